//! Process-wide counters for the chat engine.
//!
//! Registration failures are swallowed; metrics never break a session.

use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static SENDS_ACCEPTED: OnceLock<Option<IntCounter>> = OnceLock::new();
static SENDS_REJECTED: OnceLock<Option<IntCounterVec>> = OnceLock::new();
static STREAMS_FINISHED: OnceLock<Option<IntCounterVec>> = OnceLock::new();
static ATTACHMENTS: OnceLock<Option<IntCounterVec>> = OnceLock::new();
static HISTORY_DEGRADED: OnceLock<Option<IntCounter>> = OnceLock::new();

fn register<C: prometheus::core::Collector + Clone + 'static>(collector: C) -> C {
    REGISTRY.register(Box::new(collector.clone())).ok();
    collector
}

fn sends_accepted() -> Option<&'static IntCounter> {
    SENDS_ACCEPTED
        .get_or_init(|| {
            IntCounter::new("chat_sends_accepted_total", "Messages handed to the transport")
                .ok()
                .map(register)
        })
        .as_ref()
}

fn sends_rejected() -> Option<&'static IntCounterVec> {
    SENDS_REJECTED
        .get_or_init(|| {
            IntCounterVec::new(
                prometheus::opts!("chat_sends_rejected_total", "Sends refused before reaching the transport"),
                &["reason"],
            )
            .ok()
            .map(register)
        })
        .as_ref()
}

fn streams_finished() -> Option<&'static IntCounterVec> {
    STREAMS_FINISHED
        .get_or_init(|| {
            IntCounterVec::new(
                prometheus::opts!("chat_streams_finished_total", "Streams by terminal outcome"),
                &["outcome"],
            )
            .ok()
            .map(register)
        })
        .as_ref()
}

fn attachments() -> Option<&'static IntCounterVec> {
    ATTACHMENTS
        .get_or_init(|| {
            IntCounterVec::new(
                prometheus::opts!("chat_attachments_total", "Attachment resolutions by outcome"),
                &["outcome"],
            )
            .ok()
            .map(register)
        })
        .as_ref()
}

fn history_degraded() -> Option<&'static IntCounter> {
    HISTORY_DEGRADED
        .get_or_init(|| {
            IntCounter::new(
                "chat_history_degraded_total",
                "History loads that fell back to an empty conversation",
            )
            .ok()
            .map(register)
        })
        .as_ref()
}

pub fn inc_send_accepted() {
    if let Some(counter) = sends_accepted() {
        counter.inc();
    }
}

pub fn inc_send_rejected(reason: &str) {
    if let Some(counter) = sends_rejected() {
        counter.with_label_values(&[reason]).inc();
    }
}

pub fn inc_stream_finished(outcome: &str) {
    if let Some(counter) = streams_finished() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_attachment(outcome: &str) {
    if let Some(counter) = attachments() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn inc_history_degraded() {
    if let Some(counter) = history_degraded() {
        counter.inc();
    }
}

/// Text exposition of every registered metric.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
