//! Merges persisted history with the live session into one view.

use std::collections::HashSet;

use crate::message::Message;

/// History first, then live, each side keeping its own order. A persisted
/// message whose id also appears live is dropped in favour of the live copy.
///
/// Duplicate ids inside `live` are collapsed to their last occurrence, which
/// is the most recent streamed state of that message.
pub fn merge(persisted: &[Message], live: &[Message]) -> Vec<Message> {
    let live_ids: HashSet<&str> = live.iter().map(|m| m.id.as_str()).collect();

    let mut seen: HashSet<&str> = HashSet::with_capacity(persisted.len());
    let mut merged: Vec<Message> = persisted
        .iter()
        .filter(|m| !live_ids.contains(m.id.as_str()))
        .filter(|m| seen.insert(m.id.as_str()))
        .cloned()
        .collect();

    let mut live_unique: Vec<&Message> = Vec::with_capacity(live.len());
    let mut live_seen: HashSet<&str> = HashSet::with_capacity(live.len());
    for message in live.iter().rev() {
        if live_seen.insert(message.id.as_str()) {
            live_unique.push(message);
        }
    }
    merged.extend(live_unique.into_iter().rev().cloned());
    merged
}
