//! The pieces of one chat session, leaf first.

pub mod attachments;
pub mod context_ref;
pub mod history;
pub mod identity;
pub mod live;
pub mod reconciler;

pub use attachments::{
    AttachmentCache, AttachmentCategory, AttachmentContent, AttachmentPayload, AttachmentRef,
    AttachmentResolver, ResolutionState, ResolvedAttachment,
};
pub use context_ref::ContextSnapshotRef;
pub use history::HistoryStore;
pub use identity::{SessionIdentity, SessionKey};
pub use live::{LiveSession, SessionStatus, StreamSettings, StreamTicket};
pub use reconciler::merge;

use std::sync::Arc;
use tokio::sync::watch;

/// Revision counter bumped by every store whenever its observable state
/// changes. Subscribers re-read the stores after each bump.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(&self) {
        self.tx.send_modify(|revision| *revision = revision.wrapping_add(1));
    }

    pub fn revision(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}
