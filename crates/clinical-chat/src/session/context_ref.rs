//! Last-write-wins holder for the serialized clinical context.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// Cloning shares the same cell: the form side writes, the send side reads.
#[derive(Debug, Clone)]
pub struct ContextSnapshotRef {
    cell: Arc<ArcSwap<String>>,
}

impl Default for ContextSnapshotRef {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl ContextSnapshotRef {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            cell: Arc::new(ArcSwap::from_pointee(initial.into())),
        }
    }

    pub fn write(&self, snapshot: impl Into<String>) {
        self.cell.store(Arc::new(snapshot.into()));
    }

    pub fn read_current(&self) -> String {
        self.cell.load().as_ref().clone()
    }
}
