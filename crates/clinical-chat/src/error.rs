//! Error taxonomy for the chat session engine.
//!
//! Nothing here is fatal: every variant leaves the session in a state from
//! which the next user action can proceed.

use thiserror::Error;

/// Why a send was refused. A rejected send never mutates session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyText,
    AttachmentsPending,
    AlreadyInFlight,
    NoActiveSession,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::EmptyText => "empty-text",
            RejectReason::AttachmentsPending => "attachments-pending",
            RejectReason::AlreadyInFlight => "already-in-flight",
            RejectReason::NoActiveSession => "no-active-session",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error("History fetch failed: {0}")]
    HistoryFetchFailed(String),

    #[error("History delete failed: {0}")]
    HistoryDeleteFailed(String),

    #[error("Attachment {id} could not be resolved: {reason}")]
    AttachmentResolutionFailed { id: String, reason: String },

    #[error("Stream failed: {0}")]
    StreamFailed(String),

    #[error("Stream timed out after {0}s")]
    StreamTimedOut(u64),

    #[error("Stream aborted")]
    Aborted,

    #[error("Send rejected: {0}")]
    SendRejected(RejectReason),

    #[error("No entity is selected")]
    NoActiveSession,
}
