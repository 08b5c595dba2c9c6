// clinical-chat/crates/clinical-chat/src/lib.rs

pub mod backend;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod message;
pub mod metrics;
pub mod presets;
pub mod session;
pub mod telemetry;

// Public API exports
pub use config::Config;
pub use context::{ClinicalForm, ContextSerializer, FormField, LabeledFieldsSerializer};
pub use engine::{ChatEngine, ChatEngineBuilder, HistoryLoad};
pub use error::{ChatError, RejectReason};
pub use message::{Message, MessagePart, Origin, Role};

// Session and collaborator exports
pub use backend::{
    AttachmentFetcher, ChatTransport, FetchedContent, HistoryBackend, HistoryRecord, HistoryScope, HttpBackend,
    InMemoryBackend, ScriptedReply, StreamRequest, TokenStream,
};
pub use session::{
    merge, AttachmentContent, AttachmentRef, ResolutionState, ResolvedAttachment, SessionKey, SessionStatus,
    StreamTicket,
};
