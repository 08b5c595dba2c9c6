//! Collaborator seams: the only I/O the engine performs goes through these traits.

pub mod http_backend;
pub mod in_memory;

pub use http_backend::HttpBackend;
pub use in_memory::{InMemoryBackend, ScriptedReply};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::message::MessagePart;
use crate::session::attachments::{AttachmentPayload, AttachmentRef};
use crate::session::identity::SessionKey;

/// Which server-side conversation a history call addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryScope {
    pub feature: String,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_entity_id: Option<String>,
}

impl std::fmt::Display for HistoryScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sub_entity_id {
            Some(sub) => write!(f, "{}/{}/{}", self.feature, self.entity_id, sub),
            None => write!(f, "{}/{}", self.feature, self.entity_id),
        }
    }
}

/// Message body as stored server-side: a flat string or typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistoryContent {
    Text(String),
    Parts(Vec<MessagePart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(default)]
    pub id: Option<String>,
    pub role: String,
    #[serde(alias = "parts")]
    pub content: HistoryContent,
}

impl HistoryRecord {
    pub fn text(id: impl Into<String>, role: &str, content: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            role: role.to_string(),
            content: HistoryContent::Text(content.into()),
        }
    }
}

/// Everything the transport needs to open one streaming exchange.
#[derive(Debug, Clone, Serialize)]
pub struct StreamRequest {
    pub session: SessionKey,
    pub message: String,
    pub context: String,
    pub attachments: Vec<AttachmentPayload>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchedContent {
    Binary(Bytes),
    Text(String),
}

impl FetchedContent {
    pub fn len(&self) -> usize {
        match self {
            FetchedContent::Binary(bytes) => bytes.len(),
            FetchedContent::Text(text) => text.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered assistant tokens. Dropping the stream cancels the exchange.
pub type TokenStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

pub fn boxed_stream<S>(stream: S) -> TokenStream
where
    S: Stream<Item = anyhow::Result<String>> + Send + 'static,
{
    Box::pin(stream)
}

#[async_trait]
pub trait HistoryBackend: Send + Sync {
    async fn fetch_history(&self, scope: &HistoryScope) -> anyhow::Result<Vec<HistoryRecord>>;
    async fn delete_all_history(&self, scope: &HistoryScope) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open_stream(&self, request: StreamRequest) -> anyhow::Result<TokenStream>;
}

#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, attachment: &AttachmentRef) -> anyhow::Result<FetchedContent>;
}
