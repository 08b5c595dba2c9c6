//! In-process backend: DashMap-held history, scripted assistant replies and
//! attachment bodies. Backs the demo mode of the CLI and the test suites.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    boxed_stream, AttachmentFetcher, ChatTransport, FetchedContent, HistoryBackend, HistoryRecord, HistoryScope,
    StreamRequest, TokenStream,
};
use crate::session::attachments::AttachmentRef;

/// How the next `open_stream` call answers.
pub enum ScriptedReply {
    /// Emit these tokens, then close cleanly.
    Tokens(Vec<String>),
    /// Refuse to open the stream.
    FailToOpen(String),
    /// Emit these tokens, then fail mid-stream.
    FailAfter(Vec<String>, String),
    /// Forward whatever the test pushes into the paired sender.
    Manual(mpsc::UnboundedReceiver<anyhow::Result<String>>),
}

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    history: Arc<DashMap<HistoryScope, Vec<HistoryRecord>>>,
    failing_history: Arc<DashSet<HistoryScope>>,
    history_delays: Arc<DashMap<HistoryScope, Duration>>,
    history_calls: Arc<DashMap<HistoryScope, usize>>,
    delete_calls: Arc<DashMap<HistoryScope, usize>>,
    failing_delete: Arc<DashSet<HistoryScope>>,
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
    requests: Arc<Mutex<Vec<StreamRequest>>>,
    files: Arc<DashMap<String, FetchedContent>>,
    file_delays: Arc<DashMap<String, Duration>>,
    file_fetches: Arc<DashMap<String, usize>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_history(&self, scope: &HistoryScope, records: Vec<HistoryRecord>) {
        self.history.insert(scope.clone(), records);
    }

    pub fn append_history(&self, scope: &HistoryScope, record: HistoryRecord) {
        let mut entry = self.history.entry(scope.clone()).or_default();
        entry.push(record);
    }

    pub fn stored_history(&self, scope: &HistoryScope) -> Vec<HistoryRecord> {
        match self.history.get(scope) {
            Some(records) => records.clone(),
            None => Vec::new(),
        }
    }

    pub fn fail_history(&self, scope: &HistoryScope) {
        self.failing_history.insert(scope.clone());
    }

    pub fn fail_delete(&self, scope: &HistoryScope) {
        self.failing_delete.insert(scope.clone());
    }

    pub fn delay_history(&self, scope: &HistoryScope, delay: Duration) {
        self.history_delays.insert(scope.clone(), delay);
    }

    pub fn history_calls(&self, scope: &HistoryScope) -> usize {
        self.history_calls.get(scope).map(|n| *n).unwrap_or(0)
    }

    pub fn delete_calls(&self, scope: &HistoryScope) -> usize {
        self.delete_calls.get(scope).map(|n| *n).unwrap_or(0)
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(reply);
    }

    /// Queue a manually driven reply and return its token sender.
    pub fn manual_reply(&self) -> mpsc::UnboundedSender<anyhow::Result<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push_reply(ScriptedReply::Manual(rx));
        tx
    }

    /// Every stream request received so far, oldest first.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn put_file(&self, source_path: &str, content: FetchedContent) {
        self.files.insert(source_path.to_string(), content);
    }

    pub fn delay_file(&self, source_path: &str, delay: Duration) {
        self.file_delays.insert(source_path.to_string(), delay);
    }

    pub fn file_fetches(&self, source_path: &str) -> usize {
        self.file_fetches.get(source_path).map(|n| *n).unwrap_or(0)
    }

    fn next_reply(&self, request: &StreamRequest) -> ScriptedReply {
        let queued = self
            .replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        queued.unwrap_or_else(|| {
            let echo = format!("Echo: {}", request.message);
            ScriptedReply::Tokens(echo.split_inclusive(' ').map(str::to_string).collect())
        })
    }
}

#[async_trait]
impl HistoryBackend for InMemoryBackend {
    async fn fetch_history(&self, scope: &HistoryScope) -> anyhow::Result<Vec<HistoryRecord>> {
        *self.history_calls.entry(scope.clone()).or_insert(0) += 1;
        let delay = self.history_delays.get(scope).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_history.contains(scope) {
            return Err(anyhow::anyhow!("history unavailable for {}", scope));
        }
        Ok(self.stored_history(scope))
    }

    async fn delete_all_history(&self, scope: &HistoryScope) -> anyhow::Result<()> {
        *self.delete_calls.entry(scope.clone()).or_insert(0) += 1;
        if self.failing_delete.contains(scope) {
            return Err(anyhow::anyhow!("delete refused for {}", scope));
        }
        self.history.remove(scope);
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for InMemoryBackend {
    async fn open_stream(&self, request: StreamRequest) -> anyhow::Result<TokenStream> {
        debug!("In-memory transport opening stream for {}", request.session);
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        let (tokens, failure) = match self.next_reply(&request) {
            ScriptedReply::FailToOpen(reason) => return Err(anyhow::anyhow!(reason)),
            ScriptedReply::Manual(mut rx) => {
                let stream = async_stream::stream! {
                    while let Some(item) = rx.recv().await {
                        yield item;
                    }
                };
                return Ok(boxed_stream(stream));
            }
            ScriptedReply::Tokens(tokens) => (tokens, None),
            ScriptedReply::FailAfter(tokens, reason) => (tokens, Some(reason)),
        };

        // A cleanly finished exchange is persisted, as the real server does.
        let history = self.history.clone();
        let scope = request.session.scope();
        let stream = async_stream::try_stream! {
            let mut full_response = String::new();
            for token in tokens {
                full_response.push_str(&token);
                yield token;
            }
            if let Some(reason) = failure {
                Err::<(), _>(anyhow::anyhow!(reason))?;
            }
            let mut entry = history.entry(scope).or_default();
            let index = entry.len();
            entry.push(HistoryRecord::text(format!("srv-{}", index), "user", request.message.clone()));
            entry.push(HistoryRecord::text(format!("srv-{}", index + 1), "assistant", full_response));
        };
        Ok(boxed_stream(stream))
    }
}

#[async_trait]
impl AttachmentFetcher for InMemoryBackend {
    async fn fetch(&self, attachment: &AttachmentRef) -> anyhow::Result<FetchedContent> {
        *self
            .file_fetches
            .entry(attachment.source_path.clone())
            .or_insert(0) += 1;
        let delay = self.file_delays.get(&attachment.source_path).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.files
            .get(&attachment.source_path)
            .map(|content| content.clone())
            .ok_or_else(|| anyhow::anyhow!("file not found: {}", attachment.source_path))
    }
}
