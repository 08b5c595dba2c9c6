//! One parameterized chat engine per call site.
//!
//! The engine wires the session pieces together: it owns the identity
//! counter, the history store, the live session and the attachment
//! resolver for whichever entity is currently selected. Call sites differ
//! only in their feature tag and context serializer.

use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

use crate::backend::{AttachmentFetcher, ChatTransport, HistoryBackend};
use crate::config::Config;
use crate::context::{ClinicalForm, ContextSerializer, LabeledFieldsSerializer};
use crate::error::ChatError;
use crate::message::Message;
use crate::session::attachments::{new_cache, AttachmentCache, AttachmentRef, AttachmentResolver, ResolvedAttachment};
use crate::session::{
    merge, ChangeNotifier, ContextSnapshotRef, HistoryStore, LiveSession, SessionIdentity, SessionKey,
    SessionStatus, StreamSettings, StreamTicket,
};

pub struct ChatEngineBuilder {
    feature: String,
    serializer: Arc<dyn ContextSerializer>,
    config: Config,
}

impl ChatEngineBuilder {
    pub fn new(feature: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            serializer: Arc::new(LabeledFieldsSerializer::new()),
            config: Config::default(),
        }
    }

    pub fn context_serializer<S: ContextSerializer + 'static>(mut self, serializer: S) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn build(
        self,
        history_backend: Arc<dyn HistoryBackend>,
        transport: Arc<dyn ChatTransport>,
        fetcher: Arc<dyn AttachmentFetcher>,
    ) -> ChatEngine {
        let notifier = ChangeNotifier::new();
        let context = ContextSnapshotRef::default();
        let cache = new_cache(self.config.attachment_cache_capacity);
        let max_attachment_bytes = self.config.max_attachment_bytes;

        let history = Arc::new(HistoryStore::new(
            history_backend.clone(),
            self.config.history_timeout(),
            notifier.clone(),
        ));
        let live = LiveSession::new(
            transport,
            context.clone(),
            StreamSettings::from(&self.config),
            notifier.clone(),
        );
        let attachments = AttachmentResolver::new(fetcher.clone(), cache.clone(), max_attachment_bytes, notifier.clone());

        info!("Chat engine for feature '{}' ready", self.feature);
        ChatEngine {
            feature: self.feature,
            serializer: self.serializer,
            identity: SessionIdentity::new(),
            context,
            history,
            history_backend,
            history_task: Mutex::new(None),
            live,
            fetcher,
            cache,
            max_attachment_bytes,
            attachments: RwLock::new(Arc::new(attachments)),
            notifier,
        }
    }

    /// Build against a single backend implementing all three collaborators.
    pub fn build_with<B>(self, backend: Arc<B>) -> ChatEngine
    where
        B: HistoryBackend + ChatTransport + AttachmentFetcher + 'static,
    {
        self.build(backend.clone(), backend.clone(), backend)
    }
}

/// Handle on a history load started by [`ChatEngine::switch_entity`].
#[derive(Debug)]
pub struct HistoryLoad {
    handle: Option<JoinHandle<()>>,
}

impl HistoryLoad {
    /// Wait for the load to publish, or to be superseded by a newer one.
    pub async fn loaded(self) {
        if let Some(handle) = self.handle {
            let _ = handle.await;
        }
    }
}

pub struct ChatEngine {
    feature: String,
    serializer: Arc<dyn ContextSerializer>,
    identity: SessionIdentity,
    context: ContextSnapshotRef,
    history: Arc<HistoryStore>,
    history_backend: Arc<dyn HistoryBackend>,
    history_task: Mutex<Option<AbortHandle>>,
    live: LiveSession,
    fetcher: Arc<dyn AttachmentFetcher>,
    cache: AttachmentCache,
    max_attachment_bytes: usize,
    attachments: RwLock<Arc<AttachmentResolver>>,
    notifier: ChangeNotifier,
}

impl ChatEngine {
    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// Select the clinical entity the conversation is about and load its
    /// history in the background. Selecting the current entity again is a
    /// no-op. Must be called from within a Tokio runtime.
    pub fn switch_entity(&self, entity_id: &str, sub_entity_id: Option<&str>) -> HistoryLoad {
        let key = self.identity.derive_key(&self.feature, entity_id, sub_entity_id);
        if self.live.key().as_ref() == Some(&key) {
            return HistoryLoad { handle: None };
        }
        self.rebind(key.clone());
        self.reload_history(&key)
    }

    pub async fn select_entity(&self, entity_id: &str, sub_entity_id: Option<&str>) {
        self.switch_entity(entity_id, sub_entity_id).loaded().await;
    }

    /// Drop every in-memory message and start a fresh epoch for the current
    /// entity. Server-side history is left alone.
    pub fn reset_session(&self) -> Result<SessionKey, ChatError> {
        let current = self.live.key().ok_or(ChatError::NoActiveSession)?;
        let key = self.identity.reset_session(
            &current.feature,
            &current.entity_id,
            current.sub_entity_id.as_deref(),
        );
        self.rebind(key.clone());
        Ok(key)
    }

    /// Delete the server-side history, then reset the session. A failed
    /// delete leaves the current session untouched.
    pub async fn start_new_conversation(&self) -> Result<SessionKey, ChatError> {
        let current = self.live.key().ok_or(ChatError::NoActiveSession)?;
        let scope = current.scope();
        if let Err(e) = self.history_backend.delete_all_history(&scope).await {
            warn!("Could not delete history for {}: {}", scope, e);
            return Err(ChatError::HistoryDeleteFailed(e.to_string()));
        }
        // The entity may have changed while the delete was in flight.
        if self.live.key().as_ref() != Some(&current) {
            return Err(ChatError::NoActiveSession);
        }

        let key = self.reset_session()?;
        info!("Started new conversation {}", key);
        self.reload_history(&key).loaded().await;
        Ok(key)
    }

    fn rebind(&self, key: SessionKey) {
        self.live.bind(key);
        let fresh = Arc::new(AttachmentResolver::new(
            self.fetcher.clone(),
            self.cache.clone(),
            self.max_attachment_bytes,
            self.notifier.clone(),
        ));
        // The old resolver aborts its fetches when the last handle drops.
        let previous = {
            let mut current = self.attachments.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *current, fresh)
        };
        drop(previous);
    }

    fn reload_history(&self, key: &SessionKey) -> HistoryLoad {
        let scope = key.scope();
        let generation = self.history.begin(Some(scope.clone()));
        let history = self.history.clone();
        let handle = tokio::spawn(async move {
            history.fetch_into(generation, scope).await;
        });

        let mut task = self.history_task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = task.replace(handle.abort_handle()) {
            previous.abort();
        }
        HistoryLoad { handle: Some(handle) }
    }

    fn resolver(&self) -> Arc<AttachmentResolver> {
        self.attachments
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Re-derive the context snapshot from the form as it is now.
    pub fn update_context(&self, form: &ClinicalForm) {
        self.write_context(self.serializer.serialize(form));
    }

    pub fn write_context(&self, snapshot: impl Into<String>) {
        self.context.write(snapshot);
        self.notifier.bump();
    }

    pub fn context_snapshot(&self) -> String {
        self.context.read_current()
    }

    pub fn select_attachments(&self, refs: Vec<AttachmentRef>) {
        self.resolver().select(refs);
    }

    pub fn remove_attachment(&self, id: &str) {
        self.resolver().remove(id);
    }

    pub fn attachments(&self) -> Vec<ResolvedAttachment> {
        self.resolver().resolved()
    }

    pub fn is_resolving(&self) -> bool {
        self.resolver().is_resolving()
    }

    pub async fn attachments_settled(&self) {
        let resolver = self.resolver();
        resolver.settled().await;
    }

    pub fn send(&self, text: &str) -> Result<StreamTicket, ChatError> {
        let resolver = self.resolver();
        self.live.send(text, &resolver)
    }

    pub fn stop(&self) -> bool {
        self.live.stop()
    }

    /// Reconciled view: persisted history followed by live messages.
    pub fn messages(&self) -> Vec<Message> {
        merge(&self.history.snapshot(), &self.live.messages())
    }

    pub fn status(&self) -> SessionStatus {
        self.live.status()
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.live.key()
    }

    pub fn is_history_loading(&self) -> bool {
        self.history.is_loading()
    }

    /// Revision counter bumped whenever anything observable changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notifier.subscribe()
    }

    pub fn revision(&self) -> u64 {
        self.notifier.revision()
    }
}

impl Drop for ChatEngine {
    fn drop(&mut self) {
        let task = self.history_task.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = task.take() {
            task.abort();
        }
        self.live.stop();
    }
}
