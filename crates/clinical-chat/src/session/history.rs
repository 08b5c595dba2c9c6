//! Persisted conversation history for the current entity.
//!
//! Loads are best-effort: a failed or timed-out fetch degrades to an empty
//! history. Each load clears the previous entity's messages first, and a
//! load that finishes after a newer one has started is discarded.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{HistoryBackend, HistoryContent, HistoryRecord, HistoryScope};
use crate::message::{Message, MessagePart, Origin, Role};
use crate::metrics;
use crate::session::ChangeNotifier;

#[derive(Debug, Default)]
struct HistoryState {
    generation: u64,
    scope: Option<HistoryScope>,
    messages: Arc<Vec<Message>>,
    loading: bool,
}

pub struct HistoryStore {
    backend: Arc<dyn HistoryBackend>,
    timeout: Duration,
    state: RwLock<HistoryState>,
    notifier: ChangeNotifier,
}

impl HistoryStore {
    pub fn new(backend: Arc<dyn HistoryBackend>, timeout: Duration, notifier: ChangeNotifier) -> Self {
        Self {
            backend,
            timeout,
            state: RwLock::new(HistoryState::default()),
            notifier,
        }
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, HistoryState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, HistoryState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drop whatever is held and mark a load for `scope` as started.
    /// Returns the generation the eventual result must match.
    pub fn begin(&self, scope: Option<HistoryScope>) -> u64 {
        let generation = {
            let mut state = self.write_state();
            state.generation += 1;
            state.loading = scope.is_some();
            state.scope = scope;
            state.messages = Arc::new(Vec::new());
            state.generation
        };
        self.notifier.bump();
        generation
    }

    pub fn clear(&self) {
        self.begin(None);
    }

    /// Fetch and publish the history for `scope`.
    pub async fn load(&self, scope: HistoryScope) -> Arc<Vec<Message>> {
        let generation = self.begin(Some(scope.clone()));
        self.fetch_into(generation, scope).await
    }

    /// Second half of [`HistoryStore::load`], for callers that already ran
    /// [`HistoryStore::begin`] synchronously.
    pub async fn fetch_into(&self, generation: u64, scope: HistoryScope) -> Arc<Vec<Message>> {
        debug!("Loading history for {}", scope);

        let messages = match tokio::time::timeout(self.timeout, self.backend.fetch_history(&scope)).await {
            Ok(Ok(records)) => normalize_records(&scope, records),
            Ok(Err(e)) => {
                warn!("History fetch for {} failed, showing empty conversation: {}", scope, e);
                metrics::inc_history_degraded();
                Vec::new()
            }
            Err(_) => {
                warn!(
                    "History fetch for {} timed out after {}s, showing empty conversation",
                    scope,
                    self.timeout.as_secs()
                );
                metrics::inc_history_degraded();
                Vec::new()
            }
        };

        let published = {
            let mut state = self.write_state();
            if state.generation != generation {
                debug!("Discarding stale history result for {}", scope);
                return state.messages.clone();
            }
            state.messages = Arc::new(messages);
            state.loading = false;
            state.messages.clone()
        };
        info!("Loaded {} history messages for {}", published.len(), scope);
        self.notifier.bump();
        published
    }

    pub fn snapshot(&self) -> Arc<Vec<Message>> {
        self.read_state().messages.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.read_state().loading
    }

    pub fn scope(&self) -> Option<HistoryScope> {
        self.read_state().scope.clone()
    }
}

/// Turn raw store rows into displayable messages. Bookkeeping roles and
/// system prompts are dropped; rows without an id get a positional one.
pub fn normalize_records(scope: &HistoryScope, records: Vec<HistoryRecord>) -> Vec<Message> {
    records
        .into_iter()
        .enumerate()
        .filter_map(|(index, record)| {
            let role = match Role::normalize(&record.role) {
                Some(Role::System) | None => return None,
                Some(role) => role,
            };
            let id = record
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("{}-h{}", scope, index));
            let parts = match record.content {
                HistoryContent::Text(text) => vec![MessagePart::text(text)],
                HistoryContent::Parts(parts) => parts,
            };
            Some(Message::new(id, role, parts, Origin::Persisted))
        })
        .collect()
}
