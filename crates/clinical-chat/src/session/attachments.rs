//! Resolves selected file references into transport-ready content.
//!
//! Every ref in the current selection that is neither cached nor known to
//! have failed is fetched concurrently. Completions write into a content
//! cache keyed by ref id; the writes commute, so completion order does not
//! matter. A failed ref is reported but never blocks sending.

use base64::Engine as _;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{AttachmentFetcher, FetchedContent};
use crate::metrics;
use crate::session::ChangeNotifier;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub id: String,
    pub display_name: String,
    pub file_name: String,
    pub mime_type: String,
    pub source_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentCategory {
    Image,
    Document,
    Text,
}

impl AttachmentRef {
    pub fn new(
        id: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        source_path: impl Into<String>,
    ) -> Self {
        let file_name = file_name.into();
        Self {
            id: id.into(),
            display_name: file_name.clone(),
            file_name,
            mime_type: mime_type.into(),
            source_path: source_path.into(),
        }
    }

    fn extension(&self) -> String {
        self.file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Category from the mime type, falling back to the file extension.
    pub fn category(&self) -> AttachmentCategory {
        let mime = self.mime_type.to_ascii_lowercase();
        if mime.starts_with("image/") {
            return AttachmentCategory::Image;
        }
        if mime == "application/pdf" {
            return AttachmentCategory::Document;
        }
        if !mime.is_empty() {
            return AttachmentCategory::Text;
        }
        match self.extension().as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" | "heic" => AttachmentCategory::Image,
            "pdf" => AttachmentCategory::Document,
            _ => AttachmentCategory::Text,
        }
    }

    /// Mime type to put in a data URL.
    pub fn effective_mime(&self) -> String {
        if !self.mime_type.is_empty() {
            return self.mime_type.clone();
        }
        match self.extension().as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "bmp" => "image/bmp",
            "heic" => "image/heic",
            "pdf" => "application/pdf",
            "txt" | "md" => "text/plain",
            _ => "application/octet-stream",
        }
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum AttachmentContent {
    Text(String),
    DataUrl(String),
}

/// One attachment as it travels with a message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    pub id: String,
    pub name: String,
    pub file_name: String,
    pub mime_type: String,
    pub content: AttachmentContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionState {
    Pending,
    Resolved,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAttachment {
    pub attachment: AttachmentRef,
    pub content: Option<AttachmentContent>,
    pub state: ResolutionState,
}

#[derive(Debug, Clone)]
pub struct CachedAttachment {
    attachment: AttachmentRef,
    content: Arc<AttachmentContent>,
}

/// Content cache shared by every resolver an engine creates, so reselecting
/// a file in a later session is free. Bounded by entry count only; entries
/// never expire by age. A resolver never depends on an entry staying here.
pub type AttachmentCache = moka::sync::Cache<String, CachedAttachment>;

pub fn new_cache(capacity: u64) -> AttachmentCache {
    moka::sync::Cache::new(capacity)
}

/// Encode fetched content according to the ref's category.
pub fn encode_content(
    attachment: &AttachmentRef,
    fetched: FetchedContent,
    max_bytes: usize,
) -> Result<AttachmentContent, String> {
    if fetched.len() > max_bytes {
        return Err(format!("{} bytes exceeds the {} byte limit", fetched.len(), max_bytes));
    }
    match attachment.category() {
        AttachmentCategory::Image => {
            let bytes = match fetched {
                FetchedContent::Binary(bytes) => bytes.to_vec(),
                FetchedContent::Text(text) => text.into_bytes(),
            };
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            Ok(AttachmentContent::DataUrl(format!(
                "data:{};base64,{}",
                attachment.effective_mime(),
                encoded
            )))
        }
        AttachmentCategory::Document | AttachmentCategory::Text => match fetched {
            FetchedContent::Text(text) => Ok(AttachmentContent::Text(text)),
            FetchedContent::Binary(bytes) => String::from_utf8(bytes.to_vec())
                .map(AttachmentContent::Text)
                .map_err(|_| "binary content is not valid UTF-8 text".to_string()),
        },
    }
}

struct ResolverInner {
    fetcher: Arc<dyn AttachmentFetcher>,
    cache: AttachmentCache,
    // Content for the current selection. Holds everything selected, whatever
    // the shared cache decides to admit or evict.
    resolved: DashMap<String, (AttachmentRef, Arc<AttachmentContent>)>,
    failures: DashMap<String, (AttachmentRef, String)>,
    in_flight: DashMap<String, AttachmentRef>,
    selection: RwLock<Vec<AttachmentRef>>,
    max_bytes: usize,
    notifier: ChangeNotifier,
}

impl ResolverInner {
    fn selection(&self) -> Vec<AttachmentRef> {
        self.selection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn content(&self, attachment: &AttachmentRef) -> Option<Arc<AttachmentContent>> {
        self.resolved
            .get(&attachment.id)
            .filter(|entry| entry.0 == *attachment)
            .map(|entry| entry.1.clone())
    }

    /// Pull content for `attachment` out of the shared cache, if present.
    fn adopt_cached(&self, attachment: &AttachmentRef) -> bool {
        let hit = self
            .cache
            .get(&attachment.id)
            .filter(|entry| entry.attachment == *attachment);
        match hit {
            Some(entry) => {
                self.resolved
                    .insert(attachment.id.clone(), (entry.attachment, entry.content));
                true
            }
            None => false,
        }
    }

    fn failure(&self, attachment: &AttachmentRef) -> Option<String> {
        self.failures
            .get(&attachment.id)
            .filter(|entry| entry.0 == *attachment)
            .map(|entry| entry.1.clone())
    }

    fn complete(&self, attachment: AttachmentRef, result: anyhow::Result<FetchedContent>) {
        let still_wanted = self
            .in_flight
            .remove_if(&attachment.id, |_, pending| *pending == attachment)
            .is_some();
        if !still_wanted {
            debug!("Dropping superseded resolution for attachment {}", attachment.id);
            return;
        }

        let outcome = result
            .map_err(|e| e.to_string())
            .and_then(|fetched| encode_content(&attachment, fetched, self.max_bytes));
        // Holding the selection lock orders this write against `select`.
        let selection = self
            .selection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let selected = selection.iter().any(|r| *r == attachment);
        match outcome {
            Ok(content) => {
                debug!("Resolved attachment {} ({})", attachment.id, attachment.file_name);
                metrics::inc_attachment("resolved");
                let content = Arc::new(content);
                self.cache.insert(
                    attachment.id.clone(),
                    CachedAttachment {
                        attachment: attachment.clone(),
                        content: content.clone(),
                    },
                );
                if selected {
                    self.resolved.insert(attachment.id.clone(), (attachment, content));
                }
            }
            Err(reason) => {
                warn!("Attachment {} ({}) failed to resolve: {}", attachment.id, attachment.file_name, reason);
                metrics::inc_attachment("failed");
                // A ref removed mid-fetch leaves no failure behind.
                if selected {
                    self.failures.insert(attachment.id.clone(), (attachment, reason));
                }
            }
        }
        drop(selection);
        self.notifier.bump();
    }
}

/// Resolution state for one session's attachment selection. Dropping the
/// resolver aborts its outstanding fetches.
pub struct AttachmentResolver {
    inner: Arc<ResolverInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AttachmentResolver {
    pub fn new(
        fetcher: Arc<dyn AttachmentFetcher>,
        cache: AttachmentCache,
        max_bytes: usize,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                fetcher,
                cache,
                resolved: DashMap::new(),
                failures: DashMap::new(),
                in_flight: DashMap::new(),
                selection: RwLock::new(Vec::new()),
                max_bytes,
                notifier,
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replace the selection and start fetching anything not yet resolved.
    /// Must be called from within a Tokio runtime.
    pub fn select(&self, refs: Vec<AttachmentRef>) {
        {
            let mut selection = self
                .inner
                .selection
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *selection = refs.clone();
            // A failure is forgotten once its ref leaves the selection, so
            // re-adding the file is a fresh attempt.
            self.inner
                .failures
                .retain(|_, (failed, _)| refs.iter().any(|r| *r == *failed));
            self.inner
                .resolved
                .retain(|_, (held, _)| refs.iter().any(|r| *r == *held));
        }

        let to_fetch: Vec<AttachmentRef> = refs
            .into_iter()
            .filter(|r| self.inner.content(r).is_none() && !self.inner.adopt_cached(r))
            .filter(|r| self.inner.failure(r).is_none())
            .filter(|r| {
                self.inner
                    .in_flight
                    .get(&r.id)
                    .map(|pending| *pending != *r)
                    .unwrap_or(true)
            })
            .collect();

        for attachment in &to_fetch {
            self.inner.in_flight.insert(attachment.id.clone(), attachment.clone());
        }
        self.inner.notifier.bump();

        if to_fetch.is_empty() {
            return;
        }
        info!("Resolving {} attachment(s)", to_fetch.len());

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut pending: FuturesUnordered<_> = to_fetch
                .into_iter()
                .map(|attachment| {
                    let fetcher = inner.fetcher.clone();
                    async move {
                        let result = fetcher.fetch(&attachment).await;
                        (attachment, result)
                    }
                })
                .collect();
            while let Some((attachment, result)) = pending.next().await {
                inner.complete(attachment, result);
            }
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    pub fn remove(&self, id: &str) {
        let remaining: Vec<AttachmentRef> = self
            .inner
            .selection()
            .into_iter()
            .filter(|r| r.id != id)
            .collect();
        self.select(remaining);
    }

    pub fn clear(&self) {
        self.select(Vec::new());
    }

    pub fn selection(&self) -> Vec<AttachmentRef> {
        self.inner.selection()
    }

    /// True while any selected ref has neither content nor a recorded failure.
    pub fn is_resolving(&self) -> bool {
        self.inner
            .selection()
            .iter()
            .any(|r| self.inner.content(r).is_none() && self.inner.failure(r).is_none())
    }

    pub fn resolved(&self) -> Vec<ResolvedAttachment> {
        self.inner
            .selection()
            .into_iter()
            .map(|attachment| {
                if let Some(content) = self.inner.content(&attachment) {
                    ResolvedAttachment {
                        attachment,
                        content: Some(content.as_ref().clone()),
                        state: ResolutionState::Resolved,
                    }
                } else if let Some(reason) = self.inner.failure(&attachment) {
                    ResolvedAttachment {
                        attachment,
                        content: None,
                        state: ResolutionState::Failed(reason),
                    }
                } else {
                    ResolvedAttachment {
                        attachment,
                        content: None,
                        state: ResolutionState::Pending,
                    }
                }
            })
            .collect()
    }

    /// Content for every selected ref that resolved; failed ones are left out.
    pub fn payload(&self) -> Vec<AttachmentPayload> {
        self.resolved()
            .into_iter()
            .filter_map(|resolved| {
                let content = resolved.content?;
                let attachment = resolved.attachment;
                Some(AttachmentPayload {
                    mime_type: attachment.effective_mime(),
                    id: attachment.id,
                    name: attachment.display_name,
                    file_name: attachment.file_name,
                    content,
                })
            })
            .collect()
    }

    /// Wait until nothing in the selection is still resolving.
    pub async fn settled(&self) {
        let mut changes = self.inner.notifier.subscribe();
        while self.is_resolving() {
            if changes.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for AttachmentResolver {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}
