//! The in-memory half of a conversation: sends, streaming replies, status.
//!
//! Tokens are appended to a single assistant message whose id is fixed at
//! send time. Every write from the stream task is checked against the
//! stream id and session key it was opened with, so a stream that outlives
//! its session (entity switch, reset, stop) can never leak into the view.

use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::backend::{ChatTransport, StreamRequest};
use crate::config::Config;
use crate::error::{ChatError, RejectReason};
use crate::message::{Message, MessagePart, Role};
use crate::metrics;
use crate::session::attachments::{AttachmentContent, AttachmentResolver};
use crate::session::context_ref::ContextSnapshotRef;
use crate::session::identity::SessionKey;
use crate::session::ChangeNotifier;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    Submitted,
    Streaming,
    Error(ChatError),
}

impl SessionStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionStatus::Submitted | SessionStatus::Streaming)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub open_timeout: Duration,
    pub idle_timeout: Duration,
    pub batch_size: usize,
}

impl From<&Config> for StreamSettings {
    fn from(config: &Config) -> Self {
        Self {
            open_timeout: config.stream_open_timeout(),
            idle_timeout: config.stream_idle_timeout(),
            batch_size: config.token_batch_size.max(1),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

#[derive(Debug)]
struct ActiveStream {
    id: u64,
    key: SessionKey,
    assistant_id: String,
    abort: AbortHandle,
}

#[derive(Debug, Default)]
struct LiveState {
    key: Option<SessionKey>,
    messages: Vec<Message>,
    status: SessionStatus,
    stream: Option<ActiveStream>,
    next_stream_id: u64,
}

impl LiveState {
    /// Abort any open stream and drop its partial assistant message.
    fn abandon_stream(&mut self) -> bool {
        match self.stream.take() {
            Some(active) => {
                active.abort.abort();
                self.messages.retain(|m| m.id != active.assistant_id);
                true
            }
            None => false,
        }
    }

    fn owns(&self, stream_id: u64, key: &SessionKey) -> bool {
        let stream_matches = self.stream.as_ref().map(|s| s.id == stream_id && s.key == *key);
        stream_matches.unwrap_or(false) && self.key.as_ref() == Some(key)
    }
}

struct LiveInner {
    transport: Arc<dyn ChatTransport>,
    context: ContextSnapshotRef,
    settings: StreamSettings,
    state: Mutex<LiveState>,
    notifier: ChangeNotifier,
}

impl LiveInner {
    fn lock(&self) -> MutexGuard<'_, LiveState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a batch of tokens. Returns false when the stream is stale.
    fn append(&self, stream_id: u64, key: &SessionKey, assistant_id: &str, text: &str) -> bool {
        {
            let mut state = self.lock();
            if !state.owns(stream_id, key) {
                return false;
            }
            if let Some(message) = state.messages.iter_mut().find(|m| m.id == assistant_id) {
                message.append_text(text);
            }
            state.status = SessionStatus::Streaming;
        }
        self.notifier.bump();
        true
    }

    fn finish(&self, stream_id: u64, key: &SessionKey) {
        {
            let mut state = self.lock();
            if !state.owns(stream_id, key) {
                return;
            }
            state.stream = None;
            state.status = SessionStatus::Idle;
        }
        info!("Stream {} for {} completed", stream_id, key);
        metrics::inc_stream_finished("completed");
        self.notifier.bump();
    }

    fn fail(&self, stream_id: u64, key: &SessionKey, error: ChatError) {
        {
            let mut state = self.lock();
            if !state.owns(stream_id, key) {
                return;
            }
            if let Some(active) = state.stream.take() {
                state.messages.retain(|m| m.id != active.assistant_id);
            }
            state.status = SessionStatus::Error(error.clone());
        }
        warn!("Stream {} for {} failed: {}", stream_id, key, error);
        metrics::inc_stream_finished("failed");
        self.notifier.bump();
    }
}

async fn run_stream(
    inner: Arc<LiveInner>,
    stream_id: u64,
    key: SessionKey,
    assistant_id: String,
    request: StreamRequest,
) {
    let settings = inner.settings;
    let opened = tokio::time::timeout(settings.open_timeout, inner.transport.open_stream(request)).await;
    let tokens = match opened {
        Ok(Ok(tokens)) => tokens,
        Ok(Err(e)) => {
            inner.fail(stream_id, &key, ChatError::StreamFailed(e.to_string()));
            return;
        }
        Err(_) => {
            inner.fail(stream_id, &key, ChatError::StreamTimedOut(settings.open_timeout.as_secs()));
            return;
        }
    };

    // Whatever is already buffered is appended under one lock acquisition.
    let mut batches = tokens.ready_chunks(settings.batch_size.max(1));
    loop {
        let batch = match tokio::time::timeout(settings.idle_timeout, batches.next()).await {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                inner.finish(stream_id, &key);
                return;
            }
            Err(_) => {
                inner.fail(stream_id, &key, ChatError::StreamTimedOut(settings.idle_timeout.as_secs()));
                return;
            }
        };

        let mut text = String::new();
        let mut received = false;
        let mut failure = None;
        for item in batch {
            match item {
                Ok(token) => {
                    received = true;
                    text.push_str(&token);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if received && !inner.append(stream_id, &key, &assistant_id, &text) {
            debug!("Ignoring tokens from stale stream {} for {}", stream_id, key);
            return;
        }
        if let Some(e) = failure {
            inner.fail(stream_id, &key, ChatError::StreamFailed(e.to_string()));
            return;
        }
    }
}

/// Handle on one accepted send.
#[derive(Debug)]
pub struct StreamTicket {
    pub stream_id: u64,
    pub user_message_id: String,
    pub assistant_message_id: String,
    handle: JoinHandle<()>,
}

impl StreamTicket {
    /// Wait for the stream task to end, whether it finished or was abandoned.
    pub async fn finished(self) {
        let _ = self.handle.await;
    }
}

/// Cloning shares the session.
#[derive(Clone)]
pub struct LiveSession {
    inner: Arc<LiveInner>,
}

impl LiveSession {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        context: ContextSnapshotRef,
        settings: StreamSettings,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            inner: Arc::new(LiveInner {
                transport,
                context,
                settings,
                state: Mutex::new(LiveState::default()),
                notifier,
            }),
        }
    }

    /// Bind to `key`. A different key discards every in-memory message and
    /// abandons any open stream. Returns whether anything changed.
    pub fn bind(&self, key: SessionKey) -> bool {
        {
            let mut state = self.inner.lock();
            if state.key.as_ref() == Some(&key) {
                return false;
            }
            let abandoned = state.abandon_stream();
            if abandoned {
                debug!("Abandoned open stream while switching to {}", key);
            }
            state.messages.clear();
            state.status = SessionStatus::Idle;
            info!("Live session bound to {}", key);
            state.key = Some(key);
        }
        self.inner.notifier.bump();
        true
    }

    /// Abort the open stream, if any. The partial reply is dropped and the
    /// status becomes `Error(Aborted)`; the next send recovers.
    pub fn stop(&self) -> bool {
        let stopped = {
            let mut state = self.inner.lock();
            let stopped = state.abandon_stream();
            if stopped {
                state.status = SessionStatus::Error(ChatError::Aborted);
            }
            stopped
        };
        if stopped {
            info!("Stream stopped by user");
            metrics::inc_stream_finished("aborted");
            self.inner.notifier.bump();
        }
        stopped
    }

    /// Start an exchange. Context and attachment content are read here, at
    /// the moment of sending. Must be called from within a Tokio runtime.
    pub fn send(&self, text: &str, attachments: &AttachmentResolver) -> Result<StreamTicket, ChatError> {
        let text = text.trim();
        let rejected = if text.is_empty() {
            Some(RejectReason::EmptyText)
        } else if attachments.is_resolving() {
            Some(RejectReason::AttachmentsPending)
        } else {
            None
        };
        if let Some(reason) = rejected {
            return Err(self.reject(reason));
        }

        let mut state = self.inner.lock();
        if state.status.is_busy() {
            drop(state);
            return Err(self.reject(RejectReason::AlreadyInFlight));
        }
        let Some(key) = state.key.clone() else {
            drop(state);
            return Err(self.reject(RejectReason::NoActiveSession));
        };

        let context = self.inner.context.read_current();
        let payload = attachments.payload();

        let mut user = Message::live(Role::User, text);
        for attachment in &payload {
            if let AttachmentContent::DataUrl(url) = &attachment.content {
                user.parts.push(MessagePart::File {
                    media_type: attachment.mime_type.clone(),
                    url: url.clone(),
                    filename: Some(attachment.file_name.clone()),
                });
            }
        }
        let assistant = Message::live(Role::Assistant, "");
        let user_message_id = user.id.clone();
        let assistant_message_id = assistant.id.clone();

        state.next_stream_id += 1;
        let stream_id = state.next_stream_id;
        state.messages.push(user);
        state.messages.push(assistant);
        state.status = SessionStatus::Submitted;

        info!(
            "Sending message on {} (stream {}, {} attachment(s), {} context chars)",
            key,
            stream_id,
            payload.len(),
            context.len()
        );
        let request = StreamRequest {
            session: key.clone(),
            message: text.to_string(),
            context,
            attachments: payload,
        };

        // The task cannot touch the state before we release the lock, so it
        // always observes its own ActiveStream entry.
        let handle = tokio::spawn(run_stream(
            self.inner.clone(),
            stream_id,
            key.clone(),
            assistant_message_id.clone(),
            request,
        ));
        state.stream = Some(ActiveStream {
            id: stream_id,
            key,
            assistant_id: assistant_message_id.clone(),
            abort: handle.abort_handle(),
        });
        drop(state);

        metrics::inc_send_accepted();
        self.inner.notifier.bump();
        Ok(StreamTicket {
            stream_id,
            user_message_id,
            assistant_message_id,
            handle,
        })
    }

    fn reject(&self, reason: RejectReason) -> ChatError {
        debug!("Send rejected: {}", reason);
        metrics::inc_send_rejected(reason.as_str());
        ChatError::SendRejected(reason)
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.lock().messages.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().status.clone()
    }

    pub fn key(&self) -> Option<SessionKey> {
        self.inner.lock().key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FetchedContent, InMemoryBackend, ScriptedReply};
    use crate::session::attachments::{new_cache, AttachmentRef};

    fn key(entity: &str) -> SessionKey {
        SessionKey {
            feature: "chat".into(),
            entity_id: entity.into(),
            sub_entity_id: None,
            epoch: 0,
        }
    }

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        context: ContextSnapshotRef,
        live: LiveSession,
        attachments: AttachmentResolver,
    }

    fn fixture(settings: StreamSettings) -> Fixture {
        let backend = Arc::new(InMemoryBackend::new());
        let context = ContextSnapshotRef::default();
        let notifier = ChangeNotifier::new();
        let live = LiveSession::new(backend.clone(), context.clone(), settings, notifier.clone());
        let attachments = AttachmentResolver::new(backend.clone(), new_cache(8), 1024, notifier);
        live.bind(key("pat-1"));
        Fixture {
            backend,
            context,
            live,
            attachments,
        }
    }

    #[tokio::test]
    async fn test_blank_send_is_noop() {
        let f = fixture(StreamSettings::default());
        for text in ["", "   "] {
            let err = f.live.send(text, &f.attachments).unwrap_err();
            assert_eq!(err, ChatError::SendRejected(RejectReason::EmptyText));
        }
        assert_eq!(f.live.status(), SessionStatus::Idle);
        assert!(f.live.messages().is_empty());
        assert!(f.backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unbound_session_rejects() {
        let backend = Arc::new(InMemoryBackend::new());
        let notifier = ChangeNotifier::new();
        let live = LiveSession::new(
            backend.clone(),
            ContextSnapshotRef::default(),
            StreamSettings::default(),
            notifier.clone(),
        );
        let attachments = AttachmentResolver::new(backend, new_cache(8), 1024, notifier);
        let err = live.send("hello", &attachments).unwrap_err();
        assert_eq!(err, ChatError::SendRejected(RejectReason::NoActiveSession));
    }

    #[tokio::test]
    async fn test_streams_into_single_assistant_message() {
        let f = fixture(StreamSettings::default());
        f.context.write("Weight: 5kg");
        let tx = f.backend.manual_reply();

        let ticket = f.live.send("symptoms?", &f.attachments).unwrap();
        assert_eq!(f.live.status(), SessionStatus::Submitted);
        let messages = f.live.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text(), "symptoms?");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].text(), "");

        tx.send(Ok("Pain".into())).unwrap();
        tokio::task::yield_now().await;
        while f.live.status() == SessionStatus::Submitted {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.live.status(), SessionStatus::Streaming);
        assert_eq!(f.live.messages()[1].text(), "Pain");

        tx.send(Ok(" on palpation".into())).unwrap();
        drop(tx);
        let assistant_id = ticket.assistant_message_id.clone();
        ticket.finished().await;

        let messages = f.live.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id, assistant_id);
        assert_eq!(messages[1].text(), "Pain on palpation");
        assert_eq!(f.live.status(), SessionStatus::Idle);

        let requests = f.backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message, "symptoms?");
        assert_eq!(requests[0].context, "Weight: 5kg");
    }

    #[tokio::test]
    async fn test_context_is_read_at_send_time() {
        let f = fixture(StreamSettings::default());
        f.context.write("Weight: 4kg");
        let ticket = f.live.send("first", &f.attachments).unwrap();
        ticket.finished().await;

        f.context.write("Weight: 5kg");
        let ticket = f.live.send("second", &f.attachments).unwrap();
        ticket.finished().await;

        let contexts: Vec<_> = f.backend.requests().into_iter().map(|r| r.context).collect();
        assert_eq!(contexts, vec!["Weight: 4kg", "Weight: 5kg"]);
    }

    #[tokio::test]
    async fn test_concurrent_send_rejected() {
        let f = fixture(StreamSettings::default());
        let _tx = f.backend.manual_reply();
        f.live.send("one", &f.attachments).unwrap();

        let before = f.live.messages();
        let err = f.live.send("two", &f.attachments).unwrap_err();
        assert_eq!(err, ChatError::SendRejected(RejectReason::AlreadyInFlight));
        assert_eq!(f.live.messages(), before);
    }

    #[tokio::test]
    async fn test_pending_attachments_block_send() {
        let f = fixture(StreamSettings::default());
        f.backend.put_file("files/labs.txt", FetchedContent::Text("ALT 120".into()));
        f.backend.delay_file("files/labs.txt", Duration::from_millis(50));
        f.attachments
            .select(vec![AttachmentRef::new("doc-1", "labs.txt", "text/plain", "files/labs.txt")]);

        let err = f.live.send("see labs", &f.attachments).unwrap_err();
        assert_eq!(err, ChatError::SendRejected(RejectReason::AttachmentsPending));
        assert!(f.live.messages().is_empty());

        f.attachments.settled().await;
        let ticket = f.live.send("see labs", &f.attachments).unwrap();
        ticket.finished().await;
        let request = &f.backend.requests()[0];
        assert_eq!(request.attachments.len(), 1);
        assert_eq!(request.attachments[0].content, AttachmentContent::Text("ALT 120".into()));
    }

    #[tokio::test]
    async fn test_failure_drops_partial_reply_and_recovers() {
        let f = fixture(StreamSettings::default());
        f.backend
            .push_reply(ScriptedReply::FailAfter(vec!["Pa".into()], "connection reset".into()));

        let ticket = f.live.send("symptoms?", &f.attachments).unwrap();
        ticket.finished().await;

        assert!(matches!(f.live.status(), SessionStatus::Error(ChatError::StreamFailed(_))));
        let messages = f.live.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);

        let ticket = f.live.send("symptoms?", &f.attachments).unwrap();
        ticket.finished().await;
        assert_eq!(f.live.status(), SessionStatus::Idle);
        assert_eq!(f.live.messages().len(), 3);
    }

    #[tokio::test]
    async fn test_open_failure_sets_error() {
        let f = fixture(StreamSettings::default());
        f.backend.push_reply(ScriptedReply::FailToOpen("503".into()));
        f.live.send("hello", &f.attachments).unwrap().finished().await;
        assert_eq!(f.live.status(), SessionStatus::Error(ChatError::StreamFailed("503".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_stream_times_out() {
        let settings = StreamSettings {
            idle_timeout: Duration::from_secs(5),
            ..StreamSettings::default()
        };
        let f = fixture(settings);
        let _tx = f.backend.manual_reply();

        f.live.send("hello", &f.attachments).unwrap().finished().await;
        assert_eq!(f.live.status(), SessionStatus::Error(ChatError::StreamTimedOut(5)));
        assert_eq!(f.live.messages().len(), 1);
    }

    struct StalledTransport;

    #[async_trait::async_trait]
    impl ChatTransport for StalledTransport {
        async fn open_stream(&self, _request: StreamRequest) -> anyhow::Result<crate::backend::TokenStream> {
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_that_never_opens_times_out() {
        let settings = StreamSettings {
            open_timeout: Duration::from_secs(7),
            ..StreamSettings::default()
        };
        let notifier = ChangeNotifier::new();
        let live = LiveSession::new(
            Arc::new(StalledTransport),
            ContextSnapshotRef::default(),
            settings,
            notifier.clone(),
        );
        let attachments = AttachmentResolver::new(Arc::new(InMemoryBackend::new()), new_cache(8), 1024, notifier);
        live.bind(key("pat-1"));

        let ticket = live.send("hello", &attachments).unwrap();
        assert_eq!(live.messages().len(), 2);
        ticket.finished().await;

        assert_eq!(live.status(), SessionStatus::Error(ChatError::StreamTimedOut(7)));
        let messages = live.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);

        // the session recovers on the next send
        assert!(live.send("hello again", &attachments).is_ok());
        assert_eq!(live.status(), SessionStatus::Submitted);
    }

    #[tokio::test]
    async fn test_rebind_discards_stream_and_late_tokens() {
        let f = fixture(StreamSettings::default());
        let tx = f.backend.manual_reply();
        let ticket = f.live.send("symptoms?", &f.attachments).unwrap();

        assert!(f.live.bind(key("pat-2")));
        assert!(f.live.messages().is_empty());
        assert_eq!(f.live.status(), SessionStatus::Idle);

        // the aborted task no longer reads; a late token goes nowhere
        let _ = tx.send(Ok("late".into()));
        ticket.finished().await;
        assert!(f.live.messages().is_empty());
        assert_eq!(f.live.key(), Some(key("pat-2")));
    }

    #[tokio::test]
    async fn test_bind_same_key_keeps_state() {
        let f = fixture(StreamSettings::default());
        f.live.send("hello", &f.attachments).unwrap().finished().await;
        assert!(!f.live.bind(key("pat-1")));
        assert_eq!(f.live.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_aborts_and_allows_resend() {
        let f = fixture(StreamSettings::default());
        let _tx = f.backend.manual_reply();
        let ticket = f.live.send("hello", &f.attachments).unwrap();

        assert!(f.live.stop());
        ticket.finished().await;
        assert_eq!(f.live.status(), SessionStatus::Error(ChatError::Aborted));
        assert_eq!(f.live.messages().len(), 1);
        assert!(!f.live.stop());

        f.live.send("hello again", &f.attachments).unwrap().finished().await;
        assert_eq!(f.live.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_stale_append_is_refused() {
        let backend = Arc::new(InMemoryBackend::new());
        let live = LiveSession::new(
            backend,
            ContextSnapshotRef::default(),
            StreamSettings::default(),
            ChangeNotifier::new(),
        );
        live.bind(key("pat-1"));
        assert!(!live.inner.append(7, &key("pat-1"), "missing", "late"));
        assert!(live.messages().is_empty());
    }
}
