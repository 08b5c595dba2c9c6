//! HTTP client for the clinic's chat server: history, streaming replies and
//! attachment bodies. Streaming replies arrive as server-sent events.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    boxed_stream, AttachmentFetcher, ChatTransport, FetchedContent, HistoryBackend, HistoryRecord, HistoryScope,
    StreamRequest, TokenStream,
};
use crate::config::Config;
use crate::session::attachments::AttachmentRef;

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    messages: Vec<HistoryRecord>,
}

/// One SSE `data:` payload. Either a bare delta, an OpenAI-style chunk, or
/// an error report.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    delta: Option<String>,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<ChatDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct ChatDelta {
    content: Option<String>,
}

/// What one SSE line means for the token stream.
#[derive(Debug, PartialEq)]
enum SseEvent {
    Token(String),
    Done,
    Failed(String),
    Ignore,
}

fn parse_sse_line(line: &str) -> SseEvent {
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                return SseEvent::Failed(error);
            }
            if let Some(delta) = chunk.delta {
                return SseEvent::Token(delta);
            }
            let content: String = chunk
                .choices
                .iter()
                .filter_map(|c| c.delta.as_ref().and_then(|d| d.content.clone()))
                .collect();
            let finished = chunk.choices.iter().any(|c| c.finish_reason.is_some());
            match (content.is_empty(), finished) {
                (false, _) => SseEvent::Token(content),
                (true, true) => SseEvent::Done,
                (true, false) => SseEvent::Ignore,
            }
        }
        Err(_) => {
            debug!("Skipping unparseable SSE payload: {}", data);
            SseEvent::Ignore
        }
    }
}

pub struct HttpBackend {
    backend_url: String,
    http_client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: &Config) -> Self {
        Self::new_with_backend(
            config.backend_url.clone(),
            Duration::from_secs(config.http_timeout_seconds),
        )
    }

    pub fn new_with_backend(backend_url: String, timeout: Duration) -> Self {
        info!("Chat backend client initialized with: {}", backend_url);
        Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            http_client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Base URL with `segments` appended, each one percent-encoded.
    fn endpoint<'a, I>(&self, segments: I) -> anyhow::Result<reqwest::Url>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = reqwest::Url::parse(&self.backend_url)
            .map_err(|e| anyhow::anyhow!("Invalid backend URL {}: {}", self.backend_url, e))?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Backend URL {} cannot take a path", self.backend_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn history_url(&self, scope: &HistoryScope) -> anyhow::Result<reqwest::Url> {
        self.endpoint(["api", "chat", scope.feature.as_str(), scope.entity_id.as_str(), "history"])
    }

    fn stream_url(&self, feature: &str) -> anyhow::Result<reqwest::Url> {
        self.endpoint(["api", "chat", feature, "stream"])
    }

    /// Source paths keep their directory structure; each component is
    /// encoded on its own.
    fn file_url(&self, source_path: &str) -> anyhow::Result<reqwest::Url> {
        let components = source_path.split('/').filter(|c| !c.is_empty());
        self.endpoint(["api", "files"].into_iter().chain(components))
    }

    fn with_sub_entity(builder: reqwest::RequestBuilder, scope: &HistoryScope) -> reqwest::RequestBuilder {
        match &scope.sub_entity_id {
            Some(sub) => builder.query(&[("sub", sub.as_str())]),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response, what: &str) -> anyhow::Result<reqwest::Response> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("{} returned {}: {}", what, status, body));
        }
        Ok(response)
    }
}

#[async_trait]
impl HistoryBackend for HttpBackend {
    async fn fetch_history(&self, scope: &HistoryScope) -> anyhow::Result<Vec<HistoryRecord>> {
        debug!("Fetching history for {}", scope);
        let request = Self::with_sub_entity(self.http_client.get(self.history_url(scope)?), scope);
        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("History request failed: {}", e))?;
        let response = Self::check(response, "History endpoint").await?;
        let body: HistoryResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse history response: {}", e))?;
        Ok(body.messages)
    }

    async fn delete_all_history(&self, scope: &HistoryScope) -> anyhow::Result<()> {
        debug!("Deleting history for {}", scope);
        let request = Self::with_sub_entity(self.http_client.delete(self.history_url(scope)?), scope);
        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("History delete request failed: {}", e))?;
        Self::check(response, "History delete endpoint").await?;
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for HttpBackend {
    async fn open_stream(&self, request: StreamRequest) -> anyhow::Result<TokenStream> {
        debug!("Opening chat stream for {}", request.session);
        let response = self
            .http_client
            .post(self.stream_url(&request.session.feature)?)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Chat backend request failed: {}", e))?;
        let response = Self::check(response, "Chat backend").await?;

        let byte_stream = response.bytes_stream();
        let token_stream = async_stream::try_stream! {
            // Raw bytes: a multibyte character may straddle two chunks.
            let mut buffer = BytesMut::new();
            futures_util::pin_mut!(byte_stream);
            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = chunk_result
                    .map_err(|e| anyhow::anyhow!("Stream read error: {}", e))?;
                buffer.extend_from_slice(&chunk);
                while let Some(newline_pos) = buffer.iter().position(|b| *b == b'\n') {
                    let raw = buffer.split_to(newline_pos + 1);
                    let line = String::from_utf8_lossy(&raw[..newline_pos]);
                    match parse_sse_line(line.trim()) {
                        SseEvent::Token(token) => {
                            yield token;
                        }
                        SseEvent::Done => return,
                        SseEvent::Failed(reason) => {
                            Err::<(), _>(anyhow::anyhow!("Chat backend reported: {}", reason))?;
                        }
                        SseEvent::Ignore => {}
                    }
                }
            }
            // trailing line without a newline
            if let SseEvent::Token(token) = parse_sse_line(String::from_utf8_lossy(&buffer).trim()) {
                yield token;
            }
        };
        Ok(boxed_stream(token_stream))
    }
}

#[async_trait]
impl AttachmentFetcher for HttpBackend {
    async fn fetch(&self, attachment: &AttachmentRef) -> anyhow::Result<FetchedContent> {
        debug!("Fetching attachment {} from {}", attachment.id, attachment.source_path);
        let response = self
            .http_client
            .get(self.file_url(&attachment.source_path)?)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Attachment request failed: {}", e))?;
        let response = Self::check(response, "File endpoint").await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if content_type.starts_with("text/") || content_type.starts_with("application/json") {
            let text = response
                .text()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read attachment text: {}", e))?;
            Ok(FetchedContent::Text(text))
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to read attachment bytes: {}", e))?;
            Ok(FetchedContent::Binary(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HistoryContent;
    use crate::session::identity::SessionKey;
    use futures::StreamExt;
    use std::io::Write;

    fn scope() -> HistoryScope {
        HistoryScope {
            feature: "triage".into(),
            entity_id: "pat-7".into(),
            sub_entity_id: None,
        }
    }

    fn backend(server: &mockito::ServerGuard) -> HttpBackend {
        HttpBackend::new_with_backend(server.url(), Duration::from_secs(5))
    }

    #[test]
    fn test_parse_sse_variants() {
        assert_eq!(parse_sse_line(r#"data: {"delta":"Pain"}"#), SseEvent::Token("Pain".into()));
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"ful"},"finish_reason":null}]}"#),
            SseEvent::Token("ful".into())
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#),
            SseEvent::Done
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseEvent::Done);
        assert_eq!(
            parse_sse_line(r#"data: {"error":"overloaded"}"#),
            SseEvent::Failed("overloaded".into())
        );
        assert_eq!(parse_sse_line(": keep-alive"), SseEvent::Ignore);
        assert_eq!(parse_sse_line("data: not json"), SseEvent::Ignore);
    }

    #[tokio::test]
    async fn test_fetch_history() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/chat/triage/pat-7/history")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"messages":[{"id":"h1","role":"assistant","content":"Hello"}]}"#)
            .create_async()
            .await;

        let records = backend(&server).fetch_history(&scope()).await.unwrap();
        mock.assert_async().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].content, HistoryContent::Text("Hello".into()));
    }

    #[tokio::test]
    async fn test_fetch_history_error_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/chat/triage/pat-7/history")
            .with_status(500)
            .create_async()
            .await;

        assert!(backend(&server).fetch_history(&scope()).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_history_sends_sub_entity() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/api/chat/triage/pat-7/history")
            .match_query(mockito::Matcher::UrlEncoded("sub".into(), "appt-1".into()))
            .with_status(204)
            .create_async()
            .await;

        let mut scope = scope();
        scope.sub_entity_id = Some("appt-1".into());
        backend(&server).delete_all_history(&scope).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_stream_tokens_until_done() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/chat/triage/stream")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"message":"symptoms?","context":"Weight: 5kg"}"#.into(),
            ))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("data: {\"delta\":\"Pain\"}\n\ndata: {\"delta\":\" noted\"}\n\ndata: [DONE]\n\ndata: {\"delta\":\"ignored\"}\n")
            .create_async()
            .await;

        let request = StreamRequest {
            session: SessionKey {
                feature: "triage".into(),
                entity_id: "pat-7".into(),
                sub_entity_id: None,
                epoch: 0,
            },
            message: "symptoms?".into(),
            context: "Weight: 5kg".into(),
            attachments: Vec::new(),
        };
        let stream = backend(&server).open_stream(request).await.unwrap();
        let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens, vec!["Pain", " noted"]);
    }

    #[tokio::test]
    async fn test_stream_decodes_character_split_across_chunks() {
        let mut server = mockito::Server::new_async().await;
        let body = "data: {\"delta\":\"Temp 39.5\u{b0}C\"}\n\ndata: [DONE]\n".as_bytes().to_vec();
        let split = body.iter().position(|b| *b == 0xC2).unwrap() + 1;
        server
            .mock("POST", "/api/chat/vitals/stream")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_chunked_body(move |writer| {
                writer.write_all(&body[..split])?;
                writer.flush()?;
                writer.write_all(&body[split..])
            })
            .create_async()
            .await;

        let request = StreamRequest {
            session: SessionKey {
                feature: "vitals".into(),
                entity_id: "pat-7".into(),
                sub_entity_id: None,
                epoch: 0,
            },
            message: "temp?".into(),
            context: String::new(),
            attachments: Vec::new(),
        };
        let stream = backend(&server).open_stream(request).await.unwrap();
        let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens.concat(), "Temp 39.5\u{b0}C");
    }

    #[tokio::test]
    async fn test_path_segments_are_percent_encoded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/chat/triage/pat%2F7%3Fx%20y/history")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"messages":[]}"#)
            .create_async()
            .await;

        let mut scope = scope();
        scope.entity_id = "pat/7?x y".into();
        let records = backend(&server).fetch_history(&scope).await.unwrap();
        mock.assert_async().await;
        assert!(records.is_empty());
    }

    #[test]
    fn test_file_url_keeps_directories() {
        let backend = HttpBackend::new_with_backend("http://clinic.local:8000/".into(), Duration::from_secs(5));
        let url = backend.file_url("/scans/2024 06/x-ray #2.png").unwrap();
        assert_eq!(url.as_str(), "http://clinic.local:8000/api/files/scans/2024%2006/x-ray%20%232.png");
    }

    #[tokio::test]
    async fn test_fetch_attachment_by_content_type() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/files/labs/cbc.txt")
            .with_status(200)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body("WBC 12.1")
            .create_async()
            .await;
        server
            .mock("GET", "/api/files/img/xray.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body(vec![0x89u8, 0x50, 0x4e, 0x47])
            .create_async()
            .await;

        let backend = backend(&server);
        let text = backend
            .fetch(&AttachmentRef::new("t", "cbc.txt", "text/plain", "labs/cbc.txt"))
            .await
            .unwrap();
        assert_eq!(text, FetchedContent::Text("WBC 12.1".into()));

        let image = backend
            .fetch(&AttachmentRef::new("i", "xray.png", "image/png", "/img/xray.png"))
            .await
            .unwrap();
        assert_eq!(image.len(), 4);
        assert!(matches!(image, FetchedContent::Binary(_)));
    }
}
