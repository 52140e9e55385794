//! Reference HTTP model client.
//!
//! Speaks the engine's wire shape over SSE: a single streaming POST whose
//! `data:` payloads are `{"delta": {"content"?, "thinking"?}, "finishReason"?}`
//! chunks. The client performs no retries of its own - retry policy belongs
//! to the session engine, which classifies the errors surfaced here.

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use colloquy_types::Connection;

use crate::sse::{SseBuffer, event_data};
use crate::{ChatRequest, ClientError, EventStream, ModelClient, StreamEvent, TransportKind};

/// Path the generation endpoint lives under, relative to the connection's
/// base URL.
pub const GENERATE_PATH: &str = "/v1/generate";

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;
const MAX_PARSE_ERRORS: usize = 3;
const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// HTTP-backed [`ModelClient`].
#[derive(Debug, Clone)]
pub struct HttpModelClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    idle_timeout: Duration,
}

impl HttpModelClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build configured HTTP client: {e}. Using defaults.");
                reqwest::Client::new()
            });
        Self {
            client,
            base_url: base_url.into(),
            api_key: None,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    /// Build a client for a configured connection.
    #[must_use]
    pub fn for_connection(connection: &Connection) -> Self {
        let mut client = Self::new(connection.base_url.clone());
        client.api_key = connection.api_key.clone();
        client
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}{GENERATE_PATH}", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn create(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ClientError> {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = tokio::select! {
            () = cancel.cancelled() => return Err(ClientError::Cancelled),
            sent = builder.send() => sent.map_err(|e| map_reqwest_error(&e))?,
        };

        let status = response.status();
        if !status.is_success() {
            let message = read_capped_error_body(response).await;
            return Err(ClientError::status(status.as_u16(), message));
        }

        Ok(sse_event_stream(response, cancel, self.idle_timeout))
    }
}

/// One SSE chunk in the wire shape.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireChunk {
    #[serde(default)]
    delta: WireDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

fn sse_event_stream(
    response: reqwest::Response,
    cancel: CancellationToken,
    idle_timeout: Duration,
) -> EventStream {
    Box::pin(stream! {
        let mut bytes = response.bytes_stream();
        let mut buffer = SseBuffer::new();
        let mut parse_errors = 0usize;

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => {
                    yield Err(ClientError::Cancelled);
                    return;
                }
                next = tokio::time::timeout(idle_timeout, bytes.next()) => next,
            };

            let Ok(next) = next else {
                yield Err(ClientError::transport(TransportKind::Timeout, "stream idle timeout"));
                return;
            };

            let Some(chunk) = next else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(map_reqwest_error(&e));
                    return;
                }
            };

            buffer.push(&chunk);
            if buffer.len() > MAX_SSE_BUFFER_BYTES {
                yield Err(ClientError::Protocol(
                    "SSE buffer exceeded maximum size (4 MiB)".to_string(),
                ));
                return;
            }

            while let Some(event) = buffer.next_event() {
                if event.is_empty() {
                    continue;
                }

                let Ok(event) = std::str::from_utf8(&event) else {
                    yield Err(ClientError::Protocol(
                        "invalid UTF-8 in stream".to_string(),
                    ));
                    return;
                };

                let Some(data) = event_data(event) else { continue };

                if data == "[DONE]" {
                    yield Ok(StreamEvent::Done);
                    return;
                }

                match serde_json::from_str::<WireChunk>(&data) {
                    Ok(chunk) => {
                        parse_errors = 0;
                        if let Some(thinking) = chunk.delta.thinking {
                            if !thinking.is_empty() {
                                yield Ok(StreamEvent::ThinkingDelta(thinking));
                            }
                        }
                        if let Some(content) = chunk.delta.content {
                            if !content.is_empty() {
                                yield Ok(StreamEvent::ContentDelta(content));
                            }
                        }
                        if chunk.finish_reason.is_some() {
                            yield Ok(StreamEvent::Done);
                            return;
                        }
                    }
                    Err(e) => {
                        parse_errors += 1;
                        tracing::warn!(%e, payload_bytes = data.len(), "invalid stream payload");
                        if parse_errors >= MAX_PARSE_ERRORS {
                            yield Err(ClientError::Protocol(e.to_string()));
                            return;
                        }
                    }
                }
            }
        }

        // Connection closed without a completion signal.
        yield Err(ClientError::transport(
            TransportKind::Network,
            "connection closed before stream completed",
        ));
    })
}

fn map_reqwest_error(error: &reqwest::Error) -> ClientError {
    let kind = if error.is_timeout() {
        TransportKind::Timeout
    } else if error.is_connect() {
        TransportKind::ConnectionRefused
    } else {
        TransportKind::Network
    };
    ClientError::transport(kind, error.to_string())
}

async fn read_capped_error_body(response: reqwest::Response) -> String {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}
