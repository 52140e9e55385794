//! Model client boundary with unified streaming support.
//!
//! # Architecture
//!
//! The crate is organized around the [`ModelClient`] trait:
//!
//! - [`ModelClient`] - the interface the session engine drives; one call per
//!   generation attempt, returning a stream of incremental deltas
//! - [`HttpModelClient`] - reference implementation speaking the engine's
//!   SSE wire shape over HTTP
//! - [`ClientError`] - the error taxonomy the engine's retry policy
//!   classifies
//!
//! # Streaming Events
//!
//! All clients normalize their responses to [`StreamEvent`]:
//!
//! | Event | Description |
//! |-------|-------------|
//! | `ContentDelta` | Incremental response text from the model |
//! | `ThinkingDelta` | Incremental reasoning/thinking text |
//! | `Done` | Stream completed normally |
//!
//! Errors travel as `Err` items on the stream so partial output can be
//! captured before the failure point. Errors that prevent the stream from
//! being established at all (auth, connect, non-2xx) are returned from
//! [`ModelClient::create`] directly.
//!
//! # Retry Policy
//!
//! Clients perform **no internal retries**. Classified retry with backoff is
//! the session engine's responsibility, and a client that retried underneath
//! it would multiply attempts. Clients only classify: every surfaced error
//! answers [`ClientError::is_retryable`].

mod error;
mod http;
mod sse;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use colloquy_types;
use colloquy_types::ChatMessage;
pub use error::{ClientError, TransportKind};
pub use http::HttpModelClient;

/// One streaming generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
}

impl ChatRequest {
    #[must_use]
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: true,
            tool_choice: None,
        }
    }

    #[must_use]
    pub fn with_tool_choice(mut self, tool_choice: Option<serde_json::Value>) -> Self {
        self.tool_choice = tool_choice;
        self
    }
}

/// An incremental delta from the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Response text fragment.
    ContentDelta(String),
    /// Reasoning text fragment.
    ThinkingDelta(String),
    /// Stream completed normally.
    Done,
}

/// The delta stream for one accepted generation.
pub type EventStream = BoxStream<'static, Result<StreamEvent, ClientError>>;

/// A language-model backend.
///
/// `create` returning `Ok` means the generation was accepted: the stream head
/// exists even if no delta has arrived yet. The cancellation token must stop
/// further delta delivery when fired; callers observe the token themselves to
/// distinguish an abort from a stream failure.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn create(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<EventStream, ClientError>;
}
