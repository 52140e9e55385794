//! Client error taxonomy.
//!
//! The session engine retries a failed generation only when the error is
//! classified retryable here: any transport-level failure, any 5xx status,
//! or 429. Auth failures (401/403), missing models (404), and anything else
//! surface immediately.

use std::fmt;

use thiserror::Error;

/// Transport-level failure categories.
///
/// Rendered with the conventional error names hosts already know how to
/// pattern-match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Network,
    Timeout,
    ConnectionRefused,
    ConnectionTimedOut,
    DnsNotFound,
}

impl TransportKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            TransportKind::Network => "NetworkError",
            TransportKind::Timeout => "TimeoutError",
            TransportKind::ConnectionRefused => "ECONNREFUSED",
            TransportKind::ConnectionTimedOut => "ETIMEDOUT",
            TransportKind::DnsNotFound => "ENOTFOUND",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An error surfaced by a model client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The backend answered with a non-success HTTP-style status.
    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },
    /// The request never produced a usable response.
    #[error("{kind}: {message}")]
    Transport {
        kind: TransportKind,
        message: String,
    },
    /// The stream delivered a payload the client could not understand.
    #[error("invalid stream payload: {0}")]
    Protocol(String),
    /// The caller's cancellation token fired.
    #[error("request cancelled")]
    Cancelled,
}

impl ClientError {
    #[must_use]
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Whether the engine's retry policy may re-attempt after this error.
    ///
    /// Cancellation is never retryable; the engine treats it as an abort
    /// before classification.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport { .. } => true,
            ClientError::Status { status, .. } => {
                *status == 429 || (500..=599).contains(status)
            }
            ClientError::Protocol(_) | ClientError::Cancelled => false,
        }
    }

    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
