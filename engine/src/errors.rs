//! Engine errors and user-visible failure badges.

use thiserror::Error;

use colloquy_providers::ClientError;
use colloquy_types::TurnId;

/// Badge prefixing a failed generation's assistant content.
pub const SEND_FAILED_BADGE: &str = "[Send failed]";
/// Badge appended when the user stops a generation mid-stream.
pub const STOPPED_BADGE: &str = "[Generation stopped]";

#[derive(Debug, Error)]
pub enum EngineError {
    /// A structural mutation was attempted while a generation is in flight.
    /// Never retried internally; callers surface it directly.
    #[error("session is locked by an in-flight generation")]
    Locked,
    #[error("turn not found: {0}")]
    TurnNotFound(TurnId),
    #[error("branch descriptor does not belong to origin turn {0}")]
    UnknownBranch(TurnId),
}

/// Format the assistant-content badge for a failed generation.
///
/// The content field itself carries the failure so a plain renderer needs no
/// special-case UI. The retry count is appended when retries occurred.
pub(crate) fn format_send_error(error: &ClientError, retries: u32) -> String {
    let mut message = format!("{SEND_FAILED_BADGE} {error}");
    if let Some(hint) = status_hint(error) {
        message.push_str(" - ");
        message.push_str(hint);
    }
    if retries > 0 {
        message.push_str(&format!(" (after {retries} retries)"));
    }
    message
}

/// Format the badge for an unresolved agent or connection.
pub(crate) fn format_config_error(error: &colloquy_types::ResolveError) -> String {
    format!("{SEND_FAILED_BADGE} {error} - check the agent configuration")
}

fn status_hint(error: &ClientError) -> Option<&'static str> {
    match error.status_code()? {
        401 | 403 => Some("check the connection's credentials"),
        404 => Some("the configured model is unavailable"),
        429 => Some("the backend is rate limiting requests"),
        500..=599 => Some("the backend reported a server error"),
        _ => None,
    }
}
