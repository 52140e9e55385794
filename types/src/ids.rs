use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Process-unique identifier for a [`Turn`](crate::Turn).
///
/// Generated ids combine a millisecond timestamp, a process-wide counter,
/// and a random suffix. Uniqueness within a process is guaranteed by the
/// counter; the timestamp makes ids monotonic-enough for display. Global
/// ordering is not a guarantee and callers must not rely on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(String);

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl TurnId {
    /// Generate a fresh id.
    #[must_use]
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or(0);
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = rand::random();
        Self(format!("{millis:x}-{sequence:x}-{suffix:08x}"))
    }

    /// Wrap an externally supplied id, e.g. when importing a history snapshot.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TurnId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}
