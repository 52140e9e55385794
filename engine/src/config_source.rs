//! Reactive configuration source.
//!
//! The engine re-resolves `agent id -> agent -> connection` from a fresh
//! snapshot on every generation attempt, since agents and connections may be
//! edited or removed between turns. Implementations therefore hand out
//! snapshots, never long-lived resolved objects.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use colloquy_types::ConfigSnapshot;

/// Supplier of agent/connection snapshots.
pub trait ConfigSource: Send + Sync {
    /// A fresh point-in-time view. Called at least once per generation
    /// attempt; must reflect all edits made so far.
    fn snapshot(&self) -> ConfigSnapshot;
}

/// A static snapshot is its own source. Convenient for tests and hosts whose
/// configuration never changes at runtime.
impl ConfigSource for ConfigSnapshot {
    fn snapshot(&self) -> ConfigSnapshot {
        self.clone()
    }
}

/// Mutable, shareable configuration with change tracking.
///
/// Hosts replace the snapshot wholesale when the user edits agents or
/// connections; the version counter lets observers cheaply detect staleness.
#[derive(Debug, Default)]
pub struct SharedConfig {
    inner: RwLock<ConfigSnapshot>,
    version: AtomicU64,
}

impl SharedConfig {
    #[must_use]
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            inner: RwLock::new(snapshot),
            version: AtomicU64::new(0),
        }
    }

    /// Install a new snapshot; returns the new version.
    pub fn replace(&self, snapshot: ConfigSnapshot) -> u64 {
        *self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner) = snapshot;
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl ConfigSource for SharedConfig {
    fn snapshot(&self) -> ConfigSnapshot {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
