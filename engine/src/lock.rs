//! Generation lock.

use std::sync::atomic::{AtomicBool, Ordering};

/// Single gate indicating whether a generation is in flight.
///
/// Owned by the session engine; the active generation run is the only code
/// that engages and releases it, and the whole retry sequence of one run
/// happens inside a single engagement. `Locked`/`Unlocked` notifications
/// travel on the event bus, not here.
#[derive(Debug, Default)]
pub struct LockState {
    engaged: AtomicBool,
}

impl LockState {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    /// Returns false when the lock was already held.
    #[must_use]
    pub(crate) fn try_engage(&self) -> bool {
        self.engaged
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.engaged.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::LockState;

    #[test]
    fn engages_once_until_released() {
        let lock = LockState::new();
        assert!(!lock.is_locked());
        assert!(lock.try_engage());
        assert!(lock.is_locked());
        assert!(!lock.try_engage());
        lock.release();
        assert!(!lock.is_locked());
        assert!(lock.try_engage());
    }
}
