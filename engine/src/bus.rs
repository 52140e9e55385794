//! Synchronous publish/subscribe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::EngineEvent;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

/// Calls every currently-registered listener once per event, in registration
/// order. No delivery guarantees beyond that: listeners run synchronously on
/// the emitting task and are expected to hand work off quickly.
///
/// The listener list is snapshotted before delivery, so a listener may
/// subscribe or unsubscribe reentrantly; the change takes effect from the
/// next emission.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners().push((id, Arc::new(listener)));
        id
    }

    /// Returns whether the listener was still registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn emit(&self, event: &EngineEvent) {
        let snapshot: Vec<Listener> = self
            .listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
