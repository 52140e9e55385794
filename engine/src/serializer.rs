//! Single-flight request serialization.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

type QueuedRun = BoxFuture<'static, ()>;

struct State {
    queue: VecDeque<QueuedRun>,
    draining: bool,
}

/// FIFO queue ensuring at most one queued run executes at any time.
///
/// Each entry is fully awaited before the next one starts, which is what
/// prevents two generation runs from interleaving against the same engine.
/// When the queue is idle, enqueueing spawns a drain task that starts the
/// entry immediately; otherwise the entry waits its turn.
pub struct RequestSerializer {
    state: Arc<Mutex<State>>,
}

impl Default for RequestSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestSerializer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                queue: VecDeque::new(),
                draining: false,
            })),
        }
    }

    /// Queue a run. The returned receiver resolves with the run's output once
    /// it has fully settled; it errors only if the runtime is torn down
    /// before the run executes.
    pub fn enqueue<T, F>(&self, run: F) -> oneshot::Receiver<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (resolve, receiver) = oneshot::channel();
        let task: QueuedRun = Box::pin(async move {
            let output = run.await;
            // The caller may have dropped the receiver; the run still counts
            // as settled.
            let _ = resolve.send(output);
        });

        let start_drain = {
            let mut state = lock(&self.state);
            state.queue.push_back(task);
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };

        if start_drain {
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut state = lock(&state);
                        let next = state.queue.pop_front();
                        if next.is_none() {
                            state.draining = false;
                        }
                        next
                    };
                    match next {
                        Some(run) => run.await,
                        None => break,
                    }
                }
            });
        }

        receiver
    }

    /// Entries waiting to start, not counting one currently executing.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        lock(&self.state).queue.len()
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
