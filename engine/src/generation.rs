//! Generation runs.
//!
//! One controller drives one streaming request end to end: context building,
//! delta application, classified retry with exponential backoff, and
//! cooperative cancellation. The whole retry sequence happens inside a single
//! lock engagement, so the externally observed locked span covers every
//! attempt and no structural mutation can slip in between retries.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use colloquy_providers::{ChatRequest, ClientError, StreamEvent};
use colloquy_types::{ChatMessage, Turn, TurnId};

use crate::EngineEvent;
use crate::errors::{STOPPED_BADGE, format_config_error, format_send_error};
use crate::session::EngineShared;

/// Retry policy for generation runs.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Backoff before retry N is `base_delay * 2^N`.
    pub base_delay: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// Per-run options for [`SessionEngine::enqueue_generation`](crate::SessionEngine::enqueue_generation).
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    /// Caller-supplied cancellation token; a fresh one is created when absent.
    pub cancellation: Option<CancellationToken>,
    /// Pre-built message list, bypassing the context builder.
    pub context_override: Option<Vec<ChatMessage>>,
}

/// How a generation run settled.
///
/// Failures are reported here and on the event bus, never as `Err`: every
/// failure path also writes a formatted badge into the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Complete,
    Stopped,
    Failed,
}

/// Narrow handle to the one turn a controller is allowed to touch.
///
/// The controller never walks the live list; every access goes through this
/// slot, which resolves the turn by id under the state mutex. Structural
/// operations are rejected while the lock is engaged, so the turn cannot
/// disappear mid-run.
struct TurnSlot<'a> {
    shared: &'a EngineShared,
    turn_id: &'a TurnId,
}

impl TurnSlot<'_> {
    fn exists(&self) -> bool {
        self.snapshot().is_some()
    }

    fn mutate<R>(&self, apply: impl FnOnce(&mut Turn) -> R) -> Option<R> {
        let mut state = self.shared.state();
        state
            .turns
            .iter_mut()
            .find(|turn| &turn.id == self.turn_id)
            .map(apply)
    }

    fn snapshot(&self) -> Option<Turn> {
        let state = self.shared.state();
        state
            .turns
            .iter()
            .find(|turn| &turn.id == self.turn_id)
            .cloned()
    }
}

enum StreamOutcome {
    Complete,
    Cancelled,
    Errored(ClientError),
}

pub(crate) struct GenerationController {
    shared: Arc<EngineShared>,
    turn_id: TurnId,
    cancel: CancellationToken,
    context_override: Option<Vec<ChatMessage>>,
}

impl GenerationController {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        turn_id: TurnId,
        options: GenerationOptions,
    ) -> Self {
        Self {
            shared,
            turn_id,
            cancel: options.cancellation.unwrap_or_default(),
            context_override: options.context_override,
        }
    }

    /// Execute one full run. Never panics, never escapes an error: every path
    /// settles the turn, releases the lock, and reports an outcome.
    pub(crate) async fn run(self) -> GenerationOutcome {
        let slot = TurnSlot {
            shared: &self.shared,
            turn_id: &self.turn_id,
        };
        if !slot.exists() {
            // The turn was deleted while this run sat in the queue.
            tracing::warn!(turn_id = %self.turn_id, "generation target no longer exists");
            return GenerationOutcome::Failed;
        }

        if !self.shared.lock.try_engage() {
            // The serializer guarantees exclusivity; refuse rather than interleave.
            tracing::error!(turn_id = %self.turn_id, "generation refused: lock already engaged");
            return GenerationOutcome::Failed;
        }
        self.shared.set_active_cancellation(self.cancel.clone());
        self.shared.bus.emit(&EngineEvent::Locked);

        let outcome = self.drive(&slot).await;

        self.shared.clear_active_cancellation();
        self.shared.lock.release();
        self.shared.bus.emit(&EngineEvent::Unlocked);
        outcome
    }

    async fn drive(&self, slot: &TurnSlot<'_>) -> GenerationOutcome {
        let mut attempt: u32 = 0;
        let mut stream_started = false;

        loop {
            let Some(inputs) = slot.snapshot() else {
                tracing::warn!(turn_id = %self.turn_id, "generation target vanished mid-run");
                return GenerationOutcome::Failed;
            };

            // Agents and connections may be edited between turns; resolve
            // from a fresh snapshot on every attempt.
            let config = self.shared.config.snapshot();
            let agent = match config.resolve(&inputs.metadata.agent_id) {
                Ok((agent, _connection)) => agent,
                Err(error) => {
                    self.finish_failed(slot, format_config_error(&error), error.to_string(), attempt);
                    return GenerationOutcome::Failed;
                }
            };

            slot.mutate(|turn| {
                turn.assistant.is_streaming = true;
                turn.assistant.has_error = false;
            });

            let messages = match &self.context_override {
                Some(messages) => messages.clone(),
                None => {
                    let turns = self.shared.turns_snapshot();
                    self.shared
                        .context
                        .build(&turns, agent.system_prompt.as_deref())
                }
            };
            let request = ChatRequest::new(agent.model_id.clone(), messages)
                .with_tool_choice(inputs.metadata.tool_choice.clone());

            match self.stream_once(slot, request, &mut stream_started).await {
                StreamOutcome::Complete => {
                    slot.mutate(|turn| turn.assistant.is_streaming = false);
                    if let Some(turn) = slot.snapshot() {
                        self.shared
                            .bus
                            .emit(&EngineEvent::GenerationComplete { turn });
                    }
                    return GenerationOutcome::Complete;
                }
                StreamOutcome::Cancelled => {
                    return self.finish_stopped(slot, stream_started);
                }
                StreamOutcome::Errored(error) => {
                    if error.is_retryable() && attempt < self.shared.generation.max_retries {
                        let delay = backoff_delay(self.shared.generation.base_delay, attempt);
                        tracing::debug!(
                            error = %error,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            "retrying generation after error"
                        );
                        let cancelled = tokio::select! {
                            () = self.cancel.cancelled() => true,
                            () = tokio::time::sleep(delay) => false,
                        };
                        if cancelled {
                            return self.finish_stopped(slot, stream_started);
                        }
                        // Each retry starts from a clean reply.
                        slot.mutate(|turn| {
                            turn.assistant.content.clear();
                            turn.assistant.thinking = None;
                        });
                        attempt += 1;
                        continue;
                    }

                    self.finish_failed(slot, format_send_error(&error, attempt), error.to_string(), attempt);
                    return GenerationOutcome::Failed;
                }
            }
        }
    }

    async fn stream_once(
        &self,
        slot: &TurnSlot<'_>,
        request: ChatRequest,
        stream_started: &mut bool,
    ) -> StreamOutcome {
        if self.cancel.is_cancelled() {
            return StreamOutcome::Cancelled;
        }
        let created = tokio::select! {
            () = self.cancel.cancelled() => return StreamOutcome::Cancelled,
            created = self.shared.client.create(request, self.cancel.clone()) => created,
        };
        let mut stream = match created {
            Ok(stream) => stream,
            Err(ClientError::Cancelled) => return StreamOutcome::Cancelled,
            Err(error) => return StreamOutcome::Errored(error),
        };

        // The stream head exists: the generation was accepted, even if no
        // delta has arrived yet. This matters for cancellation messaging.
        *stream_started = true;

        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return StreamOutcome::Cancelled,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(StreamEvent::ThinkingDelta(fragment))) => {
                    slot.mutate(|turn| turn.assistant.append_thinking(&fragment));
                    self.shared.bus.emit(&EngineEvent::ThinkingUpdated {
                        turn_id: self.turn_id.clone(),
                    });
                }
                Some(Ok(StreamEvent::ContentDelta(fragment))) => {
                    slot.mutate(|turn| turn.assistant.append_content(&fragment));
                }
                Some(Ok(StreamEvent::Done)) | None => return StreamOutcome::Complete,
                Some(Err(ClientError::Cancelled)) => return StreamOutcome::Cancelled,
                Some(Err(error)) => return StreamOutcome::Errored(error),
            }
        }
    }

    fn finish_stopped(&self, slot: &TurnSlot<'_>, stream_started: bool) -> GenerationOutcome {
        slot.mutate(|turn| {
            turn.assistant.is_streaming = false;
            if stream_started {
                if !turn.assistant.content.is_empty() {
                    turn.assistant.content.push_str("\n\n");
                }
                turn.assistant.content.push_str(STOPPED_BADGE);
            }
        });
        if let Some(turn) = slot.snapshot() {
            self.shared.bus.emit(&EngineEvent::GenerationStopped { turn });
        }
        GenerationOutcome::Stopped
    }

    fn finish_failed(&self, slot: &TurnSlot<'_>, message: String, error: String, attempt: u32) {
        slot.mutate(|turn| {
            turn.assistant.is_streaming = false;
            turn.assistant.has_error = true;
            turn.assistant.content = message;
        });
        if let Some(turn) = slot.snapshot() {
            self.shared.bus.emit(&EngineEvent::SendError {
                turn,
                error,
                attempt,
            });
        }
    }
}

pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::backoff_delay;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(1000);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(4000));
    }

    #[test]
    fn backoff_scales_with_the_base() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let delay = backoff_delay(Duration::from_secs(1), 40);
        assert!(delay >= Duration::from_secs(1));
    }
}
