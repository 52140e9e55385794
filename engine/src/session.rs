//! The session engine.
//!
//! Owns the live turn list, the branch index, the generation lock, and the
//! request serializer, and exposes the public operations. The live list is
//! the currently selected path through the branching tree, not the whole
//! tree: editing or switching branches truncates from the affected position
//! and appends the new variant - a checkout, not a merge.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use colloquy_providers::ModelClient;
use colloquy_types::{
    Attachment, BranchDescriptor, BranchIndex, BranchRef, HistorySnapshot, Turn, TurnId,
    UserMessage,
};

use crate::bus::{EventBus, ListenerId};
use crate::config_source::ConfigSource;
use crate::context::ContextBuilder;
use crate::errors::EngineError;
use crate::events::EngineEvent;
use crate::generation::{
    GenerationConfig, GenerationController, GenerationOptions, GenerationOutcome,
};
use crate::lock::LockState;
use crate::serializer::RequestSerializer;

/// Mutable session data, guarded by one mutex with short critical sections.
#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) turns: Vec<Turn>,
    pub(crate) branches: BranchIndex,
    pub(crate) search_matches: Vec<TurnId>,
}

impl SessionState {
    fn position(&self, turn_id: &TurnId) -> Option<usize> {
        self.turns.iter().position(|turn| &turn.id == turn_id)
    }

    /// Drop search matches that no longer point at live turns.
    fn prune_search_matches(&mut self) {
        let turns = &self.turns;
        self.search_matches
            .retain(|id| turns.iter().any(|turn| &turn.id == id));
    }
}

/// State shared between the engine handle and its generation runs.
pub(crate) struct EngineShared {
    state: Mutex<SessionState>,
    pub(crate) lock: LockState,
    pub(crate) bus: EventBus,
    pub(crate) serializer: RequestSerializer,
    pub(crate) client: Arc<dyn ModelClient>,
    pub(crate) config: Arc<dyn ConfigSource>,
    pub(crate) context: ContextBuilder,
    pub(crate) generation: GenerationConfig,
    active_cancellation: Mutex<Option<CancellationToken>>,
}

impl EngineShared {
    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn turns_snapshot(&self) -> Vec<Turn> {
        self.state().turns.clone()
    }

    pub(crate) fn set_active_cancellation(&self, cancel: CancellationToken) {
        *self.active_token() = Some(cancel);
    }

    pub(crate) fn clear_active_cancellation(&self) {
        *self.active_token() = None;
    }

    fn active_token(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.active_cancellation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_unlocked(&self) -> Result<(), EngineError> {
        if self.lock.is_locked() {
            return Err(EngineError::Locked);
        }
        Ok(())
    }
}

/// Construction-time knobs.
#[derive(Default)]
pub struct EngineOptions {
    pub generation: GenerationConfig,
    pub context: ContextBuilder,
}

/// Options for [`SessionEngine::add_turn`].
#[derive(Debug, Clone, Default)]
pub struct AddTurnOptions {
    pub agent_id: String,
    pub attachments: Vec<Attachment>,
    pub tool_choice: Option<serde_json::Value>,
    pub system_prompt_override: Option<String>,
}

impl AddTurnOptions {
    #[must_use]
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }
}

/// A conversation session: branching turn history plus single-flight
/// generation. Clones share the same session; independent engines are fully
/// isolated from each other.
#[derive(Clone)]
pub struct SessionEngine {
    shared: Arc<EngineShared>,
}

impl SessionEngine {
    #[must_use]
    pub fn new(client: Arc<dyn ModelClient>, config: Arc<dyn ConfigSource>) -> Self {
        Self::with_options(client, config, EngineOptions::default())
    }

    #[must_use]
    pub fn with_options(
        client: Arc<dyn ModelClient>,
        config: Arc<dyn ConfigSource>,
        options: EngineOptions,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                state: Mutex::new(SessionState::default()),
                lock: LockState::new(),
                bus: EventBus::new(),
                serializer: RequestSerializer::new(),
                client,
                config,
                context: options.context,
                generation: options.generation,
                active_cancellation: Mutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Structural operations (rejected while a generation is in flight)
    // ------------------------------------------------------------------

    /// Append a new turn. Does not send anything; queue a generation
    /// separately.
    pub fn add_turn(
        &self,
        user_content: impl Into<String>,
        assistant_seed: impl Into<String>,
        options: AddTurnOptions,
    ) -> Result<Turn, EngineError> {
        self.shared.ensure_unlocked()?;

        let user = UserMessage::new(user_content, options.agent_id)
            .with_attachments(options.attachments);
        let mut turn = Turn::new(user, assistant_seed, SystemTime::now());
        turn.metadata.tool_choice = options.tool_choice;
        turn.metadata.system_prompt_override = options.system_prompt_override;

        self.shared.state().turns.push(turn.clone());
        self.shared.bus.emit(&EngineEvent::TurnAdded { turn: turn.clone() });
        Ok(turn)
    }

    /// Remove and drop a turn. Returns whether it existed.
    pub fn delete_turn(&self, turn_id: &TurnId) -> Result<bool, EngineError> {
        self.shared.ensure_unlocked()?;

        let removed = {
            let mut state = self.shared.state();
            match state.position(turn_id) {
                Some(index) => {
                    state.turns.remove(index);
                    state.prune_search_matches();
                    true
                }
                None => false,
            }
        };
        if removed {
            self.shared.bus.emit(&EngineEvent::TurnDeleted {
                turn_id: turn_id.clone(),
            });
        }
        Ok(removed)
    }

    /// Reset a turn's assistant output in place, keeping the turn. Used to
    /// retry a reply without rebuilding the turn. Returns whether it existed.
    pub fn clear_assistant_content(&self, turn_id: &TurnId) -> Result<bool, EngineError> {
        self.shared.ensure_unlocked()?;

        let cleared = {
            let mut state = self.shared.state();
            match state.position(turn_id) {
                Some(index) => {
                    state.turns[index].assistant.reset();
                    true
                }
                None => false,
            }
        };
        if cleared {
            self.shared.bus.emit(&EngineEvent::AssistantCleared {
                turn_id: turn_id.clone(),
            });
        }
        Ok(cleared)
    }

    /// Replace a turn with an edited variant and regenerate from it.
    ///
    /// Records the edited turn as a branch origin (preserving its original
    /// user content as descriptor 0), truncates the live list from the turn's
    /// position inclusive, appends a fresh turn with the new content, and
    /// runs a generation for it. The discarded suffix is destroyed.
    pub async fn edit_and_resend(
        &self,
        turn_id: &TurnId,
        new_user_content: impl Into<String>,
        new_agent_id: Option<String>,
    ) -> Result<Turn, EngineError> {
        self.shared.ensure_unlocked()?;
        let new_user_content = new_user_content.into();

        let new_turn = {
            let mut state = self.shared.state();
            let index = state
                .position(turn_id)
                .ok_or_else(|| EngineError::TurnNotFound(turn_id.clone()))?;
            let origin = state.turns[index].clone();

            let agent_id = new_agent_id.unwrap_or_else(|| origin.user.agent_id.clone());
            let user = UserMessage::new(new_user_content, agent_id);
            let mut turn = Turn::new(user, String::new(), SystemTime::now());
            turn.metadata.tool_choice = origin.metadata.tool_choice.clone();
            turn.metadata.system_prompt_override = origin.metadata.system_prompt_override.clone();

            state.branches.record_branch(&origin, &mut turn);
            state.turns.truncate(index);
            state.turns.push(turn.clone());
            state.prune_search_matches();
            turn
        };

        self.shared.bus.emit(&EngineEvent::MessageResent {
            original_turn_id: turn_id.clone(),
            new_turn: new_turn.clone(),
        });

        self.enqueue_generation(&new_turn.id, GenerationOptions::default())
            .await?;
        Ok(self.turn(&new_turn.id).unwrap_or(new_turn))
    }

    /// Check out a previously recorded branch at an origin position.
    ///
    /// Same truncation/append mechanics as [`Self::edit_and_resend`], sourcing
    /// the user message from the descriptor. The new turn carries a branch
    /// ref unless the descriptor is the original. The reply was destroyed
    /// when this branch was last switched away, so it is regenerated.
    pub async fn switch_to_branch(
        &self,
        origin_turn_id: &TurnId,
        descriptor: &BranchDescriptor,
    ) -> Result<Turn, EngineError> {
        self.shared.ensure_unlocked()?;

        let new_turn = {
            let mut state = self.shared.state();

            let branch_index = state
                .branches
                .descriptors_for(origin_turn_id)
                .iter()
                .position(|known| known.id == descriptor.id)
                .ok_or_else(|| EngineError::UnknownBranch(origin_turn_id.clone()))?;

            // The live turn at the origin position is either the origin
            // itself or a sibling variant pointing back at it.
            let index = state
                .turns
                .iter()
                .position(|turn| {
                    &turn.id == origin_turn_id
                        || turn
                            .metadata
                            .branch_ref
                            .as_ref()
                            .is_some_and(|branch| &branch.parent_turn_id == origin_turn_id)
                })
                .ok_or_else(|| EngineError::TurnNotFound(origin_turn_id.clone()))?;

            let user = UserMessage::new(
                descriptor.user_content.clone(),
                descriptor.agent_id.clone(),
            );
            let mut turn = Turn::new(user, String::new(), SystemTime::now());
            // The checked-out turn takes the descriptor's id back. The
            // previous holder was destroyed when this branch was switched
            // away, and keeping the id stable is what lets the origin
            // position be found again on the next switch.
            turn.id = descriptor.id.clone();
            if !descriptor.is_original {
                turn.metadata.branch_ref = Some(BranchRef {
                    parent_turn_id: origin_turn_id.clone(),
                    branch_index,
                });
            }

            state.turns.truncate(index);
            state.turns.push(turn.clone());
            state.prune_search_matches();
            turn
        };

        self.shared.bus.emit(&EngineEvent::BranchSwitched {
            origin_turn_id: origin_turn_id.clone(),
            new_turn: new_turn.clone(),
        });

        self.enqueue_generation(&new_turn.id, GenerationOptions::default())
            .await?;
        Ok(self.turn(&new_turn.id).unwrap_or(new_turn))
    }

    /// Replace the whole session with a snapshot. Clears the live list and
    /// branch index first. Returns the number of loaded turns.
    pub fn import_history(&self, snapshot: HistorySnapshot) -> Result<usize, EngineError> {
        self.shared.ensure_unlocked()?;

        let count = snapshot.turns.len();
        {
            let mut state = self.shared.state();
            state.turns.clear();
            state.branches.clear();
            state.search_matches.clear();
            state.turns = snapshot.turns;
            state.branches = snapshot.branches;
        }
        self.shared
            .bus
            .emit(&EngineEvent::HistoryLoaded { count });
        Ok(count)
    }

    /// Empty the session.
    pub fn clear_history(&self) -> Result<(), EngineError> {
        self.shared.ensure_unlocked()?;

        {
            let mut state = self.shared.state();
            state.turns.clear();
            state.branches.clear();
            state.search_matches.clear();
        }
        self.shared.bus.emit(&EngineEvent::HistoryCleared);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    /// Queue a generation run for a turn and await its settlement.
    ///
    /// Runs are strictly serialized: a second call waits until the first has
    /// fully settled. Generation failures do not surface as `Err` - the turn
    /// carries the failure badge and the outcome reports `Failed`.
    pub async fn enqueue_generation(
        &self,
        turn_id: &TurnId,
        options: GenerationOptions,
    ) -> Result<GenerationOutcome, EngineError> {
        if self.turn(turn_id).is_none() {
            return Err(EngineError::TurnNotFound(turn_id.clone()));
        }

        let controller =
            GenerationController::new(Arc::clone(&self.shared), turn_id.clone(), options);
        let settled = self.shared.serializer.enqueue(controller.run());
        match settled.await {
            Ok(outcome) => Ok(outcome),
            // The runtime is tearing down; treat the run as failed.
            Err(_) => Ok(GenerationOutcome::Failed),
        }
    }

    /// Cancel the active generation, if any. No-op otherwise. Queued runs are
    /// unaffected.
    pub fn stop_generation(&self) {
        let token = self.shared.active_token().clone();
        if let Some(token) = token {
            token.cancel();
        }
    }

    // ------------------------------------------------------------------
    // Reads (valid while locked)
    // ------------------------------------------------------------------

    /// Serialize the live list and branch index.
    #[must_use]
    pub fn export_history(&self) -> HistorySnapshot {
        let state = self.shared.state();
        HistorySnapshot {
            turns: state.turns.clone(),
            branches: state.branches.clone(),
        }
    }

    /// Case-insensitive substring search over user and assistant content, in
    /// live-list order. An empty keyword clears the stored match state and
    /// returns nothing.
    pub fn search(&self, keyword: &str) -> Vec<TurnId> {
        let mut state = self.shared.state();
        if keyword.is_empty() {
            state.search_matches.clear();
            return Vec::new();
        }
        let needle = keyword.to_lowercase();
        let matches: Vec<TurnId> = state
            .turns
            .iter()
            .filter(|turn| turn.matches_keyword(&needle))
            .map(|turn| turn.id.clone())
            .collect();
        state.search_matches = matches.clone();
        matches
    }

    /// Matches from the most recent non-empty [`Self::search`].
    #[must_use]
    pub fn search_matches(&self) -> Vec<TurnId> {
        self.shared.state().search_matches.clone()
    }

    #[must_use]
    pub fn turns(&self) -> Vec<Turn> {
        self.shared.turns_snapshot()
    }

    #[must_use]
    pub fn turn(&self, turn_id: &TurnId) -> Option<Turn> {
        let state = self.shared.state();
        state
            .turns
            .iter()
            .find(|turn| &turn.id == turn_id)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state().turns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.state().turns.is_empty()
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.shared.lock.is_locked()
    }

    #[must_use]
    pub fn has_branches(&self, turn_id: &TurnId) -> bool {
        self.shared.state().branches.has_branches(turn_id)
    }

    #[must_use]
    pub fn branch_descriptors(&self, turn_id: &TurnId) -> Vec<BranchDescriptor> {
        self.shared
            .state()
            .branches
            .descriptors_for(turn_id)
            .to_vec()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.shared.bus.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.bus.unsubscribe(id)
    }
}
