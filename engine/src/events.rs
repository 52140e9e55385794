//! Engine events.
//!
//! Observer notifications only. Internal completion signaling goes through
//! oneshot channels in the serializer, never through these events, so a slow
//! observer can delay rendering but can never stall the engine's scheduling.

use colloquy_types::{Turn, TurnId};

/// A state change announced on the [`EventBus`](crate::EventBus).
///
/// `Turn` payloads are snapshots cloned at emission time; observers never
/// alias engine-owned state.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TurnAdded {
        turn: Turn,
    },
    TurnDeleted {
        turn_id: TurnId,
    },
    AssistantCleared {
        turn_id: TurnId,
    },
    MessageResent {
        original_turn_id: TurnId,
        new_turn: Turn,
    },
    BranchSwitched {
        origin_turn_id: TurnId,
        new_turn: Turn,
    },
    /// A thinking fragment was appended to the streaming turn.
    ThinkingUpdated {
        turn_id: TurnId,
    },
    GenerationComplete {
        turn: Turn,
    },
    GenerationStopped {
        turn: Turn,
    },
    SendError {
        turn: Turn,
        error: String,
        attempt: u32,
    },
    Locked,
    Unlocked,
    HistoryCleared,
    HistoryLoaded {
        count: usize,
    },
}

impl EngineEvent {
    /// Stable name for logging and host-side dispatch.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::TurnAdded { .. } => "turnAdded",
            EngineEvent::TurnDeleted { .. } => "turnDeleted",
            EngineEvent::AssistantCleared { .. } => "assistantCleared",
            EngineEvent::MessageResent { .. } => "messageResent",
            EngineEvent::BranchSwitched { .. } => "branchSwitched",
            EngineEvent::ThinkingUpdated { .. } => "thinkingUpdated",
            EngineEvent::GenerationComplete { .. } => "generationComplete",
            EngineEvent::GenerationStopped { .. } => "generationStopped",
            EngineEvent::SendError { .. } => "sendError",
            EngineEvent::Locked => "locked",
            EngineEvent::Unlocked => "unlocked",
            EngineEvent::HistoryCleared => "historyCleared",
            EngineEvent::HistoryLoaded { .. } => "historyLoaded",
        }
    }
}
