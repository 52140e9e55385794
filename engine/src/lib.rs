//! Conversation session engine.
//!
//! A [`SessionEngine`] owns a branching history of user/assistant turns and
//! drives exactly one in-flight generation against a model backend at a time.
//! The moving parts, leaves first:
//!
//! - [`EventBus`] - synchronous pub/sub used to announce every state change
//! - [`LockState`] - single gate that blocks structural mutation while a
//!   generation is in flight
//! - [`RequestSerializer`] - FIFO queue guaranteeing single-flight generation
//! - `GenerationController` - one streaming run: context building, delta
//!   application, classified retry with backoff, cooperative cancellation
//! - [`SessionEngine`] - the public surface: add, edit-and-resend,
//!   branch switch, delete, stop, export/import, search
//!
//! Structural operations fail fast with [`EngineError::Locked`] while a
//! generation is active; reads (search, export, accessors) stay available.
//! Failures never escape a generation run: the affected turn's assistant
//! content carries a formatted error badge and a [`EngineEvent::SendError`]
//! is emitted.

mod bus;
mod config_source;
mod context;
mod errors;
mod events;
mod generation;
mod lock;
mod serializer;
mod session;

#[cfg(test)]
mod tests;

pub use bus::{EventBus, ListenerId};
pub use config_source::{ConfigSource, SharedConfig};
pub use context::{ContextBuilder, WindowStrategy};
pub use errors::{EngineError, SEND_FAILED_BADGE, STOPPED_BADGE};
pub use events::EngineEvent;
pub use generation::{GenerationConfig, GenerationOptions, GenerationOutcome};
pub use lock::LockState;
pub use serializer::RequestSerializer;
pub use session::{AddTurnOptions, EngineOptions, SessionEngine};

// Re-export the boundary crates so hosts depend on one surface.
pub use colloquy_providers::{
    self, ChatRequest, ClientError, EventStream, HttpModelClient, ModelClient, StreamEvent,
    TransportKind,
};
pub use colloquy_types::{
    AgentProfile, Attachment, AssistantMessage, BranchDescriptor, BranchIndex, BranchRef,
    ChatMessage, ConfigSnapshot, Connection, HistorySnapshot, ResolveError, Role, Turn, TurnId,
    TurnMetadata, UserMessage,
};
pub use tokio_util::sync::CancellationToken;
