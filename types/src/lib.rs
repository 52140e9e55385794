//! Core domain types for Colloquy.
//!
//! This crate contains pure domain types with no IO and no async: the turn
//! data model, branch descriptors and the branch index, the agent/connection
//! configuration snapshot, the chat wire messages consumed by the context
//! builder, and the export/import history snapshot.
//!
//! Everything here can be used from any layer of the application.

mod agent;
mod branch;
mod chat;
mod ids;
mod snapshot;
mod turn;

pub use agent::{AgentProfile, ConfigSnapshot, Connection, ResolveError};
pub use branch::{BranchDescriptor, BranchIndex};
pub use chat::{ChatMessage, Role};
pub use ids::TurnId;
pub use snapshot::HistorySnapshot;
pub use turn::{Attachment, AssistantMessage, BranchRef, Turn, TurnMetadata, UserMessage};
