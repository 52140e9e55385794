//! Core turn domain model.
//!
//! A [`Turn`] is the atomic unit of conversation history: one user message,
//! one assistant reply, and metadata. Constructors take `SystemTime`
//! explicitly; callers own the clock. Field names serialize in camelCase so
//! the export surface matches the host protocol byte-for-byte.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::TurnId;

/// A file or media reference attached to a user message.
///
/// Attachments are opaque to the engine and the context builder; they are
/// carried through to the model client unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub name: String,
    pub size: u64,
}

/// The user half of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Id of the agent this message was addressed to.
    pub agent_id: String,
}

impl UserMessage {
    #[must_use]
    pub fn new(content: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attachments: Vec::new(),
            agent_id: agent_id.into(),
        }
    }

    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// The assistant half of a turn.
///
/// Mutated in place by the generation controller while a stream is active.
/// On failure the `content` field carries the formatted error badge, so a
/// plain renderer needs no special-case error UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub is_streaming: bool,
    pub has_error: bool,
}

impl AssistantMessage {
    #[must_use]
    pub fn seeded(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            thinking: None,
            is_streaming: false,
            has_error: false,
        }
    }

    pub fn append_content(&mut self, fragment: &str) {
        self.content.push_str(fragment);
    }

    pub fn append_thinking(&mut self, fragment: &str) {
        self.thinking.get_or_insert_with(String::new).push_str(fragment);
    }

    /// Reset output and error state, keeping the message in place.
    ///
    /// Used both for retry-in-place and between retry attempts of one run.
    pub fn reset(&mut self) {
        self.content.clear();
        self.thinking = None;
        self.has_error = false;
    }
}

/// Position of a turn within its origin's branch set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRef {
    pub parent_turn_id: TurnId,
    pub branch_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMetadata {
    pub created_at: SystemTime,
    pub agent_id: String,
    /// Opaque tool-choice value passed through to the model client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,
    /// Set when this turn was created by switching to a recorded branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_ref: Option<BranchRef>,
}

/// One user message + one assistant reply + metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: TurnId,
    pub user: UserMessage,
    pub assistant: AssistantMessage,
    pub metadata: TurnMetadata,
}

impl Turn {
    /// Create a turn with a fresh id. The agent id is mirrored into the
    /// metadata so generation can resolve it after the user half is replaced.
    #[must_use]
    pub fn new(user: UserMessage, assistant_seed: impl Into<String>, created_at: SystemTime) -> Self {
        let agent_id = user.agent_id.clone();
        Self {
            id: TurnId::generate(),
            user,
            assistant: AssistantMessage::seeded(assistant_seed),
            metadata: TurnMetadata {
                created_at,
                agent_id,
                tool_choice: None,
                system_prompt_override: None,
                branch_ref: None,
            },
        }
    }

    /// Case-insensitive substring match over user and assistant content.
    ///
    /// `needle` must already be lowercased.
    #[must_use]
    pub fn matches_keyword(&self, needle: &str) -> bool {
        self.user.content.to_lowercase().contains(needle)
            || self.assistant.content.to_lowercase().contains(needle)
    }
}
