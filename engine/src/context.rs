//! Context window construction.
//!
//! Turns the live list into the flat message list sent to the model client.
//! The trailing turn contributes only its user message - its assistant reply
//! is what is being generated.

use colloquy_types::{ChatMessage, Turn};

/// How many turns of history to include.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStrategy {
    /// The whole live list.
    All,
    /// The last N *messages*, rounded up to whole turns. The trailing turn is
    /// always included.
    LastN(usize),
}

impl WindowStrategy {
    fn window_start(self, turn_count: usize) -> usize {
        match self {
            WindowStrategy::All => 0,
            WindowStrategy::LastN(messages) => {
                let turns = messages.div_ceil(2).max(1);
                turn_count.saturating_sub(turns)
            }
        }
    }
}

type ContextFn = dyn Fn(&[Turn], Option<&str>) -> Vec<ChatMessage> + Send + Sync;

/// Builds the message list for a generation.
///
/// Hosts may install a custom builder; the default walks the selected window
/// emitting a user message then (when the reply is non-empty) an assistant
/// message per turn, with an optional leading system message taken from the
/// trailing turn's override or the agent's prompt.
pub struct ContextBuilder {
    strategy: WindowStrategy,
    custom: Option<Box<ContextFn>>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(WindowStrategy::All)
    }
}

impl ContextBuilder {
    #[must_use]
    pub fn new(strategy: WindowStrategy) -> Self {
        Self {
            strategy,
            custom: None,
        }
    }

    /// Replace the default algorithm entirely.
    #[must_use]
    pub fn with_custom(
        mut self,
        builder: impl Fn(&[Turn], Option<&str>) -> Vec<ChatMessage> + Send + Sync + 'static,
    ) -> Self {
        self.custom = Some(Box::new(builder));
        self
    }

    #[must_use]
    pub fn build(&self, turns: &[Turn], agent_system_prompt: Option<&str>) -> Vec<ChatMessage> {
        if let Some(custom) = &self.custom {
            return custom(turns, agent_system_prompt);
        }
        default_context(self.strategy, turns, agent_system_prompt)
    }
}

fn default_context(
    strategy: WindowStrategy,
    turns: &[Turn],
    agent_system_prompt: Option<&str>,
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let Some(trailing) = turns.last() else {
        return messages;
    };

    let system_prompt = trailing
        .metadata
        .system_prompt_override
        .as_deref()
        .or(agent_system_prompt);
    if let Some(system_prompt) = system_prompt {
        messages.push(ChatMessage::system(system_prompt));
    }

    let start = strategy.window_start(turns.len());
    for turn in &turns[start..turns.len() - 1] {
        messages.push(ChatMessage::user(
            turn.user.content.clone(),
            turn.user.attachments.clone(),
        ));
        if !turn.assistant.content.is_empty() {
            messages.push(ChatMessage::assistant(turn.assistant.content.clone()));
        }
    }
    messages.push(ChatMessage::user(
        trailing.user.content.clone(),
        trailing.user.attachments.clone(),
    ));

    messages
}
