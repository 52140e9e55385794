//! Agent and connection configuration snapshot.
//!
//! The engine consumes immutable snapshots of this configuration and
//! re-resolves `agent id -> agent -> connection` on every generation, since
//! agents and connections may be edited or removed between turns.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A model + system-prompt bundle addressable from user messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub connection_id: String,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Credentials and endpoint for a model backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no agent configured with id {0:?}")]
    UnknownAgent(String),
    #[error("agent {agent_id:?} references missing connection {connection_id:?}")]
    UnknownConnection {
        agent_id: String,
        connection_id: String,
    },
}

/// Point-in-time view of the available agents and connections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl ConfigSnapshot {
    #[must_use]
    pub fn agent(&self, id: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|agent| agent.id == id)
    }

    #[must_use]
    pub fn connection(&self, id: &str) -> Option<&Connection> {
        self.connections.iter().find(|connection| connection.id == id)
    }

    /// Resolve an agent id to its profile and bound connection.
    pub fn resolve(&self, agent_id: &str) -> Result<(&AgentProfile, &Connection), ResolveError> {
        let agent = self
            .agent(agent_id)
            .ok_or_else(|| ResolveError::UnknownAgent(agent_id.to_string()))?;
        let connection = self.connection(&agent.connection_id).ok_or_else(|| {
            ResolveError::UnknownConnection {
                agent_id: agent.id.clone(),
                connection_id: agent.connection_id.clone(),
            }
        })?;
        Ok((agent, connection))
    }
}
