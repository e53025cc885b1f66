// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent subprocess abstraction.
//!
//! The core treats every agent as an opaque process with a small control
//! surface: start it, wait for ready, stream a prompt, read back buffered
//! messages, stop it. The concrete wire encoding belongs to the agent
//! executable; [`acp::AcpAgent`] speaks the newline-delimited JSON dialect
//! used by the bundled agents.

pub mod acp;
pub mod prompts;
pub mod signals;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;
use crate::error::AgentError;

/// A structured message buffered from an agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Agent finished initialising and will accept prompts.
    Ready {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_session_id: Option<String>,
    },
    /// Assistant text output.
    Update {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
        text: String,
    },
    /// Model reasoning (not part of the response text).
    Thinking {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
        text: String,
    },
    /// A tool invocation the agent performed or wants to perform.
    ToolCall {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
        tool_name: String,
        input: serde_json::Value,
    },
    /// Permission request for a gated tool call.
    PermissionRequest {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
        request_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    /// Mode or command status update.
    ModeUpdate {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
        mode: String,
    },
    /// Turn finished; response text is complete.
    TurnComplete {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    /// Fatal agent-side failure.
    Fail {
        #[serde(default = "Utc::now")]
        timestamp: DateTime<Utc>,
        message: String,
    },
}

impl AgentMessage {
    /// Response-forming text, when this message carries any.
    pub fn response_text(&self) -> Option<&str> {
        match self {
            Self::Update { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnComplete { .. } | Self::Fail { .. })
    }
}

/// Control surface the engine drives an agent through.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Spawn the underlying process. Idempotent once started.
    async fn start(&self) -> Result<(), AgentError>;

    /// Wait for the agent to signal ready, up to `timeout`.
    async fn wait_ready(&self, timeout: Duration) -> Result<(), AgentError>;

    /// Send a prompt and return when the turn completes.
    async fn send_prompt(&self, text: &str) -> Result<(), AgentError>;

    /// All messages buffered so far (monotonically growing per run).
    async fn get_messages(&self) -> Vec<AgentMessage>;

    /// Text of the current response (updates since the last prompt).
    async fn get_response_text(&self) -> String;

    /// Drop buffered tool-call messages after a turn is persisted.
    async fn clear_tool_calls(&self);

    /// Graceful stop: ask the process to exit, then reap it.
    async fn stop(&self);

    /// Hard cancel: kill the process.
    async fn cancel(&self);

    /// Auto-approve policy for gated tool calls.
    fn set_auto_approve(&self, enabled: bool);

    /// Override the model the agent should use.
    fn set_model_override(&self, model: &str);

    /// Task this agent is working on, for diagnostics.
    fn set_task_id(&self, task_id: &str);
}

/// Shared handle to an agent.
pub type AgentHandle = Arc<dyn Agent>;

/// Factory producing agents bound to a worktree. `read_only` marks review
/// agents, which must not modify the tree.
pub type AgentFactory =
    Arc<dyn Fn(&Path, &AgentConfig, bool) -> AgentHandle + Send + Sync>;

/// Serialize a slice of buffered messages as a JSONL log payload.
pub fn serialize_agent_messages(messages: &[AgentMessage]) -> Option<String> {
    if messages.is_empty() {
        return None;
    }
    let lines: Vec<String> = messages
        .iter()
        .filter_map(|m| serde_json::to_string(m).ok())
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Serialize an agent's full buffered output for the execution log.
pub async fn serialize_agent_output(agent: &dyn Agent) -> Option<String> {
    let messages = agent.get_messages().await;
    serialize_agent_messages(&messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(text: &str) -> AgentMessage {
        AgentMessage::Update {
            timestamp: Utc::now(),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_response_text_only_from_updates() {
        assert_eq!(update("hi").response_text(), Some("hi"));
        let thinking = AgentMessage::Thinking {
            timestamp: Utc::now(),
            text: "hmm".to_string(),
        };
        assert_eq!(thinking.response_text(), None);
    }

    #[test]
    fn test_terminal_messages() {
        assert!(AgentMessage::TurnComplete { timestamp: Utc::now() }.is_terminal());
        assert!(AgentMessage::Fail {
            timestamp: Utc::now(),
            message: "boom".to_string()
        }
        .is_terminal());
        assert!(!update("x").is_terminal());
    }

    #[test]
    fn test_serialize_agent_messages_jsonl() {
        assert_eq!(serialize_agent_messages(&[]), None);
        let payload = serialize_agent_messages(&[update("a"), update("b")]).unwrap();
        let lines: Vec<&str> = payload.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"type\":\"update\""));
    }
}
