// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading for the Kagan core.
//!
//! User configuration lives in `~/.kagan/config.yaml`. A missing file yields
//! defaults; a malformed file is an error (silently ignoring a typo'd config
//! is worse than failing fast).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KaganConfig {
    pub general: GeneralConfig,

    /// Named agent definitions, keyed by agent id.
    pub agents: HashMap<String, AgentConfig>,
}

/// General daemon and automation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Maximum number of concurrently running AUTO agents.
    pub max_concurrent_agents: usize,

    /// Run the review agent automatically after an AUTO task completes.
    pub auto_review: bool,

    /// Baseline auto-approve policy for planner-scoped agents.
    pub auto_approve: bool,

    /// Base branch used when a task does not specify one.
    pub default_base_branch: String,

    /// Agent id used when a task does not specify one.
    pub default_agent: String,

    /// Terminal backend for PAIR sessions (tmux, vscode, cursor).
    pub default_terminal_backend: String,

    /// Seconds of zero connected clients before the daemon stops (0 disables).
    pub core_idle_timeout_seconds: u64,

    /// IPC transport preference: auto, unix, or tcp.
    pub core_transport_preference: TransportPreference,

    /// Model override for claude-family agents.
    pub default_model_claude: Option<String>,

    /// Model override for opencode-family agents.
    pub default_model_opencode: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 2,
            auto_review: true,
            auto_approve: false,
            default_base_branch: "main".to_string(),
            default_agent: "claude".to_string(),
            default_terminal_backend: "tmux".to_string(),
            core_idle_timeout_seconds: 300,
            core_transport_preference: TransportPreference::Auto,
            default_model_claude: None,
            default_model_opencode: None,
        }
    }
}

/// IPC transport preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// Unix socket where available, loopback TCP otherwise.
    #[default]
    Auto,
    Unix,
    Tcp,
}

/// One agent definition: how to launch the executable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Display name.
    pub name: String,

    /// Identity string used for model-override family matching
    /// (e.g. "claude-code", "opencode").
    pub identity: String,

    /// Executable to spawn.
    pub command: String,

    /// Arguments passed to the executable.
    pub args: Vec<String>,

    /// Extra environment variables for the subprocess.
    pub env: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "claude".to_string(),
            identity: "claude-code".to_string(),
            command: "claude".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

impl KaganConfig {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        Ok(config)
    }

    /// Resolve the agent config for an agent id, falling back to the default
    /// agent, then to a built-in claude definition.
    pub fn agent_config(&self, agent_id: Option<&str>) -> AgentConfig {
        let id = agent_id.unwrap_or(&self.general.default_agent);
        if let Some(config) = self.agents.get(id) {
            return config.clone();
        }
        if let Some(config) = self.agents.get(&self.general.default_agent) {
            return config.clone();
        }
        AgentConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KaganConfig::default();
        assert_eq!(config.general.max_concurrent_agents, 2);
        assert!(config.general.auto_review);
        assert_eq!(config.general.default_base_branch, "main");
        assert_eq!(
            config.general.core_transport_preference,
            TransportPreference::Auto
        );
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = KaganConfig::load(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(config.general.default_agent, "claude");
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "general:\n  max_concurrent_agents: 5\n  default_base_branch: develop\n",
        )
        .unwrap();

        let config = KaganConfig::load(&path).unwrap();
        assert_eq!(config.general.max_concurrent_agents, 5);
        assert_eq!(config.general.default_base_branch, "develop");
        // Unspecified fields keep their defaults.
        assert!(config.general.auto_review);
    }

    #[test]
    fn test_load_malformed_yaml_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "general: [not a mapping").unwrap();
        assert!(KaganConfig::load(&path).is_err());
    }

    #[test]
    fn test_agent_config_fallback() {
        let mut config = KaganConfig::default();
        config.agents.insert(
            "opencode".to_string(),
            AgentConfig {
                name: "opencode".to_string(),
                identity: "opencode".to_string(),
                command: "opencode".to_string(),
                ..AgentConfig::default()
            },
        );

        assert_eq!(config.agent_config(Some("opencode")).command, "opencode");
        // Unknown id falls back to the built-in default.
        assert_eq!(config.agent_config(Some("mystery")).identity, "claude-code");
        assert_eq!(config.agent_config(None).identity, "claude-code");
    }
}
