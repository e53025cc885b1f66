// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! PAIR and resolution terminal sessions.
//!
//! A PAIR session attaches a human to the task's primary worktree through a
//! terminal multiplexer or editor launcher. The core only prepares the
//! launch: it writes a `start_prompt.md` into the worktree and returns the
//! command line the UI should exec. Resolution sessions reuse the same
//! machinery against the merge worktree.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::config::KaganConfig;
use crate::error::SessionError;
use crate::store::models::Task;

/// Terminal backend for interactive sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalBackend {
    Tmux,
    Vscode,
    Cursor,
}

impl TerminalBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tmux => "tmux",
            Self::Vscode => "vscode",
            Self::Cursor => "cursor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tmux" => Some(Self::Tmux),
            "vscode" => Some(Self::Vscode),
            "cursor" => Some(Self::Cursor),
            _ => None,
        }
    }

    /// tmux has no Windows build; everything else is cross-platform.
    pub fn available(self) -> bool {
        !(cfg!(windows) && self == Self::Tmux)
    }
}

/// Prepared launch for a terminal session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionLaunch {
    pub session_name: String,
    pub backend: TerminalBackend,
    /// Command line the UI should exec (suspending itself for tmux).
    pub command: Vec<String>,
    pub worktree_path: String,
    pub prompt_path: String,
}

/// Terminal session service.
#[derive(Clone)]
pub struct TerminalSessionService {
    default_backend: TerminalBackend,
}

impl TerminalSessionService {
    pub fn new(config: &KaganConfig) -> Self {
        let default_backend = TerminalBackend::parse(&config.general.default_terminal_backend)
            .unwrap_or(TerminalBackend::Tmux);
        Self { default_backend }
    }

    /// Session name for a task.
    pub fn session_name(task_id: &str) -> String {
        format!("kagan-{task_id}")
    }

    /// Resolve the backend for a task: its own setting, then the config
    /// default, skipping backends unavailable on this platform.
    pub fn resolve_backend(&self, task: &Task) -> TerminalBackend {
        let preferred = task
            .terminal_backend
            .as_deref()
            .and_then(TerminalBackend::parse)
            .unwrap_or(self.default_backend);
        if preferred.available() {
            return preferred;
        }
        if self.default_backend.available() {
            return self.default_backend;
        }
        TerminalBackend::Vscode
    }

    /// Prepare a session in `worktree_path`: write the start prompt and
    /// build the launch command. With `reuse_if_exists`, an existing tmux
    /// session of the same name is attached instead of erroring.
    pub async fn create_session(
        &self,
        task: &Task,
        worktree_path: &Path,
        reuse_if_exists: bool,
    ) -> Result<SessionLaunch, SessionError> {
        let backend = self.resolve_backend(task);
        let session_name = Self::session_name(&task.id);

        if backend == TerminalBackend::Tmux
            && !reuse_if_exists
            && self.session_exists(&session_name).await?
        {
            return Err(SessionError::BackendUnavailable(format!(
                "tmux session {session_name} already exists"
            )));
        }

        let prompt_path = self.write_start_prompt(task, worktree_path)?;
        let worktree = worktree_path.to_string_lossy().to_string();

        let command = match backend {
            // -A attaches when the session already exists.
            TerminalBackend::Tmux => vec![
                "tmux".to_string(),
                "new-session".to_string(),
                "-A".to_string(),
                "-s".to_string(),
                session_name.clone(),
                "-c".to_string(),
                worktree.clone(),
            ],
            TerminalBackend::Vscode => vec!["code".to_string(), worktree.clone()],
            TerminalBackend::Cursor => vec!["cursor".to_string(), worktree.clone()],
        };

        Ok(SessionLaunch {
            session_name,
            backend,
            command,
            worktree_path: worktree,
            prompt_path: prompt_path.to_string_lossy().to_string(),
        })
    }

    /// Whether a tmux session with this name is alive. Editor-backed
    /// sessions have no queryable liveness and report false.
    pub async fn session_exists(&self, session_name: &str) -> Result<bool, SessionError> {
        let output = Command::new("tmux")
            .args(["has-session", "-t", session_name])
            .output()
            .await;
        match output {
            Ok(output) => Ok(output.status.success()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Command the UI execs to attach to an existing session.
    pub fn attach_command(session_name: &str) -> Vec<String> {
        vec![
            "tmux".to_string(),
            "attach-session".to_string(),
            "-t".to_string(),
            session_name.to_string(),
        ]
    }

    /// Kill a tmux session if it exists.
    pub async fn kill_session(&self, session_name: &str) -> Result<bool, SessionError> {
        if !self.session_exists(session_name).await? {
            return Ok(false);
        }
        let output = Command::new("tmux")
            .args(["kill-session", "-t", session_name])
            .output()
            .await?;
        debug!("Killed tmux session {session_name}");
        Ok(output.status.success())
    }

    fn write_start_prompt(
        &self,
        task: &Task,
        worktree_path: &Path,
    ) -> Result<PathBuf, SessionError> {
        let kagan_dir = worktree_path.join(".kagan");
        std::fs::create_dir_all(&kagan_dir)?;
        let prompt_path = kagan_dir.join("start_prompt.md");

        let mut prompt = format!("# {}\n\n", task.title);
        if !task.description.is_empty() {
            prompt.push_str(&format!("{}\n\n", task.description));
        }
        if !task.acceptance_criteria.is_empty() {
            prompt.push_str("## Acceptance criteria\n");
            for criterion in &task.acceptance_criteria {
                prompt.push_str(&format!("- {criterion}\n"));
            }
        }
        std::fs::write(&prompt_path, prompt)?;
        Ok(prompt_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::Task;

    fn service() -> TerminalSessionService {
        TerminalSessionService::new(&KaganConfig::default())
    }

    #[test]
    fn test_session_name() {
        assert_eq!(TerminalSessionService::session_name("abc123"), "kagan-abc123");
    }

    #[test]
    fn test_resolve_backend_prefers_task_setting() {
        let service = service();
        let mut task = Task::new("p1", "pair work");
        task.terminal_backend = Some("cursor".to_string());
        assert_eq!(service.resolve_backend(&task), TerminalBackend::Cursor);

        task.terminal_backend = None;
        assert_eq!(service.resolve_backend(&task), TerminalBackend::Tmux);

        task.terminal_backend = Some("bogus".to_string());
        assert_eq!(service.resolve_backend(&task), TerminalBackend::Tmux);
    }

    #[tokio::test]
    async fn test_create_session_writes_prompt_and_command() {
        let service = service();
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::new("p1", "Pair on parser");
        task.description = "walk the grammar".to_string();
        task.acceptance_criteria = vec!["parses".to_string()];

        let launch = service
            .create_session(&task, dir.path(), true)
            .await
            .unwrap();
        assert_eq!(launch.session_name, format!("kagan-{}", task.id));
        assert_eq!(launch.command[0], "tmux");
        assert!(launch.command.contains(&"-A".to_string()));

        let prompt = std::fs::read_to_string(&launch.prompt_path).unwrap();
        assert!(prompt.contains("# Pair on parser"));
        assert!(prompt.contains("- parses"));
        assert!(PathBuf::from(&launch.prompt_path).starts_with(dir.path().join(".kagan")));
    }

    #[tokio::test]
    async fn test_editor_backend_command() {
        let service = service();
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::new("p1", "Editor session");
        task.terminal_backend = Some("vscode".to_string());

        let launch = service
            .create_session(&task, dir.path(), true)
            .await
            .unwrap();
        assert_eq!(launch.backend, TerminalBackend::Vscode);
        assert_eq!(launch.command[0], "code");
    }

    #[test]
    fn test_attach_command() {
        let command = TerminalSessionService::attach_command("kagan-x");
        assert_eq!(command[0], "tmux");
        assert!(command.contains(&"kagan-x".to_string()));
    }
}
