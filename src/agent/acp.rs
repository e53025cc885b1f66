// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Subprocess agent speaking newline-delimited JSON.
//!
//! Core -> agent control messages:
//!
//! ```text
//! {"type":"configure","auto_approve":true,"model":"...","task_id":"...","read_only":false}
//! {"type":"prompt","text":"..."}
//! {"type":"permission_response","request_id":"...","approve":true}
//! {"type":"shutdown"}
//! ```
//!
//! Agent -> core messages are [`AgentMessage`] values, one per line. A
//! background reader task buffers them; `send_prompt` blocks until the
//! agent emits `turn_complete` (or `fail`, or exits).

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::error::AgentError;

use super::{Agent, AgentMessage};

/// Control messages written to the agent's stdin.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage<'a> {
    Configure {
        auto_approve: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<&'a str>,
        read_only: bool,
    },
    Prompt {
        text: &'a str,
    },
    PermissionResponse {
        request_id: &'a str,
        approve: bool,
    },
    Shutdown,
}

struct SharedState {
    messages: Vec<AgentMessage>,
    response: String,
    pending_tool_calls: Vec<AgentMessage>,
    last_error: Option<String>,
}

/// Newline-delimited JSON subprocess agent.
pub struct AcpAgent {
    working_dir: PathBuf,
    config: AgentConfig,
    read_only: bool,

    child: Mutex<Option<Child>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    state: Arc<Mutex<SharedState>>,

    ready_tx: watch::Sender<bool>,
    /// Turn counter, bumped on every terminal message or process exit.
    turn_tx: watch::Sender<u64>,

    auto_approve: Arc<AtomicBool>,
    model_override: StdMutex<Option<String>>,
    task_id: StdMutex<Option<String>>,
}

impl AcpAgent {
    pub fn new(working_dir: &Path, config: &AgentConfig, read_only: bool) -> Self {
        let (ready_tx, _) = watch::channel(false);
        let (turn_tx, _) = watch::channel(0u64);
        Self {
            working_dir: working_dir.to_path_buf(),
            config: config.clone(),
            read_only,
            child: Mutex::new(None),
            stdin: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(SharedState {
                messages: Vec::new(),
                response: String::new(),
                pending_tool_calls: Vec::new(),
                last_error: None,
            })),
            ready_tx,
            turn_tx,
            auto_approve: Arc::new(AtomicBool::new(false)),
            model_override: StdMutex::new(None),
            task_id: StdMutex::new(None),
        }
    }

    async fn write_control(&self, msg: &ControlMessage<'_>) -> Result<(), AgentError> {
        let mut line = serde_json::to_string(msg)
            .map_err(|e| AgentError::Protocol(format!("encode control message: {e}")))?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let Some(ref mut pipe) = *stdin else {
            return Err(AgentError::Disconnected);
        };
        pipe.write_all(line.as_bytes()).await?;
        pipe.flush().await?;
        Ok(())
    }

    async fn reader_loop(
        reader: BufReader<tokio::process::ChildStdout>,
        state: Arc<Mutex<SharedState>>,
        stdin: Arc<Mutex<Option<ChildStdin>>>,
        ready_tx: watch::Sender<bool>,
        turn_tx: watch::Sender<u64>,
        auto_approve: Arc<AtomicBool>,
    ) {
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let message: AgentMessage = match serde_json::from_str(line) {
                        Ok(m) => m,
                        Err(e) => {
                            debug!("Ignoring unparseable agent line: {e}");
                            continue;
                        }
                    };
                    Self::handle_message(
                        message,
                        &state,
                        &stdin,
                        &ready_tx,
                        &turn_tx,
                        &auto_approve,
                    )
                    .await;
                }
                Ok(None) => {
                    debug!("Agent stdout closed");
                    break;
                }
                Err(e) => {
                    error!("Error reading from agent: {e}");
                    break;
                }
            }
        }

        // Wake any waiter; the process is gone.
        let _ = ready_tx.send(false);
        turn_tx.send_modify(|turn| *turn += 1);
    }

    async fn handle_message(
        message: AgentMessage,
        state: &Arc<Mutex<SharedState>>,
        stdin: &Arc<Mutex<Option<ChildStdin>>>,
        ready_tx: &watch::Sender<bool>,
        turn_tx: &watch::Sender<u64>,
        auto_approve: &Arc<AtomicBool>,
    ) {
        match &message {
            AgentMessage::Ready { .. } => {
                let _ = ready_tx.send(true);
            }
            AgentMessage::Update { text, .. } => {
                let mut state = state.lock().await;
                if !state.response.is_empty() {
                    state.response.push('\n');
                }
                state.response.push_str(text);
            }
            AgentMessage::ToolCall { .. } => {
                let mut state = state.lock().await;
                state.pending_tool_calls.push(message.clone());
            }
            AgentMessage::PermissionRequest { request_id, tool_name, .. } => {
                let approve = auto_approve.load(Ordering::SeqCst);
                debug!("Permission request for {tool_name}: auto approve={approve}");
                let response = ControlMessage::PermissionResponse {
                    request_id: request_id.as_str(),
                    approve,
                };
                if let Ok(mut line) = serde_json::to_string(&response) {
                    line.push('\n');
                    let mut stdin = stdin.lock().await;
                    if let Some(ref mut pipe) = *stdin {
                        let _ = pipe.write_all(line.as_bytes()).await;
                        let _ = pipe.flush().await;
                    }
                }
            }
            AgentMessage::Fail { message: text, .. } => {
                warn!("Agent reported failure: {text}");
                let mut state = state.lock().await;
                state.last_error = Some(text.clone());
            }
            _ => {}
        }

        let terminal = message.is_terminal();
        {
            let mut state = state.lock().await;
            state.messages.push(message);
        }
        if terminal {
            turn_tx.send_modify(|turn| *turn += 1);
        }
    }
}

#[async_trait]
impl Agent for AcpAgent {
    async fn start(&self) -> Result<(), AgentError> {
        let mut child_slot = self.child.lock().await;
        if child_slot.is_some() {
            return Ok(());
        }

        info!(
            "Starting agent '{}' in {:?}",
            self.config.name, self.working_dir
        );
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .current_dir(&self.working_dir)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| AgentError::SpawnFailed(format!("{}: {e}", self.config.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::SpawnFailed("no stdout pipe".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::SpawnFailed("no stdin pipe".to_string()))?;

        *self.stdin.lock().await = Some(stdin);
        *child_slot = Some(child);
        drop(child_slot);

        tokio::spawn(Self::reader_loop(
            BufReader::new(stdout),
            Arc::clone(&self.state),
            Arc::clone(&self.stdin),
            self.ready_tx.clone(),
            self.turn_tx.clone(),
            Arc::clone(&self.auto_approve),
        ));

        let model = self
            .model_override
            .lock()
            .expect("model lock poisoned")
            .clone();
        let task_id = self.task_id.lock().expect("task lock poisoned").clone();
        self.write_control(&ControlMessage::Configure {
            auto_approve: self.auto_approve.load(Ordering::SeqCst),
            model: model.as_deref(),
            task_id: task_id.as_deref(),
            read_only: self.read_only,
        })
        .await
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<(), AgentError> {
        let mut rx = self.ready_tx.subscribe();
        if *rx.borrow() {
            return Ok(());
        }
        let wait = async {
            loop {
                rx.changed()
                    .await
                    .map_err(|_| AgentError::Disconnected)?;
                if *rx.borrow() {
                    return Ok::<(), AgentError>(());
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| AgentError::ReadyTimeout(timeout.as_millis() as u64))?
    }

    async fn send_prompt(&self, text: &str) -> Result<(), AgentError> {
        let mut turn_rx = self.turn_tx.subscribe();
        let start_turn = *turn_rx.borrow();

        let start_len = {
            let mut state = self.state.lock().await;
            state.response.clear();
            state.last_error = None;
            state.messages.len()
        };

        self.write_control(&ControlMessage::Prompt { text }).await?;

        loop {
            turn_rx
                .changed()
                .await
                .map_err(|_| AgentError::Disconnected)?;
            if *turn_rx.borrow() > start_turn {
                break;
            }
        }

        let state = self.state.lock().await;
        if let Some(ref error) = state.last_error {
            return Err(AgentError::Protocol(error.clone()));
        }
        // A turn bump without a terminal message means the process exited.
        let turn_completed = state
            .messages
            .get(start_len..)
            .unwrap_or_default()
            .iter()
            .any(|m| matches!(m, AgentMessage::TurnComplete { .. }));
        if !turn_completed {
            return Err(AgentError::Disconnected);
        }
        Ok(())
    }

    async fn get_messages(&self) -> Vec<AgentMessage> {
        self.state.lock().await.messages.clone()
    }

    async fn get_response_text(&self) -> String {
        self.state.lock().await.response.clone()
    }

    async fn clear_tool_calls(&self) {
        self.state.lock().await.pending_tool_calls.clear();
    }

    async fn stop(&self) {
        let _ = self.write_control(&ControlMessage::Shutdown).await;

        let mut child_slot = self.child.lock().await;
        if let Some(mut child) = child_slot.take() {
            match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("Agent did not exit after shutdown, killing");
                    let _ = child.kill().await;
                }
            }
        }
        *self.stdin.lock().await = None;
    }

    async fn cancel(&self) {
        let mut child_slot = self.child.lock().await;
        if let Some(mut child) = child_slot.take() {
            let _ = child.kill().await;
        }
        *self.stdin.lock().await = None;
    }

    fn set_auto_approve(&self, enabled: bool) {
        self.auto_approve.store(enabled, Ordering::SeqCst);
    }

    fn set_model_override(&self, model: &str) {
        *self.model_override.lock().expect("model lock poisoned") = Some(model.to_string());
    }

    fn set_task_id(&self, task_id: &str) {
        *self.task_id.lock().expect("task lock poisoned") = Some(task_id.to_string());
    }
}

/// Default factory producing [`AcpAgent`] instances.
pub fn acp_agent_factory() -> super::AgentFactory {
    Arc::new(|working_dir: &Path, config: &AgentConfig, read_only: bool| {
        Arc::new(AcpAgent::new(working_dir, config, read_only)) as super::AgentHandle
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A scripted shell standing in for a real agent binary: announces
    /// ready, answers every prompt with a canned update + turn_complete,
    /// exits on shutdown.
    fn scripted_agent(update_json: &str) -> AgentConfig {
        let script = format!(
            r#"printf '%s\n' '{{"type":"ready"}}'
while IFS= read -r line; do
  case "$line" in
    *'"prompt"'*) printf '%s\n' '{update_json}' '{{"type":"turn_complete"}}' ;;
    *'"shutdown"'*) exit 0 ;;
  esac
done"#
        );
        AgentConfig {
            name: "scripted".to_string(),
            identity: "scripted".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script],
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_full_prompt_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            scripted_agent(r#"{"type":"update","text":"did it <complete reason=\"ok\"/>"}"#);
        let agent = AcpAgent::new(dir.path(), &config, false);

        agent.start().await.unwrap();
        agent
            .wait_ready(Duration::from_secs(5))
            .await
            .unwrap();
        agent.send_prompt("please work").await.unwrap();

        let response = agent.get_response_text().await;
        assert!(response.contains("did it"));
        let signal = crate::agent::signals::parse_signal(&response);
        assert_eq!(signal.signal, crate::agent::signals::Signal::Complete);

        let messages = agent.get_messages().await;
        assert!(messages
            .iter()
            .any(|m| matches!(m, AgentMessage::Ready { .. })));
        assert!(messages
            .iter()
            .any(|m| matches!(m, AgentMessage::TurnComplete { .. })));

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_wait_ready_timeout() {
        let dir = tempfile::tempdir().unwrap();
        // An agent that never says ready.
        let config = AgentConfig {
            name: "mute".to_string(),
            identity: "mute".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 30".to_string()],
            env: HashMap::new(),
        };
        let agent = AcpAgent::new(dir.path(), &config, false);
        agent.start().await.unwrap();

        let result = agent.wait_ready(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(AgentError::ReadyTimeout(_))));
        agent.cancel().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            name: "missing".to_string(),
            identity: "missing".to_string(),
            command: "/definitely/not/a/binary".to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        };
        let agent = AcpAgent::new(dir.path(), &config, false);
        assert!(matches!(
            agent.start().await,
            Err(AgentError::SpawnFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_prompt_against_dead_process_errors() {
        let dir = tempfile::tempdir().unwrap();
        // Exits immediately after ready.
        let config = AgentConfig {
            name: "flaky".to_string(),
            identity: "flaky".to_string(),
            command: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                r#"printf '%s\n' '{"type":"ready"}'; exit 0"#.to_string(),
            ],
            env: HashMap::new(),
        };
        let agent = AcpAgent::new(dir.path(), &config, false);
        agent.start().await.unwrap();
        agent.wait_ready(Duration::from_secs(5)).await.unwrap();

        let result = agent.send_prompt("hello?").await;
        assert!(result.is_err());
        agent.stop().await;
    }
}
