// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The API facade request handlers dispatch into: every core service, plus
//! a few cross-service workflows (long-poll task watch, merge bookkeeping).

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::KaganConfig;
use crate::error::ApiError;
use crate::automation::AutomationEngine;
use crate::jobs::JobLedger;
use crate::limits::WAIT_TIMEOUT_MAX;
use crate::messages::QueuedMessageService;
use crate::runtime::RuntimeView;
use crate::sessions::TerminalSessionService;
use crate::store::models::{Task, TaskStatus, TaskType};
use crate::store::tasks::TaskUpdate;
use crate::store::{
    AuditRepository, ExecutionRepository, ProjectRepository, ProposalRepository, TaskRepository,
};
use crate::workspace::WorkspaceService;

/// Result of a `tasks.wait` long-poll.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TasksWaitOutcome {
    pub timed_out: bool,
    pub changed_task_ids: Vec<String>,
    pub latest_updated_at: Option<DateTime<Utc>>,
}

/// All services a request handler can reach.
pub struct KaganApi {
    pub version: String,
    pub settings: StdMutex<KaganConfig>,
    pub tasks: TaskRepository,
    pub projects: ProjectRepository,
    pub executions: ExecutionRepository,
    pub proposals: ProposalRepository,
    pub audit: AuditRepository,
    pub workspaces: WorkspaceService,
    pub engine: AutomationEngine,
    pub jobs: JobLedger,
    pub terminal_sessions: TerminalSessionService,
    pub queued: QueuedMessageService,
    pub runtime: RuntimeView,
    /// Host shutdown signal; `core.shutdown` requests land here.
    pub shutdown_tx: tokio::sync::watch::Sender<Option<String>>,
}

impl KaganApi {
    /// Ask the host to stop (handled outside the request path so the
    /// response still reaches the client).
    pub fn request_shutdown(&self, reason: &str) {
        let _ = self.shutdown_tx.send(Some(reason.to_string()));
    }

    /// Load a task or fail with NOT_FOUND.
    pub async fn require_task(&self, task_id: &str) -> Result<Task, ApiError> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("task {task_id}")))
    }

    /// Long-poll for task changes after `from_updated_at`. A zero timeout
    /// is a single non-blocking check; timeouts are clamped to the server
    /// maximum. The cursor prevents lost wakeups across reconnects.
    pub async fn tasks_wait(
        &self,
        from_updated_at: Option<DateTime<Utc>>,
        timeout: Duration,
    ) -> Result<TasksWaitOutcome, ApiError> {
        let timeout = timeout.min(WAIT_TIMEOUT_MAX);
        let started = std::time::Instant::now();
        let poll_interval = Duration::from_millis(250);

        loop {
            let tasks = self.tasks.get_all(None).await?;
            let changed: Vec<&Task> = match from_updated_at {
                Some(cursor) => tasks.iter().filter(|t| t.updated_at > cursor).collect(),
                None => tasks.iter().collect(),
            };
            if !changed.is_empty() {
                let latest = changed.iter().map(|t| t.updated_at).max();
                return Ok(TasksWaitOutcome {
                    timed_out: false,
                    changed_task_ids: changed.iter().map(|t| t.id.clone()).collect(),
                    latest_updated_at: latest,
                });
            }
            if started.elapsed() >= timeout {
                return Ok(TasksWaitOutcome {
                    timed_out: true,
                    changed_task_ids: Vec::new(),
                    latest_updated_at: from_updated_at,
                });
            }
            let remaining = timeout.saturating_sub(started.elapsed());
            tokio::time::sleep(poll_interval.min(remaining)).await;
        }
    }

    /// Merge a task's branch into its base and keep the task row honest:
    /// success lands the task in DONE, failure leaves it in REVIEW with
    /// `merge_failed` and the error message set.
    pub async fn merge_task(
        &self,
        task_id: &str,
        base_branch: Option<&str>,
        squash: bool,
        allow_conflicts: bool,
    ) -> Result<(bool, String), ApiError> {
        let task = self.require_task(task_id).await?;
        if task.task_type != TaskType::Auto {
            return Err(ApiError::workflow(
                crate::error::codes::TASK_TYPE_MISMATCH,
                "Only AUTO tasks merge through the merge worktree",
            ));
        }
        let base = base_branch
            .map(str::to_string)
            .or_else(|| task.base_branch.clone())
            .unwrap_or_else(|| {
                self.settings
                    .lock()
                    .expect("settings lock poisoned")
                    .general
                    .default_base_branch
                    .clone()
            });

        let (ok, message) = self
            .workspaces
            .merge_to_main(task_id, &task.title, &base, squash, allow_conflicts)
            .await?;

        if let Some(workspace) = self.workspaces.latest_for_task(task_id).await? {
            let strategy = if squash { "squash" } else { "merge" };
            let _ = self
                .workspaces
                .workspaces
                .record_merge(
                    &workspace.id,
                    strategy,
                    ok,
                    &message,
                    None,
                    (!ok).then_some("merge"),
                    &[],
                )
                .await;
        }

        if ok {
            info!("Task {task_id} merged into {base}");
            self.tasks
                .update(
                    task_id,
                    TaskUpdate {
                        status: Some(TaskStatus::Done),
                        merge_failed: Some(false),
                        merge_error: Some(None),
                        ..TaskUpdate::default()
                    },
                )
                .await?;
        } else {
            self.tasks
                .update(
                    task_id,
                    TaskUpdate {
                        merge_failed: Some(true),
                        merge_error: Some(Some(message.clone())),
                        ..TaskUpdate::default()
                    },
                )
                .await?;
        }
        Ok((ok, message))
    }

    /// Allowlisted settings mutation (maintainer lane).
    pub fn update_settings(&self, updates: &serde_json::Value) -> Result<KaganConfig, ApiError> {
        let Some(object) = updates.as_object() else {
            return Err(ApiError::InvalidParameter(
                "settings updates must be an object".to_string(),
            ));
        };
        let mut settings = self.settings.lock().expect("settings lock poisoned");
        for (key, value) in object {
            match key.as_str() {
                "max_concurrent_agents" => {
                    settings.general.max_concurrent_agents = value
                        .as_u64()
                        .ok_or_else(|| {
                            ApiError::InvalidParameter("max_concurrent_agents".to_string())
                        })? as usize;
                }
                "auto_review" => {
                    settings.general.auto_review = value.as_bool().ok_or_else(|| {
                        ApiError::InvalidParameter("auto_review".to_string())
                    })?;
                }
                "auto_approve" => {
                    settings.general.auto_approve = value.as_bool().ok_or_else(|| {
                        ApiError::InvalidParameter("auto_approve".to_string())
                    })?;
                }
                "default_base_branch" => {
                    settings.general.default_base_branch = value
                        .as_str()
                        .ok_or_else(|| {
                            ApiError::InvalidParameter("default_base_branch".to_string())
                        })?
                        .to_string();
                }
                "default_terminal_backend" => {
                    settings.general.default_terminal_backend = value
                        .as_str()
                        .ok_or_else(|| {
                            ApiError::InvalidParameter("default_terminal_backend".to_string())
                        })?
                        .to_string();
                }
                other => {
                    return Err(ApiError::InvalidParameter(format!(
                        "settings field not updatable: {other}"
                    )));
                }
            }
        }
        Ok(settings.clone())
    }
}
