// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Review agent: runs read-only in the task's worktree after an AUTO task
//! completes, and completion/blocked handling around it.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::agent::prompts::{get_review_prompt, ReviewContext};
use crate::agent::serialize_agent_output;
use crate::agent::signals::{parse_signal, Signal};
use crate::events::NotificationSeverity;
use crate::limits::AGENT_TIMEOUT_LONG;
use crate::store::models::{Task, TaskStatus};
use crate::store::tasks::TaskUpdate;

use super::engine::EngineInner;
use super::policy::{resolve_auto_approve, AgentPermissionScope};

impl EngineInner {
    /// Run an agent-based review and return (passed, summary).
    pub(crate) async fn run_review(
        self: &Arc<Self>,
        task: &Task,
        wt_path: &Path,
        execution_id: &str,
    ) -> (bool, String) {
        let agent_config = self.config.agent_config(task.agent_backend.as_deref());
        let prompt = match self.build_review_prompt(task).await {
            Ok(prompt) => prompt,
            Err(e) => return (false, format!("Review agent error: {e}")),
        };

        let agent = (self.agent_factory)(wt_path, &agent_config, true);
        agent.set_task_id(&task.id);
        agent.set_auto_approve(resolve_auto_approve(
            AgentPermissionScope::AutomationReviewer,
            self.config.general.auto_approve,
        ));
        self.apply_model_override(
            &agent,
            &agent_config.identity,
            &format!("review of task {}", task.id),
        );

        if let Err(e) = agent.start().await {
            error!("Review agent failed to start for {}: {e}", task.id);
            return (false, format!("Review agent error: {e}"));
        }
        self.set_review_agent(&task.id, Arc::clone(&agent)).await;

        let verdict = async {
            agent
                .wait_ready(AGENT_TIMEOUT_LONG)
                .await
                .map_err(|e| format!("Review agent timed out: {e}"))?;
            agent
                .send_prompt(&prompt)
                .await
                .map_err(|e| format!("Review agent error: {e}"))?;
            Ok::<String, String>(agent.get_response_text().await)
        }
        .await;

        let result = match verdict {
            Ok(response) => {
                if let Some(payload) = serialize_agent_output(agent.as_ref()).await {
                    let _ = self.executions().append_log(execution_id, &payload).await;
                }
                let _ = self
                    .executions()
                    .append_turn(execution_id, Some(&prompt), Some(&response), None, None)
                    .await;

                let signal = parse_signal(&response);
                match signal.signal {
                    Signal::Approve => (true, signal.reason),
                    Signal::Reject => (false, signal.reason),
                    _ => (false, "No review signal found in agent response".to_string()),
                }
            }
            Err(message) => {
                error!("Review agent failed for {}: {message}", task.id);
                (false, message)
            }
        };

        self.runtime.clear_review_agent(&task.id);
        agent.stop().await;
        result
    }

    /// Handle a completed run: commit leftovers, move to REVIEW, then run
    /// the review agent when auto-review is enabled.
    pub(crate) async fn handle_complete(self: &Arc<Self>, task: &Task) -> crate::error::Result<()> {
        if let Some(wt_path) = self.workspaces.get_path(&task.id).await? {
            if self.git.has_uncommitted_changes(&wt_path).await? {
                let short_id = &task.id[..task.id.len().min(8)];
                self.git
                    .commit_all(
                        &wt_path,
                        &format!("chore: adding uncommitted agent changes ({short_id})"),
                    )
                    .await?;
                info!("Auto-committed leftover changes for task {}", task.id);
            }
        }

        self.tasks().move_to(&task.id, TaskStatus::Review).await?;

        if !self.config.general.auto_review {
            info!("Auto review disabled, skipping review for task {}", task.id);
            return Ok(());
        }

        let wt_path = self.workspaces.get_path(&task.id).await?;
        let execution_id = self.runtime.get(&task.id).and_then(|v| v.execution_id);

        let mut review_attempted = false;
        let mut review_passed = false;
        let mut review_note = String::new();

        if let (Some(wt_path), Some(execution_id)) = (wt_path, execution_id.clone()) {
            let (passed, note) = self.run_review(task, &wt_path, &execution_id).await;
            review_attempted = true;
            review_passed = passed;
            review_note = note;

            let status = if review_passed { "approved" } else { "rejected" };
            info!("Task {} review: {status}", task.id);

            if review_passed {
                let title: String = task.title.chars().take(30).collect();
                self.notify_user(
                    &format!("\u{2713} Review passed: {title}"),
                    "Review Complete",
                    NotificationSeverity::Information,
                );
            } else {
                let note: String = review_note.chars().take(50).collect();
                self.notify_user(
                    &format!("\u{2717} Review failed: {note}"),
                    "Review Complete",
                    NotificationSeverity::Warning,
                );
            }
        }

        if !review_note.is_empty() {
            let scratchpad = self.tasks().get_scratchpad(&task.id).await?;
            self.tasks()
                .update_scratchpad(
                    &task.id,
                    &format!("{scratchpad}\n\n--- REVIEW ---\n{review_note}"),
                )
                .await?;
        }

        if review_attempted {
            self.tasks()
                .update(
                    &task.id,
                    TaskUpdate {
                        checks_passed: Some(review_passed),
                        review_summary: Some(review_note.clone()),
                        ..TaskUpdate::default()
                    },
                )
                .await?;

            if let Some(execution_id) = execution_id {
                let review_result = serde_json::json!({
                    "status": if review_passed { "approved" } else { "rejected" },
                    "summary": review_note,
                    "completed_at": Utc::now().to_rfc3339(),
                });
                self.executions()
                    .update_execution(
                        &execution_id,
                        None,
                        None,
                        Some(serde_json::json!({ "review_result": review_result })),
                    )
                    .await?;
            }

            // A rejection sends the task back for another implementation
            // pass, with the feedback already in the scratchpad.
            if !review_passed {
                self.tasks()
                    .move_to(&task.id, TaskStatus::InProgress)
                    .await?;
            }
        }
        Ok(())
    }

    /// Handle a blocked run: record the reason and park the task in BACKLOG.
    pub(crate) async fn handle_blocked(
        self: &Arc<Self>,
        task: &Task,
        reason: &str,
    ) -> crate::error::Result<()> {
        self.blocked_remove(&task.id).await;
        self.runtime.mark_blocked(&task.id, reason, &[], &[]);

        let scratchpad = self.tasks().get_scratchpad(&task.id).await?;
        self.tasks()
            .update_scratchpad(
                &task.id,
                &format!("{scratchpad}\n\n--- BLOCKED ---\nReason: {reason}\n"),
            )
            .await?;
        self.tasks().move_to(&task.id, TaskStatus::Backlog).await?;
        Ok(())
    }

    async fn build_review_prompt(&self, task: &Task) -> crate::error::Result<String> {
        let base = task
            .base_branch
            .clone()
            .unwrap_or_else(|| self.config.general.default_base_branch.clone());
        let commits = self.workspaces.commit_log(&task.id, &base).await?;
        let diff_summary = self.workspaces.diff_stats(&task.id, &base).await?;
        Ok(get_review_prompt(&ReviewContext {
            task,
            commits: &commits,
            diff_summary: &diff_summary,
        }))
    }
}
