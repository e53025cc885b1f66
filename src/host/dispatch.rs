// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Static request dispatch map: `(capability, method)` to async handler.
//!
//! Handlers validate their own params and return plain JSON results; the
//! host wraps them in response envelopes, maps errors to wire codes, and
//! falls back to the plugin registry for unknown pairs. Workflow failures
//! (unsupported job action, review guardrails) are returned as structured
//! payloads carrying `next_tool`/`next_arguments` recovery metadata.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;

use crate::error::{codes, ApiError};
use crate::messages::Lane;
use crate::store::models::{Priority, ProposalStatus, Task, TaskStatus, TaskType};
use crate::store::tasks::TaskUpdate;

use super::api::KaganApi;

/// Async handler signature shared by built-in and plugin operations.
pub type Handler = Arc<
    dyn Fn(
            Arc<KaganApi>,
            serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ApiError>> + Send>>
        + Send
        + Sync,
>;

/// Mutating built-in pairs that participate in the idempotency cache.
const IDEMPOTENT_MUTATION_METHODS: [(&str, &str); 12] = [
    ("tasks", "create"),
    ("tasks", "update"),
    ("tasks", "move"),
    ("tasks", "delete"),
    ("tasks", "start"),
    ("tasks", "stop"),
    ("jobs", "submit"),
    ("review", "request"),
    ("workspaces", "merge"),
    ("plan", "propose"),
    ("plan", "approve"),
    ("settings", "update"),
];

pub fn is_idempotent_mutation(capability: &str, method: &str) -> bool {
    IDEMPOTENT_MUTATION_METHODS
        .iter()
        .any(|(c, m)| *c == capability && *m == method)
}

fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<KaganApi>, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ApiError>> + Send + 'static,
{
    Arc::new(move |api, params| Box::pin(f(api, params)))
}

// ---------------------------------------------------------------------------
// Param extraction
// ---------------------------------------------------------------------------

fn req_str(params: &serde_json::Value, key: &str) -> Result<String, ApiError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ApiError::MissingParameter(key.to_string()))
}

fn opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn opt_bool(params: &serde_json::Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn opt_u64(params: &serde_json::Value, key: &str, default: u64) -> u64 {
    params.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
}

fn opt_f64(params: &serde_json::Value, key: &str, default: f64) -> f64 {
    params.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

fn opt_timestamp(params: &serde_json::Value, key: &str) -> Result<Option<DateTime<Utc>>, ApiError> {
    let Some(raw) = params.get(key).and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| Some(dt.with_timezone(&Utc)))
        .map_err(|_| ApiError::InvalidParameter(format!("{key} must be RFC3339")))
}

fn opt_string_list(params: &serde_json::Value, key: &str) -> Option<Vec<String>> {
    params.get(key).and_then(|v| v.as_array()).map(|items| {
        items
            .iter()
            .filter_map(|i| i.as_str().map(str::to_string))
            .collect()
    })
}

fn parse_lane(params: &serde_json::Value) -> Result<Lane, ApiError> {
    let raw = opt_str(params, "lane").unwrap_or_else(|| "implementation".to_string());
    Lane::parse(&raw).ok_or_else(|| ApiError::InvalidParameter(format!("unknown lane: {raw}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}

fn task_payload(api: &KaganApi, task: &Task) -> Result<serde_json::Value, ApiError> {
    let mut payload = to_value(task)?;
    if let Some(view) = api.runtime.get(&task.id) {
        payload["runtime"] = serde_json::json!({
            "is_running": view.is_running,
            "is_reviewing": view.is_reviewing,
            "is_pending": view.is_pending,
            "is_blocked": view.is_blocked,
            "blocked_reason": view.blocked_reason,
            "blocked_by_task_ids": view.blocked_by_task_ids,
            "overlap_hints": view.overlap_hints,
            "pending_reason": view.pending_reason,
            "execution_id": view.execution_id,
            "run_count": view.run_count,
        });
    }
    Ok(payload)
}

// ---------------------------------------------------------------------------
// Dispatch map
// ---------------------------------------------------------------------------

static DISPATCH_MAP: Lazy<HashMap<(String, String), Handler>> = Lazy::new(|| {
    build_dispatch_map()
        .into_iter()
        .map(|((capability, method), handler)| {
            ((capability.to_string(), method.to_string()), handler)
        })
        .collect()
});

/// Look up the built-in handler for a pair.
pub fn resolve(capability: &str, method: &str) -> Option<Handler> {
    DISPATCH_MAP
        .get(&(capability.to_string(), method.to_string()))
        .cloned()
}

/// Pairs in the static map (used by policy tests).
pub fn dispatch_pairs() -> Vec<(String, String)> {
    DISPATCH_MAP.keys().cloned().collect()
}

#[allow(clippy::too_many_lines)]
fn build_dispatch_map() -> HashMap<(&'static str, &'static str), Handler> {
    let mut map: HashMap<(&'static str, &'static str), Handler> = HashMap::new();

    // -- tasks ------------------------------------------------------------
    map.insert(
        ("tasks", "create"),
        handler(|api, params| async move {
            let project_id = req_str(&params, "project_id")?;
            let title = req_str(&params, "title")?;
            if api.projects.get_project(&project_id).await?.is_none() {
                return Err(ApiError::NotFound(format!("project {project_id}")));
            }

            let mut task = Task::new(&project_id, &title);
            if let Some(description) = opt_str(&params, "description") {
                task.description = description;
            }
            if let Some(raw) = opt_str(&params, "priority") {
                task.priority = Priority::parse(&raw)
                    .ok_or_else(|| ApiError::InvalidParameter(format!("priority: {raw}")))?;
            }
            if let Some(raw) = opt_str(&params, "task_type") {
                task.task_type = TaskType::parse(&raw)
                    .ok_or_else(|| ApiError::InvalidParameter(format!("task_type: {raw}")))?;
            }
            task.base_branch = opt_str(&params, "base_branch");
            task.agent_backend = opt_str(&params, "agent_backend");
            task.terminal_backend = opt_str(&params, "terminal_backend");
            if let Some(criteria) = opt_string_list(&params, "acceptance_criteria") {
                task.acceptance_criteria = criteria;
            }
            api.tasks.create(&task).await?;
            Ok(serde_json::json!({ "task": to_value(&task)? }))
        }),
    );

    map.insert(
        ("tasks", "get"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let task = api.require_task(&task_id).await?;
            Ok(serde_json::json!({ "task": task_payload(&api, &task)? }))
        }),
    );

    map.insert(
        ("tasks", "list"),
        handler(|api, params| async move {
            let project_id = opt_str(&params, "project_id");
            let tasks = api.tasks.get_all(project_id.as_deref()).await?;
            let mut payloads = Vec::with_capacity(tasks.len());
            for task in &tasks {
                payloads.push(task_payload(&api, task)?);
            }
            Ok(serde_json::json!({ "tasks": payloads }))
        }),
    );

    map.insert(
        ("tasks", "search"),
        handler(|api, params| async move {
            let query = req_str(&params, "query")?;
            let tasks = api.tasks.search(&query).await?;
            Ok(serde_json::json!({ "tasks": to_value(&tasks)? }))
        }),
    );

    map.insert(
        ("tasks", "counts"),
        handler(|api, _params| async move {
            let counts = api.tasks.counts().await?;
            let mut payload = serde_json::Map::new();
            for (status, count) in counts {
                payload.insert(status.as_str().to_string(), serde_json::json!(count));
            }
            Ok(serde_json::json!({ "counts": payload }))
        }),
    );

    map.insert(
        ("tasks", "update"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let mut update = TaskUpdate {
                title: opt_str(&params, "title"),
                description: opt_str(&params, "description"),
                base_branch: opt_str(&params, "base_branch"),
                agent_backend: opt_str(&params, "agent_backend"),
                terminal_backend: opt_str(&params, "terminal_backend"),
                acceptance_criteria: opt_string_list(&params, "acceptance_criteria"),
                ..TaskUpdate::default()
            };
            if let Some(raw) = opt_str(&params, "status") {
                update.status = Some(
                    TaskStatus::parse(&raw)
                        .ok_or_else(|| ApiError::InvalidParameter(format!("status: {raw}")))?,
                );
            }
            if let Some(raw) = opt_str(&params, "priority") {
                update.priority = Some(
                    Priority::parse(&raw)
                        .ok_or_else(|| ApiError::InvalidParameter(format!("priority: {raw}")))?,
                );
            }
            let task = api
                .tasks
                .update(&task_id, update)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("task {task_id}")))?;
            Ok(serde_json::json!({ "task": to_value(&task)? }))
        }),
    );

    map.insert(
        ("tasks", "move"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let raw = req_str(&params, "status")?;
            let status = TaskStatus::parse(&raw)
                .ok_or_else(|| ApiError::InvalidParameter(format!("status: {raw}")))?;
            let task = api
                .tasks
                .move_to(&task_id, status)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("task {task_id}")))?;
            Ok(serde_json::json!({ "task": to_value(&task)? }))
        }),
    );

    map.insert(
        ("tasks", "delete"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let deleted = api.tasks.delete(&task_id).await?;
            if !deleted {
                return Err(ApiError::NotFound(format!("task {task_id}")));
            }
            Ok(serde_json::json!({ "deleted": true, "task_id": task_id }))
        }),
    );

    map.insert(
        ("tasks", "context"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let task = api.require_task(&task_id).await?;
            let scratchpad = api.tasks.get_scratchpad(&task_id).await?;
            let links = api.tasks.get_links(&task_id).await?;
            let workspace = api.workspaces.latest_for_task(&task_id).await?;
            Ok(serde_json::json!({
                "task": task_payload(&api, &task)?,
                "scratchpad": scratchpad,
                "links": links,
                "workspace": workspace.map(|w| to_value(&w)).transpose()?,
            }))
        }),
    );

    map.insert(
        ("tasks", "scratchpad"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            api.require_task(&task_id).await?;
            let content = api.tasks.get_scratchpad(&task_id).await?;
            Ok(serde_json::json!({ "task_id": task_id, "content": content }))
        }),
    );

    map.insert(
        ("tasks", "update_scratchpad"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let content = req_str(&params, "content")?;
            api.require_task(&task_id).await?;
            api.tasks.update_scratchpad(&task_id, &content).await?;
            let stored = api.tasks.get_scratchpad(&task_id).await?;
            Ok(serde_json::json!({ "task_id": task_id, "content": stored }))
        }),
    );

    map.insert(
        ("tasks", "logs"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            api.require_task(&task_id).await?;
            let limit = opt_u64(&params, "limit", 100) as i64;
            let offset = opt_u64(&params, "offset", 0) as i64;
            let Some(execution) = api.executions.latest_for_task(&task_id).await? else {
                return Ok(serde_json::json!({
                    "task_id": task_id,
                    "execution_id": null,
                    "entries": [],
                    "total_events": 0,
                    "returned_events": 0,
                    "offset": offset,
                    "limit": limit,
                    "has_more": false,
                    "next_offset": null,
                }));
            };
            let page = api.executions.log_page(&execution.id, limit, offset).await?;
            let mut payload = to_value(&page)?;
            payload["task_id"] = serde_json::json!(task_id);
            payload["execution_id"] = serde_json::json!(execution.id);
            Ok(payload)
        }),
    );

    map.insert(
        ("tasks", "wait"),
        handler(|api, params| async move {
            let cursor = opt_timestamp(&params, "from_updated_at")?;
            let timeout =
                Duration::from_secs_f64(opt_f64(&params, "timeout_seconds", 30.0).max(0.0));
            let outcome = api.tasks_wait(cursor, timeout).await?;
            to_value(&outcome)
        }),
    );

    map.insert(
        ("tasks", "start"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let task = api.require_task(&task_id).await?;
            if task.task_type != TaskType::Auto {
                return Err(ApiError::workflow(
                    codes::TASK_TYPE_MISMATCH,
                    "Only AUTO tasks can be started by the automation engine",
                ));
            }
            let spawned = api.engine.spawn_for_task(&task).await;
            Ok(serde_json::json!({ "task_id": task_id, "spawned": spawned }))
        }),
    );

    map.insert(
        ("tasks", "stop"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let stopped = api.engine.stop_task(&task_id).await;
            Ok(serde_json::json!({ "task_id": task_id, "stopped": stopped }))
        }),
    );

    // -- projects / repos -------------------------------------------------
    map.insert(
        ("projects", "create"),
        handler(|api, params| async move {
            let name = req_str(&params, "name")?;
            let description = opt_str(&params, "description").unwrap_or_default();
            let project = api.projects.create_project(&name, &description).await?;

            if let Some(repo_path) = opt_str(&params, "repo_path") {
                let default_branch =
                    opt_str(&params, "default_branch").unwrap_or_else(|| "main".to_string());
                let (repo, _) = api
                    .projects
                    .get_or_create_repo(std::path::Path::new(&repo_path), &default_branch)
                    .await?;
                api.projects.attach_repo(&project.id, &repo.id, true, 0).await?;
            }
            Ok(serde_json::json!({ "project": to_value(&project)? }))
        }),
    );

    map.insert(
        ("projects", "list"),
        handler(|api, _params| async move {
            let projects = api.projects.list_projects().await?;
            Ok(serde_json::json!({ "projects": to_value(&projects)? }))
        }),
    );

    map.insert(
        ("projects", "get"),
        handler(|api, params| async move {
            let project_id = req_str(&params, "project_id")?;
            let project = api
                .projects
                .get_project(&project_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("project {project_id}")))?;
            let repos = api.projects.project_repos(&project_id).await?;
            Ok(serde_json::json!({
                "project": to_value(&project)?,
                "repos": to_value(&repos)?,
            }))
        }),
    );

    map.insert(
        ("projects", "open"),
        handler(|api, params| async move {
            let project_id = req_str(&params, "project_id")?;
            api.projects
                .get_project(&project_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("project {project_id}")))?;
            api.projects.touch_project(&project_id).await?;
            Ok(serde_json::json!({ "project_id": project_id, "opened": true }))
        }),
    );

    map.insert(
        ("projects", "add_repo"),
        handler(|api, params| async move {
            let project_id = req_str(&params, "project_id")?;
            let repo_path = req_str(&params, "repo_path")?;
            let default_branch =
                opt_str(&params, "default_branch").unwrap_or_else(|| "main".to_string());
            let is_primary = opt_bool(&params, "is_primary", false);
            let display_order = opt_u64(&params, "display_order", 0) as i64;

            api.projects
                .get_project(&project_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("project {project_id}")))?;
            let (repo, created) = api
                .projects
                .get_or_create_repo(std::path::Path::new(&repo_path), &default_branch)
                .await?;
            api.projects
                .attach_repo(&project_id, &repo.id, is_primary, display_order)
                .await?;
            Ok(serde_json::json!({ "repo": to_value(&repo)?, "created": created }))
        }),
    );

    map.insert(
        ("repos", "list"),
        handler(|api, params| async move {
            let repos = match opt_str(&params, "project_id") {
                Some(project_id) => api.projects.project_repos(&project_id).await?,
                None => api.projects.list_repos().await?,
            };
            Ok(serde_json::json!({ "repos": to_value(&repos)? }))
        }),
    );

    // -- workspaces -------------------------------------------------------
    map.insert(
        ("workspaces", "list"),
        handler(|api, params| async move {
            let task_id = opt_str(&params, "task_id");
            let repo_id = opt_str(&params, "repo_id");
            let workspaces = api
                .workspaces
                .list_workspaces(task_id.as_deref(), repo_id.as_deref())
                .await?;
            Ok(serde_json::json!({ "workspaces": to_value(&workspaces)? }))
        }),
    );

    map.insert(
        ("workspaces", "repos"),
        handler(|api, params| async move {
            let workspace_id = req_str(&params, "workspace_id")?;
            let repos = api.workspaces.workspace_repos(&workspace_id).await?;
            Ok(serde_json::json!({ "repos": to_value(&repos)? }))
        }),
    );

    map.insert(
        ("workspaces", "diff"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let base = opt_str(&params, "base_branch").unwrap_or_else(|| "main".to_string());
            let diff = api.workspaces.diff(&task_id, &base).await?;
            Ok(serde_json::json!({ "task_id": task_id, "diff": diff }))
        }),
    );

    map.insert(
        ("workspaces", "diff_stats"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let base = opt_str(&params, "base_branch").unwrap_or_else(|| "main".to_string());
            let stats = api.workspaces.diff_stats(&task_id, &base).await?;
            Ok(serde_json::json!({ "task_id": task_id, "diff_stats": stats }))
        }),
    );

    map.insert(
        ("workspaces", "files_changed"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let base = opt_str(&params, "base_branch").unwrap_or_else(|| "main".to_string());
            let files = api.workspaces.files_changed(&task_id, &base).await?;
            Ok(serde_json::json!({ "task_id": task_id, "files": files }))
        }),
    );

    map.insert(
        ("workspaces", "commit_log"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let base = opt_str(&params, "base_branch").unwrap_or_else(|| "main".to_string());
            let commits = api.workspaces.commit_log(&task_id, &base).await?;
            Ok(serde_json::json!({ "task_id": task_id, "commits": commits }))
        }),
    );

    map.insert(
        ("workspaces", "files_changed_on_base"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let base = opt_str(&params, "base_branch").unwrap_or_else(|| "main".to_string());
            let files = api.workspaces.files_changed_on_base(&task_id, &base).await?;
            Ok(serde_json::json!({ "task_id": task_id, "files": files }))
        }),
    );

    map.insert(
        ("workspaces", "rebase"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let base = opt_str(&params, "base_branch").unwrap_or_else(|| "main".to_string());
            let (success, message, conflicts) =
                api.workspaces.rebase_onto_base(&task_id, &base).await?;
            Ok(serde_json::json!({
                "success": success,
                "message": message,
                "conflict_files": conflicts,
            }))
        }),
    );

    map.insert(
        ("workspaces", "abort_rebase"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let (success, message) = api.workspaces.abort_rebase(&task_id).await?;
            Ok(serde_json::json!({ "success": success, "message": message }))
        }),
    );

    map.insert(
        ("workspaces", "prepare_conflicts"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let base = opt_str(&params, "base_branch").unwrap_or_else(|| "main".to_string());
            let (prepared, message) =
                api.workspaces.prepare_merge_conflicts(&task_id, &base).await?;
            Ok(serde_json::json!({ "prepared": prepared, "message": message }))
        }),
    );

    map.insert(
        ("workspaces", "preflight_merge"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let base = opt_str(&params, "base_branch").unwrap_or_else(|| "main".to_string());
            let (clean, message) = api.workspaces.preflight_merge(&task_id, &base).await?;
            Ok(serde_json::json!({ "clean": clean, "message": message }))
        }),
    );

    map.insert(
        ("workspaces", "merge"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let base = opt_str(&params, "base_branch");
            let squash = opt_bool(&params, "squash", true);
            let allow_conflicts = opt_bool(&params, "allow_conflicts", true);
            let (success, message) = api
                .merge_task(&task_id, base.as_deref(), squash, allow_conflicts)
                .await?;
            Ok(serde_json::json!({ "success": success, "message": message }))
        }),
    );

    map.insert(
        ("workspaces", "release"),
        handler(|api, params| async move {
            let workspace_id = req_str(&params, "workspace_id")?;
            let cleanup = opt_bool(&params, "cleanup", true);
            api.workspaces.release(&workspace_id, cleanup).await?;
            Ok(serde_json::json!({ "workspace_id": workspace_id, "released": true }))
        }),
    );

    map.insert(
        ("workspaces", "janitor"),
        handler(|api, params| async move {
            let prune = opt_bool(&params, "prune_worktrees", true);
            let gc = opt_bool(&params, "gc_branches", true);
            let valid: Vec<String> = api
                .workspaces
                .list_workspaces(None, None)
                .await?
                .into_iter()
                .filter(|w| w.status == crate::store::models::WorkspaceStatus::Active)
                .map(|w| w.id)
                .collect();
            let result = api.workspaces.run_janitor(&valid, prune, gc).await?;
            to_value(&result)
        }),
    );

    map.insert(
        ("workspaces", "cleanup_orphans"),
        handler(|api, _params| async move {
            let valid: Vec<String> = api
                .tasks
                .get_all(None)
                .await?
                .into_iter()
                .map(|t| t.id)
                .collect();
            let cleaned = api.workspaces.cleanup_orphans(&valid).await?;
            Ok(serde_json::json!({ "released_workspace_ids": cleaned }))
        }),
    );

    // -- review -----------------------------------------------------------
    map.insert(
        ("review", "request"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let task = api.require_task(&task_id).await?;
            if task.task_type == TaskType::Pair {
                // PAIR review rides on a pull request, which the core does
                // not manage; surface the recovery path instead.
                return Ok(serde_json::json!({
                    "success": false,
                    "code": codes::REVIEW_BLOCKED_NO_PR,
                    "message": "PAIR tasks are reviewed through their pull request",
                    "hint": "Open a pull request for the task branch, then retry",
                    "next_tool": "get_task",
                    "next_arguments": { "task_id": task_id },
                }));
            }
            let task = api
                .tasks
                .move_to(&task_id, TaskStatus::Review)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("task {task_id}")))?;
            Ok(serde_json::json!({ "success": true, "task": to_value(&task)? }))
        }),
    );

    // -- jobs -------------------------------------------------------------
    map.insert(
        ("jobs", "list_actions"),
        handler(|_api, _params| async move {
            Ok(serde_json::json!({ "actions": crate::jobs::SUPPORTED_ACTIONS }))
        }),
    );

    map.insert(
        ("jobs", "submit"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let action = req_str(&params, "action")?;
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or(serde_json::json!({}));
            api.require_task(&task_id).await?;

            match api.jobs.submit(&task_id, &action, arguments).await {
                Ok(job) => Ok(serde_json::json!({
                    "success": true,
                    "job": to_value(&job)?,
                    "next_tool": "jobs_wait",
                    "next_arguments": { "job_id": job.job_id, "task_id": task_id },
                })),
                Err(crate::error::JobError::UnsupportedAction(action)) => {
                    Ok(serde_json::json!({
                        "success": false,
                        "code": codes::UNSUPPORTED_ACTION,
                        "message": format!("Unsupported job action: {action}"),
                        "hint": "List the supported actions and pick one of them",
                        "next_tool": "jobs_list_actions",
                        "next_arguments": {},
                    }))
                }
                Err(e) => Err(e.into()),
            }
        }),
    );

    map.insert(
        ("jobs", "get"),
        handler(|api, params| async move {
            let job_id = req_str(&params, "job_id")?;
            let task_id = req_str(&params, "task_id")?;
            let job = api.jobs.get(&job_id, &task_id).await?;
            Ok(serde_json::json!({ "job": to_value(&job)? }))
        }),
    );

    map.insert(
        ("jobs", "wait"),
        handler(|api, params| async move {
            let job_id = req_str(&params, "job_id")?;
            let task_id = req_str(&params, "task_id")?;
            let requested = opt_f64(&params, "timeout_seconds", 30.0);
            let outcome = api
                .jobs
                .wait(&job_id, &task_id, Duration::from_secs_f64(requested.max(0.0)))
                .await?;
            Ok(serde_json::json!({
                "job": to_value(&outcome.record)?,
                "timed_out": outcome.timed_out,
                "code": outcome.timed_out.then_some(codes::JOB_TIMEOUT),
                "timeout": {
                    "requested_seconds": outcome.requested_seconds,
                    "waited_seconds": outcome.waited_seconds,
                },
            }))
        }),
    );

    map.insert(
        ("jobs", "events"),
        handler(|api, params| async move {
            let job_id = req_str(&params, "job_id")?;
            let task_id = req_str(&params, "task_id")?;
            let limit = opt_u64(&params, "limit", 50) as usize;
            let offset = opt_u64(&params, "offset", 0) as usize;
            let page = api.jobs.events(&job_id, &task_id, limit, offset).await?;
            to_value(&page)
        }),
    );

    map.insert(
        ("jobs", "cancel"),
        handler(|api, params| async move {
            let job_id = req_str(&params, "job_id")?;
            let task_id = req_str(&params, "task_id")?;
            let job = api.jobs.cancel(&job_id, &task_id).await?;
            Ok(serde_json::json!({
                "job": to_value(&job)?,
                "next_tool": "jobs_wait",
                "next_arguments": { "job_id": job_id, "task_id": task_id },
            }))
        }),
    );

    // -- sessions ---------------------------------------------------------
    map.insert(
        ("sessions", "create"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let reuse = opt_bool(&params, "reuse_if_exists", true);
            let task = api.require_task(&task_id).await?;

            let worktree = match api.workspaces.get_path(&task_id).await? {
                Some(path) => path,
                None => api.workspaces.create(&task_id, task.base_branch.as_deref()).await?,
            };
            let launch = api
                .terminal_sessions
                .create_session(&task, &worktree, reuse)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;

            if let Some(workspace) = api.workspaces.latest_for_task(&task_id).await? {
                let _ = api
                    .executions
                    .create_session(
                        &workspace.id,
                        crate::store::models::SessionType::Pair,
                        Some(&launch.session_name),
                    )
                    .await;
            }
            Ok(serde_json::json!({ "session": to_value(&launch)? }))
        }),
    );

    map.insert(
        ("sessions", "resolution"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let base = opt_str(&params, "base_branch").unwrap_or_else(|| "main".to_string());
            let task = api.require_task(&task_id).await?;

            let merge_path = api.workspaces.merge_worktree_path(&task_id, &base).await?;
            let launch = api
                .terminal_sessions
                .create_session(&task, &merge_path, true)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;

            if let Some(workspace) = api.workspaces.latest_for_task(&task_id).await? {
                let _ = api
                    .executions
                    .create_session(
                        &workspace.id,
                        crate::store::models::SessionType::Resolution,
                        Some(&launch.session_name),
                    )
                    .await;
            }
            Ok(serde_json::json!({ "session": to_value(&launch)? }))
        }),
    );

    map.insert(
        ("sessions", "exists"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let name = crate::sessions::TerminalSessionService::session_name(&task_id);
            let exists = api
                .terminal_sessions
                .session_exists(&name)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            Ok(serde_json::json!({ "session_name": name, "exists": exists }))
        }),
    );

    map.insert(
        ("sessions", "attach"),
        handler(|_api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let name = crate::sessions::TerminalSessionService::session_name(&task_id);
            Ok(serde_json::json!({
                "session_name": name,
                "command": crate::sessions::TerminalSessionService::attach_command(&name),
            }))
        }),
    );

    map.insert(
        ("sessions", "kill"),
        handler(|api, params| async move {
            let task_id = req_str(&params, "task_id")?;
            let name = crate::sessions::TerminalSessionService::session_name(&task_id);
            let killed = api
                .terminal_sessions
                .kill_session(&name)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;
            let _ = api
                .executions
                .close_session_by_external_id(
                    &name,
                    crate::store::models::SessionStatus::Closed,
                )
                .await;
            Ok(serde_json::json!({ "session_name": name, "killed": killed }))
        }),
    );

    // -- messages ---------------------------------------------------------
    map.insert(
        ("messages", "queue"),
        handler(|api, params| async move {
            let key = req_str(&params, "key")?;
            let lane = parse_lane(&params)?;
            let content = req_str(&params, "content")?;
            let message = api.queued.queue_message(&key, lane, &content).await;
            Ok(serde_json::json!({ "message": to_value(&message)? }))
        }),
    );

    map.insert(
        ("messages", "take"),
        handler(|api, params| async move {
            let key = req_str(&params, "key")?;
            let lane = parse_lane(&params)?;
            let message = api.queued.take_queued(&key, lane).await;
            Ok(serde_json::json!({ "message": message.map(|m| to_value(&m)).transpose()? }))
        }),
    );

    map.insert(
        ("messages", "list"),
        handler(|api, params| async move {
            let key = req_str(&params, "key")?;
            let lane = parse_lane(&params)?;
            let messages = api.queued.get_queued(&key, lane).await;
            Ok(serde_json::json!({ "messages": to_value(&messages)? }))
        }),
    );

    map.insert(
        ("messages", "cancel"),
        handler(|api, params| async move {
            let key = req_str(&params, "key")?;
            let lane = parse_lane(&params)?;
            let cancelled = api.queued.cancel_queued(&key, lane).await;
            Ok(serde_json::json!({ "cancelled": cancelled }))
        }),
    );

    map.insert(
        ("messages", "status"),
        handler(|api, params| async move {
            let key = req_str(&params, "key")?;
            let lane = parse_lane(&params)?;
            let status = api.queued.get_status(&key, lane).await;
            to_value(&status)
        }),
    );

    // -- plan -------------------------------------------------------------
    map.insert(
        ("plan", "propose"),
        handler(|api, params| async move {
            let project_id = req_str(&params, "project_id")?;
            let tasks_json = params
                .get("tasks")
                .cloned()
                .unwrap_or(serde_json::json!([]));
            let todos_json = params
                .get("todos")
                .cloned()
                .unwrap_or(serde_json::json!([]));
            api.projects
                .get_project(&project_id)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("project {project_id}")))?;
            let proposal = api
                .proposals
                .create(&project_id, opt_str(&params, "repo_id").as_deref(), tasks_json, todos_json)
                .await?;
            Ok(serde_json::json!({ "proposal": to_value(&proposal)? }))
        }),
    );

    map.insert(
        ("plan", "list"),
        handler(|api, params| async move {
            let project_id = req_str(&params, "project_id")?;
            let proposals = api.proposals.list_for_project(&project_id).await?;
            Ok(serde_json::json!({ "proposals": to_value(&proposals)? }))
        }),
    );

    map.insert(
        ("plan", "approve"),
        handler(|api, params| async move {
            let proposal_id = req_str(&params, "proposal_id")?;
            let proposal = api
                .proposals
                .set_status(&proposal_id, ProposalStatus::Approved)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("proposal {proposal_id}")))?;

            // Approval materialises the drafted tasks onto the board.
            let mut created = Vec::new();
            if let Some(drafts) = proposal.tasks_json.as_array() {
                for draft in drafts {
                    let Some(title) = draft.get("title").and_then(|t| t.as_str()) else {
                        continue;
                    };
                    let mut task = Task::new(&proposal.project_id, title);
                    if let Some(description) = draft.get("description").and_then(|d| d.as_str()) {
                        task.description = description.to_string();
                    }
                    if let Some(raw) = draft.get("priority").and_then(|p| p.as_str()) {
                        if let Some(priority) = Priority::parse(raw) {
                            task.priority = priority;
                        }
                    }
                    if let Some(raw) = draft.get("task_type").and_then(|t| t.as_str()) {
                        if let Some(task_type) = TaskType::parse(raw) {
                            task.task_type = task_type;
                        }
                    }
                    api.tasks.create(&task).await?;
                    created.push(task.id);
                }
            }
            Ok(serde_json::json!({
                "proposal": to_value(&proposal)?,
                "created_task_ids": created,
            }))
        }),
    );

    map.insert(
        ("plan", "reject"),
        handler(|api, params| async move {
            let proposal_id = req_str(&params, "proposal_id")?;
            let proposal = api
                .proposals
                .set_status(&proposal_id, ProposalStatus::Rejected)
                .await?
                .ok_or_else(|| ApiError::NotFound(format!("proposal {proposal_id}")))?;
            Ok(serde_json::json!({ "proposal": to_value(&proposal)? }))
        }),
    );

    // -- core -------------------------------------------------------------
    map.insert(
        ("core", "shutdown"),
        handler(|api, params| async move {
            let reason =
                opt_str(&params, "reason").unwrap_or_else(|| "shutdown requested".to_string());
            api.request_shutdown(&reason);
            Ok(serde_json::json!({ "stopping": true, "reason": reason }))
        }),
    );

    map.insert(
        ("core", "status"),
        handler(|api, _params| async move {
            let running = api.engine.running_count().await;
            Ok(serde_json::json!({
                "version": api.version,
                "running_agents": running,
            }))
        }),
    );

    // -- settings / audit -------------------------------------------------
    map.insert(
        ("settings", "get"),
        handler(|api, _params| async move {
            let settings = api.settings.lock().expect("settings lock poisoned").clone();
            Ok(serde_json::json!({ "settings": to_value(&settings)? }))
        }),
    );

    map.insert(
        ("settings", "update"),
        handler(|api, params| async move {
            let updates = params
                .get("updates")
                .cloned()
                .ok_or_else(|| ApiError::MissingParameter("updates".to_string()))?;
            let settings = api.update_settings(&updates)?;
            Ok(serde_json::json!({ "settings": to_value(&settings)? }))
        }),
    );

    map.insert(
        ("audit", "tail"),
        handler(|api, params| async move {
            let capability = opt_str(&params, "capability");
            let limit = opt_u64(&params, "limit", 50) as i64;
            let events = api.audit.tail(capability.as_deref(), limit).await?;
            Ok(serde_json::json!({ "events": to_value(&events)? }))
        }),
    );

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_contains_core_pairs() {
        for pair in [
            ("tasks", "create"),
            ("tasks", "wait"),
            ("tasks", "logs"),
            ("jobs", "submit"),
            ("jobs", "wait"),
            ("workspaces", "merge"),
            ("sessions", "create"),
            ("settings", "update"),
            ("plan", "propose"),
            ("audit", "tail"),
        ] {
            assert!(resolve(pair.0, pair.1).is_some(), "missing {pair:?}");
        }
        assert!(resolve("tasks", "no_such_method").is_none());
    }

    #[test]
    fn test_idempotent_mutation_set() {
        assert!(is_idempotent_mutation("jobs", "submit"));
        assert!(is_idempotent_mutation("tasks", "create"));
        assert!(!is_idempotent_mutation("tasks", "get"));
        assert!(!is_idempotent_mutation("audit", "tail"));
    }

    #[test]
    fn test_every_pair_is_profile_gated() {
        // No pair is callable by an unbound (viewer-defaulted) session
        // unless the viewer allowlist explicitly names it.
        use crate::host::binding::CapabilityProfile;
        for (capability, method) in dispatch_pairs() {
            let viewer_ok = CapabilityProfile::Viewer.allows(&capability, &method);
            let maintainer_ok = CapabilityProfile::Maintainer.allows(&capability, &method);
            assert!(maintainer_ok, "maintainer must reach {capability}.{method}");
            if viewer_ok {
                // Viewer pairs must be read-only.
                assert!(
                    !is_idempotent_mutation(&capability, &method),
                    "{capability}.{method} is viewer-visible but mutating"
                );
            }
        }
    }

    #[test]
    fn test_param_helpers() {
        let params = serde_json::json!({
            "task_id": "t1",
            "flag": true,
            "count": 7,
            "names": ["a", "b"],
        });
        assert_eq!(req_str(&params, "task_id").unwrap(), "t1");
        assert!(matches!(
            req_str(&params, "missing"),
            Err(ApiError::MissingParameter(_))
        ));
        assert!(opt_bool(&params, "flag", false));
        assert_eq!(opt_u64(&params, "count", 0), 7);
        assert_eq!(
            opt_string_list(&params, "names").unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(opt_timestamp(&params, "task_id").is_err());
        assert!(opt_timestamp(&params, "missing").unwrap().is_none());
    }
}
