// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace service: maps tasks to on-disk git worktrees.
//!
//! Layout under the data directory:
//!
//! ```text
//! worktrees/<workspace_id>/<repo_name>   one worktree per (workspace, repo)
//! merge-worktrees/<repo_id>              stable conflict-staging worktree
//! ```
//!
//! The merge worktree's branch is `kagan/merge-worktree-<repo_id[:8]>`; it
//! is reused across merges of the same repo and exempt from branch GC.

mod merge;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::WorkspaceError;
use crate::events::{DomainEvent, EventBus};
use crate::git::GitAdapter;
use crate::limits::DIFF_CACHE_TTL;
use crate::store::models::{
    short_id, Repo, Workspace, WorkspaceRepo, WorkspaceRepoView, WorkspaceStatus,
};
use crate::store::{ProjectRepository, TaskRepository, WorkspaceRepository};

/// Input for creating one repo's worktree in a workspace.
#[derive(Debug, Clone)]
pub struct RepoWorkspaceInput {
    pub repo_id: String,
    pub repo_path: String,
    pub target_branch: String,
}

/// Result of janitor cleanup operations.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JanitorResult {
    pub worktrees_pruned: usize,
    pub branches_deleted: Vec<String>,
    pub repos_processed: Vec<String>,
}

impl JanitorResult {
    pub fn total_cleaned(&self) -> usize {
        self.worktrees_pruned + self.branches_deleted.len()
    }
}

#[derive(Clone)]
enum CachedValue {
    Text(String),
    List(Vec<String>),
}

/// Workspace and worktree operations for tasks.
#[derive(Clone)]
pub struct WorkspaceService {
    pub(crate) workspaces: WorkspaceRepository,
    pub(crate) tasks: TaskRepository,
    pub(crate) projects: ProjectRepository,
    pub(crate) git: GitAdapter,
    events: EventBus,
    base_dir: PathBuf,
    diff_cache: Arc<Mutex<HashMap<(String, String, String), (Instant, CachedValue)>>>,
    /// Serialises merges so fast-forward steps do not race.
    pub(crate) merge_lock: Arc<Mutex<()>>,
}

impl WorkspaceService {
    pub fn new(
        workspaces: WorkspaceRepository,
        tasks: TaskRepository,
        projects: ProjectRepository,
        git: GitAdapter,
        events: EventBus,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            workspaces,
            tasks,
            projects,
            git,
            events,
            base_dir,
            diff_cache: Arc::new(Mutex::new(HashMap::new())),
            merge_lock: Arc::new(Mutex::new(())),
        }
    }

    fn workspace_base_dir(&self, workspace_id: &str) -> PathBuf {
        self.base_dir.join("worktrees").join(workspace_id)
    }

    pub(crate) fn merge_worktrees_dir(&self) -> PathBuf {
        self.base_dir.join("merge-worktrees")
    }

    pub(crate) fn merge_branch_name(repo_id: &str) -> String {
        let prefix: String = repo_id.chars().take(8).collect();
        format!("kagan/merge-worktree-{prefix}")
    }

    // ------------------------------------------------------------------
    // Provisioning and lifecycle
    // ------------------------------------------------------------------

    /// Provision a workspace with worktrees for all given repos. Any
    /// failure rolls back worktrees created so far.
    pub async fn provision(
        &self,
        task_id: &str,
        repos: &[RepoWorkspaceInput],
        branch_name: Option<&str>,
    ) -> Result<String, WorkspaceError> {
        if repos.is_empty() {
            return Err(WorkspaceError::InvalidInput(
                "At least one repo is required to provision a workspace".to_string(),
            ));
        }
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| WorkspaceError::NotFound(format!("task {task_id}")))?;

        let workspace_id = short_id();
        let branch_name = branch_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("kagan/{workspace_id}"));

        let base_dir = self.workspace_base_dir(&workspace_id);
        std::fs::create_dir_all(&base_dir)
            .map_err(|e| WorkspaceError::ProvisionFailed(format!("create base dir: {e}")))?;

        let mut created: Vec<PathBuf> = Vec::new();
        let mut rows: Vec<WorkspaceRepo> = Vec::new();

        for input in repos {
            let repo_name = Path::new(&input.repo_path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| input.repo_id.clone());
            let worktree_path = base_dir.join(&repo_name);

            let result = self
                .git
                .create_worktree(
                    Path::new(&input.repo_path),
                    &worktree_path,
                    &branch_name,
                    &input.target_branch,
                )
                .await;

            if let Err(e) = result {
                warn!("Worktree creation failed for {}: {e}", input.repo_id);
                self.rollback_worktrees(&created, &base_dir).await;
                return Err(WorkspaceError::ProvisionFailed(e.to_string()));
            }
            created.push(worktree_path.clone());
            rows.push(WorkspaceRepo {
                workspace_id: workspace_id.clone(),
                repo_id: input.repo_id.clone(),
                target_branch: input.target_branch.clone(),
                worktree_path: worktree_path.to_string_lossy().to_string(),
                created_at: Utc::now(),
            });
        }

        let now = Utc::now();
        let workspace = Workspace {
            id: workspace_id.clone(),
            project_id: task.project_id.clone(),
            task_id: task_id.to_string(),
            path: base_dir.to_string_lossy().to_string(),
            branch_name,
            status: WorkspaceStatus::Active,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.workspaces.insert(&workspace, &rows).await {
            self.rollback_worktrees(&created, &base_dir).await;
            return Err(e.into());
        }

        info!("Provisioned workspace {workspace_id} for task {task_id}");
        self.events.publish(DomainEvent::WorkspaceProvisioned {
            workspace_id: workspace_id.clone(),
            task_id: task_id.to_string(),
        });
        Ok(workspace_id)
    }

    async fn rollback_worktrees(&self, created: &[PathBuf], base_dir: &Path) {
        for path in created {
            if let Err(e) = self.git.delete_worktree(path).await {
                warn!("Rollback failed to delete worktree {path:?}: {e}");
            }
        }
        let _ = std::fs::remove_dir_all(base_dir);
    }

    /// Provision using all repos of a project, in display order.
    pub async fn provision_for_project(
        &self,
        task_id: &str,
        project_id: &str,
        branch_name: Option<&str>,
    ) -> Result<String, WorkspaceError> {
        let repos = self.projects.project_repos(project_id).await?;
        if repos.is_empty() {
            return Err(WorkspaceError::NoRepos(format!("project {project_id}")));
        }
        let inputs: Vec<RepoWorkspaceInput> = repos
            .into_iter()
            .map(|repo| RepoWorkspaceInput {
                repo_id: repo.id,
                repo_path: repo.path,
                target_branch: repo.default_branch,
            })
            .collect();
        self.provision(task_id, &inputs, branch_name).await
    }

    /// Create a workspace for a task from its project repos and return the
    /// primary worktree path.
    pub async fn create(
        &self,
        task_id: &str,
        base_branch: Option<&str>,
    ) -> Result<PathBuf, WorkspaceError> {
        let task = self
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| WorkspaceError::NotFound(format!("task {task_id}")))?;
        let repos = self.projects.project_repos(&task.project_id).await?;
        if repos.is_empty() {
            return Err(WorkspaceError::NoRepos(format!(
                "project {}",
                task.project_id
            )));
        }
        let inputs: Vec<RepoWorkspaceInput> = repos
            .into_iter()
            .map(|repo| RepoWorkspaceInput {
                repo_id: repo.id,
                repo_path: repo.path,
                target_branch: base_branch
                    .map(str::to_string)
                    .unwrap_or(repo.default_branch),
            })
            .collect();
        let workspace_id = self.provision(task_id, &inputs, None).await?;
        self.agent_working_dir(&workspace_id).await
    }

    /// Release a workspace: remove its worktrees (when `cleanup`) and mark
    /// the row ARCHIVED.
    pub async fn release(&self, workspace_id: &str, cleanup: bool) -> Result<(), WorkspaceError> {
        let workspace = self
            .workspaces
            .get(workspace_id)
            .await?
            .ok_or_else(|| WorkspaceError::NotFound(format!("workspace {workspace_id}")))?;

        if cleanup {
            for (repo_row, _) in self.workspaces.repo_rows(workspace_id).await? {
                let path = PathBuf::from(&repo_row.worktree_path);
                if path.exists() {
                    if let Err(e) = self.git.delete_worktree(&path).await {
                        warn!("Failed to delete worktree {path:?}: {e}");
                    }
                }
            }
            let base = PathBuf::from(&workspace.path);
            if base.exists() {
                let _ = std::fs::remove_dir_all(&base);
            }
        }

        self.workspaces
            .set_status(workspace_id, WorkspaceStatus::Archived)
            .await?;
        Ok(())
    }

    /// Release the latest workspace of a task (no-op when none exists).
    pub async fn delete(&self, task_id: &str) -> Result<(), WorkspaceError> {
        if let Some(workspace) = self.workspaces.latest_for_task(task_id).await? {
            self.release(&workspace.id, true).await?;
        }
        Ok(())
    }

    /// Release workspaces whose task no longer exists.
    pub async fn cleanup_orphans(
        &self,
        valid_task_ids: &[String],
    ) -> Result<Vec<String>, WorkspaceError> {
        let mut cleaned = Vec::new();
        for workspace in self.workspaces.list(None, None).await? {
            if workspace.status == WorkspaceStatus::Archived {
                continue;
            }
            if !valid_task_ids.contains(&workspace.task_id) {
                self.release(&workspace.id, true).await?;
                cleaned.push(workspace.id);
            }
        }
        Ok(cleaned)
    }

    /// Janitor: prune stale worktree admin files and GC orphan `kagan/*`
    /// branches. Merge-worktree branches are never collected.
    pub async fn run_janitor(
        &self,
        valid_workspace_ids: &[String],
        prune_worktrees: bool,
        gc_branches: bool,
    ) -> Result<JanitorResult, WorkspaceError> {
        let mut result = JanitorResult {
            worktrees_pruned: 0,
            branches_deleted: Vec::new(),
            repos_processed: Vec::new(),
        };

        for repo in self.projects.list_repos().await? {
            let repo_path = PathBuf::from(&repo.path);
            if !repo_path.exists() {
                continue;
            }
            result.repos_processed.push(repo.name.clone());

            if prune_worktrees {
                result.worktrees_pruned += self.git.prune_worktrees(&repo_path).await?;
            }

            if gc_branches {
                for branch in self.git.list_kagan_branches(&repo_path).await? {
                    let Some(workspace_id) = extract_workspace_id(&branch) else {
                        continue;
                    };
                    if valid_workspace_ids.iter().any(|id| id == &workspace_id) {
                        continue;
                    }
                    if self
                        .git
                        .worktree_for_branch(&repo_path, &branch)
                        .await?
                        .is_some()
                    {
                        continue;
                    }
                    if self.git.delete_branch(&repo_path, &branch, false).await? {
                        result.branches_deleted.push(format!("{}:{branch}", repo.name));
                    }
                }
            }
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub async fn get_workspace(
        &self,
        workspace_id: &str,
    ) -> Result<Option<Workspace>, WorkspaceError> {
        Ok(self.workspaces.get(workspace_id).await?)
    }

    pub async fn list_workspaces(
        &self,
        task_id: Option<&str>,
        repo_id: Option<&str>,
    ) -> Result<Vec<Workspace>, WorkspaceError> {
        Ok(self.workspaces.list(task_id, repo_id).await?)
    }

    pub(crate) async fn latest_for_task(
        &self,
        task_id: &str,
    ) -> Result<Option<Workspace>, WorkspaceError> {
        Ok(self.workspaces.latest_for_task(task_id).await?)
    }

    /// The agent's working directory: the primary repo's worktree.
    pub async fn agent_working_dir(&self, workspace_id: &str) -> Result<PathBuf, WorkspaceError> {
        let primary = self.workspaces.primary_repo_row(workspace_id).await?;
        match primary {
            Some((repo_row, _)) if !repo_row.worktree_path.is_empty() => {
                Ok(PathBuf::from(repo_row.worktree_path))
            }
            _ => Err(WorkspaceError::NoRepos(format!("workspace {workspace_id}"))),
        }
    }

    /// Primary worktree path for a task, when a workspace exists.
    pub async fn get_path(&self, task_id: &str) -> Result<Option<PathBuf>, WorkspaceError> {
        let Some(workspace) = self.latest_for_task(task_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.agent_working_dir(&workspace.id).await?))
    }

    pub(crate) async fn repo_rows_for_task(
        &self,
        task_id: &str,
    ) -> Result<Vec<(WorkspaceRepo, Repo)>, WorkspaceError> {
        let Some(workspace) = self.latest_for_task(task_id).await? else {
            return Ok(Vec::new());
        };
        Ok(self.workspaces.repo_rows(&workspace.id).await?)
    }

    /// Repos of a workspace with per-repo change summaries.
    pub async fn workspace_repos(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<WorkspaceRepoView>, WorkspaceError> {
        let mut views = Vec::new();
        for (repo_row, repo) in self.workspaces.repo_rows(workspace_id).await? {
            let worktree = PathBuf::from(&repo_row.worktree_path);
            let (has_changes, diff_stats) = if worktree.exists() {
                let uncommitted = self.git.has_uncommitted_changes(&worktree).await?;
                let stats = self
                    .git
                    .diff_stats(&worktree, &repo_row.target_branch)
                    .await?;
                let touched = stats.values().any(|v| *v != 0);
                (uncommitted || touched, Some(stats))
            } else {
                (false, None)
            };
            views.push(WorkspaceRepoView {
                repo_id: repo.id,
                repo_name: repo.name,
                repo_path: repo.path,
                worktree_path: repo_row.worktree_path,
                target_branch: repo_row.target_branch,
                has_changes,
                diff_stats,
            });
        }
        Ok(views)
    }

    // ------------------------------------------------------------------
    // Diff family (fan-out over workspace repos, cached ~5 s)
    // ------------------------------------------------------------------

    async fn cached_text(
        &self,
        operation: &str,
        task_id: &str,
        base_branch: &str,
    ) -> Option<String> {
        let cache = self.diff_cache.lock().await;
        let key = (
            operation.to_string(),
            task_id.to_string(),
            base_branch.to_string(),
        );
        match cache.get(&key) {
            Some((at, CachedValue::Text(value))) if at.elapsed() <= DIFF_CACHE_TTL => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    async fn cached_list(
        &self,
        operation: &str,
        task_id: &str,
        base_branch: &str,
    ) -> Option<Vec<String>> {
        let cache = self.diff_cache.lock().await;
        let key = (
            operation.to_string(),
            task_id.to_string(),
            base_branch.to_string(),
        );
        match cache.get(&key) {
            Some((at, CachedValue::List(value))) if at.elapsed() <= DIFF_CACHE_TTL => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    async fn store_cached(
        &self,
        operation: &str,
        task_id: &str,
        base_branch: &str,
        value: CachedValue,
    ) {
        let mut cache = self.diff_cache.lock().await;
        cache.insert(
            (
                operation.to_string(),
                task_id.to_string(),
                base_branch.to_string(),
            ),
            (Instant::now(), value),
        );
    }

    /// One-line commit messages across repos, labelled `[<repo>]`.
    pub async fn commit_log(
        &self,
        task_id: &str,
        base_branch: &str,
    ) -> Result<Vec<String>, WorkspaceError> {
        if let Some(cached) = self.cached_list("commit_log", task_id, base_branch).await {
            return Ok(cached);
        }
        let mut commits = Vec::new();
        for (repo_row, repo) in self.repo_rows_for_task(task_id).await? {
            let worktree = PathBuf::from(&repo_row.worktree_path);
            if !worktree.exists() {
                continue;
            }
            let target = pick_branch(&repo_row.target_branch, base_branch);
            for commit in self.git.commit_log(&worktree, target).await? {
                commits.push(format!("[{}] {commit}", repo.name));
            }
        }
        self.store_cached(
            "commit_log",
            task_id,
            base_branch,
            CachedValue::List(commits.clone()),
        )
        .await;
        Ok(commits)
    }

    /// Full diff across repos with `# === <repo> (<branch>) ===` headers;
    /// repos without changes are omitted.
    pub async fn diff(&self, task_id: &str, base_branch: &str) -> Result<String, WorkspaceError> {
        if let Some(cached) = self.cached_text("diff", task_id, base_branch).await {
            return Ok(cached);
        }
        let mut chunks: Vec<String> = Vec::new();
        for (repo_row, repo) in self.repo_rows_for_task(task_id).await? {
            let worktree = PathBuf::from(&repo_row.worktree_path);
            if !worktree.exists() {
                continue;
            }
            let target = pick_branch(&repo_row.target_branch, base_branch);
            let diff = self.git.diff(&worktree, target).await?;
            if diff.trim().is_empty() {
                continue;
            }
            chunks.push(format!("# === {} ({target}) ===", repo.name));
            chunks.push(diff.trim_end().to_string());
            chunks.push(String::new());
        }
        let combined = chunks.join("\n").trim().to_string();
        self.store_cached("diff", task_id, base_branch, CachedValue::Text(combined.clone()))
            .await;
        Ok(combined)
    }

    /// Per-repo diff summary lines, with a total line when more than one
    /// repo reports.
    pub async fn diff_stats(
        &self,
        task_id: &str,
        base_branch: &str,
    ) -> Result<String, WorkspaceError> {
        if let Some(cached) = self.cached_text("diff_stats", task_id, base_branch).await {
            return Ok(cached);
        }
        let mut lines = Vec::new();
        let (mut total_files, mut total_ins, mut total_del) = (0, 0, 0);
        for (repo_row, repo) in self.repo_rows_for_task(task_id).await? {
            let worktree = PathBuf::from(&repo_row.worktree_path);
            if !worktree.exists() {
                continue;
            }
            let target = pick_branch(&repo_row.target_branch, base_branch);
            let stats = self.git.diff_stats(&worktree, target).await?;
            let files = stats.get("files").copied().unwrap_or(0);
            let insertions = stats.get("insertions").copied().unwrap_or(0);
            let deletions = stats.get("deletions").copied().unwrap_or(0);
            total_files += files;
            total_ins += insertions;
            total_del += deletions;
            if files != 0 || insertions != 0 || deletions != 0 {
                lines.push(format!(
                    "{}: +{insertions} -{deletions} ({files} files)",
                    repo.name
                ));
            } else {
                lines.push(format!("{}: no changes", repo.name));
            }
        }
        if lines.len() > 1 {
            lines.push(format!(
                "Total: +{total_ins} -{total_del} ({total_files} files)"
            ));
        }
        let summary = lines.join("\n");
        self.store_cached(
            "diff_stats",
            task_id,
            base_branch,
            CachedValue::Text(summary.clone()),
        )
        .await;
        Ok(summary)
    }

    /// Changed file paths labelled `<repo>:<path>`.
    pub async fn files_changed(
        &self,
        task_id: &str,
        base_branch: &str,
    ) -> Result<Vec<String>, WorkspaceError> {
        if let Some(cached) = self.cached_list("files_changed", task_id, base_branch).await {
            return Ok(cached);
        }
        let mut files = Vec::new();
        for (repo_row, repo) in self.repo_rows_for_task(task_id).await? {
            let worktree = PathBuf::from(&repo_row.worktree_path);
            if !worktree.exists() {
                continue;
            }
            let target = pick_branch(&repo_row.target_branch, base_branch);
            for path in self.git.files_changed(&worktree, target).await? {
                files.push(format!("{}:{path}", repo.name));
            }
        }
        self.store_cached(
            "files_changed",
            task_id,
            base_branch,
            CachedValue::List(files.clone()),
        )
        .await;
        Ok(files)
    }

    /// Files changed on the base branch since each repo's merge base,
    /// labelled `<repo>:<path>`.
    pub async fn files_changed_on_base(
        &self,
        task_id: &str,
        base_branch: &str,
    ) -> Result<Vec<String>, WorkspaceError> {
        let mut files = Vec::new();
        for (repo_row, repo) in self.repo_rows_for_task(task_id).await? {
            let worktree = PathBuf::from(&repo_row.worktree_path);
            if !worktree.exists() {
                continue;
            }
            let target = pick_branch(&repo_row.target_branch, base_branch);
            for path in self.git.files_changed_on_base(&worktree, target).await? {
                files.push(format!("{}:{path}", repo.name));
            }
        }
        Ok(files)
    }
}

fn pick_branch<'a>(target_branch: &'a str, fallback: &'a str) -> &'a str {
    if target_branch.is_empty() {
        fallback
    } else {
        target_branch
    }
}

/// Extract the workspace id from a managed branch name.
///
/// `kagan/<workspace_id>` maps to the id; merge-worktree branches map to
/// `None` (they are pinned).
pub fn extract_workspace_id(branch_name: &str) -> Option<String> {
    let suffix = branch_name.strip_prefix("kagan/")?;
    if suffix.is_empty() || suffix.starts_with("merge-worktree-") {
        return None;
    }
    Some(suffix.to_string())
}

#[cfg(test)]
pub(crate) mod testutil;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_workspace_id() {
        assert_eq!(
            extract_workspace_id("kagan/abc12345"),
            Some("abc12345".to_string())
        );
        assert_eq!(extract_workspace_id("kagan/merge-worktree-abc12345"), None);
        assert_eq!(extract_workspace_id("kagan/"), None);
        assert_eq!(extract_workspace_id("feature/x"), None);
    }

    #[test]
    fn test_merge_branch_name_truncates_repo_id() {
        assert_eq!(
            WorkspaceService::merge_branch_name("0123456789abcdef"),
            "kagan/merge-worktree-01234567"
        );
    }

    #[test]
    fn test_pick_branch() {
        assert_eq!(pick_branch("develop", "main"), "develop");
        assert_eq!(pick_branch("", "main"), "main");
    }
}
