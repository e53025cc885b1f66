// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Rebase, conflict staging, and merge operations on top of the workspace
//! service.
//!
//! Merges never touch the source repo's checkout directly: the task branch
//! is merged inside the per-repo merge worktree, then the base branch is
//! fast-forwarded from it. Conflicts can be left staged in the merge
//! worktree for manual resolution.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::WorkspaceError;
use crate::git::generate_semantic_commit;
use crate::store::models::Workspace;

use super::WorkspaceService;

/// Outcome of a rebase attempt: success flag, human message, conflicting
/// files labelled `<repo>:<path>`.
pub type RebaseOutcome = (bool, String, Vec<String>);

impl WorkspaceService {
    // ------------------------------------------------------------------
    // Rebase
    // ------------------------------------------------------------------

    /// Rebase every workspace repo onto its target branch (origin-tracking
    /// when an `origin` remote exists). Dirty worktrees are auto-committed
    /// first. On conflict the rebase is aborted and the conflicting files
    /// are reported.
    pub async fn rebase_onto_base(
        &self,
        task_id: &str,
        base_branch: &str,
    ) -> Result<RebaseOutcome, WorkspaceError> {
        let Some(workspace) = self.latest_for_task(task_id).await? else {
            return Ok((false, format!("Workspace not found for task {task_id}"), vec![]));
        };
        let repo_rows = self.workspaces.repo_rows(&workspace.id).await?;
        if repo_rows.is_empty() {
            return Ok((false, format!("Workspace {} has no repos", workspace.id), vec![]));
        }

        for (repo_row, repo) in &repo_rows {
            let wt_path = PathBuf::from(&repo_row.worktree_path);
            if !wt_path.exists() {
                continue;
            }
            let target = if repo_row.target_branch.is_empty() {
                base_branch
            } else {
                &repo_row.target_branch
            };

            let has_remote = self.git.has_remote(&wt_path).await?;
            if has_remote {
                self.git
                    .run_git(&["fetch", "origin", target], &wt_path, false)
                    .await?;
            }
            let rebase_ref = if has_remote {
                format!("origin/{target}")
            } else {
                target.to_string()
            };

            if self.git.rebase_in_progress(&wt_path).await? {
                let conflicts = self.labelled_conflicts(&wt_path, &repo.name).await?;
                return Ok((
                    false,
                    format!(
                        "Rebase already in progress for {}; resolve conflicts or abort the rebase",
                        repo.name
                    ),
                    conflicts,
                ));
            }

            if self.git.has_uncommitted_changes(&wt_path).await? {
                self.git
                    .commit_all(
                        &wt_path,
                        &format!("chore: adding uncommitted agent changes ({})", repo.name),
                    )
                    .await?;
            }

            let (stdout, stderr) = self
                .git
                .run_git(&["rebase", &rebase_ref], &wt_path, false)
                .await?;

            if self.git.rebase_in_progress(&wt_path).await? {
                let conflicts = self.labelled_conflicts(&wt_path, &repo.name).await?;
                self.git
                    .run_git(&["rebase", "--abort"], &wt_path, false)
                    .await?;
                info!("Rebase conflict for {task_id}: {conflicts:?}");
                return Ok((
                    false,
                    format!(
                        "Rebase conflict in {} ({} file(s))",
                        repo.name,
                        conflicts.len()
                    ),
                    conflicts,
                ));
            }

            let combined = format!("{stdout}\n{stderr}").to_lowercase();
            if combined.contains("fatal:") || combined.contains("error:") {
                let failure = combined.trim().to_string();
                return Ok((
                    false,
                    format!("Rebase failed in {}: {failure}", repo.name),
                    vec![],
                ));
            }
        }

        Ok((
            true,
            format!("Successfully rebased onto {base_branch}"),
            vec![],
        ))
    }

    /// Abort in-progress rebases across the workspace's repos.
    pub async fn abort_rebase(&self, task_id: &str) -> Result<(bool, String), WorkspaceError> {
        let Some(workspace) = self.latest_for_task(task_id).await? else {
            return Ok((false, format!("Workspace not found for task {task_id}")));
        };
        let repo_rows = self.workspaces.repo_rows(&workspace.id).await?;
        if repo_rows.is_empty() {
            return Ok((false, format!("Workspace {} has no repos", workspace.id)));
        }

        let mut aborted = Vec::new();
        for (repo_row, repo) in &repo_rows {
            let wt_path = PathBuf::from(&repo_row.worktree_path);
            if !wt_path.exists() || !self.git.rebase_in_progress(&wt_path).await? {
                continue;
            }
            self.git
                .run_git(&["rebase", "--abort"], &wt_path, false)
                .await?;
            aborted.push(repo.name.clone());
        }

        if aborted.is_empty() {
            return Ok((false, "No rebase in progress".to_string()));
        }
        Ok((
            true,
            format!("Aborted rebase in {} repo(s): {}", aborted.len(), aborted.join(", ")),
        ))
    }

    async fn labelled_conflicts(
        &self,
        wt_path: &Path,
        repo_name: &str,
    ) -> Result<Vec<String>, WorkspaceError> {
        Ok(self
            .git
            .conflict_files(wt_path)
            .await?
            .into_iter()
            .map(|path| format!("{repo_name}:{path}"))
            .collect())
    }

    // ------------------------------------------------------------------
    // Merge worktree
    // ------------------------------------------------------------------

    /// Path of the primary repo's merge worktree, creating it when missing.
    pub async fn merge_worktree_path(
        &self,
        task_id: &str,
        base_branch: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let Some(workspace) = self.latest_for_task(task_id).await? else {
            return Err(WorkspaceError::NotFound(format!(
                "Workspace not found for task {task_id}"
            )));
        };
        self.ensure_merge_worktree(&workspace, base_branch).await
    }

    async fn ensure_merge_worktree(
        &self,
        workspace: &Workspace,
        base_branch: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let Some((primary, _)) = self.workspaces.primary_repo_row(&workspace.id).await? else {
            return Err(WorkspaceError::NoRepos(format!(
                "workspace {}",
                workspace.id
            )));
        };
        let merge_path = self.merge_worktrees_dir().join(&primary.repo_id);
        if merge_path.exists() {
            return Ok(merge_path);
        }
        if let Some(parent) = merge_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| WorkspaceError::ProvisionFailed(e.to_string()))?;
        }

        let worktree = self.agent_working_dir(&workspace.id).await?;
        let repo_root = self.git.resolve_repo_root(&worktree);
        self.git
            .create_worktree_forced(
                &repo_root,
                &merge_path,
                &Self::merge_branch_name(&primary.repo_id),
                base_branch,
            )
            .await?;
        Ok(merge_path)
    }

    /// A resolution is pending in the merge worktree when MERGE_HEAD exists
    /// or the tree is non-clean. The merge worktree is always hard-reset
    /// before staging, so any leftover state belongs to a prior conflict
    /// staging (a conflicted squash merge leaves no MERGE_HEAD).
    async fn merge_resolution_pending(&self, merge_path: &Path) -> Result<bool, WorkspaceError> {
        if self.git.merge_in_progress(merge_path).await? {
            return Ok(true);
        }
        let (status, _) = self
            .git
            .run_git(&["status", "--porcelain"], merge_path, false)
            .await?;
        Ok(!status.trim().is_empty())
    }

    /// Reset the merge worktree to the tip of the base branch
    /// (origin-tracking when available).
    async fn reset_merge_worktree(
        &self,
        merge_path: &Path,
        merge_branch: &str,
        base_branch: &str,
    ) -> Result<(), WorkspaceError> {
        self.git
            .run_git(&["fetch", "origin", base_branch], merge_path, false)
            .await?;
        let origin_ref = format!("refs/remotes/origin/{base_branch}");
        let base_ref = if self.git.ref_exists(merge_path, &origin_ref).await? {
            format!("origin/{base_branch}")
        } else {
            base_branch.to_string()
        };
        self.git
            .run_git(&["checkout", merge_branch], merge_path, true)
            .await?;
        self.git
            .run_git(&["reset", "--hard", &base_ref], merge_path, true)
            .await?;
        Ok(())
    }

    /// Stage the task branch's conflicts in the merge worktree for manual
    /// resolution. Returns `(true, ...)` when conflicts are staged (or a
    /// resolution is already underway), `(false, ...)` otherwise.
    pub async fn prepare_merge_conflicts(
        &self,
        task_id: &str,
        base_branch: &str,
    ) -> Result<(bool, String), WorkspaceError> {
        let Some(workspace) = self.latest_for_task(task_id).await? else {
            return Ok((false, format!("Workspace not found for task {task_id}")));
        };
        let Some((primary, _)) = self.workspaces.primary_repo_row(&workspace.id).await? else {
            return Ok((false, format!("Workspace {} has no repos", workspace.id)));
        };
        let merge_path = self.ensure_merge_worktree(&workspace, base_branch).await?;
        if self.merge_resolution_pending(&merge_path).await? {
            return Ok((true, "Merge already in progress".to_string()));
        }

        let merge_branch = Self::merge_branch_name(&primary.repo_id);
        self.reset_merge_worktree(&merge_path, &merge_branch, base_branch)
            .await?;
        self.git
            .run_git(
                &["merge", "--squash", &workspace.branch_name],
                &merge_path,
                false,
            )
            .await?;
        if self.git.has_conflict_markers(&merge_path).await? {
            return Ok((true, "Merge conflicts prepared".to_string()));
        }
        self.git
            .run_git(&["merge", "--abort"], &merge_path, false)
            .await?;
        // Squash staging without conflicts leaves staged content behind.
        self.git
            .run_git(&["reset", "--hard", "HEAD"], &merge_path, false)
            .await?;
        Ok((false, "No conflicts detected".to_string()))
    }

    /// Dry-run the merge in the merge worktree and report whether it would
    /// conflict.
    pub async fn preflight_merge(
        &self,
        task_id: &str,
        base_branch: &str,
    ) -> Result<(bool, String), WorkspaceError> {
        let Some(workspace) = self.latest_for_task(task_id).await? else {
            return Ok((false, format!("Workspace not found for task {task_id}")));
        };
        let Some((primary, _)) = self.workspaces.primary_repo_row(&workspace.id).await? else {
            return Ok((false, format!("Workspace {} has no repos", workspace.id)));
        };
        let merge_path = self.ensure_merge_worktree(&workspace, base_branch).await?;
        if self.merge_resolution_pending(&merge_path).await? {
            return Ok((
                false,
                "Merge worktree has unresolved conflicts. Resolve before merging.".to_string(),
            ));
        }

        let merge_branch = Self::merge_branch_name(&primary.repo_id);
        self.reset_merge_worktree(&merge_path, &merge_branch, base_branch)
            .await?;
        self.git
            .run_git(
                &["merge", "--no-commit", "--no-ff", &workspace.branch_name],
                &merge_path,
                false,
            )
            .await?;
        let conflicted = self.git.has_conflict_markers(&merge_path).await?;
        self.git
            .run_git(&["merge", "--abort"], &merge_path, false)
            .await?;
        self.git
            .run_git(&["reset", "--hard", "HEAD"], &merge_path, false)
            .await?;
        if conflicted {
            Ok((
                false,
                "Merge conflict predicted. Please resolve before merging.".to_string(),
            ))
        } else {
            Ok((true, "Preflight clean".to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Merge to base
    // ------------------------------------------------------------------

    /// Merge the task branch into `base_branch` via the merge worktree.
    ///
    /// With `squash` the commits collapse into one semantic commit derived
    /// from `title`; otherwise a merge commit is created. When a conflicted
    /// resolution is already staged in the merge worktree, the merge
    /// resumes from it. The whole operation holds the merge lock so
    /// fast-forward steps never race.
    pub async fn merge_to_main(
        &self,
        task_id: &str,
        title: &str,
        base_branch: &str,
        squash: bool,
        allow_conflicts: bool,
    ) -> Result<(bool, String), WorkspaceError> {
        let _guard = self.merge_lock.lock().await;

        let Some(workspace) = self.latest_for_task(task_id).await? else {
            return Ok((false, format!("Workspace not found for task {task_id}")));
        };
        let Some((primary, _primary_repo)) =
            self.workspaces.primary_repo_row(&workspace.id).await?
        else {
            return Ok((false, format!("Workspace {} has no repos", workspace.id)));
        };
        let branch_name = workspace.branch_name.clone();
        let merge_branch = Self::merge_branch_name(&primary.repo_id);
        let merge_path = self.ensure_merge_worktree(&workspace, base_branch).await?;
        let worktree = self.agent_working_dir(&workspace.id).await?;
        let repo_root = self.git.resolve_repo_root(&worktree);

        if self.merge_resolution_pending(&merge_path).await? {
            if !allow_conflicts {
                return Ok((
                    false,
                    "Merge worktree has unresolved conflicts. Resolve before merging.".to_string(),
                ));
            }
            if self.git.has_conflict_markers(&merge_path).await? {
                return Ok((
                    false,
                    "Merge conflicts still unresolved. Finish resolution first.".to_string(),
                ));
            }
            let commits = self.git.commit_log(&worktree, base_branch).await?;
            if !commits.is_empty() {
                let (staged, _) = self
                    .git
                    .run_git(&["diff", "--cached", "--name-only"], &merge_path, false)
                    .await?;
                if !staged.trim().is_empty() {
                    let message = generate_semantic_commit(title, &commits);
                    self.git
                        .run_git(&["commit", "-m", &message], &merge_path, true)
                        .await?;
                }
            }
            return self
                .fast_forward_base(&repo_root, base_branch, &merge_branch)
                .await;
        }

        self.reset_merge_worktree(&merge_path, &merge_branch, base_branch)
            .await?;

        let commits = self.git.commit_log(&worktree, base_branch).await?;
        if commits.is_empty() {
            return Ok((false, format!("No commits to merge for task {task_id}")));
        }

        if squash {
            self.git
                .run_git(&["merge", "--squash", &branch_name], &merge_path, false)
                .await?;
            if self.git.has_conflict_markers(&merge_path).await? {
                if !allow_conflicts {
                    self.git
                        .run_git(&["merge", "--abort"], &merge_path, false)
                        .await?;
                    self.git
                        .run_git(&["reset", "--hard", "HEAD"], &merge_path, false)
                        .await?;
                }
                return Ok((
                    false,
                    "Merge conflict detected. Resolve in merge worktree.".to_string(),
                ));
            }
            let message = generate_semantic_commit(title, &commits);
            self.git
                .run_git(&["commit", "-m", &message], &merge_path, true)
                .await?;
        } else {
            let merge_message = format!("Merge branch '{branch_name}'");
            let (stdout, stderr) = self
                .git
                .run_git(
                    &["merge", &branch_name, "-m", &merge_message],
                    &merge_path,
                    false,
                )
                .await?;
            if stdout.contains("CONFLICT") || stderr.contains("CONFLICT") {
                if !allow_conflicts {
                    self.git
                        .run_git(&["merge", "--abort"], &merge_path, false)
                        .await?;
                }
                return Ok((
                    false,
                    "Merge conflict detected. Resolve in merge worktree.".to_string(),
                ));
            }
        }

        self.fast_forward_base(&repo_root, base_branch, &merge_branch)
            .await
    }

    /// Advance the base branch in the source repo to the merge worktree
    /// head. The source checkout must be clean and on the base branch.
    async fn fast_forward_base(
        &self,
        repo_root: &Path,
        base_branch: &str,
        merge_branch: &str,
    ) -> Result<(bool, String), WorkspaceError> {
        if self.git.has_uncommitted_changes(repo_root).await? {
            return Ok((
                false,
                "Cannot update base branch: repository has uncommitted changes. \
                 Please commit or stash your changes first."
                    .to_string(),
            ));
        }
        let head = self
            .git
            .current_branch(repo_root)
            .await?
            .unwrap_or_default();
        if head != base_branch {
            return Ok((
                false,
                format!(
                    "Cannot update base branch: checked out on '{head}'. \
                     Switch to '{base_branch}' and retry."
                ),
            ));
        }

        match self
            .git
            .run_git(&["merge", "--no-ff", merge_branch], repo_root, true)
            .await
        {
            Ok(_) => Ok((
                true,
                format!("Fast-forwarded {base_branch} to merge worktree"),
            )),
            Err(e) => {
                warn!("Fast-forward failed: {e}");
                Ok((false, format!("Fast-forward failed: {e}")))
            }
        }
    }
}
