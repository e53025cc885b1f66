// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git adapter: every operation shells out to the local `git` binary via
//! async subprocesses.
//!
//! The adapter is stateless; callers pass the working directory explicitly.
//! `run_git` with `check = true` converts a non-zero exit into a
//! [`GitError`]; porcelain-parsing helpers always run unchecked and
//! interpret the output instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::debug;

use crate::error::GitError;

/// Porcelain status prefixes that indicate merge/rebase conflicts.
pub const CONFLICT_MARKERS: [&str; 7] = ["UU ", "AA ", "DD ", "AU ", "UA ", "DU ", "UD "];

/// Stateless async git runner.
#[derive(Clone, Default)]
pub struct GitAdapter;

impl GitAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Run `git <args>` in `cwd`, returning trimmed (stdout, stderr).
    pub async fn run_git(
        &self,
        args: &[&str],
        cwd: &Path,
        check: bool,
    ) -> Result<(String, String), GitError> {
        debug!("git {:?} in {:?}", args, cwd);
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if check && !output.status.success() {
            let command = args.first().copied().unwrap_or("git");
            let message = if stderr.is_empty() {
                format!("exit code {:?}", output.status.code())
            } else {
                stderr.clone()
            };
            return Err(GitError::from_output(command, &message));
        }
        Ok((stdout, stderr))
    }

    // ------------------------------------------------------------------
    // Worktrees
    // ------------------------------------------------------------------

    /// Create a worktree on a fresh branch forked from `base_branch`. A
    /// leftover branch of the same name (from a failed earlier attempt) is
    /// deleted first.
    pub async fn create_worktree(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch_name: &str,
        base_branch: &str,
    ) -> Result<(), GitError> {
        let (existing, _) = self
            .run_git(&["branch", "--list", branch_name], repo_path, false)
            .await?;
        if !existing.trim().is_empty() {
            self.run_git(&["branch", "-D", branch_name], repo_path, false)
                .await?;
        }

        let worktree = worktree_path.to_string_lossy().to_string();
        self.run_git(
            &["worktree", "add", "-b", branch_name, &worktree, base_branch],
            repo_path,
            true,
        )
        .await?;
        Ok(())
    }

    /// Create or reset a stable worktree at `path` on `branch` (used for the
    /// conflict-staging worktree).
    pub async fn create_worktree_forced(
        &self,
        repo_path: &Path,
        worktree_path: &Path,
        branch_name: &str,
        base_branch: &str,
    ) -> Result<(), GitError> {
        let worktree = worktree_path.to_string_lossy().to_string();
        self.run_git(
            &["worktree", "add", "-B", branch_name, &worktree, base_branch],
            repo_path,
            true,
        )
        .await?;
        Ok(())
    }

    /// Remove a worktree, falling back to rm + prune when git refuses.
    pub async fn delete_worktree(&self, worktree_path: &Path) -> Result<(), GitError> {
        if !worktree_path.exists() {
            return Ok(());
        }
        let repo_root = self.resolve_repo_root(worktree_path);
        let path = worktree_path.to_string_lossy().to_string();
        self.run_git(&["worktree", "remove", "--force", &path], &repo_root, false)
            .await?;
        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)
                .map_err(|e| GitError::Io(e.to_string()))?;
            self.run_git(&["worktree", "prune"], &repo_root, false).await?;
        }
        Ok(())
    }

    /// `git worktree prune -v`; returns the number of pruned entries.
    pub async fn prune_worktrees(&self, repo_path: &Path) -> Result<usize, GitError> {
        let (stdout, stderr) = self
            .run_git(&["worktree", "prune", "-v"], repo_path, false)
            .await?;
        let combined = format!("{stdout}\n{stderr}");
        Ok(combined.lines().filter(|l| !l.trim().is_empty()).count())
    }

    /// Worktree checking out `branch`, if any.
    pub async fn worktree_for_branch(
        &self,
        repo_path: &Path,
        branch: &str,
    ) -> Result<Option<PathBuf>, GitError> {
        let (stdout, _) = self
            .run_git(&["worktree", "list", "--porcelain"], repo_path, false)
            .await?;
        let mut current_path: Option<PathBuf> = None;
        for line in stdout.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(path));
            } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
                if b == branch {
                    return Ok(current_path);
                }
            }
        }
        Ok(None)
    }

    /// Resolve a worktree's parent repository root from its `.git` link file.
    pub fn resolve_repo_root(&self, worktree_path: &Path) -> PathBuf {
        let git_file = worktree_path.join(".git");
        let Ok(content) = std::fs::read_to_string(&git_file) else {
            return worktree_path.to_path_buf();
        };
        let content = content.trim();
        let Some(git_dir) = content.strip_prefix("gitdir:") else {
            return worktree_path.to_path_buf();
        };
        // gitdir points at <repo>/.git/worktrees/<name>.
        let git_dir = PathBuf::from(git_dir.trim());
        git_dir
            .parent()
            .and_then(Path::parent)
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| worktree_path.to_path_buf())
    }

    // ------------------------------------------------------------------
    // Branches
    // ------------------------------------------------------------------

    pub async fn current_branch(&self, cwd: &Path) -> Result<Option<String>, GitError> {
        let (stdout, _) = self
            .run_git(&["rev-parse", "--abbrev-ref", "HEAD"], cwd, false)
            .await?;
        Ok((!stdout.is_empty()).then_some(stdout))
    }

    /// Local `kagan/*` branches of a repo.
    pub async fn list_kagan_branches(&self, repo_path: &Path) -> Result<Vec<String>, GitError> {
        let (stdout, _) = self
            .run_git(
                &["branch", "--list", "kagan/*", "--format=%(refname:short)"],
                repo_path,
                false,
            )
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Delete a branch; returns whether git accepted the deletion.
    pub async fn delete_branch(
        &self,
        repo_path: &Path,
        branch: &str,
        force: bool,
    ) -> Result<bool, GitError> {
        let flag = if force { "-D" } else { "-d" };
        let (_, stderr) = self
            .run_git(&["branch", flag, branch], repo_path, false)
            .await?;
        Ok(!stderr.contains("error:"))
    }

    pub async fn ref_exists(&self, cwd: &Path, reference: &str) -> Result<bool, GitError> {
        let (stdout, _) = self
            .run_git(
                &["rev-parse", "--verify", "--quiet", reference],
                cwd,
                false,
            )
            .await?;
        Ok(!stdout.is_empty())
    }

    pub async fn head_commit(&self, cwd: &Path) -> Result<Option<String>, GitError> {
        let (stdout, _) = self.run_git(&["rev-parse", "HEAD"], cwd, false).await?;
        Ok((!stdout.is_empty()).then_some(stdout))
    }

    pub async fn has_remote(&self, cwd: &Path) -> Result<bool, GitError> {
        let (stdout, _) = self.run_git(&["remote"], cwd, false).await?;
        Ok(stdout.lines().any(|r| r.trim() == "origin"))
    }

    // ------------------------------------------------------------------
    // Working tree state
    // ------------------------------------------------------------------

    pub async fn has_uncommitted_changes(&self, cwd: &Path) -> Result<bool, GitError> {
        let (stdout, _) = self.run_git(&["status", "--porcelain"], cwd, false).await?;
        Ok(!stdout.trim().is_empty())
    }

    /// Stage everything and commit with `message`.
    pub async fn commit_all(&self, cwd: &Path, message: &str) -> Result<(), GitError> {
        self.run_git(&["add", "-A"], cwd, true).await?;
        self.run_git(&["commit", "-m", message], cwd, true).await?;
        Ok(())
    }

    pub async fn merge_in_progress(&self, cwd: &Path) -> Result<bool, GitError> {
        let (stdout, _) = self
            .run_git(&["rev-parse", "-q", "--verify", "MERGE_HEAD"], cwd, false)
            .await?;
        Ok(!stdout.is_empty())
    }

    /// A rebase is in progress when REBASE_HEAD resolves or the rebase admin
    /// directories exist.
    pub async fn rebase_in_progress(&self, cwd: &Path) -> Result<bool, GitError> {
        let (stdout, _) = self
            .run_git(&["rev-parse", "-q", "--verify", "REBASE_HEAD"], cwd, false)
            .await?;
        if !stdout.is_empty() {
            return Ok(true);
        }
        for admin_dir in ["rebase-apply", "rebase-merge"] {
            let (path_out, _) = self
                .run_git(&["rev-parse", "--git-path", admin_dir], cwd, false)
                .await?;
            let path_out = path_out.trim();
            if !path_out.is_empty() {
                let path = Path::new(path_out);
                let resolved = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    cwd.join(path)
                };
                if resolved.exists() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Unmerged files, falling back to porcelain conflict markers.
    pub async fn conflict_files(&self, cwd: &Path) -> Result<Vec<String>, GitError> {
        let (stdout, _) = self
            .run_git(&["diff", "--name-only", "--diff-filter=U"], cwd, false)
            .await?;
        let mut files: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if files.is_empty() {
            let (status, _) = self.run_git(&["status", "--porcelain"], cwd, false).await?;
            for line in status.lines() {
                if CONFLICT_MARKERS.iter().any(|m| line.starts_with(m)) {
                    files.push(line[3..].trim().to_string());
                }
            }
        }
        Ok(files)
    }

    /// Whether porcelain status currently shows conflict markers.
    pub async fn has_conflict_markers(&self, cwd: &Path) -> Result<bool, GitError> {
        let (status, _) = self.run_git(&["status", "--porcelain"], cwd, false).await?;
        Ok(status
            .lines()
            .any(|line| CONFLICT_MARKERS.iter().any(|m| line.starts_with(m))))
    }

    // ------------------------------------------------------------------
    // History and diffs
    // ------------------------------------------------------------------

    pub async fn commit_log(&self, cwd: &Path, base_branch: &str) -> Result<Vec<String>, GitError> {
        let range = format!("{base_branch}..HEAD");
        let (stdout, _) = self
            .run_git(&["log", "--oneline", &range], cwd, false)
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn diff(&self, cwd: &Path, base_branch: &str) -> Result<String, GitError> {
        let range = format!("{base_branch}..HEAD");
        let (stdout, _) = self.run_git(&["diff", &range], cwd, false).await?;
        Ok(stdout)
    }

    /// Diff statistics vs base: `{files, insertions, deletions}`.
    pub async fn diff_stats(
        &self,
        cwd: &Path,
        base_branch: &str,
    ) -> Result<HashMap<String, i64>, GitError> {
        let range = format!("{base_branch}..HEAD");
        let (stdout, _) = self
            .run_git(&["diff", "--shortstat", &range], cwd, false)
            .await?;
        Ok(parse_shortstat(&stdout))
    }

    pub async fn files_changed(
        &self,
        cwd: &Path,
        base_branch: &str,
    ) -> Result<Vec<String>, GitError> {
        let range = format!("{base_branch}..HEAD");
        let (stdout, _) = self
            .run_git(&["diff", "--name-only", &range], cwd, false)
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Files changed on `origin/<base>` since the merge base with HEAD.
    pub async fn files_changed_on_base(
        &self,
        cwd: &Path,
        base_branch: &str,
    ) -> Result<Vec<String>, GitError> {
        let origin_ref = format!("origin/{base_branch}");
        let (merge_base, _) = self
            .run_git(&["merge-base", "HEAD", &origin_ref], cwd, false)
            .await?;
        let merge_base = merge_base.trim();
        if merge_base.is_empty() {
            return Ok(Vec::new());
        }
        let (stdout, _) = self
            .run_git(
                &["diff", "--name-only", merge_base, &origin_ref],
                cwd,
                false,
            )
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Git user identity with local-developer fallbacks.
    pub async fn user_identity(&self, cwd: &Path) -> (String, String) {
        let name = self
            .run_git(&["config", "user.name"], cwd, false)
            .await
            .map(|(out, _)| out)
            .unwrap_or_default();
        let email = self
            .run_git(&["config", "user.email"], cwd, false)
            .await
            .map(|(out, _)| out)
            .unwrap_or_default();
        (
            if name.is_empty() {
                "Developer".to_string()
            } else {
                name
            },
            if email.is_empty() {
                "developer@localhost".to_string()
            } else {
                email
            },
        )
    }
}

static SHORTSTAT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:(\d+) files? changed)?(?:, )?(?:(\d+) insertions?\(\+\))?(?:, )?(?:(\d+) deletions?\(-\))?",
    )
    .expect("shortstat regex")
});

/// Parse `git diff --shortstat` output into counters.
pub fn parse_shortstat(output: &str) -> HashMap<String, i64> {
    let mut stats = HashMap::from([
        ("files".to_string(), 0),
        ("insertions".to_string(), 0),
        ("deletions".to_string(), 0),
    ]);
    let line = output.trim();
    if line.is_empty() {
        return stats;
    }
    if let Some(captures) = SHORTSTAT_RE.captures(line) {
        for (index, key) in [(1, "files"), (2, "insertions"), (3, "deletions")] {
            if let Some(m) = captures.get(index) {
                if let Ok(value) = m.as_str().parse::<i64>() {
                    stats.insert(key.to_string(), value);
                }
            }
        }
    }
    stats
}

/// Derive a conventional-commits message from a task title and its commits.
///
/// The type comes from keywords in the title; the scope is the second title
/// word when it looks like a component name; the body lists the commit
/// messages with their hashes stripped.
pub fn generate_semantic_commit(title: &str, commits: &[String]) -> String {
    let title_lower = title.to_lowercase();

    let commit_type = if ["fix", "bug", "issue"].iter().any(|k| title_lower.contains(k)) {
        "fix"
    } else if ["add", "create", "implement", "new"]
        .iter()
        .any(|k| title_lower.contains(k))
    {
        "feat"
    } else if ["refactor", "clean", "improve"]
        .iter()
        .any(|k| title_lower.contains(k))
    {
        "refactor"
    } else if ["doc", "readme"].iter().any(|k| title_lower.contains(k)) {
        "docs"
    } else if title_lower.contains("test") {
        "test"
    } else {
        "chore"
    };

    let mut scope = String::new();
    let mut words = title.split_whitespace();
    let _first = words.next();
    if let Some(second) = words.next() {
        let candidate: String = second
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if candidate.len() > 2
            && !["the", "for", "and", "with", "from", "into"].contains(&candidate.as_str())
        {
            scope = candidate;
        }
    }

    let header = if scope.is_empty() {
        format!("{commit_type}: {title}")
    } else {
        format!("{commit_type}({scope}): {title}")
    };

    if commits.is_empty() {
        return header;
    }
    let body = commits
        .iter()
        .map(|commit| {
            let message = commit.split_once(' ').map_or(commit.as_str(), |(_, m)| m);
            format!("- {message}")
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("{header}\n\n{body}")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) -> GitAdapter {
        let git = GitAdapter::new();
        git.run_git(&["init", "-b", "main"], dir, true).await.unwrap();
        git.run_git(&["config", "user.name", "Test"], dir, true)
            .await
            .unwrap();
        git.run_git(&["config", "user.email", "test@localhost"], dir, true)
            .await
            .unwrap();
        std::fs::write(dir.join("README.md"), "# test\n").unwrap();
        git.commit_all(dir, "initial commit").await.unwrap();
        git
    }

    #[tokio::test]
    async fn test_worktree_create_and_delete() {
        let repo = tempfile::tempdir().unwrap();
        let git = init_repo(repo.path()).await;

        let wt = repo.path().parent().unwrap().join(format!(
            "wt-{}",
            crate::store::models::short_id()
        ));
        git.create_worktree(repo.path(), &wt, "kagan/abc12345", "main")
            .await
            .unwrap();
        assert!(wt.join("README.md").exists());
        assert_eq!(
            git.current_branch(&wt).await.unwrap().as_deref(),
            Some("kagan/abc12345")
        );

        // Repo root resolution walks the .git link file.
        let resolved = git.resolve_repo_root(&wt);
        assert_eq!(
            resolved.canonicalize().unwrap(),
            repo.path().canonicalize().unwrap()
        );

        git.delete_worktree(&wt).await.unwrap();
        assert!(!wt.exists());
    }

    #[tokio::test]
    async fn test_create_worktree_replaces_leftover_branch() {
        let repo = tempfile::tempdir().unwrap();
        let git = init_repo(repo.path()).await;
        git.run_git(&["branch", "kagan/leftover"], repo.path(), true)
            .await
            .unwrap();

        let wt = repo.path().parent().unwrap().join(format!(
            "wt-{}",
            crate::store::models::short_id()
        ));
        git.create_worktree(repo.path(), &wt, "kagan/leftover", "main")
            .await
            .unwrap();
        git.delete_worktree(&wt).await.unwrap();
    }

    #[tokio::test]
    async fn test_uncommitted_changes_and_commit_all() {
        let repo = tempfile::tempdir().unwrap();
        let git = init_repo(repo.path()).await;

        assert!(!git.has_uncommitted_changes(repo.path()).await.unwrap());
        std::fs::write(repo.path().join("new.txt"), "hello").unwrap();
        assert!(git.has_uncommitted_changes(repo.path()).await.unwrap());

        git.commit_all(repo.path(), "chore: adding uncommitted agent changes (test)")
            .await
            .unwrap();
        assert!(!git.has_uncommitted_changes(repo.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_log_and_diff_family() {
        let repo = tempfile::tempdir().unwrap();
        let git = init_repo(repo.path()).await;
        git.run_git(&["checkout", "-b", "feature"], repo.path(), true)
            .await
            .unwrap();
        std::fs::write(repo.path().join("a.txt"), "one\ntwo\n").unwrap();
        git.commit_all(repo.path(), "add a.txt").await.unwrap();

        let commits = git.commit_log(repo.path(), "main").await.unwrap();
        assert_eq!(commits.len(), 1);
        assert!(commits[0].contains("add a.txt"));

        let files = git.files_changed(repo.path(), "main").await.unwrap();
        assert_eq!(files, vec!["a.txt"]);

        let stats = git.diff_stats(repo.path(), "main").await.unwrap();
        assert_eq!(stats["files"], 1);
        assert_eq!(stats["insertions"], 2);

        let diff = git.diff(repo.path(), "main").await.unwrap();
        assert!(diff.contains("+one"));
    }

    #[tokio::test]
    async fn test_branch_listing_and_worktree_lookup() {
        let repo = tempfile::tempdir().unwrap();
        let git = init_repo(repo.path()).await;
        git.run_git(&["branch", "kagan/aaaa1111"], repo.path(), true)
            .await
            .unwrap();
        git.run_git(&["branch", "other"], repo.path(), true)
            .await
            .unwrap();

        let branches = git.list_kagan_branches(repo.path()).await.unwrap();
        assert_eq!(branches, vec!["kagan/aaaa1111"]);

        assert!(git
            .worktree_for_branch(repo.path(), "kagan/aaaa1111")
            .await
            .unwrap()
            .is_none());
        let main_wt = git
            .worktree_for_branch(repo.path(), "main")
            .await
            .unwrap();
        assert!(main_wt.is_some());

        assert!(git
            .delete_branch(repo.path(), "kagan/aaaa1111", false)
            .await
            .unwrap());
    }

    #[test]
    fn test_parse_shortstat() {
        let stats =
            parse_shortstat(" 3 files changed, 10 insertions(+), 2 deletions(-)");
        assert_eq!(stats["files"], 3);
        assert_eq!(stats["insertions"], 10);
        assert_eq!(stats["deletions"], 2);

        let stats = parse_shortstat(" 1 file changed, 1 insertion(+)");
        assert_eq!(stats["files"], 1);
        assert_eq!(stats["insertions"], 1);
        assert_eq!(stats["deletions"], 0);

        let stats = parse_shortstat("");
        assert_eq!(stats["files"], 0);
    }

    #[test]
    fn test_semantic_commit_type_inference() {
        assert!(generate_semantic_commit("Fix database connection", &[])
            .starts_with("fix(database): Fix database connection"));
        assert!(generate_semantic_commit("Add new endpoint", &[]).starts_with("feat"));
        assert!(generate_semantic_commit("Refactor the parser", &[]).starts_with("refactor"));
        assert!(generate_semantic_commit("Update README", &[]).starts_with("docs"));
        assert!(generate_semantic_commit("Expand test coverage", &[]).starts_with("test"));
        assert!(generate_semantic_commit("Bump version", &[]).starts_with("chore"));
    }

    #[test]
    fn test_semantic_commit_skips_stopword_scope() {
        let message = generate_semantic_commit("Fix the widget", &[]);
        assert!(message.starts_with("fix: Fix the widget"));
    }

    #[test]
    fn test_semantic_commit_body_strips_hashes() {
        let commits = vec![
            "abc1234 first change".to_string(),
            "def5678 second change".to_string(),
        ];
        let message = generate_semantic_commit("Fix login flow", &commits);
        assert!(message.contains("- first change"));
        assert!(message.contains("- second change"));
        assert!(!message.contains("abc1234"));
    }

    #[tokio::test]
    async fn test_rebase_in_progress_false_on_clean_repo() {
        let repo = tempfile::tempdir().unwrap();
        let git = init_repo(repo.path()).await;
        assert!(!git.rebase_in_progress(repo.path()).await.unwrap());
        assert!(!git.merge_in_progress(repo.path()).await.unwrap());
        assert!(git.conflict_files(repo.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_identity_fallbacks() {
        let repo = tempfile::tempdir().unwrap();
        let git = init_repo(repo.path()).await;
        let (name, email) = git.user_identity(repo.path()).await;
        assert_eq!(name, "Test");
        assert_eq!(email, "test@localhost");
    }
}
