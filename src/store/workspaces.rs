// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Workspace rows, workspace-repo junctions, and merge attempt records.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::error::StoreError;
use crate::store::models::{full_id, MergeRecord, Repo, Workspace, WorkspaceRepo, WorkspaceStatus};
use crate::store::{json_from_sql, ts_from_sql, ts_to_sql, Store};

#[derive(Clone)]
pub struct WorkspaceRepository {
    store: Store,
}

impl WorkspaceRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Insert a workspace and its repo rows in one transaction.
    pub async fn insert(
        &self,
        workspace: &Workspace,
        repos: &[WorkspaceRepo],
    ) -> Result<(), StoreError> {
        let workspace = workspace.clone();
        let repos = repos.to_vec();
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO workspaces
                        (id, project_id, task_id, path, branch_name, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        workspace.id,
                        workspace.project_id,
                        workspace.task_id,
                        workspace.path,
                        workspace.branch_name,
                        workspace.status.as_str(),
                        ts_to_sql(workspace.created_at),
                        ts_to_sql(workspace.updated_at),
                    ],
                )?;
                for repo in &repos {
                    tx.execute(
                        "INSERT INTO workspace_repos
                            (workspace_id, repo_id, target_branch, worktree_path, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            repo.workspace_id,
                            repo.repo_id,
                            repo.target_branch,
                            repo.worktree_path,
                            ts_to_sql(repo.created_at),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, workspace_id: &str) -> Result<Option<Workspace>, StoreError> {
        let id = workspace_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1"),
                    params![id],
                    row_to_workspace,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    /// Workspaces, newest first, optionally filtered by task or repo.
    pub async fn list(
        &self,
        task_id: Option<&str>,
        repo_id: Option<&str>,
    ) -> Result<Vec<Workspace>, StoreError> {
        let task_id = task_id.map(str::to_string);
        let repo_id = repo_id.map(str::to_string);
        self.store
            .with_conn(move |conn| {
                let mut sql = format!(
                    "SELECT DISTINCT {WORKSPACE_COLUMNS_QUALIFIED} FROM workspaces w"
                );
                if repo_id.is_some() {
                    sql.push_str(" JOIN workspace_repos wr ON wr.workspace_id = w.id");
                }
                let mut clauses = Vec::new();
                if task_id.is_some() {
                    clauses.push("w.task_id = :task_id");
                }
                if repo_id.is_some() {
                    clauses.push("wr.repo_id = :repo_id");
                }
                if !clauses.is_empty() {
                    sql.push_str(" WHERE ");
                    sql.push_str(&clauses.join(" AND "));
                }
                sql.push_str(" ORDER BY w.created_at DESC");

                let mut stmt = conn.prepare(&sql)?;
                let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
                if let Some(ref t) = task_id {
                    named.push((":task_id", t));
                }
                if let Some(ref r) = repo_id {
                    named.push((":repo_id", r));
                }
                let rows = stmt.query_map(named.as_slice(), row_to_workspace)?;
                let mut workspaces = Vec::new();
                for row in rows {
                    workspaces.push(row?);
                }
                Ok(workspaces)
            })
            .await
    }

    /// Most recently created workspace for a task.
    pub async fn latest_for_task(&self, task_id: &str) -> Result<Option<Workspace>, StoreError> {
        Ok(self.list(Some(task_id), None).await?.into_iter().next())
    }

    /// Count of ACTIVE workspaces for a task.
    pub async fn active_count_for_task(&self, task_id: &str) -> Result<i64, StoreError> {
        let id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM workspaces WHERE task_id = ?1 AND status = 'ACTIVE'",
                    params![id],
                    |row| row.get(0),
                )
                .map_err(Into::into)
            })
            .await
    }

    pub async fn set_status(
        &self,
        workspace_id: &str,
        status: WorkspaceStatus,
    ) -> Result<(), StoreError> {
        let id = workspace_id.to_string();
        self.store
            .with_conn(move |conn| {
                let updated = conn.execute(
                    "UPDATE workspaces SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, status.as_str(), ts_to_sql(Utc::now())],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound(format!("workspace {id}")));
                }
                Ok(())
            })
            .await
    }

    /// Workspace repo rows joined with their repos, in insertion order.
    pub async fn repo_rows(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<(WorkspaceRepo, Repo)>, StoreError> {
        let id = workspace_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT wr.workspace_id, wr.repo_id, wr.target_branch, wr.worktree_path,
                            wr.created_at,
                            r.id, r.path, r.name, r.display_name, r.default_branch, r.scripts
                     FROM workspace_repos wr
                     JOIN repos r ON r.id = wr.repo_id
                     WHERE wr.workspace_id = ?1
                     ORDER BY wr.created_at ASC, wr.repo_id ASC",
                )?;
                let rows = stmt.query_map(params![id], |row| {
                    let created_at: String = row.get(4)?;
                    let scripts: String = row.get(10)?;
                    Ok((
                        WorkspaceRepo {
                            workspace_id: row.get(0)?,
                            repo_id: row.get(1)?,
                            target_branch: row.get(2)?,
                            worktree_path: row.get(3)?,
                            created_at: ts_from_sql(&created_at),
                        },
                        Repo {
                            id: row.get(5)?,
                            path: row.get(6)?,
                            name: row.get(7)?,
                            display_name: row.get(8)?,
                            default_branch: row.get(9)?,
                            scripts: json_from_sql(&scripts),
                        },
                    ))
                })?;
                let mut pairs = Vec::new();
                for row in rows {
                    pairs.push(row?);
                }
                Ok(pairs)
            })
            .await
    }

    /// Primary workspace repo: the project's `is_primary` repo, then lowest
    /// `display_order`, then insertion order.
    pub async fn primary_repo_row(
        &self,
        workspace_id: &str,
    ) -> Result<Option<(WorkspaceRepo, Repo)>, StoreError> {
        let id = workspace_id.to_string();
        let ranked: Option<String> = self
            .store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT wr.repo_id
                     FROM workspace_repos wr
                     JOIN workspaces w ON w.id = wr.workspace_id
                     LEFT JOIN project_repos pr
                        ON pr.repo_id = wr.repo_id AND pr.project_id = w.project_id
                     WHERE wr.workspace_id = ?1
                     ORDER BY COALESCE(pr.is_primary, 0) DESC,
                              COALESCE(pr.display_order, 999999) ASC,
                              wr.created_at ASC, wr.repo_id ASC
                     LIMIT 1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(Into::into)
            })
            .await?;
        let Some(repo_id) = ranked else {
            return Ok(None);
        };
        Ok(self
            .repo_rows(workspace_id)
            .await?
            .into_iter()
            .find(|(wr, _)| wr.repo_id == repo_id))
    }

    /// Record a merge attempt outcome.
    pub async fn record_merge(
        &self,
        workspace_id: &str,
        strategy: &str,
        success: bool,
        message: &str,
        commit_sha: Option<&str>,
        conflict_op: Option<&str>,
        conflict_files: &[String],
    ) -> Result<MergeRecord, StoreError> {
        let record = MergeRecord {
            id: full_id(),
            workspace_id: workspace_id.to_string(),
            strategy: strategy.to_string(),
            success,
            message: message.to_string(),
            commit_sha: commit_sha.map(str::to_string),
            pr_url: None,
            conflict_op: conflict_op.map(str::to_string),
            conflict_files: conflict_files.to_vec(),
            created_at: Utc::now(),
        };
        let row = record.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO merges
                        (id, workspace_id, strategy, success, message, commit_sha, pr_url,
                         conflict_op, conflict_files, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        row.id,
                        row.workspace_id,
                        row.strategy,
                        row.success,
                        row.message,
                        row.commit_sha,
                        row.pr_url,
                        row.conflict_op,
                        serde_json::to_string(&row.conflict_files)?,
                        ts_to_sql(row.created_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(record)
    }
}

const WORKSPACE_COLUMNS: &str =
    "id, project_id, task_id, path, branch_name, status, created_at, updated_at";

const WORKSPACE_COLUMNS_QUALIFIED: &str =
    "w.id, w.project_id, w.task_id, w.path, w.branch_name, w.status, w.created_at, w.updated_at";

fn row_to_workspace(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    let status: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(Workspace {
        id: row.get(0)?,
        project_id: row.get(1)?,
        task_id: row.get(2)?,
        path: row.get(3)?,
        branch_name: row.get(4)?,
        status: WorkspaceStatus::parse(&status).unwrap_or(WorkspaceStatus::Archived),
        created_at: ts_from_sql(&created_at),
        updated_at: ts_from_sql(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::short_id;

    async fn fixtures() -> WorkspaceRepository {
        let store = Store::open_in_memory().await.unwrap();
        store
            .with_conn(|conn| {
                let now = ts_to_sql(Utc::now());
                conn.execute(
                    "INSERT INTO projects (id, name, description, created_at)
                     VALUES ('p1', 'Test', '', ?1)",
                    params![now],
                )?;
                for (id, path) in [("r1", "/repos/alpha"), ("r2", "/repos/beta")] {
                    conn.execute(
                        "INSERT INTO repos (id, path, name, display_name, default_branch)
                         VALUES (?1, ?2, ?3, ?3, 'main')",
                        params![id, path, path.rsplit('/').next().unwrap()],
                    )?;
                }
                // beta is the primary despite a higher insert order.
                conn.execute(
                    "INSERT INTO project_repos (project_id, repo_id, is_primary, display_order)
                     VALUES ('p1', 'r1', 0, 0), ('p1', 'r2', 1, 1)",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        WorkspaceRepository::new(store)
    }

    fn workspace(task_id: &str) -> Workspace {
        let now = Utc::now();
        let id = short_id();
        Workspace {
            path: format!("/tmp/worktrees/{id}"),
            branch_name: format!("kagan/{id}"),
            id,
            project_id: "p1".to_string(),
            task_id: task_id.to_string(),
            status: WorkspaceStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    fn repo_row(ws: &Workspace, repo_id: &str) -> WorkspaceRepo {
        WorkspaceRepo {
            workspace_id: ws.id.clone(),
            repo_id: repo_id.to_string(),
            target_branch: "main".to_string(),
            worktree_path: format!("{}/{repo_id}", ws.path),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_list_for_task() {
        let repo = fixtures().await;
        let ws = workspace("t1");
        repo.insert(&ws, &[repo_row(&ws, "r1"), repo_row(&ws, "r2")])
            .await
            .unwrap();

        let listed = repo.list(Some("t1"), None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, ws.id);

        let by_repo = repo.list(None, Some("r1")).await.unwrap();
        assert_eq!(by_repo.len(), 1);
        assert!(repo.list(Some("other"), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_primary_repo_selection_honours_is_primary() {
        let repo = fixtures().await;
        let ws = workspace("t1");
        repo.insert(&ws, &[repo_row(&ws, "r1"), repo_row(&ws, "r2")])
            .await
            .unwrap();

        let (primary, primary_repo) = repo.primary_repo_row(&ws.id).await.unwrap().unwrap();
        assert_eq!(primary.repo_id, "r2");
        assert_eq!(primary_repo.name, "beta");
    }

    #[tokio::test]
    async fn test_primary_falls_back_to_insertion_order() {
        let repo = fixtures().await;
        // r3 has no project_repos row at all.
        repo.store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO repos (id, path, name, display_name, default_branch)
                     VALUES ('r3', '/repos/gamma', 'gamma', 'gamma', 'main')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let ws = workspace("t2");
        repo.insert(&ws, &[repo_row(&ws, "r3")]).await.unwrap();
        let (primary, _) = repo.primary_repo_row(&ws.id).await.unwrap().unwrap();
        assert_eq!(primary.repo_id, "r3");
    }

    #[tokio::test]
    async fn test_active_count_and_archive() {
        let repo = fixtures().await;
        let ws = workspace("t1");
        repo.insert(&ws, &[repo_row(&ws, "r1")]).await.unwrap();

        assert_eq!(repo.active_count_for_task("t1").await.unwrap(), 1);
        repo.set_status(&ws.id, WorkspaceStatus::Archived).await.unwrap();
        assert_eq!(repo.active_count_for_task("t1").await.unwrap(), 0);

        assert!(repo
            .set_status("missing", WorkspaceStatus::Archived)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_record_merge() {
        let repo = fixtures().await;
        let ws = workspace("t1");
        repo.insert(&ws, &[repo_row(&ws, "r1")]).await.unwrap();

        let record = repo
            .record_merge(
                &ws.id,
                "squash",
                false,
                "Merge conflict detected",
                None,
                Some("merge"),
                &["alpha:src/a.rs".to_string()],
            )
            .await
            .unwrap();
        assert!(!record.success);
        assert_eq!(record.conflict_files.len(), 1);
    }
}
