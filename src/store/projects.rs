// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Projects, repos, and their junction rows.
//!
//! Projects are only ever created by explicit user action; nothing in the
//! core auto-creates one.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::error::StoreError;
use crate::store::models::{full_id, Project, ProjectRepo, Repo};
use crate::store::{json_from_sql, opt_ts_from_sql, ts_from_sql, ts_to_sql, Store};

#[derive(Clone)]
pub struct ProjectRepository {
    store: Store,
}

impl ProjectRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create_project(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Project, StoreError> {
        let project = Project {
            id: full_id(),
            name: name.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            last_opened_at: None,
        };
        let row = project.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO projects (id, name, description, created_at, last_opened_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        row.id,
                        row.name,
                        row.description,
                        ts_to_sql(row.created_at),
                        Option::<String>::None,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(project)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        let id = project_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, name, description, created_at, last_opened_at
                     FROM projects WHERE id = ?1",
                    params![id],
                    row_to_project,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        self.store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, created_at, last_opened_at
                     FROM projects ORDER BY created_at ASC",
                )?;
                let rows = stmt.query_map([], row_to_project)?;
                let mut projects = Vec::new();
                for row in rows {
                    projects.push(row?);
                }
                Ok(projects)
            })
            .await
    }

    pub async fn touch_project(&self, project_id: &str) -> Result<(), StoreError> {
        let id = project_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE projects SET last_opened_at = ?2 WHERE id = ?1",
                    params![id, ts_to_sql(Utc::now())],
                )?;
                Ok(())
            })
            .await
    }

    /// Register a repo, resolving its path. Re-registering an existing path
    /// returns the existing row.
    pub async fn get_or_create_repo(
        &self,
        path: &Path,
        default_branch: &str,
    ) -> Result<(Repo, bool), StoreError> {
        let resolved = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .to_string();
        let name = Path::new(&resolved)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| resolved.clone());

        if let Some(existing) = self.get_repo_by_path(&resolved).await? {
            return Ok((existing, false));
        }

        let repo = Repo {
            id: full_id(),
            path: resolved,
            display_name: name.clone(),
            name,
            default_branch: default_branch.to_string(),
            scripts: serde_json::json!({}),
        };
        let row = repo.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO repos (id, path, name, display_name, default_branch, scripts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.id,
                        row.path,
                        row.name,
                        row.display_name,
                        row.default_branch,
                        serde_json::to_string(&row.scripts)?,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok((repo, true))
    }

    pub async fn get_repo(&self, repo_id: &str) -> Result<Option<Repo>, StoreError> {
        let id = repo_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, path, name, display_name, default_branch, scripts
                     FROM repos WHERE id = ?1",
                    params![id],
                    row_to_repo,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn get_repo_by_path(&self, path: &str) -> Result<Option<Repo>, StoreError> {
        let path = path.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, path, name, display_name, default_branch, scripts
                     FROM repos WHERE path = ?1",
                    params![path],
                    row_to_repo,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    /// All repos on disk (used by the janitor).
    pub async fn list_repos(&self) -> Result<Vec<Repo>, StoreError> {
        self.store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, path, name, display_name, default_branch, scripts
                     FROM repos ORDER BY name ASC",
                )?;
                let rows = stmt.query_map([], row_to_repo)?;
                let mut repos = Vec::new();
                for row in rows {
                    repos.push(row?);
                }
                Ok(repos)
            })
            .await
    }

    pub async fn attach_repo(
        &self,
        project_id: &str,
        repo_id: &str,
        is_primary: bool,
        display_order: i64,
    ) -> Result<ProjectRepo, StoreError> {
        let link = ProjectRepo {
            project_id: project_id.to_string(),
            repo_id: repo_id.to_string(),
            is_primary,
            display_order,
        };
        let row = link.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO project_repos (project_id, repo_id, is_primary, display_order)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![row.project_id, row.repo_id, row.is_primary, row.display_order],
                )?;
                Ok(())
            })
            .await?;
        Ok(link)
    }

    /// Repos of a project ordered by display order.
    pub async fn project_repos(&self, project_id: &str) -> Result<Vec<Repo>, StoreError> {
        let id = project_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT r.id, r.path, r.name, r.display_name, r.default_branch, r.scripts
                     FROM project_repos pr
                     JOIN repos r ON r.id = pr.repo_id
                     WHERE pr.project_id = ?1
                     ORDER BY pr.display_order ASC",
                )?;
                let rows = stmt.query_map(params![id], row_to_repo)?;
                let mut repos = Vec::new();
                for row in rows {
                    repos.push(row?);
                }
                Ok(repos)
            })
            .await
    }
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    let created_at: String = row.get(3)?;
    let last_opened_at: Option<String> = row.get(4)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        created_at: ts_from_sql(&created_at),
        last_opened_at: opt_ts_from_sql(last_opened_at),
    })
}

fn row_to_repo(row: &Row<'_>) -> rusqlite::Result<Repo> {
    let scripts: String = row.get(5)?;
    Ok(Repo {
        id: row.get(0)?,
        path: row.get(1)?,
        name: row.get(2)?,
        display_name: row.get(3)?,
        default_branch: row.get(4)?,
        scripts: json_from_sql(&scripts),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> ProjectRepository {
        ProjectRepository::new(Store::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_project_round_trip() {
        let projects = repo().await;
        let project = projects.create_project("Web", "frontend work").await.unwrap();
        let fetched = projects.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "Web");
        assert!(fetched.last_opened_at.is_none());

        projects.touch_project(&project.id).await.unwrap();
        let touched = projects.get_project(&project.id).await.unwrap().unwrap();
        assert!(touched.last_opened_at.is_some());
    }

    #[tokio::test]
    async fn test_repo_get_or_create_dedupes_by_path() {
        let projects = repo().await;
        let dir = tempfile::tempdir().unwrap();

        let (first, created) = projects.get_or_create_repo(dir.path(), "main").await.unwrap();
        assert!(created);
        let (second, created) = projects.get_or_create_repo(dir.path(), "main").await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_project_repos_ordered() {
        let projects = repo().await;
        let project = projects.create_project("Multi", "").await.unwrap();
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let (repo_a, _) = projects.get_or_create_repo(a.path(), "main").await.unwrap();
        let (repo_b, _) = projects.get_or_create_repo(b.path(), "main").await.unwrap();

        projects.attach_repo(&project.id, &repo_b.id, false, 1).await.unwrap();
        projects.attach_repo(&project.id, &repo_a.id, true, 0).await.unwrap();

        let ordered = projects.project_repos(&project.id).await.unwrap();
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].id, repo_a.id);
    }
}
