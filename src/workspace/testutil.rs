// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixture for workspace service tests: an in-memory store plus a
//! real git repo registered as the project's primary repo.

use std::path::PathBuf;

use tempfile::TempDir;

use crate::events::EventBus;
use crate::git::GitAdapter;
use crate::store::models::Task;
use crate::store::{ProjectRepository, Store, TaskRepository, WorkspaceRepository};

use super::WorkspaceService;

pub(crate) struct Fixture {
    pub service: WorkspaceService,
    pub git: GitAdapter,
    pub tasks: TaskRepository,
    pub project_id: String,
    repo_dir: TempDir,
    _data_dir: TempDir,
}

impl Fixture {
    pub async fn new() -> Self {
        let repo_dir = TempDir::new().unwrap();
        let data_dir = TempDir::new().unwrap();
        let git = GitAdapter::new();

        git.run_git(&["init", "-b", "main"], repo_dir.path(), true)
            .await
            .unwrap();
        git.run_git(&["config", "user.name", "Test"], repo_dir.path(), true)
            .await
            .unwrap();
        git.run_git(
            &["config", "user.email", "test@localhost"],
            repo_dir.path(),
            true,
        )
        .await
        .unwrap();
        std::fs::write(repo_dir.path().join("README.md"), "# fixture\n").unwrap();
        git.commit_all(repo_dir.path(), "initial commit").await.unwrap();

        let store = Store::open_in_memory().await.unwrap();
        let tasks = TaskRepository::new(store.clone());
        let projects = ProjectRepository::new(store.clone());
        let workspaces = WorkspaceRepository::new(store.clone());

        let project = projects.create_project("Fixture", "").await.unwrap();
        let (repo, _) = projects
            .get_or_create_repo(repo_dir.path(), "main")
            .await
            .unwrap();
        projects
            .attach_repo(&project.id, &repo.id, true, 0)
            .await
            .unwrap();

        let service = WorkspaceService::new(
            workspaces,
            tasks.clone(),
            projects,
            git.clone(),
            EventBus::new(),
            data_dir.path().to_path_buf(),
        );

        Self {
            service,
            git,
            tasks,
            project_id: project.id,
            repo_dir,
            _data_dir: data_dir,
        }
    }

    pub async fn create_task(&self, title: &str) -> Task {
        let task = Task::new(&self.project_id, title);
        self.tasks.create(&task).await.unwrap();
        task
    }

    pub fn repo_path(&self) -> PathBuf {
        self.repo_dir.path().to_path_buf()
    }

    pub fn repo_name(&self) -> String {
        self.repo_dir
            .path()
            .canonicalize()
            .unwrap_or_else(|_| self.repo_dir.path().to_path_buf())
            .file_name()
            .unwrap()
            .to_string_lossy()
            .to_string()
    }
}
