// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Engine test fixture: in-memory store, a real git repo, and a scripted
//! in-process agent standing in for the subprocess implementation.

use std::collections::VecDeque;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use crate::agent::{Agent, AgentFactory, AgentMessage};
use crate::config::{AgentConfig, KaganConfig};
use crate::error::AgentError;
use crate::events::EventBus;
use crate::git::GitAdapter;
use crate::messages::QueuedMessageService;
use crate::runtime::RuntimeView;
use crate::store::models::Task;
use crate::store::{
    ExecutionRepository, ProjectRepository, Store, TaskRepository, WorkspaceRepository,
};
use crate::workspace::WorkspaceService;

use super::AutomationEngine;

/// What a scripted mock agent should do with its next prompt.
#[derive(Debug, Clone)]
pub(crate) enum MockScript {
    /// Answer with this text, then complete the turn.
    Respond(String),
    /// Never complete the turn (simulates a long-running agent).
    Hang,
}

impl MockScript {
    pub fn respond(text: &str) -> Self {
        Self::Respond(text.to_string())
    }

    pub fn hang() -> Self {
        Self::Hang
    }
}

/// In-process agent driven by a [`MockScript`].
pub(crate) struct MockAgent {
    script: MockScript,
    messages: StdMutex<Vec<AgentMessage>>,
    response: StdMutex<String>,
    stopped: AtomicBool,
}

impl MockAgent {
    fn new(script: MockScript) -> Self {
        Self {
            script,
            messages: StdMutex::new(Vec::new()),
            response: StdMutex::new(String::new()),
            stopped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn start(&self) -> Result<(), AgentError> {
        self.messages.lock().unwrap().push(AgentMessage::Ready {
            timestamp: Utc::now(),
            agent_session_id: None,
        });
        Ok(())
    }

    async fn wait_ready(&self, _timeout: Duration) -> Result<(), AgentError> {
        Ok(())
    }

    async fn send_prompt(&self, _text: &str) -> Result<(), AgentError> {
        match &self.script {
            MockScript::Respond(text) => {
                {
                    let mut messages = self.messages.lock().unwrap();
                    messages.push(AgentMessage::Update {
                        timestamp: Utc::now(),
                        text: text.clone(),
                    });
                    messages.push(AgentMessage::TurnComplete { timestamp: Utc::now() });
                }
                *self.response.lock().unwrap() = text.clone();
                Ok(())
            }
            MockScript::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn get_messages(&self) -> Vec<AgentMessage> {
        self.messages.lock().unwrap().clone()
    }

    async fn get_response_text(&self) -> String {
        self.response.lock().unwrap().clone()
    }

    async fn clear_tool_calls(&self) {}

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn cancel(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn set_auto_approve(&self, _enabled: bool) {}

    fn set_model_override(&self, _model: &str) {}

    fn set_task_id(&self, _task_id: &str) {}
}

/// Factory handing out scripted agents in creation order, with separate
/// queues for implementation and review agents.
#[derive(Clone, Default)]
pub(crate) struct MockAgentFactory {
    impl_scripts: Arc<StdMutex<VecDeque<MockScript>>>,
    review_scripts: Arc<StdMutex<VecDeque<MockScript>>>,
}

impl MockAgentFactory {
    pub fn push_impl(&self, script: MockScript) {
        self.impl_scripts.lock().unwrap().push_back(script);
    }

    pub fn push_review(&self, script: MockScript) {
        self.review_scripts.lock().unwrap().push_back(script);
    }

    pub fn as_factory(&self) -> AgentFactory {
        let this = self.clone();
        Arc::new(move |_path: &Path, _config: &AgentConfig, read_only: bool| {
            let scripts = if read_only {
                &this.review_scripts
            } else {
                &this.impl_scripts
            };
            let script = scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| MockScript::respond(""));
            Arc::new(MockAgent::new(script)) as Arc<dyn Agent>
        })
    }
}

/// Full engine fixture around a real git repo.
pub(crate) struct EngineFixture {
    pub engine: AutomationEngine,
    pub factory: MockAgentFactory,
    pub tasks: TaskRepository,
    pub executions: ExecutionRepository,
    pub runtime: RuntimeView,
    pub queued: QueuedMessageService,
    pub project_id: String,
    _repo_dir: TempDir,
    _data_dir: TempDir,
}

impl EngineFixture {
    pub async fn new(max_concurrent_agents: usize, auto_review: bool) -> Self {
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
        std::fs::write(repo_dir.path().join("README.md"), "# engine fixture\n").unwrap();
        git.commit_all(repo_dir.path(), "initial commit").await.unwrap();

        let store = Store::open_in_memory().await.unwrap();
        let tasks = TaskRepository::new(store.clone());
        let projects = ProjectRepository::new(store.clone());
        let workspaces_repo = WorkspaceRepository::new(store.clone());
        let executions = ExecutionRepository::new(store.clone());

        let project = projects.create_project("Engine", "").await.unwrap();
        let (repo, _) = projects
            .get_or_create_repo(repo_dir.path(), "main")
            .await
            .unwrap();
        projects
            .attach_repo(&project.id, &repo.id, true, 0)
            .await
            .unwrap();

        let events = EventBus::new();
        let workspace_service = WorkspaceService::new(
            workspaces_repo,
            tasks.clone(),
            projects,
            git.clone(),
            events.clone(),
            data_dir.path().to_path_buf(),
        );

        let mut config = KaganConfig::default();
        config.general.max_concurrent_agents = max_concurrent_agents;
        config.general.auto_review = auto_review;

        let runtime = RuntimeView::new();
        let queued = QueuedMessageService::new();
        let factory = MockAgentFactory::default();

        let engine = AutomationEngine::new(
            tasks.clone(),
            executions.clone(),
            workspace_service,
            config,
            runtime.clone(),
            queued.clone(),
            events.clone(),
            git,
            factory.as_factory(),
        );
        engine.start().await;

        // Task status changes reach the engine over the event bus.
        let bus = events.clone();
        tasks.set_status_change_callback(Some(Arc::new(move |task_id, old, new| {
            bus.publish(crate::events::DomainEvent::TaskStatusChanged {
                task_id: task_id.to_string(),
                from_status: old,
                to_status: new,
            });
        })));

        Self {
            engine,
            factory,
            tasks,
            executions,
            runtime,
            queued,
            project_id: project.id,
            _repo_dir: repo_dir,
            _data_dir: data_dir,
        }
    }

    pub async fn create_auto_task(&self, title: &str, description: &str) -> Task {
        let mut task = Task::new(&self.project_id, title);
        task.description = description.to_string();
        self.tasks.create(&task).await.unwrap();
        task
    }
}

/// Poll `condition` until true or panic after ~10 s.
pub(crate) async fn wait_until<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within timeout");
}
