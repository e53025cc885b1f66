// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The automation engine proper: event worker, admission, and the per-task
//! run loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::prompts::{build_prompt, PromptContext};
use crate::agent::signals::{parse_signal, Signal, SignalResult};
use crate::agent::{serialize_agent_messages, serialize_agent_output, AgentFactory, AgentHandle};
use crate::config::KaganConfig;
use crate::error::AgentError;
use crate::events::{DomainEvent, EventBus, NotificationSeverity};
use crate::git::GitAdapter;
use crate::limits::{
    truncate_queue_payload, AGENT_TIMEOUT_LONG, RUN_NOTE_TAIL, STREAM_LOG_FLUSH_INTERVAL,
};
use crate::messages::{Lane, QueuedMessageService};
use crate::runtime::RuntimeView;
use crate::store::models::{
    ExecutionRunReason, ExecutionStatus, SessionStatus, SessionType, Task, TaskStatus,
};
use crate::store::{ExecutionRepository, TaskRepository};
use crate::workspace::WorkspaceService;

use super::policy::{
    assess_conflict, can_spawn_new_agent, is_auto_task, resolve_auto_approve,
    should_stop_running_on_status_change, AgentPermissionScope, ConflictAssessment,
};

/// Lifecycle state for a currently running task loop.
#[derive(Default)]
struct RunningTaskState {
    handle: Option<JoinHandle<()>>,
    session_id: Option<String>,
    pending_respawn: bool,
}

/// Scheduler metadata for conflict-blocked AUTO task starts.
#[derive(Debug, Clone)]
struct BlockedSpawnState {
    blocker_task_ids: Vec<String>,
    #[allow(dead_code)]
    overlap_hints: Vec<String>,
    #[allow(dead_code)]
    reason: String,
    #[allow(dead_code)]
    blocked_at: DateTime<Utc>,
}

/// Queue item for the automation worker.
#[derive(Debug, Clone)]
enum AutomationEvent {
    StatusChange {
        task_id: String,
        old_status: Option<TaskStatus>,
        new_status: Option<TaskStatus>,
    },
    Spawn {
        task_id: String,
    },
}

struct PendingSpawns {
    queue: VecDeque<String>,
    set: HashSet<String>,
}

/// Automation engine driving AUTO task lifecycles.
#[derive(Clone)]
pub struct AutomationEngine {
    inner: Arc<EngineInner>,
}

pub(crate) struct EngineInner {
    tasks: TaskRepository,
    executions: ExecutionRepository,
    pub(crate) workspaces: WorkspaceService,
    pub(crate) config: KaganConfig,
    pub(crate) runtime: RuntimeView,
    queued: QueuedMessageService,
    pub(crate) events: EventBus,
    pub(crate) git: GitAdapter,
    pub(crate) agent_factory: AgentFactory,

    event_tx: mpsc::UnboundedSender<AutomationEvent>,
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<AutomationEvent>>>,
    running: Mutex<HashMap<String, RunningTaskState>>,
    pending: Mutex<PendingSpawns>,
    blocked: Mutex<HashMap<String, BlockedSpawnState>>,
    /// Held while admitting pending spawns.
    admission: Mutex<()>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl AutomationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tasks: TaskRepository,
        executions: ExecutionRepository,
        workspaces: WorkspaceService,
        config: KaganConfig,
        runtime: RuntimeView,
        queued: QueuedMessageService,
        events: EventBus,
        git: GitAdapter,
        agent_factory: AgentFactory,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(EngineInner {
                tasks,
                executions,
                workspaces,
                config,
                runtime,
                queued,
                events,
                git,
                agent_factory,
                event_tx,
                event_rx: StdMutex::new(Some(event_rx)),
                running: Mutex::new(HashMap::new()),
                pending: Mutex::new(PendingSpawns {
                    queue: VecDeque::new(),
                    set: HashSet::new(),
                }),
                blocked: Mutex::new(HashMap::new()),
                admission: Mutex::new(()),
                workers: StdMutex::new(Vec::new()),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Start the worker loop and the domain event subscription.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = Vec::new();

        if let Some(mut rx) = self.inner.event_rx.lock().expect("event rx lock").take() {
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(async move {
                info!("Automation worker loop started");
                while let Some(event) = rx.recv().await {
                    if let Err(e) = inner.process_event(event).await {
                        error!("Error in automation worker: {e}");
                    }
                }
                info!("Automation worker loop ended");
            }));
        }

        let mut bus_rx = self.inner.events.subscribe();
        let event_tx = self.inner.event_tx.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(DomainEvent::TaskStatusChanged {
                        task_id,
                        from_status,
                        to_status,
                    }) => {
                        let _ = event_tx.send(AutomationEvent::StatusChange {
                            task_id,
                            old_status: from_status,
                            new_status: to_status,
                        });
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Automation event subscription lagged by {missed} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        *self.inner.workers.lock().expect("workers lock") = handles;
        info!("Automation service started (reactive mode)");
    }

    /// Stop the engine and every running agent.
    pub async fn stop(&self) {
        info!("Stopping automation service");
        for handle in self.inner.workers.lock().expect("workers lock").drain(..) {
            handle.abort();
        }

        let task_ids: Vec<String> = {
            let running = self.inner.running.lock().await;
            running.keys().cloned().collect()
        };
        for task_id in task_ids {
            self.inner.stop_if_running(&task_id).await;
        }
        self.inner.started.store(false, Ordering::SeqCst);
    }

    /// Queue a status change for the worker (used by tests and direct
    /// callers; the engine also receives these via the event bus).
    pub fn handle_status_change(
        &self,
        task_id: &str,
        old_status: Option<TaskStatus>,
        new_status: Option<TaskStatus>,
    ) {
        debug!("Queued status change: {task_id} {old_status:?} -> {new_status:?}");
        let _ = self.inner.event_tx.send(AutomationEvent::StatusChange {
            task_id: task_id.to_string(),
            old_status,
            new_status,
        });
    }

    /// Request a spawn for an AUTO task. Returns false when the task is
    /// already running or not AUTO.
    pub async fn spawn_for_task(&self, task: &Task) -> bool {
        if self.inner.running.lock().await.contains_key(&task.id) {
            return false;
        }
        if !is_auto_task(task.task_type) {
            return false;
        }
        self.inner
            .runtime
            .mark_pending(&task.id, "Queued for scheduler admission.");
        let _ = self.inner.event_tx.send(AutomationEvent::Spawn {
            task_id: task.id.clone(),
        });
        true
    }

    /// Stop a task's agent, or remove it from the pending/blocked queues.
    /// Returns true when there was anything to stop.
    pub async fn stop_task(&self, task_id: &str) -> bool {
        let was_running = self.inner.running.lock().await.contains_key(task_id);
        if !was_running {
            let was_pending = {
                let pending = self.inner.pending.lock().await;
                pending.set.contains(task_id)
            } || self.inner.blocked.lock().await.contains_key(task_id);
            if !was_pending {
                return false;
            }

            self.inner.discard_pending_spawn(task_id).await;
            self.inner.blocked.lock().await.remove(task_id);
            self.inner.runtime.clear_pending(task_id);
            self.inner.runtime.clear_blocked(task_id);
            if let Ok(Some(task)) = self.inner.tasks.get(task_id).await {
                if task.status != TaskStatus::Backlog {
                    let _ = self
                        .inner
                        .tasks
                        .move_to(task_id, TaskStatus::Backlog)
                        .await;
                }
            }
            return true;
        }

        self.inner.stop_if_running(task_id).await;
        if let Ok(Some(task)) = self.inner.tasks.get(task_id).await {
            if task.status != TaskStatus::Backlog {
                let _ = self
                    .inner
                    .tasks
                    .move_to(task_id, TaskStatus::Backlog)
                    .await;
            }
        }
        true
    }

    pub async fn is_running(&self, task_id: &str) -> bool {
        if self
            .inner
            .runtime
            .get(task_id)
            .map(|v| v.is_running)
            .unwrap_or(false)
        {
            return true;
        }
        self.inner.running.lock().await.contains_key(task_id)
    }

    pub fn get_running_agent(&self, task_id: &str) -> Option<AgentHandle> {
        let view = self.inner.runtime.get(task_id)?;
        if !view.is_running {
            return None;
        }
        view.running_agent
    }

    pub fn get_execution_id(&self, task_id: &str) -> Option<String> {
        self.inner.runtime.get(task_id)?.execution_id
    }

    pub fn get_run_count(&self, task_id: &str) -> i64 {
        self.inner
            .runtime
            .get(task_id)
            .map(|v| v.run_count)
            .unwrap_or(0)
    }

    pub async fn running_count(&self) -> usize {
        self.inner.running.lock().await.len()
    }
}

impl EngineInner {
    async fn process_event(self: &Arc<Self>, event: AutomationEvent) -> crate::error::Result<()> {
        match event {
            AutomationEvent::StatusChange {
                task_id,
                old_status,
                new_status,
            } => {
                self.process_status_event(&task_id, old_status, new_status)
                    .await
            }
            AutomationEvent::Spawn { task_id } => self.process_spawn(&task_id).await,
        }
    }

    async fn process_status_event(
        self: &Arc<Self>,
        task_id: &str,
        old_status: Option<TaskStatus>,
        new_status: Option<TaskStatus>,
    ) -> crate::error::Result<()> {
        if new_status.is_none() {
            self.stop_if_running(task_id).await;
            self.retry_blocked_pending_spawns().await;
            return Ok(());
        }

        let Some(task) = self.tasks.get(task_id).await? else {
            self.stop_if_running(task_id).await;
            self.retry_blocked_pending_spawns().await;
            return Ok(());
        };

        if !is_auto_task(task.task_type) {
            self.blocked.lock().await.remove(task_id);
            self.runtime.clear_blocked(task_id);
            return Ok(());
        }

        if task.status != TaskStatus::Backlog {
            if self.blocked.lock().await.remove(task_id).is_some() {
                self.runtime.clear_blocked(task_id);
            }
        }

        if should_stop_running_on_status_change(old_status, new_status) {
            self.stop_if_running(task_id).await;
        }
        self.retry_blocked_pending_spawns().await;
        Ok(())
    }

    async fn process_spawn(self: &Arc<Self>, task_id: &str) -> crate::error::Result<()> {
        if self.running.lock().await.contains_key(task_id) {
            self.discard_pending_spawn(task_id).await;
            debug!("Task {task_id} already running");
            return Ok(());
        }
        let Some(task) = self.tasks.get(task_id).await? else {
            self.discard_pending_spawn(task_id).await;
            return Ok(());
        };
        if !is_auto_task(task.task_type) {
            self.discard_pending_spawn(task_id).await;
            return Ok(());
        }

        self.blocked.lock().await.remove(task_id);
        self.runtime.clear_blocked(task_id);
        self.enqueue_pending_spawn(task_id).await;
        self.admit_pending_spawns().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pending-spawn queue
    // ------------------------------------------------------------------

    async fn enqueue_pending_spawn(&self, task_id: &str) {
        if self.running.lock().await.contains_key(task_id) {
            self.discard_pending_spawn(task_id).await;
            return;
        }
        let mut pending = self.pending.lock().await;
        if pending.set.insert(task_id.to_string()) {
            pending.queue.push_back(task_id.to_string());
        }
    }

    async fn discard_pending_spawn(&self, task_id: &str) {
        let mut pending = self.pending.lock().await;
        if pending.set.remove(task_id) {
            pending.queue.retain(|id| id != task_id);
        }
        drop(pending);
        self.runtime.clear_pending(task_id);
    }

    /// Start pending AUTO tasks while capacity allows, skipping (and
    /// parking) conflict-blocked candidates.
    async fn admit_pending_spawns(self: &Arc<Self>) {
        let _guard = self.admission.lock().await;
        let max_agents = self.config.general.max_concurrent_agents;

        loop {
            let running_count = self.running.lock().await.len();
            let queue_snapshot: Vec<String> = {
                let pending = self.pending.lock().await;
                pending.queue.iter().cloned().collect()
            };
            if queue_snapshot.is_empty() || !can_spawn_new_agent(running_count, max_agents) {
                break;
            }

            let mut started = false;
            for task_id in queue_snapshot {
                let task = match self.tasks.get(&task_id).await {
                    Ok(task) => task,
                    Err(e) => {
                        warn!("Failed to load pending task {task_id}: {e}");
                        None
                    }
                };
                let invalid = match &task {
                    None => true,
                    Some(task) => {
                        !is_auto_task(task.task_type)
                            || self.running.lock().await.contains_key(&task.id)
                    }
                };
                if invalid {
                    self.discard_pending_spawn(&task_id).await;
                    self.blocked.lock().await.remove(&task_id);
                    self.runtime.clear_blocked(&task_id);
                    continue;
                }
                let task = task.expect("validated above");

                let running_tasks = self.list_running_auto_tasks(&task.id).await;
                let conflict = assess_conflict(&task, &running_tasks);
                if conflict.is_blocked() {
                    self.discard_pending_spawn(&task.id).await;
                    self.mark_spawn_blocked(&task, &conflict).await;
                    continue;
                }

                self.discard_pending_spawn(&task.id).await;
                self.blocked.lock().await.remove(&task.id);
                self.runtime.clear_blocked(&task.id);
                self.spawn(&task).await;
                started = true;
                break;
            }
            if !started {
                break;
            }
        }

        let queued: Vec<String> = {
            let pending = self.pending.lock().await;
            pending.queue.iter().cloned().collect()
        };
        if !queued.is_empty() {
            debug!(
                "At capacity ({max_agents}), deferred spawn for {} pending task(s)",
                queued.len()
            );
            for task_id in queued {
                self.runtime.mark_pending(
                    &task_id,
                    "Queued for capacity: waiting for an available agent slot.",
                );
            }
        }
    }

    async fn list_running_auto_tasks(&self, exclude_task_id: &str) -> Vec<(String, Task)> {
        let running_ids: Vec<String> = {
            let running = self.running.lock().await;
            running.keys().cloned().collect()
        };
        let mut tasks = Vec::new();
        for task_id in running_ids {
            if task_id == exclude_task_id {
                continue;
            }
            if let Ok(Some(task)) = self.tasks.get(&task_id).await {
                if is_auto_task(task.task_type) {
                    tasks.push((task_id, task));
                }
            }
        }
        tasks
    }

    // ------------------------------------------------------------------
    // Blocked-spawn management
    // ------------------------------------------------------------------

    async fn mark_spawn_blocked(&self, task: &Task, conflict: &ConflictAssessment) {
        let overlap_preview = conflict
            .overlap_hints
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(", ");
        let blockers_preview = conflict
            .blocker_task_ids
            .iter()
            .take(3)
            .map(|id| format!("#{}", &id[..id.len().min(8)]))
            .collect::<Vec<_>>()
            .join(", ");
        let mut reason = format!("Waiting on {blockers_preview} before starting");
        if !overlap_preview.is_empty() {
            reason.push_str(&format!(" (overlap: {overlap_preview})"));
        }

        self.blocked.lock().await.insert(
            task.id.clone(),
            BlockedSpawnState {
                blocker_task_ids: conflict.blocker_task_ids.clone(),
                overlap_hints: conflict.overlap_hints.clone(),
                reason: reason.clone(),
                blocked_at: Utc::now(),
            },
        );
        self.runtime.mark_blocked(
            &task.id,
            &reason,
            &conflict.blocker_task_ids,
            &conflict.overlap_hints,
        );
        self.record_blocked_history(&task.id, &reason, conflict).await;
        if task.status != TaskStatus::Backlog {
            let _ = self.tasks.move_to(&task.id, TaskStatus::Backlog).await;
        }
    }

    /// Persist a lightweight blocked event trail in the task scratchpad.
    async fn record_blocked_history(
        &self,
        task_id: &str,
        reason: &str,
        conflict: &ConflictAssessment,
    ) {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M");
        let blockers = if conflict.blocker_task_ids.is_empty() {
            "none".to_string()
        } else {
            conflict
                .blocker_task_ids
                .iter()
                .map(|id| format!("#{}", &id[..id.len().min(8)]))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let overlap = if conflict.overlap_hints.is_empty() {
            "n/a".to_string()
        } else {
            conflict
                .overlap_hints
                .iter()
                .take(5)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        };
        let entry = format!(
            "\n\n---\n[Blocked auto-start {timestamp}]\n- Reason: {reason}\n- Blocked by: {blockers}\n- Overlap hints: {overlap}"
        );
        match self.tasks.get_scratchpad(task_id).await {
            Ok(scratchpad) => {
                if let Err(e) = self
                    .tasks
                    .update_scratchpad(task_id, &format!("{scratchpad}{entry}"))
                    .await
                {
                    debug!("Unable to persist blocked history for {task_id}: {e}");
                }
            }
            Err(e) => debug!("Unable to persist blocked history for {task_id}: {e}"),
        }
    }

    /// Re-enqueue blocked tasks whose blockers have all cleared.
    async fn retry_blocked_pending_spawns(self: &Arc<Self>) {
        let snapshot: Vec<(String, BlockedSpawnState)> = {
            let blocked = self.blocked.lock().await;
            if blocked.is_empty() {
                return;
            }
            blocked
                .iter()
                .map(|(id, state)| (id.clone(), state.clone()))
                .collect()
        };

        let mut resumed = false;
        for (task_id, state) in snapshot {
            let task = match self.tasks.get(&task_id).await {
                Ok(Some(task)) if is_auto_task(task.task_type) => task,
                _ => {
                    self.blocked.lock().await.remove(&task_id);
                    self.runtime.clear_blocked(&task_id);
                    continue;
                }
            };

            let mut still_waiting = false;
            for blocker_id in &state.blocker_task_ids {
                if self.blocker_is_active(blocker_id).await {
                    still_waiting = true;
                    break;
                }
            }
            if still_waiting {
                continue;
            }

            self.blocked.lock().await.remove(&task_id);
            self.runtime.clear_blocked(&task_id);
            self.enqueue_pending_spawn(&task.id).await;
            self.runtime
                .mark_pending(&task.id, "Queued after blockers cleared.");
            resumed = true;
        }

        if resumed {
            self.admit_pending_spawns().await;
        }
    }

    /// A blocker keeps its dependents parked while it is running in memory,
    /// still IN_PROGRESS/REVIEW in the store, or live in the runtime view.
    async fn blocker_is_active(&self, blocker_task_id: &str) -> bool {
        if self.running.lock().await.contains_key(blocker_task_id) {
            return true;
        }
        let Ok(Some(blocker)) = self.tasks.get(blocker_task_id).await else {
            return false;
        };
        if let Some(view) = self.runtime.get(blocker_task_id) {
            if view.is_running || view.is_reviewing || view.is_pending {
                return true;
            }
        }
        matches!(blocker.status, TaskStatus::InProgress | TaskStatus::Review)
    }

    // ------------------------------------------------------------------
    // Spawn and run loop
    // ------------------------------------------------------------------

    // Boxed to erase the return type: `run_task_loop` transitively calls
    // back into `spawn` (via `admit_pending_spawns`), and leaving this as
    // a plain `async fn` creates a self-referential opaque future type
    // that the compiler cannot prove `Send` for.
    fn spawn<'a>(
        self: &'a Arc<Self>,
        task: &'a Task,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            info!("Spawning agent for AUTO task {}: {}", task.id, task.title);
            if task.status != TaskStatus::InProgress {
                let _ = self.tasks.move_to(&task.id, TaskStatus::InProgress).await;
            }

            {
                let mut running = self.running.lock().await;
                running.insert(task.id.clone(), RunningTaskState::default());
            }
            self.runtime.mark_started(&task.id);
            self.check_runtime_view_consistency(&task.id, "mark_started")
                .await;
            self.events.publish(DomainEvent::AutomationTaskStarted {
                task_id: task.id.clone(),
            });

            // The loop body holds a strong reference; cleanup goes through a
            // weak one so a parked loop cannot keep the engine alive.
            let loop_inner = Arc::clone(self);
            let weak = Arc::downgrade(self);
            let task = task.clone();
            let task_id = task.id.clone();
            let inner_task_id = task_id.clone();
            let handle = tokio::spawn(async move {
                loop_inner.run_task_loop(&task).await;
                drop(loop_inner);
                if let Some(inner) = weak.upgrade() {
                    inner.remove_running_state(&inner_task_id).await;
                }
            });

            let mut running = self.running.lock().await;
            if let Some(state) = running.get_mut(&task_id) {
                state.handle = Some(handle);
            }
        })
    }

    async fn run_task_loop(self: &Arc<Self>, task: &Task) {
        info!("Starting task loop for {}", task.id);
        let mut final_status: Option<ExecutionStatus> = None;
        let mut agent: Option<AgentHandle> = None;
        let mut execution_id: Option<String> = None;
        let mut session_id: Option<String> = None;

        let outcome = self
            .run_task_loop_body(
                task,
                &mut final_status,
                &mut agent,
                &mut execution_id,
                &mut session_id,
            )
            .await;

        if let Err(e) = outcome {
            error!("Exception in task loop for {}: {e}", task.id);
            self.notify_user(
                &format!("Agent failed: {e}"),
                "Agent Error",
                NotificationSeverity::Error,
            );
            let _ = self.tasks.move_to(&task.id, TaskStatus::Backlog).await;
            final_status = Some(ExecutionStatus::Failed);
        }

        if let Some(agent) = agent {
            agent.stop().await;
        }
        if let Some(execution_id) = execution_id {
            let _ = self
                .executions
                .update_execution(
                    &execution_id,
                    Some(final_status.unwrap_or(ExecutionStatus::Failed)),
                    Some(Utc::now()),
                    None,
                )
                .await;
        }
        if let Some(session_id) = session_id {
            let _ = self
                .executions
                .close_session(&session_id, SessionStatus::Closed)
                .await;
        }
        info!("Task loop ended for {}", task.id);
    }

    async fn run_task_loop_body(
        self: &Arc<Self>,
        task: &Task,
        final_status: &mut Option<ExecutionStatus>,
        agent_slot: &mut Option<AgentHandle>,
        execution_slot: &mut Option<String>,
        session_slot: &mut Option<String>,
    ) -> crate::error::Result<()> {
        let base_branch = task
            .base_branch
            .clone()
            .unwrap_or_else(|| self.config.general.default_base_branch.clone());

        let wt_path = match self.workspaces.get_path(&task.id).await? {
            Some(path) => path,
            None => {
                info!("Creating worktree for {}", task.id);
                match self.workspaces.create(&task.id, Some(&base_branch)).await {
                    Ok(path) => path,
                    Err(e) => {
                        let message = e.to_string();
                        let user_message = if message.to_lowercase().contains("not a git repository")
                            || message.to_lowercase().contains("fatal:")
                        {
                            format!("Repository is not a valid git repo: {message}")
                        } else {
                            format!("Failed to create workspace: {message}")
                        };
                        error!("Workspace creation failed for task {}: {message}", task.id);
                        self.notify_user(
                            &format!("\u{274c} {user_message}"),
                            "Cannot Start Agent",
                            NotificationSeverity::Error,
                        );
                        let _ = self.tasks.move_to(&task.id, TaskStatus::Backlog).await;
                        return Ok(());
                    }
                }
            }
        };
        info!("Worktree path: {wt_path:?}");

        let workspace = self
            .workspaces
            .latest_for_task(&task.id)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!("No workspace record found for task {}", task.id)
            })?;

        let session = self
            .executions
            .create_session(&workspace.id, SessionType::Acp, None)
            .await?;
        *session_slot = Some(session.id.clone());

        let execution = self
            .executions
            .create_execution(&session.id, ExecutionRunReason::CodingAgent, serde_json::json!({}))
            .await?;
        *execution_slot = Some(execution.id.clone());

        {
            let mut running = self.running.lock().await;
            if let Some(state) = running.get_mut(&task.id) {
                state.session_id = Some(session.id.clone());
            }
        }
        self.runtime.set_execution(&task.id, &execution.id, 0);

        let (user_name, user_email) = self.git.user_identity(&wt_path).await;
        debug!("Git user identity: {user_name} <{user_email}>");

        let run_count = self.executions.count_for_task(&task.id).await?;
        info!("Starting run for {}, run={run_count}", task.id);
        self.runtime.set_execution(&task.id, &execution.id, run_count);

        let primary_repo_id = self
            .workspaces
            .workspaces
            .primary_repo_row(&workspace.id)
            .await?
            .map(|(row, _)| row.repo_id);
        let before_head = self.git.head_commit(&wt_path).await.unwrap_or(None);

        let (signal, agent) = self
            .run_execution(
                task,
                &wt_path,
                run_count,
                &execution.id,
                &user_name,
                &user_email,
            )
            .await?;
        *agent_slot = Some(agent);

        // Snapshot the primary repo's head movement for this execution.
        if let Some(repo_id) = primary_repo_id {
            let after_head = self.git.head_commit(&wt_path).await.unwrap_or(None);
            let _ = self
                .executions
                .add_repo_state(
                    &execution.id,
                    &repo_id,
                    before_head.as_deref(),
                    after_head.as_deref(),
                    None,
                )
                .await;
        }

        debug!("Task {} run {run_count} signal: {signal:?}", task.id);

        match signal.signal {
            Signal::Complete => {
                *final_status = Some(ExecutionStatus::Completed);

                if let Some(queued) = self
                    .take_implementation_queue(&task.id, session_slot.as_deref())
                    .await
                {
                    self.append_queued_message_to_scratchpad(&task.id, &queued.content)
                        .await?;
                    let _ = self.tasks.move_to(&task.id, TaskStatus::InProgress).await;
                    info!("Task {} has queued messages, re-spawning", task.id);
                    let mut running = self.running.lock().await;
                    if let Some(state) = running.get_mut(&task.id) {
                        state.pending_respawn = true;
                    }
                    return Ok(());
                }

                info!("Task {} completed, moving to REVIEW", task.id);
                self.handle_complete(task).await?;
            }
            Signal::Blocked => {
                warn!("Task {} blocked: {}", task.id, signal.reason);
                self.notify_user(
                    &format!("Blocked: {}", signal.reason),
                    "Agent Blocked",
                    NotificationSeverity::Warning,
                );
                self.handle_blocked(task, &signal.reason).await?;
                *final_status = Some(ExecutionStatus::Failed);
            }
            _ => {
                info!(
                    "Task {} run {run_count} complete; awaiting next run",
                    task.id
                );
                *final_status = Some(ExecutionStatus::Completed);
            }
        }
        Ok(())
    }

    /// Run a single agent execution and parse its verdict.
    async fn run_execution(
        self: &Arc<Self>,
        task: &Task,
        wt_path: &PathBuf,
        run_count: i64,
        execution_id: &str,
        user_name: &str,
        user_email: &str,
    ) -> crate::error::Result<(SignalResult, AgentHandle)> {
        let agent_config = self.config.agent_config(task.agent_backend.as_deref());
        let agent = (self.agent_factory)(wt_path, &agent_config, false);
        agent.set_task_id(&task.id);
        agent.set_auto_approve(resolve_auto_approve(
            AgentPermissionScope::AutomationRunner,
            self.config.general.auto_approve,
        ));
        self.apply_model_override(&agent, &agent_config.identity, &format!("task {}", task.id));

        if let Err(e) = agent.start().await {
            error!("Agent start failed for {}: {e}", task.id);
            return Ok((
                parse_signal("<blocked reason=\"Agent failed to start\"/>"),
                agent,
            ));
        }
        self.set_running_agent(&task.id, Arc::clone(&agent)).await;

        if let Err(e) = agent.wait_ready(AGENT_TIMEOUT_LONG).await {
            error!("Agent timeout for task {}: {e}", task.id);
            return Ok((
                parse_signal("<blocked reason=\"Agent failed to start\"/>"),
                agent,
            ));
        }

        let scratchpad = self.tasks.get_scratchpad(&task.id).await?;
        let prompt = build_prompt(&PromptContext {
            task,
            run_count,
            scratchpad: &scratchpad,
            user_name,
            user_email,
        });

        info!("Sending prompt to agent for task {}, run {run_count}", task.id);
        let send_result = self
            .send_prompt_with_incremental_persistence(execution_id, &agent, &prompt)
            .await;
        agent.clear_tool_calls().await;

        let persisted_incremental = match send_result {
            Ok(persisted) => persisted,
            Err(e) => {
                error!("Agent prompt failed for {}: {e}", task.id);
                let blocked = format!("<blocked reason=\"Agent error: {e}\"/>");
                return Ok((parse_signal(&blocked), agent));
            }
        };

        let response = agent.get_response_text().await;
        let signal = parse_signal(&response);

        if !persisted_incremental {
            if let Some(payload) = serialize_agent_output(agent.as_ref()).await {
                self.executions.append_log(execution_id, &payload).await?;
            }
        }
        self.executions
            .append_turn(execution_id, Some(&prompt), Some(&response), None, None)
            .await?;

        let progress_note = format!(
            "\n\n--- Run {run_count} ---\n{}",
            crate::limits::tail_bytes(&response, RUN_NOTE_TAIL)
        );
        self.tasks
            .update_scratchpad(&task.id, &format!("{scratchpad}{progress_note}"))
            .await?;

        Ok((signal, agent))
    }

    /// Stream the prompt while flushing newly buffered agent messages into
    /// the execution log every ~250 ms. Returns whether anything was
    /// persisted incrementally.
    async fn send_prompt_with_incremental_persistence(
        &self,
        execution_id: &str,
        agent: &AgentHandle,
        prompt: &str,
    ) -> Result<bool, AgentError> {
        let prompt_agent = Arc::clone(agent);
        let prompt_text = prompt.to_string();
        let mut prompt_task =
            tokio::spawn(async move { prompt_agent.send_prompt(&prompt_text).await });

        let mut next_index = 0usize;
        let mut persisted_any = false;

        let send_result = loop {
            tokio::select! {
                result = &mut prompt_task => {
                    break result.unwrap_or(Err(AgentError::Disconnected));
                }
                _ = tokio::time::sleep(STREAM_LOG_FLUSH_INTERVAL) => {
                    let (index, persisted) = self
                        .persist_incremental_output(execution_id, agent, next_index)
                        .await;
                    next_index = index;
                    persisted_any |= persisted;
                }
            }
        };

        // Trailing flush regardless of outcome.
        let (_, persisted) = self
            .persist_incremental_output(execution_id, agent, next_index)
            .await;
        persisted_any |= persisted;

        send_result.map(|()| persisted_any)
    }

    async fn persist_incremental_output(
        &self,
        execution_id: &str,
        agent: &AgentHandle,
        next_index: usize,
    ) -> (usize, bool) {
        let messages = agent.get_messages().await;
        if next_index >= messages.len() {
            return (messages.len(), false);
        }
        let Some(payload) = serialize_agent_messages(&messages[next_index..]) else {
            return (messages.len(), false);
        };
        match self.executions.append_log(execution_id, &payload).await {
            Ok(_) => (messages.len(), true),
            Err(e) => {
                debug!("Unable to persist incremental output: {e}");
                (messages.len(), false)
            }
        }
    }

    // ------------------------------------------------------------------
    // Stop / cleanup
    // ------------------------------------------------------------------

    async fn stop_if_running(&self, task_id: &str) {
        let state = {
            let mut running = self.running.lock().await;
            running.remove(task_id)
        };
        let Some(state) = state else {
            return;
        };
        info!("Stopping agent for task {task_id}");

        if let Some(view) = self.runtime.get(task_id) {
            if let Some(agent) = view.running_agent {
                agent.stop().await;
            }
            if let Some(agent) = view.review_agent {
                agent.stop().await;
            }
        }

        if let Some(handle) = state.handle {
            if !handle.is_finished() {
                handle.abort();
                // The aborted loop never reaches its bookkeeping; settle the
                // open execution and session here.
                if let Some(view) = self.runtime.get(task_id) {
                    if let Some(execution_id) = view.execution_id {
                        let _ = self
                            .executions
                            .update_execution(
                                &execution_id,
                                Some(ExecutionStatus::Killed),
                                Some(Utc::now()),
                                None,
                            )
                            .await;
                    }
                }
                if let Some(session_id) = state.session_id {
                    let _ = self
                        .executions
                        .close_session(&session_id, SessionStatus::Closed)
                        .await;
                }
            }
        }

        self.runtime.mark_ended(task_id);
        self.check_runtime_view_consistency(task_id, "mark_ended").await;
        self.events.publish(DomainEvent::AutomationTaskEnded {
            task_id: task_id.to_string(),
        });
    }

    /// Remove running state after a loop finishes and kick the scheduler.
    async fn remove_running_state(self: &Arc<Self>, task_id: &str) {
        let removed = {
            let mut running = self.running.lock().await;
            running.remove(task_id)
        };
        let Some(removed) = removed else {
            return;
        };
        self.runtime.mark_ended(task_id);
        self.check_runtime_view_consistency(task_id, "mark_ended").await;
        self.events.publish(DomainEvent::AutomationTaskEnded {
            task_id: task_id.to_string(),
        });
        if removed.pending_respawn {
            self.enqueue_pending_spawn(task_id).await;
        }
        self.retry_blocked_pending_spawns().await;
        self.admit_pending_spawns().await;
    }

    // ------------------------------------------------------------------
    // Agent attachment
    // ------------------------------------------------------------------

    async fn set_running_agent(&self, task_id: &str, agent: AgentHandle) {
        if !self.running.lock().await.contains_key(task_id) {
            return;
        }
        let first_attach = self
            .runtime
            .get(task_id)
            .map(|v| v.running_agent.is_none())
            .unwrap_or(true);
        self.runtime.attach_running_agent(task_id, agent);
        self.check_runtime_view_consistency(task_id, "attach_running_agent")
            .await;
        if first_attach {
            self.events.publish(DomainEvent::AutomationAgentAttached {
                task_id: task_id.to_string(),
            });
        }
    }

    pub(crate) async fn set_review_agent(&self, task_id: &str, agent: AgentHandle) {
        if !self.running.lock().await.contains_key(task_id) {
            return;
        }
        let first_attach = self
            .runtime
            .get(task_id)
            .map(|v| v.review_agent.is_none())
            .unwrap_or(true);
        self.runtime.attach_review_agent(task_id, agent);
        self.check_runtime_view_consistency(task_id, "attach_review_agent")
            .await;
        if first_attach {
            self.events
                .publish(DomainEvent::AutomationReviewAgentAttached {
                    task_id: task_id.to_string(),
                });
        }
    }

    // ------------------------------------------------------------------
    // Queued messages
    // ------------------------------------------------------------------

    async fn take_implementation_queue(
        &self,
        task_id: &str,
        session_id: Option<&str>,
    ) -> Option<crate::messages::QueuedMessage> {
        if let Some(message) = self.queued.take_queued(task_id, Lane::Implementation).await {
            return Some(message);
        }
        let session_id = session_id?;
        self.queued
            .take_queued(session_id, Lane::Implementation)
            .await
    }

    async fn append_queued_message_to_scratchpad(
        &self,
        task_id: &str,
        content: &str,
    ) -> crate::error::Result<()> {
        let scratchpad = self.tasks.get_scratchpad(task_id).await?;
        let note = format!(
            "\n\n--- USER MESSAGE ---\n{}",
            truncate_queue_payload(content)
        );
        self.tasks
            .update_scratchpad(task_id, &format!("{scratchpad}{note}"))
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    async fn check_runtime_view_consistency(&self, task_id: &str, phase: &str) {
        let has_state = self.running.lock().await.contains_key(task_id);
        let has_view = self
            .runtime
            .get(task_id)
            .map(|v| v.is_running)
            .unwrap_or(false);
        if has_state != has_view {
            warn!(
                "Runtime state mismatch at {phase} for task {task_id}: \
                 has_state={has_state}, has_view={has_view}"
            );
        }
    }

    pub(crate) fn notify_user(
        &self,
        message: &str,
        title: &str,
        severity: NotificationSeverity,
    ) {
        self.events.publish(DomainEvent::UserNotification {
            message: message.to_string(),
            title: title.to_string(),
            severity,
        });
    }

    pub(crate) fn apply_model_override(&self, agent: &AgentHandle, identity: &str, context: &str) {
        let identity = identity.to_lowercase();
        let model = if identity.contains("claude") {
            self.config.general.default_model_claude.clone()
        } else if identity.contains("opencode") {
            self.config.general.default_model_opencode.clone()
        } else {
            None
        };
        if let Some(model) = model {
            agent.set_model_override(&model);
            info!("Applied model override for {context}: {model}");
        }
    }

    pub(crate) async fn blocked_remove(&self, task_id: &str) {
        self.blocked.lock().await.remove(task_id);
    }

    pub(crate) fn tasks(&self) -> &TaskRepository {
        &self.tasks
    }

    pub(crate) fn executions(&self) -> &ExecutionRepository {
        &self.executions
    }
}

#[cfg(test)]
mod tests {
    use crate::automation::testutil::{wait_until, EngineFixture, MockScript};
    use crate::store::models::{TaskStatus, TaskType};

    #[tokio::test]
    async fn test_complete_flow_with_auto_review_approval() {
        let fx = EngineFixture::new(2, true).await;
        fx.factory.push_impl(MockScript::respond(
            "all done <complete reason=\"implemented\"/>",
        ));
        fx.factory.push_review(MockScript::respond("<approve reason=\"ok\"/>"));

        let task = fx.create_auto_task("Fix login bug", "mentions src/login.py").await;
        fx.engine.spawn_for_task(&task).await;

        wait_until(|| async {
            fx.tasks.get(&task.id).await.unwrap().unwrap().status == TaskStatus::Review
                && !fx.engine.is_running(&task.id).await
        })
        .await;

        let stored = fx.tasks.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Review);
        assert_eq!(stored.checks_passed, Some(true));

        let scratchpad = fx.tasks.get_scratchpad(&task.id).await.unwrap();
        assert!(scratchpad.contains("--- Run 0 ---"), "{scratchpad}");
        assert!(scratchpad.contains("--- REVIEW ---\nok"), "{scratchpad}");

        // Review result is persisted in the execution metadata.
        let execution = fx.executions.latest_for_task(&task.id).await.unwrap().unwrap();
        assert_eq!(
            execution.metadata["review_result"]["status"],
            serde_json::json!("approved")
        );
    }

    #[tokio::test]
    async fn test_blocked_signal_returns_task_to_backlog() {
        let fx = EngineFixture::new(2, false).await;
        fx.factory.push_impl(MockScript::respond(
            "cannot proceed <blocked reason=\"missing credentials\"/>",
        ));

        let task = fx.create_auto_task("Blocked work", "needs src/auth.py").await;
        fx.engine.spawn_for_task(&task).await;

        wait_until(|| async {
            fx.tasks.get(&task.id).await.unwrap().unwrap().status == TaskStatus::Backlog
                && !fx.engine.is_running(&task.id).await
        })
        .await;

        let scratchpad = fx.tasks.get_scratchpad(&task.id).await.unwrap();
        assert!(scratchpad.contains("--- BLOCKED ---"));
        assert!(scratchpad.contains("missing credentials"));
    }

    #[tokio::test]
    async fn test_conflict_blocks_second_task() {
        let fx = EngineFixture::new(2, false).await;
        // First agent hangs so the task stays running.
        fx.factory.push_impl(MockScript::hang());

        let t1 = fx
            .create_auto_task("Calculator work", "editing src/calculator.py")
            .await;
        fx.engine.spawn_for_task(&t1).await;
        wait_until(|| async { fx.engine.is_running(&t1.id).await }).await;

        let t2 = fx
            .create_auto_task("More calculator", "also src/calculator.py")
            .await;
        fx.engine.spawn_for_task(&t2).await;

        wait_until(|| async {
            fx.runtime.get(&t2.id).map(|v| v.is_blocked).unwrap_or(false)
        })
        .await;

        let view = fx.runtime.get(&t2.id).unwrap();
        assert!(view.is_blocked);
        assert_eq!(view.blocked_by_task_ids, vec![t1.id.clone()]);
        assert_eq!(view.overlap_hints, vec!["src/calculator.py".to_string()]);
        assert_eq!(
            fx.tasks.get(&t2.id).await.unwrap().unwrap().status,
            TaskStatus::Backlog
        );
        let scratchpad = fx.tasks.get_scratchpad(&t2.id).await.unwrap();
        assert!(scratchpad.contains("[Blocked auto-start"));

        fx.engine.stop_task(&t1.id).await;
    }

    #[tokio::test]
    async fn test_capacity_queues_excess_spawn() {
        let fx = EngineFixture::new(1, false).await;
        fx.factory.push_impl(MockScript::hang());

        let t1 = fx.create_auto_task("First", "src/one.py").await;
        fx.engine.spawn_for_task(&t1).await;
        wait_until(|| async { fx.engine.is_running(&t1.id).await }).await;

        // No overlap, but the single slot is taken.
        let t2 = fx.create_auto_task("Second", "src/two.py").await;
        fx.engine.spawn_for_task(&t2).await;

        wait_until(|| async {
            fx.runtime.get(&t2.id).map(|v| v.is_pending).unwrap_or(false)
        })
        .await;
        let view = fx.runtime.get(&t2.id).unwrap();
        assert!(view
            .pending_reason
            .as_deref()
            .unwrap_or("")
            .contains("Queued for capacity"));

        fx.engine.stop_task(&t1.id).await;
        fx.engine.stop_task(&t2.id).await;
    }

    #[tokio::test]
    async fn test_blocked_task_resumes_after_blocker_completes() {
        let fx = EngineFixture::new(2, false).await;
        fx.factory.push_impl(MockScript::hang());
        // Script for t2 once it is admitted.
        fx.factory.push_impl(MockScript::respond("<complete/>"));

        let t1 = fx.create_auto_task("Hold the file", "src/shared.py").await;
        fx.engine.spawn_for_task(&t1).await;
        wait_until(|| async { fx.engine.is_running(&t1.id).await }).await;

        let t2 = fx.create_auto_task("Wants the file", "src/shared.py").await;
        fx.engine.spawn_for_task(&t2).await;
        wait_until(|| async {
            fx.runtime.get(&t2.id).map(|v| v.is_blocked).unwrap_or(false)
        })
        .await;

        // Stopping t1 moves it to BACKLOG; the status event sweeps the
        // blocked table and admits t2.
        fx.engine.stop_task(&t1.id).await;
        wait_until(|| async {
            let status = fx.tasks.get(&t2.id).await.unwrap().unwrap().status;
            status == TaskStatus::Review && !fx.engine.is_running(&t2.id).await
        })
        .await;
    }

    #[tokio::test]
    async fn test_stop_task_clears_pending() {
        let fx = EngineFixture::new(1, false).await;
        fx.factory.push_impl(MockScript::hang());

        let t1 = fx.create_auto_task("Running", "src/busy.py").await;
        fx.engine.spawn_for_task(&t1).await;
        wait_until(|| async { fx.engine.is_running(&t1.id).await }).await;

        let t2 = fx.create_auto_task("Parked", "src/parked.py").await;
        fx.engine.spawn_for_task(&t2).await;
        wait_until(|| async {
            fx.runtime.get(&t2.id).map(|v| v.is_pending).unwrap_or(false)
        })
        .await;

        assert!(fx.engine.stop_task(&t2.id).await);
        assert!(fx.runtime.get(&t2.id).is_none());

        // Stopping an unknown task reports false.
        assert!(!fx.engine.stop_task("does-not-exist").await);

        fx.engine.stop_task(&t1.id).await;
    }

    #[tokio::test]
    async fn test_pair_task_never_spawns() {
        let fx = EngineFixture::new(2, false).await;
        let mut task = fx.create_auto_task("Pair work", "").await;
        task.task_type = TaskType::Pair;
        fx.tasks
            .update(
                &task.id,
                crate::store::tasks::TaskUpdate {
                    task_type: Some(TaskType::Pair),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!fx.engine.spawn_for_task(&task).await);
        assert!(!fx.engine.is_running(&task.id).await);
    }

    #[tokio::test]
    async fn test_queued_message_triggers_respawn() {
        let fx = EngineFixture::new(2, false).await;
        fx.factory.push_impl(MockScript::respond("<complete/>"));
        // Second run consumes the queued message and completes for real.
        fx.factory.push_impl(MockScript::respond("<complete/>"));

        let task = fx.create_auto_task("Iterate", "src/iter.py").await;
        fx.queued
            .queue_message(&task.id, crate::messages::Lane::Implementation, "also do X")
            .await;
        fx.engine.spawn_for_task(&task).await;

        wait_until(|| async {
            fx.tasks.get(&task.id).await.unwrap().unwrap().status == TaskStatus::Review
                && !fx.engine.is_running(&task.id).await
        })
        .await;

        let scratchpad = fx.tasks.get_scratchpad(&task.id).await.unwrap();
        assert!(scratchpad.contains("--- USER MESSAGE ---"));
        assert!(scratchpad.contains("also do X"));
        // Two executions: the respawned run follows the first.
        assert_eq!(fx.executions.count_for_task(&task.id).await.unwrap(), 2);
    }
}
