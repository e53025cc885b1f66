// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core host: the single long-lived daemon owning all authoritative state.
//!
//! Lifecycle: `STOPPED -> STARTING -> RUNNING -> DRAINING -> STOPPED`.
//! Start acquires the instance lock, bootstraps the store and services,
//! binds the IPC transport, and writes the discovery files; stop tears all
//! of it down in reverse. Every request flows through [`HostState::
//! handle_request`]: admission, session binding, policy, idempotency,
//! dispatch, audit.

pub mod api;
pub mod binding;
pub mod dispatch;
pub mod idempotency;
pub mod lease;
pub mod plugins;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::acp::acp_agent_factory;
use crate::automation::AutomationEngine;
use crate::config::KaganConfig;
use crate::error::codes;
use crate::events::{DomainEvent, EventBus};
use crate::git::GitAdapter;
use crate::ipc::{CoreRequest, CoreResponse, EndpointInfo, IpcServer};
use crate::jobs::{JobActionExecutor, JobLedger};
use crate::limits::LEASE_HEARTBEAT_INTERVAL;
use crate::messages::QueuedMessageService;
use crate::runtime::RuntimeView;
use crate::sessions::TerminalSessionService;
use crate::store::models::TaskType;
use crate::store::{
    AuditRepository, ExecutionRepository, ProjectRepository, ProposalRepository, Store,
    TaskRepository, WorkspaceRepository,
};
use crate::workspace::WorkspaceService;

use api::KaganApi;
use binding::{enforce_profile, enforce_task_scope, SessionBindings};
use idempotency::{CachedResponse, IdempotencyCache, Reservation};
use lease::CoreInstanceLock;
use plugins::PluginRegistry;

/// State machine for the core host lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreHostStatus {
    Stopped,
    Starting,
    Running,
    Draining,
}

/// Job executor wired to the automation engine.
struct EngineJobExecutor {
    engine: AutomationEngine,
    tasks: TaskRepository,
}

#[async_trait]
impl JobActionExecutor for EngineJobExecutor {
    async fn execute(
        &self,
        action: &str,
        task_id: &str,
        _params: &serde_json::Value,
    ) -> Result<serde_json::Value, (String, String)> {
        match action {
            "start_agent" => {
                let task = self
                    .tasks
                    .get(task_id)
                    .await
                    .map_err(|e| (codes::INTERNAL_ERROR.to_string(), e.to_string()))?
                    .ok_or_else(|| {
                        (codes::NOT_FOUND.to_string(), format!("task {task_id}"))
                    })?;
                if task.task_type != TaskType::Auto {
                    return Err((
                        codes::TASK_TYPE_MISMATCH.to_string(),
                        "start_agent requires an AUTO task".to_string(),
                    ));
                }
                let spawned = self.engine.spawn_for_task(&task).await;
                Ok(serde_json::json!({ "spawned": spawned }))
            }
            "stop_agent" => {
                let stopped = self.engine.stop_task(task_id).await;
                Ok(serde_json::json!({ "stopped": stopped }))
            }
            other => Err((
                codes::UNSUPPORTED_ACTION.to_string(),
                format!("Unsupported job action: {other}"),
            )),
        }
    }

    async fn cancel(&self, action: &str, task_id: &str) {
        if action == "start_agent" {
            let _ = self.engine.stop_task(task_id).await;
        }
    }
}

/// Shared host state; the IPC handler and background tasks hold an `Arc`.
pub struct HostState {
    status: StdMutex<CoreHostStatus>,
    pub api: Arc<KaganApi>,
    pub events: EventBus,
    bindings: Mutex<SessionBindings>,
    idempotency: IdempotencyCache,
    pub plugins: StdMutex<PluginRegistry>,
    version: String,
    runtime_dir: PathBuf,
    client_count: AtomicUsize,
    last_disconnected: StdMutex<Option<Instant>>,
    instance_lock: StdMutex<CoreInstanceLock>,
    ipc: Mutex<Option<Arc<IpcServer>>>,
    background: StdMutex<Vec<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
}

/// The core daemon.
pub struct CoreHost {
    state: Arc<HostState>,
}

impl CoreHost {
    /// Bootstrap and start the daemon rooted at `data_dir`. Fails when
    /// another daemon holds the instance lock for the same directory.
    pub async fn start(config: KaganConfig, data_dir: PathBuf) -> crate::error::Result<Self> {
        let runtime_dir = data_dir.join("runtime");
        let mut instance_lock = CoreInstanceLock::new(
            runtime_dir.join("core.instance.lock"),
            runtime_dir.join("core.lease.json"),
        );
        std::fs::create_dir_all(&runtime_dir)?;
        if !instance_lock.acquire() {
            anyhow::bail!("Another core daemon is already running for this runtime directory");
        }

        match Self::start_inner(config, data_dir, runtime_dir, &mut instance_lock).await {
            Ok(host) => Ok(host),
            Err(e) => {
                instance_lock.release();
                Err(e)
            }
        }
    }

    async fn start_inner(
        config: KaganConfig,
        data_dir: PathBuf,
        runtime_dir: PathBuf,
        instance_lock: &mut CoreInstanceLock,
    ) -> crate::error::Result<Self> {
        info!("Core host starting (pid {})", std::process::id());

        let store = Store::open(&data_dir.join("kagan.db")).await?;
        let tasks = TaskRepository::new(store.clone());
        let projects = ProjectRepository::new(store.clone());
        let workspaces_repo = WorkspaceRepository::new(store.clone());
        let executions = ExecutionRepository::new(store.clone());
        let proposals = ProposalRepository::new(store.clone());
        let audit = AuditRepository::new(store.clone());

        let events = EventBus::new();
        let git = GitAdapter::new();
        let runtime = RuntimeView::new();
        let queued = QueuedMessageService::new();

        let workspaces = WorkspaceService::new(
            workspaces_repo,
            tasks.clone(),
            projects.clone(),
            git.clone(),
            events.clone(),
            data_dir.clone(),
        );

        let engine = AutomationEngine::new(
            tasks.clone(),
            executions.clone(),
            workspaces.clone(),
            config.clone(),
            runtime.clone(),
            queued.clone(),
            events.clone(),
            git.clone(),
            acp_agent_factory(),
        );

        // Task status changes feed the event bus, which the engine consumes.
        {
            let bus = events.clone();
            tasks.set_status_change_callback(Some(Arc::new(move |task_id, old, new| {
                bus.publish(DomainEvent::TaskStatusChanged {
                    task_id: task_id.to_string(),
                    from_status: old,
                    to_status: new,
                });
            })));
        }

        // Reconcile the runtime view against persisted executions before
        // the engine starts taking decisions.
        let running = executions.running_with_tasks().await?;
        let mut running_auto: Vec<(String, String)> = Vec::new();
        for (execution, task_id) in running {
            if let Some(task) = tasks.get(&task_id).await? {
                if task.task_type == TaskType::Auto {
                    running_auto.push((task_id, execution.id));
                }
            }
        }
        runtime.reconcile_startup_state(&running_auto);

        engine.start().await;
        events.publish(DomainEvent::CoreHostStarting);

        let jobs = JobLedger::new(Arc::new(EngineJobExecutor {
            engine: engine.clone(),
            tasks: tasks.clone(),
        }));
        let terminal_sessions = TerminalSessionService::new(&config);

        let version = env!("CARGO_PKG_VERSION").to_string();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(None::<String>);
        let api = Arc::new(KaganApi {
            version: version.clone(),
            settings: StdMutex::new(config.clone()),
            tasks,
            projects,
            executions,
            proposals,
            audit,
            workspaces,
            engine,
            jobs,
            terminal_sessions,
            queued,
            runtime,
            shutdown_tx,
        });

        let (stop_tx, _) = watch::channel(false);
        let state = Arc::new(HostState {
            status: StdMutex::new(CoreHostStatus::Starting),
            api,
            events: events.clone(),
            bindings: Mutex::new(SessionBindings::new()),
            idempotency: IdempotencyCache::new(),
            plugins: StdMutex::new(PluginRegistry::new()),
            version,
            runtime_dir: runtime_dir.clone(),
            client_count: AtomicUsize::new(0),
            last_disconnected: StdMutex::new(Some(Instant::now())),
            instance_lock: StdMutex::new(std::mem::replace(
                instance_lock,
                CoreInstanceLock::new(PathBuf::new(), PathBuf::new()),
            )),
            ipc: Mutex::new(None),
            background: StdMutex::new(Vec::new()),
            stop_tx,
        });

        // IPC server with a handler bound to the host state. Failures past
        // this point roll back the engine and the instance lock.
        let handler_state = Arc::clone(&state);
        let connect_state = Arc::clone(&state);
        let disconnect_state = Arc::clone(&state);
        let server = Arc::new(IpcServer::new(
            runtime_dir.clone(),
            config.general.core_transport_preference,
            &state.version,
            Arc::new(move |request| {
                let state = Arc::clone(&handler_state);
                Box::pin(async move { state.handle_request(request).await })
            }),
            Some(Arc::new(move || connect_state.on_client_connected())),
            Some(Arc::new(move |sessions| {
                disconnect_state.on_client_disconnected(sessions)
            })),
        ));
        let bind_result: crate::error::Result<EndpointInfo> = async {
            let endpoint = server.start().await?;
            state.write_runtime_files(&endpoint, server.token())?;
            Ok(endpoint)
        }
        .await;
        let endpoint = match bind_result {
            Ok(endpoint) => endpoint,
            Err(e) => {
                server.stop().await;
                state.api.engine.stop().await;
                state.cleanup_runtime_files();
                state
                    .instance_lock
                    .lock()
                    .expect("lock mutex poisoned")
                    .release();
                return Err(e);
            }
        };
        *state.ipc.lock().await = Some(Arc::clone(&server));

        // Lease heartbeat.
        let mut handles = Vec::new();
        {
            let heartbeat_state = Arc::clone(&state);
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(LEASE_HEARTBEAT_INTERVAL).await;
                    let result = heartbeat_state
                        .instance_lock
                        .lock()
                        .expect("lock mutex poisoned")
                        .heartbeat();
                    if let Err(e) = result {
                        warn!("Failed to write core lease heartbeat: {e}");
                    }
                }
            }));
        }

        // Idle shutdown watchdog.
        let idle_timeout = config.general.core_idle_timeout_seconds;
        if idle_timeout > 0 {
            let watchdog_state = Arc::clone(&state);
            let timeout = Duration::from_secs(idle_timeout);
            let check_interval = (timeout / 4).min(Duration::from_secs(30));
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(check_interval).await;
                    if watchdog_state.client_count.load(Ordering::SeqCst) > 0 {
                        continue;
                    }
                    let elapsed = {
                        let mut last = watchdog_state
                            .last_disconnected
                            .lock()
                            .expect("last disconnect lock poisoned");
                        match *last {
                            Some(at) => at.elapsed(),
                            None => {
                                *last = Some(Instant::now());
                                continue;
                            }
                        }
                    };
                    if elapsed >= timeout {
                        info!(
                            "Idle timeout reached with no clients ({elapsed:?} >= {timeout:?}), shutting down"
                        );
                        // Detached: stop() aborts the background tasks,
                        // this one included.
                        let stopping = Arc::clone(&watchdog_state);
                        tokio::spawn(async move { stopping.stop("idle timeout").await });
                        return;
                    }
                }
            }));
        }
        // core.shutdown requests stop the host after the response has gone
        // out.
        {
            let shutdown_state = Arc::clone(&state);
            handles.push(tokio::spawn(async move {
                while shutdown_rx.changed().await.is_ok() {
                    let reason = shutdown_rx.borrow().clone();
                    if let Some(reason) = reason {
                        // Give the core.shutdown response time to flush,
                        // then stop from a detached task (stop() aborts
                        // this one).
                        let stopping = Arc::clone(&shutdown_state);
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            stopping.stop(&reason).await;
                        });
                        return;
                    }
                }
            }));
        }
        *state.background.lock().expect("background lock poisoned") = handles;

        state.set_status(CoreHostStatus::Running);
        events.publish(DomainEvent::CoreHostRunning {
            transport: endpoint.transport.clone(),
            address: endpoint.address.clone(),
            port: endpoint.port,
        });
        info!(
            "Core host running: transport={} address={} port={:?}",
            endpoint.transport, endpoint.address, endpoint.port
        );

        Ok(Self { state })
    }

    pub fn status(&self) -> CoreHostStatus {
        self.state.status()
    }

    pub fn state(&self) -> &Arc<HostState> {
        &self.state
    }

    pub async fn stop(&self, reason: &str) {
        self.state.stop(reason).await;
    }

    /// Block until the host has fully stopped.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.state.stop_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl HostState {
    fn status(&self) -> CoreHostStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    fn set_status(&self, new_status: CoreHostStatus) {
        let mut status = self.status.lock().expect("status lock poisoned");
        debug!("Core host status: {:?} -> {new_status:?}", *status);
        *status = new_status;
    }

    fn on_client_connected(&self) {
        self.client_count.fetch_add(1, Ordering::SeqCst);
        *self
            .last_disconnected
            .lock()
            .expect("last disconnect lock poisoned") = None;
    }

    fn on_client_disconnected(self: &Arc<Self>, sessions: Vec<String>) {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut bindings = state.bindings.lock().await;
            for session_id in &sessions {
                bindings.unbind(session_id);
            }
        });

        let previous = self.client_count.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |count| Some(count.saturating_sub(1)),
        );
        if matches!(previous, Ok(1)) {
            *self
                .last_disconnected
                .lock()
                .expect("last disconnect lock poisoned") = Some(Instant::now());
        }
    }

    /// Gracefully stop the daemon.
    pub async fn stop(self: &Arc<Self>, reason: &str) {
        {
            let status = self.status();
            if matches!(status, CoreHostStatus::Draining | CoreHostStatus::Stopped) {
                return;
            }
        }
        self.set_status(CoreHostStatus::Draining);
        self.events.publish(DomainEvent::CoreHostDraining {
            reason: reason.to_string(),
        });

        for handle in self.background.lock().expect("background lock poisoned").drain(..) {
            handle.abort();
        }
        if let Some(server) = self.ipc.lock().await.take() {
            server.stop().await;
        }
        self.cleanup_runtime_files();

        self.api.engine.stop().await;

        self.bindings.lock().await.clear();
        self.idempotency.clear().await;
        self.instance_lock
            .lock()
            .expect("lock mutex poisoned")
            .release();

        self.events.publish(DomainEvent::CoreHostStopped);
        self.set_status(CoreHostStatus::Stopped);
        let _ = self.stop_tx.send(true);
        info!("Core host stopped: {reason}");
    }

    fn write_runtime_files(
        &self,
        endpoint: &EndpointInfo,
        token: &str,
    ) -> crate::error::Result<()> {
        std::fs::create_dir_all(&self.runtime_dir)?;
        std::fs::write(self.runtime_dir.join("core.token"), token)?;
        std::fs::write(
            self.runtime_dir.join("core.endpoint"),
            serde_json::to_string_pretty(endpoint)?,
        )?;
        Ok(())
    }

    fn cleanup_runtime_files(&self) {
        for name in ["core.endpoint", "core.token"] {
            let _ = std::fs::remove_file(self.runtime_dir.join(name));
        }
    }

    // ------------------------------------------------------------------
    // Request handling
    // ------------------------------------------------------------------

    /// Admission, policy, idempotency, dispatch, audit for one request.
    pub async fn handle_request(self: &Arc<Self>, request: CoreRequest) -> CoreResponse {
        if self.status() != CoreHostStatus::Running {
            return CoreResponse::failure(
                &request.request_id,
                codes::NOT_READY,
                "Core host is not running",
            );
        }

        let binding = {
            let mut bindings = self.bindings.lock().await;
            match bindings.get_or_bind(&request) {
                Ok(binding) => binding,
                Err(e) => {
                    let response =
                        CoreResponse::failure(&request.request_id, e.code, e.message);
                    self.record_audit(&request, &response, None).await;
                    return response;
                }
            }
        };

        // Plugin policy first; the profile allowlist applies only when no
        // plugin claims the pair.
        let plugin_decision = {
            let plugins = self.plugins.lock().expect("plugins lock poisoned");
            plugins.evaluate_policy(
                &request.capability,
                &request.method,
                &request.session_id,
                binding.profile,
                &request.params,
            )
        };
        let policy_result = match plugin_decision {
            Some(decision) if !decision.allowed => Err((decision.code, decision.message)),
            Some(_) => Ok(()),
            None => enforce_profile(&binding, &request.capability, &request.method)
                .map_err(|e| (e.code.to_string(), e.message)),
        };
        if let Err((code, message)) = policy_result {
            let response = CoreResponse::failure(&request.request_id, &code, message);
            self.record_audit(&request, &response, Some(&binding)).await;
            return response;
        }

        if let Err(e) = enforce_task_scope(&binding, &request) {
            let response = CoreResponse::failure(&request.request_id, e.code, e.message);
            self.record_audit(&request, &response, Some(&binding)).await;
            return response;
        }

        if binding.origin.requires_version_match() {
            let client_version = request.client_version.trim();
            if client_version.is_empty() {
                let response = CoreResponse::failure(
                    &request.request_id,
                    codes::MCP_OUTDATED,
                    "MCP client did not report its version. Restart the MCP client/session \
                     to load the latest kagan package.",
                );
                self.record_audit(&request, &response, Some(&binding)).await;
                return response;
            }
            if client_version != self.version {
                let response = CoreResponse::failure(
                    &request.request_id,
                    codes::MCP_OUTDATED,
                    format!(
                        "MCP client version '{client_version}' does not match core version \
                         '{}'. Restart the MCP client/session.",
                        self.version
                    ),
                );
                self.record_audit(&request, &response, Some(&binding)).await;
                return response;
            }
        }

        let response = self.dispatch_with_idempotency(&request).await;
        self.record_audit(&request, &response, Some(&binding)).await;
        response
    }

    fn is_idempotent_mutation(&self, request: &CoreRequest) -> bool {
        if dispatch::is_idempotent_mutation(&request.capability, &request.method) {
            return true;
        }
        let plugins = self.plugins.lock().expect("plugins lock poisoned");
        plugins
            .resolve_operation(&request.capability, &request.method)
            .map(|op| op.mutating)
            .unwrap_or(false)
    }

    async fn dispatch_with_idempotency(self: &Arc<Self>, request: &CoreRequest) -> CoreResponse {
        let Some(cache_key) = IdempotencyCache::cache_key(request) else {
            return self.dispatch_request(request).await;
        };
        if !self.is_idempotent_mutation(request) {
            return self.dispatch_request(request).await;
        }

        let fingerprint = idempotency::fingerprint(request);
        match self.idempotency.reserve(&cache_key, &fingerprint).await {
            Reservation::FingerprintMismatch => CoreResponse::failure(
                &request.request_id,
                codes::INVALID_PARAMS,
                "idempotency_key cannot be reused with different capability/method/params",
            ),
            Reservation::Cached(cached) => cached.to_response(&request.request_id),
            Reservation::Waiter(mut rx) => {
                if let Some(cached) = rx.borrow().clone() {
                    return cached.to_response(&request.request_id);
                }
                match rx.changed().await {
                    Ok(()) => match rx.borrow().clone() {
                        Some(cached) => cached.to_response(&request.request_id),
                        None => CoreResponse::failure(
                            &request.request_id,
                            codes::INTERNAL_ERROR,
                            "Owning request completed without a response",
                        ),
                    },
                    Err(_) => CoreResponse::failure(
                        &request.request_id,
                        codes::INTERNAL_ERROR,
                        "Owning request was abandoned",
                    ),
                }
            }
            Reservation::Owner => {
                let response = self.dispatch_request(request).await;
                self.idempotency
                    .store(&cache_key, CachedResponse::from_response(&response))
                    .await;
                response
            }
        }
    }

    async fn dispatch_request(self: &Arc<Self>, request: &CoreRequest) -> CoreResponse {
        let handler = dispatch::resolve(&request.capability, &request.method);
        let handler = match handler {
            Some(handler) => Some(handler),
            None => {
                let plugins = self.plugins.lock().expect("plugins lock poisoned");
                plugins
                    .resolve_operation(&request.capability, &request.method)
                    .map(|op| Arc::clone(&op.handler))
            }
        };
        let Some(handler) = handler else {
            return CoreResponse::failure(
                &request.request_id,
                codes::UNKNOWN_METHOD,
                format!("No handler for {}.{}", request.capability, request.method),
            );
        };

        match handler(Arc::clone(&self.api), request.params.clone()).await {
            Ok(result) => CoreResponse::success(&request.request_id, Some(result)),
            Err(e) => {
                let code = e.code();
                if code == codes::INTERNAL_ERROR {
                    error!(
                        "Handler error for {}.{}: {e}",
                        request.capability, request.method
                    );
                    CoreResponse::failure(
                        &request.request_id,
                        code,
                        format!(
                            "Internal error processing {}.{}",
                            request.capability, request.method
                        ),
                    )
                } else {
                    CoreResponse::failure(&request.request_id, code, e.to_string())
                }
            }
        }
    }

    /// Best-effort audit row; failures are logged, never surfaced.
    async fn record_audit(
        &self,
        request: &CoreRequest,
        response: &CoreResponse,
        binding: Option<&binding::SessionBinding>,
    ) {
        let mut payload = serde_json::json!({
            "params": request.params,
            "requested_profile": request.session_profile,
            "requested_origin": request.session_origin,
        });
        if let Some(binding) = binding {
            payload["effective_profile"] = serde_json::json!(binding.profile.as_str());
            payload["effective_origin"] = serde_json::json!(binding.origin.as_str());
            payload["namespace"] = serde_json::json!(binding.namespace);
        }

        let result_payload = if response.ok {
            response.result.clone().unwrap_or(serde_json::json!({}))
        } else {
            serde_json::json!({
                "error": {
                    "code": response.error.as_ref().map(|e| e.code.clone()),
                    "message": response.error.as_ref().map(|e| e.message.clone()),
                }
            })
        };

        let mut success = response.ok;
        if response.ok {
            if let Some(nested) = result_payload.get("success").and_then(|v| v.as_bool()) {
                success = nested;
            }
        }

        let result = self
            .api
            .audit
            .record(
                "session",
                &request.session_id,
                &request.session_id,
                &request.capability,
                &request.method,
                &payload.to_string(),
                &result_payload.to_string(),
                success,
            )
            .await;
        if let Err(e) = result {
            error!(
                "Failed to record audit event for {}.{}: {e}",
                request.capability, request.method
            );
        }
    }
}
