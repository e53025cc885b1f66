// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Asynchronous job ledger.
//!
//! Jobs decouple slow actions (starting or stopping an agent) from the IPC
//! request/response path: `submit` returns immediately with a queued job,
//! `wait` long-polls for a terminal status, `events` pages an append-only
//! trail, `cancel` propagates to the underlying action. The action set is
//! closed; unknown actions fail with `UNSUPPORTED_ACTION` so the caller can
//! recover via the action-listing tool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::error::JobError;
use crate::limits::WAIT_TIMEOUT_MAX;
use crate::store::models::full_id;

/// Actions the ledger accepts.
pub const SUPPORTED_ACTIONS: [&str; 2] = ["start_agent", "stop_agent"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One job's record.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub task_id: String,
    pub action: String,
    pub status: JobStatus,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub message: Option<String>,
    pub code: Option<String>,
}

/// One entry in a job's event trail.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub seq: usize,
    pub job_id: String,
    pub occurred_at: DateTime<Utc>,
    pub event: String,
    pub detail: Option<serde_json::Value>,
}

/// A page of job events with the standard pagination fields.
#[derive(Debug, Clone, Serialize)]
pub struct JobEventPage {
    pub events: Vec<JobEvent>,
    pub total_events: usize,
    pub returned_events: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
    pub next_offset: Option<usize>,
}

/// Outcome of `wait_job`.
#[derive(Debug, Clone, Serialize)]
pub struct JobWaitOutcome {
    pub record: JobRecord,
    pub timed_out: bool,
    pub requested_seconds: f64,
    pub waited_seconds: f64,
}

/// Executes job actions against the rest of the core.
#[async_trait]
pub trait JobActionExecutor: Send + Sync {
    /// Run the action to completion; `Err((code, message))` fails the job.
    async fn execute(
        &self,
        action: &str,
        task_id: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, (String, String)>;

    /// Best-effort cancellation of a running action.
    async fn cancel(&self, action: &str, task_id: &str);
}

struct JobEntry {
    record: JobRecord,
    events: Vec<JobEvent>,
    status_tx: watch::Sender<JobStatus>,
}

impl JobEntry {
    fn push_event(&mut self, event: &str, detail: Option<serde_json::Value>) {
        self.events.push(JobEvent {
            seq: self.events.len(),
            job_id: self.record.job_id.clone(),
            occurred_at: Utc::now(),
            event: event.to_string(),
            detail,
        });
    }

    fn set_status(&mut self, status: JobStatus) {
        self.record.status = status;
        self.record.updated_at = Utc::now();
        let _ = self.status_tx.send(status);
    }
}

/// In-memory job ledger.
#[derive(Clone)]
pub struct JobLedger {
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
    executor: Arc<dyn JobActionExecutor>,
}

impl JobLedger {
    pub fn new(executor: Arc<dyn JobActionExecutor>) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            executor,
        }
    }

    /// Submit a job and hand its action to the executor.
    pub async fn submit(
        &self,
        task_id: &str,
        action: &str,
        params: serde_json::Value,
    ) -> Result<JobRecord, JobError> {
        if !SUPPORTED_ACTIONS.contains(&action) {
            return Err(JobError::UnsupportedAction(action.to_string()));
        }

        let now = Utc::now();
        let record = JobRecord {
            job_id: full_id(),
            task_id: task_id.to_string(),
            action: action.to_string(),
            status: JobStatus::Queued,
            params: params.clone(),
            created_at: now,
            updated_at: now,
            result: None,
            message: None,
            code: None,
        };
        let job_id = record.job_id.clone();
        let (status_tx, _) = watch::channel(JobStatus::Queued);

        {
            let mut jobs = self.jobs.lock().await;
            let mut entry = JobEntry {
                record: record.clone(),
                events: Vec::new(),
                status_tx,
            };
            entry.push_event("submitted", Some(serde_json::json!({ "action": action })));
            jobs.insert(job_id.clone(), entry);
        }

        let ledger = self.clone();
        let task = task_id.to_string();
        let action = action.to_string();
        tokio::spawn(async move {
            ledger.run_job(&job_id, &task, &action, params).await;
        });

        Ok(record)
    }

    async fn run_job(&self, job_id: &str, task_id: &str, action: &str, params: serde_json::Value) {
        {
            let mut jobs = self.jobs.lock().await;
            let Some(entry) = jobs.get_mut(job_id) else {
                return;
            };
            if entry.record.status != JobStatus::Queued {
                // Cancelled before it started.
                return;
            }
            entry.set_status(JobStatus::Running);
            entry.push_event("started", None);
        }
        info!("Job {job_id}: running {action} for task {task_id}");

        let outcome = self.executor.execute(action, task_id, &params).await;

        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };
        if entry.record.status.is_terminal() {
            // Cancelled while running; keep the cancellation outcome.
            return;
        }
        match outcome {
            Ok(result) => {
                entry.record.result = Some(result);
                entry.push_event("succeeded", None);
                entry.set_status(JobStatus::Succeeded);
            }
            Err((code, message)) => {
                warn!("Job {job_id} failed: {code}: {message}");
                entry.record.code = Some(code.clone());
                entry.record.message = Some(message.clone());
                entry.push_event(
                    "failed",
                    Some(serde_json::json!({ "code": code, "message": message })),
                );
                entry.set_status(JobStatus::Failed);
            }
        }
    }

    async fn entry_record(&self, job_id: &str, task_id: &str) -> Result<JobRecord, JobError> {
        let jobs = self.jobs.lock().await;
        let entry = jobs
            .get(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if entry.record.task_id != task_id {
            return Err(JobError::TaskMismatch);
        }
        Ok(entry.record.clone())
    }

    pub async fn get(&self, job_id: &str, task_id: &str) -> Result<JobRecord, JobError> {
        self.entry_record(job_id, task_id).await
    }

    /// Block until the job reaches a terminal status or `timeout` elapses.
    /// The timeout is clamped to the server maximum; zero means a single
    /// non-blocking poll.
    pub async fn wait(
        &self,
        job_id: &str,
        task_id: &str,
        timeout: Duration,
    ) -> Result<JobWaitOutcome, JobError> {
        let requested_seconds = timeout.as_secs_f64();
        let timeout = timeout.min(WAIT_TIMEOUT_MAX);
        let started = std::time::Instant::now();

        let mut status_rx = {
            let jobs = self.jobs.lock().await;
            let entry = jobs
                .get(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            if entry.record.task_id != task_id {
                return Err(JobError::TaskMismatch);
            }
            entry.status_tx.subscribe()
        };

        let mut timed_out = false;
        loop {
            if status_rx.borrow().is_terminal() {
                break;
            }
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                timed_out = true;
                break;
            }
            match tokio::time::timeout(remaining, status_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        let record = self.entry_record(job_id, task_id).await?;
        Ok(JobWaitOutcome {
            timed_out: timed_out && !record.status.is_terminal(),
            record,
            requested_seconds,
            waited_seconds: started.elapsed().as_secs_f64(),
        })
    }

    /// Page through a job's event trail in append order.
    pub async fn events(
        &self,
        job_id: &str,
        task_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<JobEventPage, JobError> {
        let jobs = self.jobs.lock().await;
        let entry = jobs
            .get(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if entry.record.task_id != task_id {
            return Err(JobError::TaskMismatch);
        }

        let total = entry.events.len();
        let events: Vec<JobEvent> = entry
            .events
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        let returned = events.len();
        let has_more = offset + returned < total;
        Ok(JobEventPage {
            events,
            total_events: total,
            returned_events: returned,
            offset,
            limit,
            has_more,
            next_offset: has_more.then_some(offset + returned),
        })
    }

    /// Cancel a non-terminal job and propagate to the action.
    pub async fn cancel(&self, job_id: &str, task_id: &str) -> Result<JobRecord, JobError> {
        let action = {
            let mut jobs = self.jobs.lock().await;
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            if entry.record.task_id != task_id {
                return Err(JobError::TaskMismatch);
            }
            if entry.record.status.is_terminal() {
                return Ok(entry.record.clone());
            }
            entry.push_event("cancelled", None);
            entry.set_status(JobStatus::Cancelled);
            entry.record.action.clone()
        };

        self.executor.cancel(&action, task_id).await;
        self.entry_record(job_id, task_id).await
    }

    /// Records of all jobs for a task, newest first.
    pub async fn list_for_task(&self, task_id: &str) -> Vec<JobRecord> {
        let jobs = self.jobs.lock().await;
        let mut records: Vec<JobRecord> = jobs
            .values()
            .filter(|e| e.record.task_id == task_id)
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Executor that completes after an optional delay, or blocks forever.
    struct FakeExecutor {
        delay: Option<Duration>,
        fail: bool,
        cancels: AtomicUsize,
    }

    impl FakeExecutor {
        fn instant() -> Arc<Self> {
            Arc::new(Self {
                delay: Some(Duration::ZERO),
                fail: false,
                cancels: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                delay: Some(Duration::ZERO),
                fail: true,
                cancels: AtomicUsize::new(0),
            })
        }

        fn hanging() -> Arc<Self> {
            Arc::new(Self {
                delay: None,
                fail: false,
                cancels: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl JobActionExecutor for FakeExecutor {
        async fn execute(
            &self,
            action: &str,
            _task_id: &str,
            _params: &serde_json::Value,
        ) -> Result<serde_json::Value, (String, String)> {
            match self.delay {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    if self.fail {
                        Err(("INTERNAL_ERROR".to_string(), "boom".to_string()))
                    } else {
                        Ok(serde_json::json!({ "action": action }))
                    }
                }
                None => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }

        async fn cancel(&self, _action: &str, _task_id: &str) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_submit_then_wait_succeeds() {
        let ledger = JobLedger::new(FakeExecutor::instant());
        let job = ledger
            .submit("t1", "start_agent", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let outcome = ledger
            .wait(&job.job_id, "t1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.record.status, JobStatus::Succeeded);
        assert_eq!(
            outcome.record.result,
            Some(serde_json::json!({ "action": "start_agent" }))
        );

        // get returns the same terminal record.
        let fetched = ledger.get(&job.job_id, "t1").await.unwrap();
        assert_eq!(fetched.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_unsupported_action_rejected() {
        let ledger = JobLedger::new(FakeExecutor::instant());
        let result = ledger.submit("t1", "fly_to_moon", serde_json::json!({})).await;
        assert!(matches!(result, Err(JobError::UnsupportedAction(_))));
    }

    #[tokio::test]
    async fn test_wait_zero_timeout_polls_once() {
        let ledger = JobLedger::new(FakeExecutor::hanging());
        let job = ledger
            .submit("t1", "start_agent", serde_json::json!({}))
            .await
            .unwrap();

        let outcome = ledger
            .wait(&job.job_id, "t1", Duration::ZERO)
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.record.status.is_terminal());
        assert!(outcome.waited_seconds < 1.0);
    }

    #[tokio::test]
    async fn test_failed_job_carries_code_and_message() {
        let ledger = JobLedger::new(FakeExecutor::failing());
        let job = ledger
            .submit("t1", "stop_agent", serde_json::json!({}))
            .await
            .unwrap();

        let outcome = ledger
            .wait(&job.job_id, "t1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.record.status, JobStatus::Failed);
        assert_eq!(outcome.record.code.as_deref(), Some("INTERNAL_ERROR"));
        assert_eq!(outcome.record.message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_executor() {
        let executor = FakeExecutor::hanging();
        let ledger = JobLedger::new(Arc::clone(&executor) as Arc<dyn JobActionExecutor>);
        let job = ledger
            .submit("t1", "start_agent", serde_json::json!({}))
            .await
            .unwrap();

        let record = ledger.cancel(&job.job_id, "t1").await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(executor.cancels.load(Ordering::SeqCst), 1);

        // Cancelling a terminal job is a no-op.
        let again = ledger.cancel(&job.job_id, "t1").await.unwrap();
        assert_eq!(again.status, JobStatus::Cancelled);
        assert_eq!(executor.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_task_scope_enforced() {
        let ledger = JobLedger::new(FakeExecutor::instant());
        let job = ledger
            .submit("t1", "start_agent", serde_json::json!({}))
            .await
            .unwrap();

        assert!(matches!(
            ledger.get(&job.job_id, "other").await,
            Err(JobError::TaskMismatch)
        ));
        assert!(matches!(
            ledger.get("missing", "t1").await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_event_pagination_contract() {
        let ledger = JobLedger::new(FakeExecutor::instant());
        let job = ledger
            .submit("t1", "start_agent", serde_json::json!({}))
            .await
            .unwrap();
        ledger
            .wait(&job.job_id, "t1", Duration::from_secs(5))
            .await
            .unwrap();

        // submitted, started, succeeded.
        let page = ledger.events(&job.job_id, "t1", 2, 0).await.unwrap();
        assert_eq!(page.total_events, 3);
        assert_eq!(page.returned_events, 2);
        assert!(page.has_more);
        assert_eq!(page.next_offset, Some(2));
        assert_eq!(page.events[0].event, "submitted");

        let page = ledger.events(&job.job_id, "t1", 10, 2).await.unwrap();
        assert_eq!(page.returned_events, 1);
        assert!(!page.has_more);
        assert_eq!(page.events[0].event, "succeeded");
        assert_eq!(page.next_offset, None);
    }
}
