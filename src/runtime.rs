// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory runtime view of per-task execution state.
//!
//! Nothing here is persisted: the view is rebuilt on startup from the
//! execution ledger and mutated by the automation engine as agents start,
//! attach, block, and end. The markers are synchronous so they can be called
//! from both async contexts and task-completion callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::agent::AgentHandle;

/// Live execution state for one task.
#[derive(Clone, Default)]
pub struct RuntimeTaskView {
    pub is_running: bool,
    pub is_reviewing: bool,
    pub is_pending: bool,
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    pub blocked_by_task_ids: Vec<String>,
    pub overlap_hints: Vec<String>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub pending_reason: Option<String>,
    pub execution_id: Option<String>,
    pub run_count: i64,
    pub running_agent: Option<AgentHandle>,
    pub review_agent: Option<AgentHandle>,
}

impl std::fmt::Debug for RuntimeTaskView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeTaskView")
            .field("is_running", &self.is_running)
            .field("is_reviewing", &self.is_reviewing)
            .field("is_pending", &self.is_pending)
            .field("is_blocked", &self.is_blocked)
            .field("blocked_reason", &self.blocked_reason)
            .field("blocked_by_task_ids", &self.blocked_by_task_ids)
            .field("overlap_hints", &self.overlap_hints)
            .field("execution_id", &self.execution_id)
            .field("run_count", &self.run_count)
            .field("has_running_agent", &self.running_agent.is_some())
            .field("has_review_agent", &self.review_agent.is_some())
            .finish()
    }
}

/// Process-wide map of task id to runtime view.
#[derive(Clone, Default)]
pub struct RuntimeView {
    views: Arc<Mutex<HashMap<String, RuntimeTaskView>>>,
}

impl RuntimeView {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_view<T>(&self, task_id: &str, f: impl FnOnce(&mut RuntimeTaskView) -> T) -> T {
        let mut views = self.views.lock().expect("runtime view lock poisoned");
        f(views.entry(task_id.to_string()).or_default())
    }

    pub fn get(&self, task_id: &str) -> Option<RuntimeTaskView> {
        self.views
            .lock()
            .expect("runtime view lock poisoned")
            .get(task_id)
            .cloned()
    }

    /// Task ids currently marked running.
    pub fn running_tasks(&self) -> Vec<String> {
        self.views
            .lock()
            .expect("runtime view lock poisoned")
            .iter()
            .filter(|(_, v)| v.is_running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn mark_started(&self, task_id: &str) {
        self.with_view(task_id, |view| {
            view.is_running = true;
            view.is_pending = false;
            view.pending_reason = None;
            view.is_blocked = false;
            view.blocked_reason = None;
            view.blocked_by_task_ids.clear();
            view.overlap_hints.clear();
            view.blocked_at = None;
        });
    }

    /// Remove the task's entry entirely; agents are dropped with it.
    pub fn mark_ended(&self, task_id: &str) {
        self.views
            .lock()
            .expect("runtime view lock poisoned")
            .remove(task_id);
    }

    pub fn attach_running_agent(&self, task_id: &str, agent: AgentHandle) {
        self.with_view(task_id, |view| {
            view.is_running = true;
            view.running_agent = Some(agent);
        });
    }

    pub fn attach_review_agent(&self, task_id: &str, agent: AgentHandle) {
        self.with_view(task_id, |view| {
            view.is_reviewing = true;
            view.review_agent = Some(agent);
        });
    }

    pub fn clear_review_agent(&self, task_id: &str) {
        self.with_view(task_id, |view| {
            view.is_reviewing = false;
            view.review_agent = None;
        });
    }

    pub fn mark_blocked(
        &self,
        task_id: &str,
        reason: &str,
        blocked_by_task_ids: &[String],
        overlap_hints: &[String],
    ) {
        self.with_view(task_id, |view| {
            view.is_blocked = true;
            view.blocked_reason = Some(reason.to_string());
            view.blocked_by_task_ids = blocked_by_task_ids.to_vec();
            view.overlap_hints = overlap_hints.to_vec();
            view.blocked_at = Some(Utc::now());
            view.is_pending = false;
            view.pending_reason = None;
        });
    }

    pub fn clear_blocked(&self, task_id: &str) {
        let mut views = self.views.lock().expect("runtime view lock poisoned");
        if let Some(view) = views.get_mut(task_id) {
            view.is_blocked = false;
            view.blocked_reason = None;
            view.blocked_by_task_ids.clear();
            view.overlap_hints.clear();
            view.blocked_at = None;
            if Self::is_empty(view) {
                views.remove(task_id);
            }
        }
    }

    pub fn mark_pending(&self, task_id: &str, reason: &str) {
        self.with_view(task_id, |view| {
            if view.is_running {
                return;
            }
            view.is_pending = true;
            view.pending_reason = Some(reason.to_string());
        });
    }

    pub fn clear_pending(&self, task_id: &str) {
        let mut views = self.views.lock().expect("runtime view lock poisoned");
        if let Some(view) = views.get_mut(task_id) {
            view.is_pending = false;
            view.pending_reason = None;
            if Self::is_empty(view) {
                views.remove(task_id);
            }
        }
    }

    pub fn set_execution(&self, task_id: &str, execution_id: &str, run_count: i64) {
        self.with_view(task_id, |view| {
            view.execution_id = Some(execution_id.to_string());
            view.run_count = run_count;
        });
    }

    /// Rebuild running flags from persisted executions at daemon startup.
    /// `running` pairs are (task_id, execution_id) rows still marked RUNNING,
    /// restricted by the caller to AUTO tasks that still exist.
    pub fn reconcile_startup_state(&self, running: &[(String, String)]) {
        let mut views = self.views.lock().expect("runtime view lock poisoned");
        views.clear();
        for (task_id, execution_id) in running {
            let view = views.entry(task_id.clone()).or_default();
            view.is_running = true;
            view.execution_id = Some(execution_id.clone());
        }
    }

    fn is_empty(view: &RuntimeTaskView) -> bool {
        !view.is_running
            && !view.is_reviewing
            && !view.is_pending
            && !view.is_blocked
            && view.running_agent.is_none()
            && view.review_agent.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_started_clears_pending_and_blocked() {
        let runtime = RuntimeView::new();
        runtime.mark_pending("t1", "queued");
        runtime.mark_blocked("t1", "conflict", &["t2".to_string()], &["src/a.rs".to_string()]);
        runtime.mark_started("t1");

        let view = runtime.get("t1").unwrap();
        assert!(view.is_running);
        assert!(!view.is_pending);
        assert!(!view.is_blocked);
        assert!(view.blocked_by_task_ids.is_empty());
    }

    #[test]
    fn test_mark_ended_removes_entry() {
        let runtime = RuntimeView::new();
        runtime.mark_started("t1");
        assert_eq!(runtime.running_tasks(), vec!["t1".to_string()]);

        runtime.mark_ended("t1");
        assert!(runtime.get("t1").is_none());
        assert!(runtime.running_tasks().is_empty());
    }

    #[test]
    fn test_blocked_view_fields() {
        let runtime = RuntimeView::new();
        runtime.mark_blocked(
            "t2",
            "Waiting on #aaaa1111 before starting",
            &["aaaa1111".to_string()],
            &["src/calculator.py".to_string()],
        );

        let view = runtime.get("t2").unwrap();
        assert!(view.is_blocked);
        assert_eq!(view.blocked_by_task_ids, vec!["aaaa1111"]);
        assert_eq!(view.overlap_hints, vec!["src/calculator.py"]);
        assert!(view.blocked_at.is_some());

        runtime.clear_blocked("t2");
        // Entry is garbage-collected once nothing remains set.
        assert!(runtime.get("t2").is_none());
    }

    #[test]
    fn test_pending_does_not_override_running() {
        let runtime = RuntimeView::new();
        runtime.mark_started("t1");
        runtime.mark_pending("t1", "queued for capacity");
        let view = runtime.get("t1").unwrap();
        assert!(view.is_running);
        assert!(!view.is_pending);
    }

    #[test]
    fn test_reconcile_startup_state() {
        let runtime = RuntimeView::new();
        runtime.mark_pending("stale", "queued");
        runtime.reconcile_startup_state(&[
            ("t1".to_string(), "e1".to_string()),
            ("t2".to_string(), "e2".to_string()),
        ]);

        assert!(runtime.get("stale").is_none());
        let view = runtime.get("t1").unwrap();
        assert!(view.is_running);
        assert_eq!(view.execution_id.as_deref(), Some("e1"));
        assert_eq!(runtime.running_tasks().len(), 2);
    }

    #[test]
    fn test_set_execution() {
        let runtime = RuntimeView::new();
        runtime.mark_started("t1");
        runtime.set_execution("t1", "e9", 3);
        let view = runtime.get("t1").unwrap();
        assert_eq!(view.execution_id.as_deref(), Some("e9"));
        assert_eq!(view.run_count, 3);
    }
}
