// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task repository: board CRUD, links, scratchpad, change notifications.
//!
//! Status-change callbacks fire after the mutating transaction commits, in
//! commit order (writes are serialised by the store's connection mutex).

use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::error::StoreError;
use crate::limits::SCRATCHPAD_LIMIT;
use crate::store::models::{Priority, Task, TaskStatus, TaskType};
use crate::store::{json_from_sql, ts_from_sql, ts_to_sql, Store};

/// Callback invoked on any task mutation.
pub type ChangeCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback invoked when a task's status changes: (task_id, old, new).
/// `old = None` on create, `new = None` on delete.
pub type StatusChangeCallback =
    Arc<dyn Fn(&str, Option<TaskStatus>, Option<TaskStatus>) + Send + Sync>;

/// Field updates accepted by [`TaskRepository::update`]. `None` leaves the
/// stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub task_type: Option<TaskType>,
    pub terminal_backend: Option<String>,
    pub agent_backend: Option<String>,
    pub base_branch: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
    pub checks_passed: Option<bool>,
    pub review_summary: Option<String>,
    pub merge_failed: Option<bool>,
    pub merge_error: Option<Option<String>>,
    pub merge_readiness: Option<String>,
}

#[derive(Clone)]
pub struct TaskRepository {
    store: Store,
    on_change: Arc<StdMutex<Option<ChangeCallback>>>,
    on_status_change: Arc<StdMutex<Option<StatusChangeCallback>>>,
}

impl TaskRepository {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            on_change: Arc::new(StdMutex::new(None)),
            on_status_change: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn set_change_callback(&self, callback: Option<ChangeCallback>) {
        *self.on_change.lock().expect("callback lock poisoned") = callback;
    }

    pub fn set_status_change_callback(&self, callback: Option<StatusChangeCallback>) {
        *self
            .on_status_change
            .lock()
            .expect("callback lock poisoned") = callback;
    }

    fn notify_change(&self, task_id: &str) {
        if let Some(cb) = self.on_change.lock().expect("callback lock poisoned").clone() {
            cb(task_id);
        }
    }

    fn notify_status_change(
        &self,
        task_id: &str,
        old: Option<TaskStatus>,
        new: Option<TaskStatus>,
    ) {
        if let Some(cb) = self
            .on_status_change
            .lock()
            .expect("callback lock poisoned")
            .clone()
        {
            cb(task_id, old, new);
        }
    }

    pub async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let row = task.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (
                        id, project_id, title, description, status, priority, task_type,
                        terminal_backend, agent_backend, parent_id, base_branch,
                        acceptance_criteria, created_at, updated_at, checks_passed,
                        review_summary, merge_failed, merge_error, merge_readiness
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                              ?15, ?16, ?17, ?18, ?19)",
                    params![
                        row.id,
                        row.project_id,
                        row.title,
                        row.description,
                        row.status.as_str(),
                        row.priority.as_str(),
                        row.task_type.as_str(),
                        row.terminal_backend,
                        row.agent_backend,
                        row.parent_id,
                        row.base_branch,
                        serde_json::to_string(&row.acceptance_criteria)?,
                        ts_to_sql(row.created_at),
                        ts_to_sql(row.updated_at),
                        row.checks_passed,
                        row.review_summary,
                        row.merge_failed,
                        row.merge_error,
                        row.merge_readiness,
                    ],
                )?;
                Ok(())
            })
            .await?;

        self.notify_change(&task.id);
        self.notify_status_change(&task.id, None, Some(task.status));
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let task_id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                    params![task_id],
                    row_to_task,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    /// All tasks, board order: status, priority descending, created ascending.
    pub async fn get_all(&self, project_id: Option<&str>) -> Result<Vec<Task>, StoreError> {
        let project_id = project_id.map(str::to_string);
        self.store
            .with_conn(move |conn| {
                let order = "ORDER BY CASE status
                        WHEN 'BACKLOG' THEN 0 WHEN 'IN_PROGRESS' THEN 1
                        WHEN 'REVIEW' THEN 2 WHEN 'DONE' THEN 3 ELSE 99 END,
                    CASE priority WHEN 'HIGH' THEN 2 WHEN 'MED' THEN 1 ELSE 0 END DESC,
                    created_at ASC";
                let mut tasks = Vec::new();
                match project_id {
                    Some(pid) => {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {TASK_COLUMNS} FROM tasks WHERE project_id = ?1 {order}"
                        ))?;
                        let rows = stmt.query_map(params![pid], row_to_task)?;
                        for row in rows {
                            tasks.push(row?);
                        }
                    }
                    None => {
                        let mut stmt =
                            conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks {order}"))?;
                        let rows = stmt.query_map([], row_to_task)?;
                        for row in rows {
                            tasks.push(row?);
                        }
                    }
                }
                Ok(tasks)
            })
            .await
    }

    pub async fn get_by_status(
        &self,
        status: TaskStatus,
        project_id: Option<&str>,
    ) -> Result<Vec<Task>, StoreError> {
        let all = self.get_all(project_id).await?;
        Ok(all.into_iter().filter(|t| t.status == status).collect())
    }

    /// Apply field updates; fires status callback when the status changed.
    pub async fn update(
        &self,
        task_id: &str,
        update: TaskUpdate,
    ) -> Result<Option<Task>, StoreError> {
        let id = task_id.to_string();
        let result = self
            .store
            .with_conn(move |conn| {
                let existing: Option<Task> = conn
                    .query_row(
                        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                        params![id],
                        row_to_task,
                    )
                    .optional()?;
                let Some(mut task) = existing else {
                    return Ok(None);
                };
                let old_status = task.status;

                if let Some(v) = update.title {
                    task.title = v;
                }
                if let Some(v) = update.description {
                    task.description = v;
                }
                if let Some(v) = update.status {
                    task.status = v;
                }
                if let Some(v) = update.priority {
                    task.priority = v;
                }
                if let Some(v) = update.task_type {
                    task.task_type = v;
                }
                if let Some(v) = update.terminal_backend {
                    task.terminal_backend = Some(v);
                }
                if let Some(v) = update.agent_backend {
                    task.agent_backend = Some(v);
                }
                if let Some(v) = update.base_branch {
                    task.base_branch = Some(v);
                }
                if let Some(v) = update.acceptance_criteria {
                    task.acceptance_criteria = v;
                }
                if let Some(v) = update.checks_passed {
                    task.checks_passed = Some(v);
                }
                if let Some(v) = update.review_summary {
                    task.review_summary = Some(v);
                }
                if let Some(v) = update.merge_failed {
                    task.merge_failed = v;
                }
                if let Some(v) = update.merge_error {
                    task.merge_error = v;
                }
                if let Some(v) = update.merge_readiness {
                    task.merge_readiness = Some(v);
                }
                task.updated_at = Utc::now();

                conn.execute(
                    "UPDATE tasks SET
                        title = ?2, description = ?3, status = ?4, priority = ?5,
                        task_type = ?6, terminal_backend = ?7, agent_backend = ?8,
                        base_branch = ?9, acceptance_criteria = ?10, updated_at = ?11,
                        checks_passed = ?12, review_summary = ?13, merge_failed = ?14,
                        merge_error = ?15, merge_readiness = ?16
                    WHERE id = ?1",
                    params![
                        task.id,
                        task.title,
                        task.description,
                        task.status.as_str(),
                        task.priority.as_str(),
                        task.task_type.as_str(),
                        task.terminal_backend,
                        task.agent_backend,
                        task.base_branch,
                        serde_json::to_string(&task.acceptance_criteria)?,
                        ts_to_sql(task.updated_at),
                        task.checks_passed,
                        task.review_summary,
                        task.merge_failed,
                        task.merge_error,
                        task.merge_readiness,
                    ],
                )?;
                Ok(Some((task, old_status)))
            })
            .await?;

        let Some((task, old_status)) = result else {
            return Ok(None);
        };
        if task.status != old_status {
            self.notify_status_change(&task.id, Some(old_status), Some(task.status));
        }
        self.notify_change(&task.id);
        Ok(Some(task))
    }

    /// Move a task to a new status column.
    pub async fn move_to(
        &self,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<Option<Task>, StoreError> {
        self.update(
            task_id,
            TaskUpdate {
                status: Some(status),
                ..TaskUpdate::default()
            },
        )
        .await
    }

    /// Delete a task and its links. Returns true when a row was removed.
    pub async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
        let id = task_id.to_string();
        let old_status = self
            .store
            .with_conn(move |conn| {
                let status: Option<String> = conn
                    .query_row(
                        "SELECT status FROM tasks WHERE id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(status) = status else {
                    return Ok(None);
                };
                conn.execute(
                    "DELETE FROM task_links WHERE task_id = ?1 OR ref_task_id = ?1",
                    params![id],
                )?;
                conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
                Ok(TaskStatus::parse(&status))
            })
            .await?;

        match old_status {
            Some(status) => {
                self.notify_change(task_id);
                self.notify_status_change(task_id, Some(status), None);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Search by exact id or case-insensitive title/description match.
    pub async fn search(&self, query: &str) -> Result<Vec<Task>, StoreError> {
        let query = query.trim().to_string();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .with_conn(move |conn| {
                let pattern = format!("%{query}%");
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE id = ?1 OR title LIKE ?2 COLLATE NOCASE
                        OR description LIKE ?2 COLLATE NOCASE
                     ORDER BY updated_at DESC"
                ))?;
                let rows = stmt.query_map(params![query, pattern], row_to_task)?;
                let mut tasks = Vec::new();
                for row in rows {
                    tasks.push(row?);
                }
                Ok(tasks)
            })
            .await
    }

    /// Task counts per status column.
    pub async fn counts(&self) -> Result<Vec<(TaskStatus, i64)>, StoreError> {
        self.store
            .with_conn(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                let mut counts: Vec<(TaskStatus, i64)> = [
                    TaskStatus::Backlog,
                    TaskStatus::InProgress,
                    TaskStatus::Review,
                    TaskStatus::Done,
                ]
                .into_iter()
                .map(|s| (s, 0))
                .collect();
                for row in rows {
                    let (status, count) = row?;
                    if let Some(status) = TaskStatus::parse(&status) {
                        if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == status) {
                            entry.1 = count;
                        }
                    }
                }
                Ok(counts)
            })
            .await
    }

    /// Replace all outgoing task links, skipping self-references.
    pub async fn replace_links(
        &self,
        task_id: &str,
        ref_task_ids: &[String],
    ) -> Result<(), StoreError> {
        let id = task_id.to_string();
        let mut refs: Vec<String> = ref_task_ids
            .iter()
            .filter(|r| r.as_str() != task_id)
            .cloned()
            .collect();
        refs.sort();
        refs.dedup();

        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM task_links WHERE task_id = ?1", params![id])?;
                for ref_id in &refs {
                    tx.execute(
                        "INSERT INTO task_links (task_id, ref_task_id) VALUES (?1, ?2)",
                        params![id, ref_id],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn get_links(&self, task_id: &str) -> Result<Vec<String>, StoreError> {
        let id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT ref_task_id FROM task_links WHERE task_id = ?1 ORDER BY ref_task_id",
                )?;
                let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
                let mut refs = Vec::new();
                for row in rows {
                    refs.push(row?);
                }
                Ok(refs)
            })
            .await
    }

    /// Scratchpad content for a task (empty when absent).
    pub async fn get_scratchpad(&self, task_id: &str) -> Result<String, StoreError> {
        let id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                let payload: Option<String> = conn
                    .query_row(
                        "SELECT payload FROM scratch
                         WHERE id = ?1 AND scratch_type = 'WORKSPACE_NOTES'",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(payload) = payload else {
                    return Ok(String::new());
                };
                let value = json_from_sql(&payload);
                Ok(value
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string())
            })
            .await
    }

    /// Write scratchpad content, keeping the trailing [`SCRATCHPAD_LIMIT`]
    /// bytes.
    pub async fn update_scratchpad(&self, task_id: &str, content: &str) -> Result<(), StoreError> {
        let id = task_id.to_string();
        let content = crate::limits::tail_bytes(content, SCRATCHPAD_LIMIT).to_string();
        self.store
            .with_conn(move |conn| {
                let payload = serde_json::to_string(&serde_json::json!({ "content": content }))?;
                let now = ts_to_sql(Utc::now());
                conn.execute(
                    "INSERT INTO scratch (id, scratch_type, payload, created_at, updated_at)
                     VALUES (?1, 'WORKSPACE_NOTES', ?2, ?3, ?3)
                     ON CONFLICT (id, scratch_type)
                     DO UPDATE SET payload = ?2, updated_at = ?3",
                    params![id, payload, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete_scratchpad(&self, task_id: &str) -> Result<(), StoreError> {
        let id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "DELETE FROM scratch WHERE id = ?1 AND scratch_type = 'WORKSPACE_NOTES'",
                    params![id],
                )?;
                Ok(())
            })
            .await
    }
}

const TASK_COLUMNS: &str = "id, project_id, title, description, status, priority, task_type,
    terminal_backend, agent_backend, parent_id, base_branch, acceptance_criteria,
    created_at, updated_at, checks_passed, review_summary, merge_failed, merge_error,
    merge_readiness";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(4)?;
    let priority: String = row.get(5)?;
    let task_type: String = row.get(6)?;
    let criteria_raw: String = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Backlog),
        priority: Priority::parse(&priority).unwrap_or(Priority::Med),
        task_type: TaskType::parse(&task_type).unwrap_or(TaskType::Auto),
        terminal_backend: row.get(7)?,
        agent_backend: row.get(8)?,
        parent_id: row.get(9)?,
        base_branch: row.get(10)?,
        acceptance_criteria: serde_json::from_str(&criteria_raw).unwrap_or_default(),
        created_at: ts_from_sql(&created_at),
        updated_at: ts_from_sql(&updated_at),
        checks_passed: row.get(14)?,
        review_summary: row.get(15)?,
        merge_failed: row.get(16)?,
        merge_error: row.get(17)?,
        merge_readiness: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn repo() -> TaskRepository {
        let store = Store::open_in_memory().await.unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO projects (id, name, description, created_at)
                     VALUES ('p1', 'Test', '', ?1)",
                    params![ts_to_sql(Utc::now())],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        TaskRepository::new(store)
    }

    #[tokio::test]
    async fn test_create_then_get_round_trip() {
        let repo = repo().await;
        let mut task = Task::new("p1", "Fix login bug");
        task.description = "see src/login.py".to_string();
        task.acceptance_criteria = vec!["works".to_string(), "tested".to_string()];
        repo.create(&task).await.unwrap();

        let fetched = repo.get(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Fix login bug");
        assert_eq!(fetched.description, "see src/login.py");
        assert_eq!(fetched.status, TaskStatus::Backlog);
        assert_eq!(fetched.acceptance_criteria, vec!["works", "tested"]);
    }

    #[tokio::test]
    async fn test_board_ordering() {
        let repo = repo().await;
        let mut low = Task::new("p1", "low prio");
        low.priority = Priority::Low;
        let mut high = Task::new("p1", "high prio");
        high.priority = Priority::High;
        let mut review = Task::new("p1", "in review");
        review.status = TaskStatus::Review;

        repo.create(&low).await.unwrap();
        repo.create(&review).await.unwrap();
        repo.create(&high).await.unwrap();

        let all = repo.get_all(Some("p1")).await.unwrap();
        let titles: Vec<_> = all.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["high prio", "low prio", "in review"]);
    }

    #[tokio::test]
    async fn test_status_change_callback_fires_on_transition() {
        let repo = repo().await;
        let task = Task::new("p1", "watched");
        repo.create(&task).await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        repo.set_status_change_callback(Some(Arc::new(move |_, old, new| {
            assert_eq!(old, Some(TaskStatus::Backlog));
            assert_eq!(new, Some(TaskStatus::InProgress));
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })));

        repo.move_to(&task.id, TaskStatus::InProgress).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Non-status update must not fire the status callback.
        repo.update(
            &task.id,
            TaskUpdate {
                title: Some("renamed".to_string()),
                ..TaskUpdate::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_cascades_links() {
        let repo = repo().await;
        let a = Task::new("p1", "a");
        let b = Task::new("p1", "b");
        repo.create(&a).await.unwrap();
        repo.create(&b).await.unwrap();
        repo.replace_links(&a.id, &[b.id.clone()]).await.unwrap();

        assert!(repo.delete(&a.id).await.unwrap());
        assert!(repo.get(&a.id).await.unwrap().is_none());
        assert!(repo.get_links(&a.id).await.unwrap().is_empty());
        // Deleting again reports false.
        assert!(!repo.delete(&a.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_links_skip_self_reference() {
        let repo = repo().await;
        let a = Task::new("p1", "a");
        let b = Task::new("p1", "b");
        repo.create(&a).await.unwrap();
        repo.create(&b).await.unwrap();

        repo.replace_links(&a.id, &[a.id.clone(), b.id.clone()])
            .await
            .unwrap();
        assert_eq!(repo.get_links(&a.id).await.unwrap(), vec![b.id.clone()]);
    }

    #[tokio::test]
    async fn test_scratchpad_round_trip_and_cap() {
        let repo = repo().await;
        let task = Task::new("p1", "notes");
        repo.create(&task).await.unwrap();

        assert_eq!(repo.get_scratchpad(&task.id).await.unwrap(), "");

        repo.update_scratchpad(&task.id, "first note").await.unwrap();
        assert_eq!(repo.get_scratchpad(&task.id).await.unwrap(), "first note");

        let huge = "y".repeat(SCRATCHPAD_LIMIT + 500);
        repo.update_scratchpad(&task.id, &huge).await.unwrap();
        let stored = repo.get_scratchpad(&task.id).await.unwrap();
        assert_eq!(stored.len(), SCRATCHPAD_LIMIT);
    }

    #[tokio::test]
    async fn test_search_by_id_and_text() {
        let repo = repo().await;
        let task = Task::new("p1", "Fix the parser");
        repo.create(&task).await.unwrap();

        assert_eq!(repo.search(&task.id).await.unwrap().len(), 1);
        assert_eq!(repo.search("PARSER").await.unwrap().len(), 1);
        assert!(repo.search("nothing here").await.unwrap().is_empty());
        assert!(repo.search("   ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_counts() {
        let repo = repo().await;
        repo.create(&Task::new("p1", "one")).await.unwrap();
        let mut t = Task::new("p1", "two");
        t.status = TaskStatus::Done;
        repo.create(&t).await.unwrap();

        let counts = repo.counts().await.unwrap();
        let get = |s: TaskStatus| counts.iter().find(|(k, _)| *k == s).unwrap().1;
        assert_eq!(get(TaskStatus::Backlog), 1);
        assert_eq!(get(TaskStatus::Done), 1);
        assert_eq!(get(TaskStatus::Review), 0);
    }
}
