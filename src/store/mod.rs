// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! SQLite persistence layer.
//!
//! A single [`Store`] owns the connection (WAL mode, foreign keys on) and
//! serialises access behind an async mutex; repositories are thin typed
//! views over it. Writes therefore commit in lock-acquisition order, which
//! keeps task status-change notifications linearisable.

pub mod audit;
pub mod executions;
pub mod models;
pub mod projects;
pub mod proposals;
pub mod tasks;
pub mod workspaces;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::StoreError;

pub use audit::AuditRepository;
pub use executions::ExecutionRepository;
pub use projects::ProjectRepository;
pub use proposals::ProposalRepository;
pub use tasks::TaskRepository;
pub use workspaces::WorkspaceRepository;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    last_opened_at TEXT
);

CREATE TABLE IF NOT EXISTS repos (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    display_name TEXT NOT NULL,
    default_branch TEXT NOT NULL DEFAULT 'main',
    scripts TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS project_repos (
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    repo_id TEXT NOT NULL REFERENCES repos(id),
    is_primary INTEGER NOT NULL DEFAULT 0,
    display_order INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (project_id, repo_id)
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id),
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    priority TEXT NOT NULL,
    task_type TEXT NOT NULL,
    terminal_backend TEXT,
    agent_backend TEXT,
    parent_id TEXT,
    base_branch TEXT,
    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    checks_passed INTEGER,
    review_summary TEXT,
    merge_failed INTEGER NOT NULL DEFAULT 0,
    merge_error TEXT,
    merge_readiness TEXT
);

CREATE TABLE IF NOT EXISTS task_links (
    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    ref_task_id TEXT NOT NULL,
    PRIMARY KEY (task_id, ref_task_id)
);

CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    task_id TEXT NOT NULL,
    path TEXT NOT NULL,
    branch_name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workspace_repos (
    workspace_id TEXT NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
    repo_id TEXT NOT NULL,
    target_branch TEXT NOT NULL,
    worktree_path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (workspace_id, repo_id)
);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    session_type TEXT NOT NULL,
    status TEXT NOT NULL,
    external_id TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT
);

CREATE TABLE IF NOT EXISTS execution_processes (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    run_reason TEXT NOT NULL,
    status TEXT NOT NULL,
    executor_action TEXT NOT NULL DEFAULT '{}',
    metadata TEXT NOT NULL DEFAULT '{}',
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS execution_process_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_process_id TEXT NOT NULL REFERENCES execution_processes(id) ON DELETE CASCADE,
    logs TEXT NOT NULL,
    byte_size INTEGER NOT NULL,
    inserted_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS execution_process_repo_states (
    id TEXT PRIMARY KEY,
    execution_process_id TEXT NOT NULL REFERENCES execution_processes(id) ON DELETE CASCADE,
    repo_id TEXT NOT NULL,
    before_head_commit TEXT,
    after_head_commit TEXT,
    merge_commit TEXT
);

CREATE TABLE IF NOT EXISTS coding_agent_turns (
    id TEXT PRIMARY KEY,
    execution_process_id TEXT NOT NULL REFERENCES execution_processes(id) ON DELETE CASCADE,
    prompt TEXT,
    summary TEXT,
    agent_session_id TEXT,
    agent_message_id TEXT,
    seen INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scratch (
    id TEXT NOT NULL,
    scratch_type TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (id, scratch_type)
);

CREATE TABLE IF NOT EXISTS planner_proposals (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    repo_id TEXT,
    tasks_json TEXT NOT NULL DEFAULT '[]',
    todos_json TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'DRAFT',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS merges (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    strategy TEXT NOT NULL,
    success INTEGER NOT NULL,
    message TEXT NOT NULL,
    commit_sha TEXT,
    pr_url TEXT,
    conflict_op TEXT,
    conflict_files TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    occurred_at TEXT NOT NULL,
    actor_type TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    capability TEXT NOT NULL,
    command_name TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    result_json TEXT NOT NULL,
    success INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_workspaces_task ON workspaces(task_id);
CREATE INDEX IF NOT EXISTS idx_sessions_workspace ON sessions(workspace_id);
CREATE INDEX IF NOT EXISTS idx_executions_session ON execution_processes(session_id);
CREATE INDEX IF NOT EXISTS idx_execution_logs_execution
    ON execution_process_logs(execution_process_id, inserted_at, id);
CREATE INDEX IF NOT EXISTS idx_turns_execution ON coding_agent_turns(execution_process_id);
CREATE INDEX IF NOT EXISTS idx_audit_occurred ON audit_events(occurred_at);
"#;

/// Shared handle to the SQLite database.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Store {
    /// Open or create the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Database(format!("create db directory: {e}")))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory database (tests).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute_batch(SCHEMA_SQL)?;

        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
        }

        Self::apply_compat_shims(&conn)?;
        Ok(())
    }

    /// Lightweight shims for databases created by earlier releases: add
    /// missing nullable columns rather than running a full migration.
    fn apply_compat_shims(conn: &Connection) -> Result<(), StoreError> {
        let mut stmt = conn.prepare("PRAGMA table_info(tasks)")?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for (column, ddl) in [
            (
                "terminal_backend",
                "ALTER TABLE tasks ADD COLUMN terminal_backend TEXT",
            ),
            (
                "merge_readiness",
                "ALTER TABLE tasks ADD COLUMN merge_readiness TEXT",
            ),
        ] {
            if !columns.iter().any(|c| c == column) {
                conn.execute(ddl, [])?;
            }
        }
        Ok(())
    }

    /// Run `f` with exclusive access to the connection.
    pub async fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().await;
        f(&mut conn)
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Format a timestamp for storage.
pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a stored timestamp; malformed values collapse to the epoch rather
/// than poisoning reads.
pub(crate) fn ts_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default())
}

/// Parse an optional stored timestamp.
pub(crate) fn opt_ts_from_sql(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| ts_from_sql(&s))
}

/// Parse a stored JSON column, defaulting on corruption.
pub(crate) fn json_from_sql(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_schema() {
        let store = Store::open_in_memory().await.unwrap();
        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='tasks'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_schema_version_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kagan.db");

        let store = Store::open(&path).await.unwrap();
        drop(store);
        let store = Store::open(&path).await.unwrap();

        let versions: i64 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(versions, 1);
    }

    #[tokio::test]
    async fn test_compat_shim_adds_terminal_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.db");

        // Simulate a legacy database lacking the column.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE tasks (
                    id TEXT PRIMARY KEY, project_id TEXT NOT NULL, title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '', status TEXT NOT NULL,
                    priority TEXT NOT NULL, task_type TEXT NOT NULL,
                    agent_backend TEXT, parent_id TEXT, base_branch TEXT,
                    acceptance_criteria TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL, updated_at TEXT NOT NULL,
                    checks_passed INTEGER, review_summary TEXT,
                    merge_failed INTEGER NOT NULL DEFAULT 0, merge_error TEXT,
                    merge_readiness TEXT
                );",
            )
            .unwrap();
        }

        let store = Store::open(&path).await.unwrap();
        let has_column: bool = store
            .with_conn(|conn| {
                let mut stmt = conn.prepare("PRAGMA table_info(tasks)")?;
                let columns: Vec<String> = stmt
                    .query_map([], |row| row.get::<_, String>(1))?
                    .collect::<Result<_, _>>()?;
                Ok(columns.iter().any(|c| c == "terminal_backend"))
            })
            .await
            .unwrap();
        assert!(has_column);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let parsed = ts_from_sql(&ts_to_sql(now));
        assert_eq!(parsed.timestamp(), now.timestamp());
    }

    #[test]
    fn test_malformed_timestamp_defaults() {
        assert_eq!(ts_from_sql("garbage").timestamp(), 0);
    }
}
