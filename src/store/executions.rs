// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Execution ledger: session records, execution processes, append-only
//! logs, agent turns, and per-repo git state snapshots.
//!
//! Log entries are always read in `(inserted_at, id)` order.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::error::StoreError;
use crate::store::models::{
    full_id, CodingAgentTurn, ExecutionProcess, ExecutionProcessLog, ExecutionProcessRepoState,
    ExecutionRunReason, ExecutionStatus, SessionRecord, SessionStatus, SessionType,
};
use crate::store::{json_from_sql, opt_ts_from_sql, ts_from_sql, ts_to_sql, Store};

/// A page of execution log entries plus pagination metadata.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogPage {
    pub entries: Vec<ExecutionProcessLog>,
    pub total_events: i64,
    pub returned_events: i64,
    pub offset: i64,
    pub limit: i64,
    pub has_more: bool,
    pub next_offset: Option<i64>,
}

#[derive(Clone)]
pub struct ExecutionRepository {
    store: Store,
}

impl ExecutionRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create_session(
        &self,
        workspace_id: &str,
        session_type: SessionType,
        external_id: Option<&str>,
    ) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord {
            id: full_id(),
            workspace_id: workspace_id.to_string(),
            session_type,
            status: SessionStatus::Active,
            external_id: external_id.map(str::to_string),
            started_at: Utc::now(),
            ended_at: None,
        };
        let row = record.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO sessions
                        (id, workspace_id, session_type, status, external_id, started_at, ended_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        row.id,
                        row.workspace_id,
                        row.session_type.as_str(),
                        row.status.as_str(),
                        row.external_id,
                        ts_to_sql(row.started_at),
                        Option::<String>::None,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(record)
    }

    pub async fn close_session(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let id = session_id.to_string();
        self.store
            .with_conn(move |conn| {
                let updated = conn.execute(
                    "UPDATE sessions SET status = ?2, ended_at = ?3 WHERE id = ?1",
                    params![id, status.as_str(), ts_to_sql(Utc::now())],
                )?;
                if updated == 0 {
                    return Ok(None);
                }
                conn.query_row(
                    "SELECT id, workspace_id, session_type, status, external_id,
                            started_at, ended_at
                     FROM sessions WHERE id = ?1",
                    params![id],
                    row_to_session,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn close_session_by_external_id(
        &self,
        external_id: &str,
        status: SessionStatus,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let external = external_id.to_string();
        let id: Option<String> = self
            .store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id FROM sessions WHERE external_id = ?1",
                    params![external],
                    |row| row.get(0),
                )
                .optional()
                .map_err(Into::into)
            })
            .await?;
        match id {
            Some(id) => self.close_session(&id, status).await,
            None => Ok(None),
        }
    }

    pub async fn create_execution(
        &self,
        session_id: &str,
        run_reason: ExecutionRunReason,
        executor_action: serde_json::Value,
    ) -> Result<ExecutionProcess, StoreError> {
        let now = Utc::now();
        let execution = ExecutionProcess {
            id: full_id(),
            session_id: session_id.to_string(),
            run_reason,
            status: ExecutionStatus::Running,
            executor_action,
            metadata: serde_json::json!({}),
            started_at: now,
            updated_at: now,
            completed_at: None,
        };
        let row = execution.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO execution_processes
                        (id, session_id, run_reason, status, executor_action, metadata,
                         started_at, updated_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        row.id,
                        row.session_id,
                        row.run_reason.as_str(),
                        row.status.as_str(),
                        serde_json::to_string(&row.executor_action)?,
                        serde_json::to_string(&row.metadata)?,
                        ts_to_sql(row.started_at),
                        ts_to_sql(row.updated_at),
                        Option::<String>::None,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(execution)
    }

    /// Update execution status/completion; `metadata` keys are merged into
    /// the stored metadata object.
    pub async fn update_execution(
        &self,
        execution_id: &str,
        status: Option<ExecutionStatus>,
        completed_at: Option<DateTime<Utc>>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Option<ExecutionProcess>, StoreError> {
        let id = execution_id.to_string();
        self.store
            .with_conn(move |conn| {
                let existing = conn
                    .query_row(
                        &format!("SELECT {EXECUTION_COLUMNS} FROM execution_processes WHERE id = ?1"),
                        params![id],
                        row_to_execution,
                    )
                    .optional()?;
                let Some(mut execution) = existing else {
                    return Ok(None);
                };

                if let Some(status) = status {
                    execution.status = status;
                }
                if let Some(done) = completed_at {
                    execution.completed_at = Some(done);
                }
                if let Some(serde_json::Value::Object(extra)) = metadata {
                    if let serde_json::Value::Object(ref mut existing) = execution.metadata {
                        for (k, v) in extra {
                            existing.insert(k, v);
                        }
                    } else {
                        execution.metadata = serde_json::Value::Object(extra);
                    }
                }
                execution.updated_at = Utc::now();

                conn.execute(
                    "UPDATE execution_processes
                     SET status = ?2, metadata = ?3, updated_at = ?4, completed_at = ?5
                     WHERE id = ?1",
                    params![
                        execution.id,
                        execution.status.as_str(),
                        serde_json::to_string(&execution.metadata)?,
                        ts_to_sql(execution.updated_at),
                        execution.completed_at.map(ts_to_sql),
                    ],
                )?;
                Ok(Some(execution))
            })
            .await
    }

    pub async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionProcess>, StoreError> {
        let id = execution_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("SELECT {EXECUTION_COLUMNS} FROM execution_processes WHERE id = ?1"),
                    params![id],
                    row_to_execution,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn append_log(
        &self,
        execution_id: &str,
        logs: &str,
    ) -> Result<ExecutionProcessLog, StoreError> {
        let id = execution_id.to_string();
        let logs = logs.to_string();
        self.store
            .with_conn(move |conn| {
                let inserted_at = Utc::now();
                let byte_size = logs.len() as i64;
                conn.execute(
                    "INSERT INTO execution_process_logs
                        (execution_process_id, logs, byte_size, inserted_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, logs, byte_size, ts_to_sql(inserted_at)],
                )?;
                Ok(ExecutionProcessLog {
                    id: conn.last_insert_rowid(),
                    execution_process_id: id,
                    logs,
                    byte_size,
                    inserted_at,
                })
            })
            .await
    }

    /// All log entries for an execution joined into one aggregate row, or
    /// `None` when nothing was logged.
    pub async fn aggregated_logs(
        &self,
        execution_id: &str,
    ) -> Result<Option<ExecutionProcessLog>, StoreError> {
        let entries = self.log_entries(execution_id).await?;
        if entries.is_empty() {
            return Ok(None);
        }
        let combined = entries
            .iter()
            .filter(|e| !e.logs.is_empty())
            .map(|e| e.logs.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let total_bytes: i64 = entries.iter().map(|e| e.byte_size).sum();
        let latest = entries.last().expect("non-empty entries");
        Ok(Some(ExecutionProcessLog {
            id: latest.id,
            execution_process_id: execution_id.to_string(),
            logs: combined,
            byte_size: total_bytes,
            inserted_at: latest.inserted_at,
        }))
    }

    pub async fn log_entries(
        &self,
        execution_id: &str,
    ) -> Result<Vec<ExecutionProcessLog>, StoreError> {
        let id = execution_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, execution_process_id, logs, byte_size, inserted_at
                     FROM execution_process_logs
                     WHERE execution_process_id = ?1
                     ORDER BY inserted_at ASC, id ASC",
                )?;
                let rows = stmt.query_map(params![id], row_to_log)?;
                let mut entries = Vec::new();
                for row in rows {
                    entries.push(row?);
                }
                Ok(entries)
            })
            .await
    }

    /// Paginated log entries ordered by `(inserted_at, id)` ascending.
    pub async fn log_page(
        &self,
        execution_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<LogPage, StoreError> {
        let id = execution_id.to_string();
        self.store
            .with_conn(move |conn| {
                let total: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM execution_process_logs WHERE execution_process_id = ?1",
                    params![id],
                    |row| row.get(0),
                )?;
                let mut stmt = conn.prepare(
                    "SELECT id, execution_process_id, logs, byte_size, inserted_at
                     FROM execution_process_logs
                     WHERE execution_process_id = ?1
                     ORDER BY inserted_at ASC, id ASC
                     LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(params![id, limit, offset], row_to_log)?;
                let mut entries = Vec::new();
                for row in rows {
                    entries.push(row?);
                }
                let returned = entries.len() as i64;
                let has_more = offset + returned < total;
                Ok(LogPage {
                    entries,
                    total_events: total,
                    returned_events: returned,
                    offset,
                    limit,
                    has_more,
                    next_offset: has_more.then_some(offset + returned),
                })
            })
            .await
    }

    pub async fn append_turn(
        &self,
        execution_id: &str,
        prompt: Option<&str>,
        summary: Option<&str>,
        agent_session_id: Option<&str>,
        agent_message_id: Option<&str>,
    ) -> Result<CodingAgentTurn, StoreError> {
        let turn = CodingAgentTurn {
            id: full_id(),
            execution_process_id: execution_id.to_string(),
            prompt: prompt.map(str::to_string),
            summary: summary.map(str::to_string),
            agent_session_id: agent_session_id.map(str::to_string),
            agent_message_id: agent_message_id.map(str::to_string),
            seen: false,
            created_at: Utc::now(),
        };
        let row = turn.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO coding_agent_turns
                        (id, execution_process_id, prompt, summary, agent_session_id,
                         agent_message_id, seen, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        row.id,
                        row.execution_process_id,
                        row.prompt,
                        row.summary,
                        row.agent_session_id,
                        row.agent_message_id,
                        row.seen,
                        ts_to_sql(row.created_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(turn)
    }

    pub async fn list_turns(
        &self,
        execution_id: &str,
    ) -> Result<Vec<CodingAgentTurn>, StoreError> {
        let id = execution_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, execution_process_id, prompt, summary, agent_session_id,
                            agent_message_id, seen, created_at
                     FROM coding_agent_turns
                     WHERE execution_process_id = ?1
                     ORDER BY created_at ASC, id ASC",
                )?;
                let rows = stmt.query_map(params![id], row_to_turn)?;
                let mut turns = Vec::new();
                for row in rows {
                    turns.push(row?);
                }
                Ok(turns)
            })
            .await
    }

    pub async fn add_repo_state(
        &self,
        execution_id: &str,
        repo_id: &str,
        before_head_commit: Option<&str>,
        after_head_commit: Option<&str>,
        merge_commit: Option<&str>,
    ) -> Result<ExecutionProcessRepoState, StoreError> {
        let state = ExecutionProcessRepoState {
            id: full_id(),
            execution_process_id: execution_id.to_string(),
            repo_id: repo_id.to_string(),
            before_head_commit: before_head_commit.map(str::to_string),
            after_head_commit: after_head_commit.map(str::to_string),
            merge_commit: merge_commit.map(str::to_string),
        };
        let row = state.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO execution_process_repo_states
                        (id, execution_process_id, repo_id, before_head_commit,
                         after_head_commit, merge_commit)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.id,
                        row.execution_process_id,
                        row.repo_id,
                        row.before_head_commit,
                        row.after_head_commit,
                        row.merge_commit,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(state)
    }

    /// Total executions recorded for a task (via workspace sessions).
    pub async fn count_for_task(&self, task_id: &str) -> Result<i64, StoreError> {
        let id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*)
                     FROM execution_processes e
                     JOIN sessions s ON e.session_id = s.id
                     JOIN workspaces w ON s.workspace_id = w.id
                     WHERE w.task_id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .map_err(Into::into)
            })
            .await
    }

    pub async fn latest_for_task(
        &self,
        task_id: &str,
    ) -> Result<Option<ExecutionProcess>, StoreError> {
        let id = task_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {EXECUTION_COLUMNS_QUALIFIED}
                         FROM execution_processes e
                         JOIN sessions s ON e.session_id = s.id
                         JOIN workspaces w ON s.workspace_id = w.id
                         WHERE w.task_id = ?1
                         ORDER BY e.started_at DESC LIMIT 1"
                    ),
                    params![id],
                    row_to_execution,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    /// All executions still marked RUNNING, joined to their task ids. Used
    /// by startup reconciliation.
    pub async fn running_with_tasks(&self) -> Result<Vec<(ExecutionProcess, String)>, StoreError> {
        self.store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EXECUTION_COLUMNS_QUALIFIED}, w.task_id
                     FROM execution_processes e
                     JOIN sessions s ON e.session_id = s.id
                     JOIN workspaces w ON s.workspace_id = w.id
                     WHERE e.status = 'RUNNING'
                     ORDER BY e.started_at ASC"
                ))?;
                let rows = stmt.query_map([], |row| {
                    let execution = row_to_execution(row)?;
                    let task_id: String = row.get(9)?;
                    Ok((execution, task_id))
                })?;
                let mut result = Vec::new();
                for row in rows {
                    result.push(row?);
                }
                Ok(result)
            })
            .await
    }
}

const EXECUTION_COLUMNS: &str = "id, session_id, run_reason, status, executor_action, metadata,
    started_at, updated_at, completed_at";

const EXECUTION_COLUMNS_QUALIFIED: &str =
    "e.id, e.session_id, e.run_reason, e.status, e.executor_action, e.metadata,
     e.started_at, e.updated_at, e.completed_at";

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<ExecutionProcess> {
    let run_reason: String = row.get(2)?;
    let status: String = row.get(3)?;
    let executor_action: String = row.get(4)?;
    let metadata: String = row.get(5)?;
    let started_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;

    Ok(ExecutionProcess {
        id: row.get(0)?,
        session_id: row.get(1)?,
        run_reason: ExecutionRunReason::parse(&run_reason).unwrap_or(ExecutionRunReason::Manual),
        status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Failed),
        executor_action: json_from_sql(&executor_action),
        metadata: json_from_sql(&metadata),
        started_at: ts_from_sql(&started_at),
        updated_at: ts_from_sql(&updated_at),
        completed_at: opt_ts_from_sql(completed_at),
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    let session_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    let started_at: String = row.get(5)?;
    let ended_at: Option<String> = row.get(6)?;

    Ok(SessionRecord {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        session_type: SessionType::parse(&session_type).unwrap_or(SessionType::Acp),
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Closed),
        external_id: row.get(4)?,
        started_at: ts_from_sql(&started_at),
        ended_at: opt_ts_from_sql(ended_at),
    })
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<ExecutionProcessLog> {
    let inserted_at: String = row.get(4)?;
    Ok(ExecutionProcessLog {
        id: row.get(0)?,
        execution_process_id: row.get(1)?,
        logs: row.get(2)?,
        byte_size: row.get(3)?,
        inserted_at: ts_from_sql(&inserted_at),
    })
}

fn row_to_turn(row: &Row<'_>) -> rusqlite::Result<CodingAgentTurn> {
    let created_at: String = row.get(7)?;
    Ok(CodingAgentTurn {
        id: row.get(0)?,
        execution_process_id: row.get(1)?,
        prompt: row.get(2)?,
        summary: row.get(3)?,
        agent_session_id: row.get(4)?,
        agent_message_id: row.get(5)?,
        seen: row.get(6)?,
        created_at: ts_from_sql(&created_at),
    })
}
