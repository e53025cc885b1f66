// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Append-only audit trail.

use chrono::Utc;
use rusqlite::{params, Row};

use crate::error::StoreError;
use crate::store::models::AuditEvent;
use crate::store::{ts_from_sql, ts_to_sql, Store};

#[derive(Clone)]
pub struct AuditRepository {
    store: Store,
}

impl AuditRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        &self,
        actor_type: &str,
        actor_id: &str,
        session_id: &str,
        capability: &str,
        command_name: &str,
        payload_json: &str,
        result_json: &str,
        success: bool,
    ) -> Result<(), StoreError> {
        let actor_type = actor_type.to_string();
        let actor_id = actor_id.to_string();
        let session_id = session_id.to_string();
        let capability = capability.to_string();
        let command_name = command_name.to_string();
        let payload_json = payload_json.to_string();
        let result_json = result_json.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO audit_events
                        (occurred_at, actor_type, actor_id, session_id, capability,
                         command_name, payload_json, result_json, success)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        ts_to_sql(Utc::now()),
                        actor_type,
                        actor_id,
                        session_id,
                        capability,
                        command_name,
                        payload_json,
                        result_json,
                        success,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Most recent events, newest first, optionally filtered by capability.
    pub async fn tail(
        &self,
        capability: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let capability = capability.map(str::to_string);
        self.store
            .with_conn(move |conn| {
                let mut events = Vec::new();
                match capability {
                    Some(cap) => {
                        let mut stmt = conn.prepare(
                            "SELECT id, occurred_at, actor_type, actor_id, session_id,
                                    capability, command_name, payload_json, result_json, success
                             FROM audit_events WHERE capability = ?1
                             ORDER BY id DESC LIMIT ?2",
                        )?;
                        let rows = stmt.query_map(params![cap, limit], row_to_event)?;
                        for row in rows {
                            events.push(row?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(
                            "SELECT id, occurred_at, actor_type, actor_id, session_id,
                                    capability, command_name, payload_json, result_json, success
                             FROM audit_events ORDER BY id DESC LIMIT ?1",
                        )?;
                        let rows = stmt.query_map(params![limit], row_to_event)?;
                        for row in rows {
                            events.push(row?);
                        }
                    }
                }
                Ok(events)
            })
            .await
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        self.store
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM audit_events", [], |row| row.get(0))
                    .map_err(Into::into)
            })
            .await
    }
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<AuditEvent> {
    let occurred_at: String = row.get(1)?;
    Ok(AuditEvent {
        id: row.get(0)?,
        occurred_at: ts_from_sql(&occurred_at),
        actor_type: row.get(2)?,
        actor_id: row.get(3)?,
        session_id: row.get(4)?,
        capability: row.get(5)?,
        command_name: row.get(6)?,
        payload_json: row.get(7)?,
        result_json: row.get(8)?,
        success: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_tail() {
        let audit = AuditRepository::new(Store::open_in_memory().await.unwrap());
        for i in 0..3 {
            audit
                .record(
                    "session",
                    "s1",
                    "s1",
                    "tasks",
                    &format!("method{i}"),
                    "{}",
                    "{}",
                    true,
                )
                .await
                .unwrap();
        }
        audit
            .record("session", "s1", "s1", "jobs", "submit", "{}", "{}", false)
            .await
            .unwrap();

        let all = audit.tail(None, 10).await.unwrap();
        assert_eq!(all.len(), 4);
        // Newest first.
        assert_eq!(all[0].capability, "jobs");
        assert!(!all[0].success);

        let tasks_only = audit.tail(Some("tasks"), 2).await.unwrap();
        assert_eq!(tasks_only.len(), 2);
        assert_eq!(tasks_only[0].command_name, "method2");

        assert_eq!(audit.count().await.unwrap(), 4);
    }
}
