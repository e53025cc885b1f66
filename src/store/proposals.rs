// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Planner proposal drafts awaiting user approval.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use crate::error::StoreError;
use crate::store::models::{full_id, PlannerProposal, ProposalStatus};
use crate::store::{json_from_sql, ts_from_sql, ts_to_sql, Store};

#[derive(Clone)]
pub struct ProposalRepository {
    store: Store,
}

impl ProposalRepository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        project_id: &str,
        repo_id: Option<&str>,
        tasks_json: serde_json::Value,
        todos_json: serde_json::Value,
    ) -> Result<PlannerProposal, StoreError> {
        let now = Utc::now();
        let proposal = PlannerProposal {
            id: full_id(),
            project_id: project_id.to_string(),
            repo_id: repo_id.map(str::to_string),
            tasks_json,
            todos_json,
            status: ProposalStatus::Draft,
            created_at: now,
            updated_at: now,
        };
        let row = proposal.clone();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO planner_proposals
                        (id, project_id, repo_id, tasks_json, todos_json, status,
                         created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        row.id,
                        row.project_id,
                        row.repo_id,
                        serde_json::to_string(&row.tasks_json)?,
                        serde_json::to_string(&row.todos_json)?,
                        row.status.as_str(),
                        ts_to_sql(row.created_at),
                        ts_to_sql(row.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(proposal)
    }

    pub async fn get(&self, proposal_id: &str) -> Result<Option<PlannerProposal>, StoreError> {
        let id = proposal_id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT id, project_id, repo_id, tasks_json, todos_json, status,
                            created_at, updated_at
                     FROM planner_proposals WHERE id = ?1",
                    params![id],
                    row_to_proposal,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }

    pub async fn list_for_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<PlannerProposal>, StoreError> {
        let id = project_id.to_string();
        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, repo_id, tasks_json, todos_json, status,
                            created_at, updated_at
                     FROM planner_proposals WHERE project_id = ?1
                     ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![id], row_to_proposal)?;
                let mut proposals = Vec::new();
                for row in rows {
                    proposals.push(row?);
                }
                Ok(proposals)
            })
            .await
    }

    pub async fn set_status(
        &self,
        proposal_id: &str,
        status: ProposalStatus,
    ) -> Result<Option<PlannerProposal>, StoreError> {
        let id = proposal_id.to_string();
        self.store
            .with_conn(move |conn| {
                let updated = conn.execute(
                    "UPDATE planner_proposals SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, status.as_str(), ts_to_sql(Utc::now())],
                )?;
                if updated == 0 {
                    return Ok(None);
                }
                conn.query_row(
                    "SELECT id, project_id, repo_id, tasks_json, todos_json, status,
                            created_at, updated_at
                     FROM planner_proposals WHERE id = ?1",
                    params![id],
                    row_to_proposal,
                )
                .optional()
                .map_err(Into::into)
            })
            .await
    }
}

fn row_to_proposal(row: &Row<'_>) -> rusqlite::Result<PlannerProposal> {
    let tasks_json: String = row.get(3)?;
    let todos_json: String = row.get(4)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    let updated_at: String = row.get(7)?;
    Ok(PlannerProposal {
        id: row.get(0)?,
        project_id: row.get(1)?,
        repo_id: row.get(2)?,
        tasks_json: json_from_sql(&tasks_json),
        todos_json: json_from_sql(&todos_json),
        status: ProposalStatus::parse(&status).unwrap_or(ProposalStatus::Draft),
        created_at: ts_from_sql(&created_at),
        updated_at: ts_from_sql(&updated_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_proposal_lifecycle() {
        let proposals = ProposalRepository::new(Store::open_in_memory().await.unwrap());
        let created = proposals
            .create(
                "p1",
                None,
                serde_json::json!([{"title": "Add tests"}]),
                serde_json::json!([]),
            )
            .await
            .unwrap();
        assert_eq!(created.status, ProposalStatus::Draft);

        let approved = proposals
            .set_status(&created.id, ProposalStatus::Approved)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(approved.status, ProposalStatus::Approved);

        let listed = proposals.list_for_project("p1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].tasks_json[0]["title"], "Add tests");

        assert!(proposals
            .set_status("missing", ProposalStatus::Rejected)
            .await
            .unwrap()
            .is_none());
    }
}
