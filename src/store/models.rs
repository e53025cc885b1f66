// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent entity types and their enums.
//!
//! Rows are plain structs mapped by hand in the repositories; enums are
//! stored as their uppercase wire strings.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kanban column for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Backlog,
    InProgress,
    Review,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "BACKLOG",
            Self::InProgress => "IN_PROGRESS",
            Self::Review => "REVIEW",
            Self::Done => "DONE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BACKLOG" => Some(Self::Backlog),
            "IN_PROGRESS" => Some(Self::InProgress),
            "REVIEW" => Some(Self::Review),
            "DONE" => Some(Self::Done),
            _ => None,
        }
    }

    /// Board ordering: BACKLOG < IN_PROGRESS < REVIEW < DONE.
    pub fn board_order(self) -> i64 {
        match self {
            Self::Backlog => 0,
            Self::InProgress => 1,
            Self::Review => 2,
            Self::Done => 3,
        }
    }
}

/// Task priority lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Med,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Med => "MED",
            Self::High => "HIGH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(Self::Low),
            "MED" => Some(Self::Med),
            "HIGH" => Some(Self::High),
            _ => None,
        }
    }

    pub fn rank(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Med => 1,
            Self::High => 2,
        }
    }
}

/// How a task is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Driven by the autonomous agent loop.
    Auto,
    /// A human works inside a terminal/editor attached to the worktree.
    Pair,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Pair => "PAIR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AUTO" => Some(Self::Auto),
            "PAIR" => Some(Self::Pair),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceStatus {
    Active,
    Archived,
}

impl WorkspaceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "ARCHIVED" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionType {
    Acp,
    Pair,
    Resolution,
}

impl SessionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acp => "ACP",
            Self::Pair => "PAIR",
            Self::Resolution => "RESOLUTION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACP" => Some(Self::Acp),
            "PAIR" => Some(Self::Pair),
            "RESOLUTION" => Some(Self::Resolution),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "CLOSED" => Some(Self::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "KILLED" => Some(Self::Killed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionRunReason {
    #[serde(rename = "CODINGAGENT")]
    CodingAgent,
    Review,
    Manual,
}

impl ExecutionRunReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CodingAgent => "CODINGAGENT",
            Self::Review => "REVIEW",
            Self::Manual => "MANUAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CODINGAGENT" => Some(Self::CodingAgent),
            "REVIEW" => Some(Self::Review),
            "MANUAL" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Draft,
    Approved,
    Rejected,
}

impl ProposalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(Self::Draft),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// A project groups one or more repos and their tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub last_opened_at: Option<DateTime<Utc>>,
}

/// A git repository registered with Kagan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: String,
    /// Resolved filesystem path.
    pub path: String,
    pub name: String,
    pub display_name: String,
    pub default_branch: String,
    /// Optional named scripts (setup, test, ...) as JSON.
    pub scripts: serde_json::Value,
}

/// Junction row: membership of a repo in a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRepo {
    pub project_id: String,
    pub repo_id: String,
    pub is_primary: bool,
    pub display_order: i64,
}

/// A task on the Kanban board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// 8-hex identifier.
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub task_type: TaskType,
    pub terminal_backend: Option<String>,
    pub agent_backend: Option<String>,
    pub parent_id: Option<String>,
    pub base_branch: Option<String>,
    pub acceptance_criteria: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub checks_passed: Option<bool>,
    pub review_summary: Option<String>,
    pub merge_failed: bool,
    pub merge_error: Option<String>,
    pub merge_readiness: Option<String>,
}

impl Task {
    /// Build a new BACKLOG task with a fresh 8-hex id.
    pub fn new(project_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: short_id(),
            project_id: project_id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Backlog,
            priority: Priority::Med,
            task_type: TaskType::Auto,
            terminal_backend: None,
            agent_backend: None,
            parent_id: None,
            base_branch: None,
            acceptance_criteria: Vec::new(),
            created_at: now,
            updated_at: now,
            checks_passed: None,
            review_summary: None,
            merge_failed: false,
            merge_error: None,
            merge_readiness: None,
        }
    }
}

/// A workspace: one logical checkout-set for a task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub project_id: String,
    pub task_id: String,
    /// Workspace root directory holding the per-repo worktrees.
    pub path: String,
    pub branch_name: String,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One worktree of one repo inside a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRepo {
    pub workspace_id: String,
    pub repo_id: String,
    pub target_branch: String,
    pub worktree_path: String,
    pub created_at: DateTime<Utc>,
}

/// An agent or terminal session bound to a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub workspace_id: String,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub external_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// One agent invocation within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProcess {
    pub id: String,
    pub session_id: String,
    pub run_reason: ExecutionRunReason,
    pub status: ExecutionStatus,
    pub executor_action: serde_json::Value,
    pub metadata: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Append-only log entry for an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProcessLog {
    pub id: i64,
    pub execution_process_id: String,
    pub logs: String,
    pub byte_size: i64,
    pub inserted_at: DateTime<Utc>,
}

/// Snapshot of git heads around an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProcessRepoState {
    pub id: String,
    pub execution_process_id: String,
    pub repo_id: String,
    pub before_head_commit: Option<String>,
    pub after_head_commit: Option<String>,
    pub merge_commit: Option<String>,
}

/// One prompt/response turn of a coding agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodingAgentTurn {
    pub id: String,
    pub execution_process_id: String,
    pub prompt: Option<String>,
    pub summary: Option<String>,
    pub agent_session_id: Option<String>,
    pub agent_message_id: Option<String>,
    pub seen: bool,
    pub created_at: DateTime<Utc>,
}

/// Planner-emitted draft awaiting user approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerProposal {
    pub id: String,
    pub project_id: String,
    pub repo_id: Option<String>,
    pub tasks_json: serde_json::Value,
    pub todos_json: serde_json::Value,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a merge attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRecord {
    pub id: String,
    pub workspace_id: String,
    pub strategy: String,
    pub success: bool,
    pub message: String,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
    pub conflict_op: Option<String>,
    pub conflict_files: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Immutable audit trail entry, one per handled IPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub occurred_at: DateTime<Utc>,
    pub actor_type: String,
    pub actor_id: String,
    pub session_id: String,
    pub capability: String,
    pub command_name: String,
    pub payload_json: String,
    pub result_json: String,
    pub success: bool,
}

/// Workspace repo row joined with its repo, plus change summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRepoView {
    pub repo_id: String,
    pub repo_name: String,
    pub repo_path: String,
    pub worktree_path: String,
    pub target_branch: String,
    pub has_changes: bool,
    pub diff_stats: Option<HashMap<String, i64>>,
}

/// Generate an 8-hex identifier (task/workspace ids).
pub fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Generate a full-length identifier.
pub fn full_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            TaskStatus::Backlog,
            TaskStatus::InProgress,
            TaskStatus::Review,
            TaskStatus::Done,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("bogus"), None);
    }

    #[test]
    fn test_board_order() {
        assert!(TaskStatus::Backlog.board_order() < TaskStatus::InProgress.board_order());
        assert!(TaskStatus::Review.board_order() < TaskStatus::Done.board_order());
    }

    #[test]
    fn test_priority_rank() {
        assert!(Priority::High.rank() > Priority::Med.rank());
        assert!(Priority::Med.rank() > Priority::Low.rank());
    }

    #[test]
    fn test_short_id_shape() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("p1", "Fix login bug");
        assert_eq!(task.status, TaskStatus::Backlog);
        assert_eq!(task.task_type, TaskType::Auto);
        assert!(!task.merge_failed);
        assert!(task.acceptance_criteria.is_empty());
    }

    #[test]
    fn test_enum_wire_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
        assert_eq!(
            serde_json::to_string(&ExecutionRunReason::CodingAgent).unwrap(),
            "\"CODINGAGENT\""
        );
    }
}
