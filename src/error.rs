// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the Kagan core.
//!
//! Each subsystem owns a strongly-typed error enum built with `thiserror`;
//! `anyhow` is used for application-level propagation. Errors crossing the
//! IPC boundary are mapped to stable wire codes (see [`ApiError::code`]),
//! never leaked verbatim.

use thiserror::Error;

/// Errors raised by the SQLite store and its repositories.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store is closing")]
    Closing,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised by git subprocess operations.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("git {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("Not a git repository: {0}")]
    NotARepository(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for GitError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl GitError {
    /// Build a command failure from stderr output, classifying repo errors.
    pub fn from_output(command: &str, stderr: &str) -> Self {
        if stderr.contains("not a git repository") {
            return Self::NotARepository(stderr.trim().to_string());
        }
        Self::Command {
            command: command.to_string(),
            message: stderr.trim().to_string(),
        }
    }
}

/// Errors raised by the workspace service.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Workspace not found: {0}")]
    NotFound(String),

    #[error("Workspace has no repos: {0}")]
    NoRepos(String),

    #[error("Provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("Git error: {0}")]
    Git(#[from] GitError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Errors raised while driving an agent subprocess.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Agent failed to start: {0}")]
    SpawnFailed(String),

    #[error("Agent not ready after {0}ms")]
    ReadyTimeout(u64),

    #[error("Agent channel closed")]
    Disconnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors raised by the IPC transport and server.
#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Server not started")]
    NotStarted,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("IO error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl IpcError {
    pub fn from_io_error(context: &str, source: std::io::Error) -> Self {
        Self::Io {
            context: context.to_string(),
            source,
        }
    }
}

/// Errors raised by the job ledger.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("Job belongs to a different task")]
    TaskMismatch,
}

/// Errors raised by the terminal session service.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Stable wire error codes for IPC responses.
pub mod codes {
    pub const NOT_READY: &str = "NOT_READY";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const AUTH_STALE_TOKEN: &str = "AUTH_STALE_TOKEN";
    pub const UNKNOWN_METHOD: &str = "UNKNOWN_METHOD";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const MCP_OUTDATED: &str = "MCP_OUTDATED";
    pub const SCOPE_DENIED: &str = "SCOPE_DENIED";
    pub const ACTION_NOT_ALLOWED: &str = "ACTION_NOT_ALLOWED";
    pub const UNSUPPORTED_ACTION: &str = "UNSUPPORTED_ACTION";
    pub const JOB_TIMEOUT: &str = "JOB_TIMEOUT";
    pub const TASK_TYPE_MISMATCH: &str = "TASK_TYPE_MISMATCH";
    pub const REVIEW_BLOCKED_NO_PR: &str = "REVIEW_BLOCKED_NO_PR";
    pub const REVIEW_BLOCKED_LEASE: &str = "REVIEW_BLOCKED_LEASE";
    pub const REVIEW_GUARDRAIL_CHECK_FAILED: &str = "REVIEW_GUARDRAIL_CHECK_FAILED";
}

/// Error surfaced to IPC clients, carrying a stable wire code.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{message}")]
    Workflow { code: &'static str, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingParameter(_) | Self::InvalidParameter(_) => codes::INVALID_PARAMS,
            Self::NotFound(_) => codes::NOT_FOUND,
            Self::Workflow { code, .. } => code,
            Self::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    pub fn workflow(code: &'static str, message: impl Into<String>) -> Self {
        Self::Workflow {
            code,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::NotFound(msg) => Self::NotFound(msg),
            WorkspaceError::InvalidInput(msg) => Self::InvalidParameter(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(msg) => Self::NotFound(msg),
            JobError::UnsupportedAction(action) => Self::workflow(
                codes::UNSUPPORTED_ACTION,
                format!("Unsupported job action: {action}"),
            ),
            JobError::TaskMismatch => {
                Self::InvalidParameter("job_id does not belong to task_id".to_string())
            }
        }
    }
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_codes() {
        assert_eq!(
            ApiError::MissingParameter("task_id".into()).code(),
            codes::INVALID_PARAMS
        );
        assert_eq!(ApiError::NotFound("task".into()).code(), codes::NOT_FOUND);
        assert_eq!(
            ApiError::Internal("boom".into()).code(),
            codes::INTERNAL_ERROR
        );
        assert_eq!(
            ApiError::workflow(codes::TASK_TYPE_MISMATCH, "PAIR task").code(),
            codes::TASK_TYPE_MISMATCH
        );
    }

    #[test]
    fn test_store_error_from_rusqlite() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_git_error_classification() {
        let err = GitError::from_output("status", "fatal: not a git repository");
        assert!(matches!(err, GitError::NotARepository(_)));

        let err = GitError::from_output("merge", "error: merge failed");
        assert!(matches!(err, GitError::Command { .. }));
    }

    #[test]
    fn test_job_error_to_api_error() {
        let api: ApiError = JobError::UnsupportedAction("fly".into()).into();
        assert_eq!(api.code(), codes::UNSUPPORTED_ACTION);
    }
}
