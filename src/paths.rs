// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Filesystem layout for per-user data and runtime files.
//!
//! Everything Kagan writes lives under `~/.kagan`:
//!
//! ```text
//! ~/.kagan/
//! ├── config.yaml            # user configuration
//! ├── kagan.db               # SQLite store
//! ├── worktrees/<ws_id>/     # per-workspace worktrees
//! ├── merge-worktrees/<repo> # conflict staging worktrees
//! └── runtime/
//!     ├── core.endpoint      # {transport, address, port?}
//!     ├── core.token         # bearer token, rotated each start
//!     ├── core.instance.lock # PID file held for the process lifetime
//!     └── core.lease.json    # {owner_pid, started_at, last_heartbeat}
//! ```
//!
//! Tests override the base via `KAGAN_HOME`.

use std::path::PathBuf;

/// Environment variable overriding the base directory (used by tests).
pub const HOME_ENV: &str = "KAGAN_HOME";

/// Base data directory (`~/.kagan` unless overridden).
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(HOME_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".kagan")
}

/// Path to the user config file.
pub fn config_path() -> PathBuf {
    data_dir().join("config.yaml")
}

/// Path to the SQLite database.
pub fn database_path() -> PathBuf {
    data_dir().join("kagan.db")
}

/// Base directory for per-workspace worktrees and merge worktrees.
pub fn worktree_base_dir() -> PathBuf {
    data_dir()
}

/// Runtime directory holding daemon discovery files.
pub fn runtime_dir() -> PathBuf {
    data_dir().join("runtime")
}

/// Endpoint descriptor file, present while the daemon runs.
pub fn endpoint_path() -> PathBuf {
    runtime_dir().join("core.endpoint")
}

/// Bearer token file, rotated on each daemon start.
pub fn token_path() -> PathBuf {
    runtime_dir().join("core.token")
}

/// Single-instance lock file.
pub fn instance_lock_path() -> PathBuf {
    runtime_dir().join("core.instance.lock")
}

/// Lease file refreshed by the heartbeat loop.
pub fn lease_path() -> PathBuf {
    runtime_dir().join("core.lease.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_files_under_runtime_dir() {
        let runtime = runtime_dir();
        assert!(endpoint_path().starts_with(&runtime));
        assert!(token_path().starts_with(&runtime));
        assert!(instance_lock_path().starts_with(&runtime));
        assert!(lease_path().starts_with(&runtime));
    }

    #[test]
    fn test_database_under_data_dir() {
        assert!(database_path().starts_with(data_dir()));
    }
}
