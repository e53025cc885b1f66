// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Single-instance lock and lease for the core daemon.
//!
//! Two filesystem artefacts enforce one daemon per runtime directory:
//!
//! - `core.instance.lock` - PID file held for the process lifetime.
//! - `core.lease.json` - `{owner_pid, started_at, last_heartbeat}`,
//!   refreshed every ~5 s.
//!
//! Readers MUST treat a stale heartbeat as "no owner" and may attempt
//! takeover only when the recorded PID is no longer live.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::limits::LEASE_STALE_AFTER;

/// Lock paths held by this process. A PID file alone cannot distinguish
/// "this process already runs a daemon here" from "we are re-acquiring our
/// own lock".
static HELD_PATHS: Lazy<StdMutex<HashSet<PathBuf>>> =
    Lazy::new(|| StdMutex::new(HashSet::new()));

/// Contents of `core.lease.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreLease {
    pub owner_pid: u32,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl CoreLease {
    /// A lease is stale when its heartbeat is older than the threshold.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat);
        age.num_milliseconds() > LEASE_STALE_AFTER.as_millis() as i64
    }
}

/// Whether a PID refers to a live process. On Linux this checks `/proc`;
/// elsewhere liveness is unknown and callers fall back to heartbeat
/// staleness.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        false
    }
}

/// Filesystem lock enforcing a single daemon per runtime directory.
pub struct CoreInstanceLock {
    lock_path: PathBuf,
    lease_path: PathBuf,
    started_at: Option<DateTime<Utc>>,
}

impl CoreInstanceLock {
    pub fn new(lock_path: PathBuf, lease_path: PathBuf) -> Self {
        Self {
            lock_path,
            lease_path,
            started_at: None,
        }
    }

    /// Try to acquire the lock. An existing lock is taken over only when
    /// its owner is provably gone (dead PID, or unknown liveness plus a
    /// stale lease).
    pub fn acquire(&mut self) -> bool {
        if self.started_at.is_some() {
            return true;
        }
        if HELD_PATHS
            .lock()
            .expect("held paths lock poisoned")
            .contains(&self.lock_path)
        {
            return false;
        }

        if let Some(owner_pid) = self.read_lock_pid() {
            if owner_pid != std::process::id() {
                let lease = self.read_lease();
                let owner_gone = match lease {
                    Some(lease) => {
                        !pid_alive(owner_pid)
                            && (cfg!(target_os = "linux") || lease.is_stale(Utc::now()))
                    }
                    None => !pid_alive(owner_pid),
                };
                if !owner_gone {
                    return false;
                }
                warn!("Taking over stale instance lock from pid {owner_pid}");
            }
        }

        if let Some(parent) = self.lock_path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return false;
            }
        }
        let pid = std::process::id();
        if std::fs::write(&self.lock_path, pid.to_string()).is_err() {
            return false;
        }
        self.started_at = Some(Utc::now());
        HELD_PATHS
            .lock()
            .expect("held paths lock poisoned")
            .insert(self.lock_path.clone());
        if let Err(e) = self.write_lease() {
            warn!("Failed to write initial lease: {e}");
        }
        info!("Acquired instance lock (pid {pid})");
        true
    }

    /// Refresh the lease heartbeat.
    pub fn heartbeat(&self) -> std::io::Result<()> {
        self.write_lease()
    }

    /// Release the lock and remove both artefacts.
    pub fn release(&mut self) {
        if self.started_at.is_none() {
            return;
        }
        // Only remove a lock we own.
        if self.read_lock_pid() == Some(std::process::id()) {
            let _ = std::fs::remove_file(&self.lock_path);
        }
        let _ = std::fs::remove_file(&self.lease_path);
        HELD_PATHS
            .lock()
            .expect("held paths lock poisoned")
            .remove(&self.lock_path);
        self.started_at = None;
    }

    pub fn is_held(&self) -> bool {
        self.started_at.is_some()
    }

    fn write_lease(&self) -> std::io::Result<()> {
        let lease = CoreLease {
            owner_pid: std::process::id(),
            started_at: self.started_at.unwrap_or_else(Utc::now),
            last_heartbeat: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&lease)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.lease_path, json)
    }

    fn read_lock_pid(&self) -> Option<u32> {
        let raw = std::fs::read_to_string(&self.lock_path).ok()?;
        raw.trim().parse().ok()
    }

    fn read_lease(&self) -> Option<CoreLease> {
        let raw = std::fs::read_to_string(&self.lease_path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_in(dir: &std::path::Path) -> CoreInstanceLock {
        CoreInstanceLock::new(dir.join("core.instance.lock"), dir.join("core.lease.json"))
    }

    #[test]
    fn test_acquire_writes_lock_and_lease() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = lock_in(dir.path());
        assert!(lock.acquire());
        assert!(lock.is_held());

        let pid: u32 = std::fs::read_to_string(dir.path().join("core.instance.lock"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(pid, std::process::id());

        let lease: CoreLease = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("core.lease.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(lease.owner_pid, std::process::id());
        assert!(!lease.is_stale(Utc::now()));
    }

    #[test]
    fn test_acquire_is_reentrant_for_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = lock_in(dir.path());
        assert!(lock.acquire());
        assert!(lock.acquire());
    }

    #[test]
    fn test_second_instance_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = lock_in(dir.path());
        assert!(first.acquire());

        let mut second = lock_in(dir.path());
        assert!(!second.acquire());

        first.release();
        assert!(second.acquire());
        second.release();
    }

    #[test]
    fn test_acquire_refuses_live_foreign_owner() {
        // pid 1 is always alive on Linux.
        #[cfg(target_os = "linux")]
        {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("core.instance.lock"), "1").unwrap();
            let mut lock = lock_in(dir.path());
            assert!(!lock.acquire());
        }
    }

    #[test]
    fn test_takeover_from_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        // A PID far beyond pid_max is never alive.
        std::fs::write(dir.path().join("core.instance.lock"), "4194999").unwrap();
        let mut lock = lock_in(dir.path());
        assert!(lock.acquire());
    }

    #[test]
    fn test_release_removes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = lock_in(dir.path());
        assert!(lock.acquire());
        lock.release();
        assert!(!dir.path().join("core.instance.lock").exists());
        assert!(!dir.path().join("core.lease.json").exists());
        assert!(!lock.is_held());
    }

    #[test]
    fn test_lease_staleness() {
        let lease = CoreLease {
            owner_pid: 1,
            started_at: Utc::now(),
            last_heartbeat: Utc::now() - chrono::Duration::seconds(60),
        };
        assert!(lease.is_stale(Utc::now()));

        let fresh = CoreLease {
            owner_pid: 1,
            started_at: Utc::now(),
            last_heartbeat: Utc::now(),
        };
        assert!(!fresh.is_stale(Utc::now()));
    }
}
