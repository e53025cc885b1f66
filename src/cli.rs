// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! CLI commands: start/stop/status for the core daemon and a local
//! environment doctor.

use colored::Colorize;
use tracing::info;

use crate::config::KaganConfig;
use crate::error::Result;
use crate::host::lease::{pid_alive, CoreLease};
use crate::host::CoreHost;
use crate::ipc::{CoreRequest, IpcClient};
use crate::paths;

fn cli_request(capability: &str, method: &str, params: serde_json::Value) -> CoreRequest {
    CoreRequest {
        request_id: uuid::Uuid::new_v4().to_string(),
        session_id: format!("cli-{}", std::process::id()),
        session_profile: Some("operator".to_string()),
        session_origin: Some("CLI".to_string()),
        client_version: crate::VERSION.to_string(),
        capability: capability.to_string(),
        method: method.to_string(),
        params,
        idempotency_key: None,
    }
}

/// Run the daemon in the foreground until it stops or a signal arrives.
pub async fn core_start() -> Result<()> {
    let config = KaganConfig::load(&paths::config_path())?;
    let host = CoreHost::start(config, paths::data_dir()).await?;
    println!("{} core daemon running (pid {})", "ok:".green().bold(), std::process::id());

    let host_state = std::sync::Arc::clone(host.state());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, stopping core");
            host_state.stop("interrupted").await;
        }
    });

    host.wait_until_stopped().await;
    println!("{} core daemon stopped", "ok:".green().bold());
    Ok(())
}

/// Ask a running daemon to shut down.
pub async fn core_stop() -> Result<()> {
    let mut client = IpcClient::connect_from_runtime_dir().await?;
    let response = client
        .request(cli_request(
            "core",
            "shutdown",
            serde_json::json!({"reason": "cli stop"}),
        ))
        .await?;
    if response.ok {
        println!("{} core daemon stopping", "ok:".green().bold());
    } else {
        anyhow::bail!(
            "daemon refused shutdown: {}",
            response
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

/// Report daemon status from the lease file and a live probe.
pub async fn core_status() -> Result<()> {
    let lease_raw = std::fs::read_to_string(paths::lease_path()).ok();
    let lease: Option<CoreLease> =
        lease_raw.and_then(|raw| serde_json::from_str(&raw).ok());

    match lease {
        None => {
            println!("{} no core daemon running", "status:".bold());
            return Ok(());
        }
        Some(lease) => {
            let stale = lease.is_stale(chrono::Utc::now());
            let alive = pid_alive(lease.owner_pid);
            if stale && !alive {
                println!(
                    "{} stale lease from pid {} (daemon gone)",
                    "status:".bold(),
                    lease.owner_pid
                );
                return Ok(());
            }
            println!(
                "{} core daemon pid {} (started {})",
                "status:".bold(),
                lease.owner_pid,
                lease.started_at.to_rfc3339()
            );
        }
    }

    match IpcClient::connect_from_runtime_dir().await {
        Ok(mut client) => {
            let response = client
                .request(cli_request("core", "status", serde_json::json!({})))
                .await?;
            if let Some(result) = response.result {
                println!(
                    "  version {}  running agents {}",
                    result["version"].as_str().unwrap_or("?"),
                    result["running_agents"]
                );
            }
            let response = client
                .request(cli_request("tasks", "counts", serde_json::json!({})))
                .await?;
            if let Some(result) = response.result {
                println!("  tasks {}", result["counts"]);
            }
        }
        Err(e) => {
            println!("  {} cannot reach daemon: {e}", "warn:".yellow().bold());
        }
    }
    Ok(())
}

/// Minimum git version with solid worktree support.
const MIN_GIT_MAJOR_MINOR: (u32, u32) = (2, 20);

/// Check the local environment.
pub async fn doctor() -> Result<()> {
    // git present and recent enough for worktrees.
    let output = tokio::process::Command::new("git")
        .arg("--version")
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {
            let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let supported = parse_git_version(&raw)
                .map(|(major, minor)| (major, minor) >= MIN_GIT_MAJOR_MINOR)
                .unwrap_or(false);
            if supported {
                println!("{} {raw}", "ok:".green().bold());
            } else {
                println!(
                    "{} {raw} (need >= {}.{} for worktree support)",
                    "warn:".yellow().bold(),
                    MIN_GIT_MAJOR_MINOR.0,
                    MIN_GIT_MAJOR_MINOR.1
                );
            }
        }
        _ => println!("{} git not found on PATH", "fail:".red().bold()),
    }

    // Data directory writable.
    let data_dir = paths::data_dir();
    match std::fs::create_dir_all(&data_dir) {
        Ok(()) => println!("{} data dir {}", "ok:".green().bold(), data_dir.display()),
        Err(e) => println!(
            "{} data dir {}: {e}",
            "fail:".red().bold(),
            data_dir.display()
        ),
    }

    // Daemon reachable?
    match IpcClient::connect_from_runtime_dir().await {
        Ok(client) => println!(
            "{} core daemon reachable (version {})",
            "ok:".green().bold(),
            client.server_version()
        ),
        Err(_) => println!("{} core daemon not running", "info:".bold()),
    }
    Ok(())
}

fn parse_git_version(raw: &str) -> Option<(u32, u32)> {
    let version = raw.split_whitespace().nth(2)?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_git_version() {
        assert_eq!(parse_git_version("git version 2.43.0"), Some((2, 43)));
        assert_eq!(parse_git_version("git version 2.20.1.windows.1"), Some((2, 20)));
        assert_eq!(parse_git_version("nonsense"), None);
    }

    #[test]
    fn test_cli_request_shape() {
        let request = cli_request("tasks", "counts", serde_json::json!({}));
        assert_eq!(request.capability, "tasks");
        assert_eq!(request.session_profile.as_deref(), Some("operator"));
        assert_eq!(request.session_origin.as_deref(), Some("CLI"));
        assert!(!request.client_version.is_empty());
    }
}
