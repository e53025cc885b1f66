// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Kagan main entry point - CLI commands for the core daemon.

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use kagan::cli;

/// Kagan - Kanban-driven coding agent host.
#[derive(Parser)]
#[command(name = "kagan")]
#[command(author, version, about = "Kanban board for coding agents in isolated git worktrees", long_about = None)]
struct Cli {
    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the core daemon
    Core {
        #[command(subcommand)]
        command: CoreCommands,
    },
    /// Check the local environment (git, data dir, daemon)
    Doctor,
}

#[derive(Subcommand)]
enum CoreCommands {
    /// Start the daemon in the foreground
    Start,
    /// Ask a running daemon to stop
    Stop,
    /// Show daemon status
    Status,
}

fn init_tracing(debug: bool) {
    let default = if debug { "kagan=debug" } else { "kagan=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    init_tracing(args.debug);

    let result = match args.command {
        Commands::Core { command } => match command {
            CoreCommands::Start => cli::core_start().await,
            CoreCommands::Stop => cli::core_stop().await,
            CoreCommands::Status => cli::core_status().await,
        },
        Commands::Doctor => cli::doctor().await,
    };

    if let Err(e) = result {
        eprintln!("{} {e:#}", "error:".red().bold());
        std::process::exit(1);
    }
}
