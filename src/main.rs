//! shellwarden - policy-gated shell execution with background supervision
//!
//! Thin binary entry point that delegates to the CLI handlers.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use shellwarden::cli::{self, Cli, Commands};
use shellwarden_config::ConfigManager;
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod main_helpers;

use main_helpers::initialize_tracing;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();

    let workspace = std::env::current_dir().context("Failed to resolve the current directory")?;
    let manager = ConfigManager::load(args.config.as_deref(), &workspace)?;
    initialize_tracing(args.log_level, &manager.config().logging);
    debug!(source = ?manager.source(), "configuration loaded");
    let config = manager.into_config();

    // Ctrl-C cancels the current command as the caller.
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupt received; cancelling");
                cancel.cancel();
            }
        }
    });

    match args.command {
        Commands::Check(check) => cli::handle_check_command(&config, check, args.json),
        Commands::Run(run) => {
            cli::handle_run_command(&config, &workspace, run, args.json, cancel).await
        }
        Commands::Spawn(spawn) => {
            cli::handle_spawn_command(&config, &workspace, spawn, args.json, cancel).await
        }
    }
}
