use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use shellwarden_config::LogLevel;
use shellwarden_runner::ExecError;

pub mod check;
pub mod run;
pub mod spawn;

pub use check::handle_check_command;
pub use run::handle_run_command;
pub use spawn::handle_spawn_command;

/// Run shell commands under policy, timeouts and background supervision.
#[derive(Debug, Parser)]
#[command(name = "shellwarden", version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (overrides SHELLWARDEN_CONFIG and ./shellwarden.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log level for shellwarden crates; RUST_LOG takes precedence
    #[arg(long, global = true, value_name = "LEVEL", value_parser = parse_log_level)]
    pub log_level: Option<LogLevel>,

    /// Emit machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Evaluate a command against the policy without running it
    Check(CheckArgs),
    /// Run a command in the foreground and print its summary
    Run(RunArgs),
    /// Start a command in the background and follow its output
    Spawn(SpawnArgs),
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    pub command: String,

    /// Root command the user already approved (repeatable)
    #[arg(long = "approved", value_name = "ROOT")]
    pub approved: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    pub command: String,

    /// Working directory (defaults to the current directory)
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Timeout in milliseconds (defaults to exec.default_timeout_ms)
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Run with a minimal environment (best effort, not a sandbox)
    #[arg(long)]
    pub restricted: bool,
}

#[derive(Debug, Args)]
pub struct SpawnArgs {
    pub command: String,

    /// Working directory (defaults to the current directory)
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Only print lines matching this regular expression
    #[arg(long, value_name = "REGEX")]
    pub filter: Option<String>,

    /// Terminate the process after this many milliseconds
    #[arg(long, value_name = "MS")]
    pub kill_after_ms: Option<u64>,

    /// Delay between polls in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 250)]
    pub poll_interval_ms: u64,

    /// Run with a minimal environment (best effort, not a sandbox)
    #[arg(long)]
    pub restricted: bool,
}

fn parse_log_level(value: &str) -> Result<LogLevel, String> {
    value.parse()
}

/// Exit code used when a request is rejected before anything runs.
pub(crate) const EXIT_REJECTED: u8 = 2;

#[derive(Debug, Serialize)]
struct ErrorReport<'a> {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
}

/// Print an execution error with its recovery hint and map it to an exit code.
pub(crate) fn report_exec_error(err: &ExecError, json: bool) -> Result<ExitCode> {
    if json {
        print_json(&ErrorReport {
            error: err.to_string(),
            suggestion: err.suggestion(),
        })?;
    } else {
        eprintln!("error: {err}");
        if let Some(suggestion) = err.suggestion() {
            eprintln!("hint: {suggestion}");
        }
    }
    Ok(ExitCode::from(EXIT_REJECTED))
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{rendered}").context("Failed to write to stdout")?;
    Ok(())
}

pub(crate) fn resolve_cwd(cwd: Option<PathBuf>, workspace: &Path) -> PathBuf {
    match cwd {
        Some(dir) if dir.is_absolute() => dir,
        Some(dir) => workspace.join(dir),
        None => workspace.to_path_buf(),
    }
}
