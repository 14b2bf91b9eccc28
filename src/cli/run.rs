use std::io::{self, Write};
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use shellwarden_config::ShellwardenConfig;
use shellwarden_runner::{
    CancelReason, CommandPolicy, ExecutionEngine, ExecutionRequest, ExecutionResult,
    ForegroundRunner,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{RunArgs, print_json, report_exec_error, resolve_cwd};

const EXIT_TIMED_OUT: u8 = 124;
const EXIT_INTERRUPTED: u8 = 130;

pub async fn handle_run_command(
    config: &ShellwardenConfig,
    workspace: &Path,
    args: RunArgs,
    json: bool,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    let policy = CommandPolicy::from_config(&config.policy)
        .context("Failed to compile policy.deny_patterns")?;
    let runner = ForegroundRunner::new(ExecutionEngine::new(config.exec.clone()), policy);

    let mut request = ExecutionRequest::new(args.command, resolve_cwd(args.cwd, workspace))
        .restricted(args.restricted);
    if let Some(timeout_ms) = args.timeout_ms {
        request = request.with_timeout_ms(timeout_ms);
    }
    debug!(command = %request.command, cwd = %request.cwd.display(), "running foreground command");

    let mut progress = ProgressPrinter::default();
    let outcome = match runner
        .run(&request, cancel, |text| {
            if !json {
                progress.show(text);
            }
        })
        .await
    {
        Ok(outcome) => outcome,
        Err(err) => return report_exec_error(&err, json),
    };

    if json {
        print_json(&outcome)?;
    } else {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", outcome.summary).context("Failed to write to stdout")?;
    }

    Ok(ExitCode::from(exit_status_for(&outcome.result)))
}

fn exit_status_for(result: &ExecutionResult) -> u8 {
    if result.aborted {
        return match result.cancel_reason {
            Some(CancelReason::Timeout) => EXIT_TIMED_OUT,
            _ => EXIT_INTERRUPTED,
        };
    }
    result
        .exit_code
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1)
}

/// Mirrors cumulative display text to stderr, printing only what is new.
#[derive(Debug, Default)]
struct ProgressPrinter {
    shown: String,
}

impl ProgressPrinter {
    fn show(&mut self, text: &str) {
        let mut stderr = io::stderr().lock();
        let fresh = match text.strip_prefix(self.shown.as_str()) {
            Some(rest) => rest,
            None if self.shown.is_empty() => text,
            // Status notices replace the stream; print them on their own line.
            None => {
                let _ = writeln!(stderr);
                text
            }
        };
        let _ = write!(stderr, "{fresh}");
        let _ = stderr.flush();
        self.shown = text.to_string();
    }
}
