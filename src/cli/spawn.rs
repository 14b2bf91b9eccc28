use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use shellwarden_config::ShellwardenConfig;
use shellwarden_runner::{
    BackgroundHandle, BackgroundLauncher, CommandPolicy, ExecutionEngine, ExecutionRequest,
    PollResult, ProcessStatus, ProcessSummary, ProcessSupervisor, TerminationResult,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{SpawnArgs, print_json, report_exec_error, resolve_cwd};

const CONSUMER: &str = "cli";

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum SpawnEvent<'a> {
    Started(&'a BackgroundHandle),
    Output(&'a PollResult),
    Terminated(&'a TerminationResult),
    Finished { processes: &'a [ProcessSummary] },
}

/// Launch in the background and follow the output until a terminal state.
pub async fn handle_spawn_command(
    config: &ShellwardenConfig,
    workspace: &Path,
    args: SpawnArgs,
    json: bool,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    let policy = CommandPolicy::from_config(&config.policy)
        .context("Failed to compile policy.deny_patterns")?;
    let supervisor = ProcessSupervisor::new(config.supervisor.clone());
    let launcher = BackgroundLauncher::new(
        ExecutionEngine::new(config.exec.clone()),
        policy,
        supervisor.clone(),
    );

    let request = ExecutionRequest::new(args.command, resolve_cwd(args.cwd, workspace))
        .restricted(args.restricted);
    let handle = match launcher.launch(&request).await {
        Ok(handle) => handle,
        Err(err) => return report_exec_error(&err, json),
    };

    if json {
        print_json(&SpawnEvent::Started(&handle))?;
    } else {
        eprintln!("started {} (pid {})", handle.id, handle.pid);
    }

    let deadline = args
        .kill_after_ms
        .map(|ms| Instant::now() + Duration::from_millis(ms));
    let interval = Duration::from_millis(args.poll_interval_ms.max(1));
    let mut termination: Option<TerminationResult> = None;
    let mut filter_error = None;

    let status = loop {
        let poll = match supervisor.poll(&handle.id, CONSUMER, args.filter.as_deref()) {
            Ok(poll) => poll,
            Err(err) => {
                warn!(id = %handle.id, error = %err, "poll failed; stopping process");
                filter_error = Some(err);
                termination = Some(supervisor.terminate(&handle.id).await);
                break ProcessStatus::Terminated;
            }
        };

        if json {
            if !poll.lines.is_empty() || poll.status.is_terminal() {
                print_json(&SpawnEvent::Output(&poll))?;
            }
        } else {
            for line in &poll.lines {
                println!("{line}");
            }
        }
        if poll.status.is_terminal() {
            break poll.status;
        }

        let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
        if termination.is_none() && (cancel.is_cancelled() || expired) {
            info!(id = %handle.id, interrupted = cancel.is_cancelled(), "stopping background process");
            termination = Some(supervisor.terminate(&handle.id).await);
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled(), if termination.is_none() => {}
        }
    };

    if let Some(result) = &termination {
        if json {
            print_json(&SpawnEvent::Terminated(result))?;
        } else {
            eprintln!("{}", result.message);
        }
    }

    let processes = supervisor.list();
    if json {
        print_json(&SpawnEvent::Finished {
            processes: &processes,
        })?;
    } else {
        for process in &processes {
            eprintln!(
                "{}  pid={}  status={}  exit={}  runtime={}ms  {}",
                process.id,
                process
                    .pid
                    .map_or_else(|| "-".to_string(), |pid| pid.to_string()),
                process.status,
                process
                    .exit_code
                    .map_or_else(|| "-".to_string(), |code| code.to_string()),
                process.runtime_ms,
                process.command
            );
        }
    }

    if let Some(err) = filter_error {
        return report_exec_error(&err, json);
    }

    let exit_code = supervisor
        .get(&handle.id)
        .and_then(|summary| summary.exit_code);
    Ok(match status {
        ProcessStatus::Completed => exit_code
            .and_then(|code| u8::try_from(code).ok())
            .map_or(ExitCode::FAILURE, ExitCode::from),
        ProcessStatus::Terminated if cancel.is_cancelled() => ExitCode::from(130),
        ProcessStatus::Terminated => ExitCode::SUCCESS,
        ProcessStatus::Failed | ProcessStatus::Running => ExitCode::FAILURE,
    })
}
