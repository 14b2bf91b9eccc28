#![cfg(unix)]

use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use shellwarden_config::{ExecConfig, SupervisorConfig};
use shellwarden_runner::{
    BackgroundLauncher, CommandPolicy, ExecError, ExecutionEngine, ExecutionRequest,
    ProcessStatus, ProcessSupervisor, TerminationMethod,
};

fn launcher() -> BackgroundLauncher {
    BackgroundLauncher::new(
        ExecutionEngine::new(ExecConfig::default()),
        CommandPolicy::default(),
        ProcessSupervisor::new(SupervisorConfig::default()),
    )
}

async fn wait_for_terminal(supervisor: &ProcessSupervisor, id: &str) -> Vec<String> {
    let mut lines = Vec::new();
    for _ in 0..100 {
        let poll = supervisor.poll(id, "test", None).unwrap();
        lines.extend(poll.lines);
        if poll.status.is_terminal() {
            return lines;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("process {id} never finished");
}

#[tokio::test]
async fn sleeping_process_can_be_terminated() {
    let launcher = launcher();
    let supervisor = launcher.supervisor().clone();
    let handle = launcher
        .launch(&ExecutionRequest::new("sleep 5", "."))
        .await
        .unwrap();
    assert!(handle.id.starts_with("bg_"));

    let poll = supervisor.poll(&handle.id, "agent", None).unwrap();
    assert_eq!(poll.status, ProcessStatus::Running);
    assert!(poll.lines.is_empty());

    let started = Instant::now();
    let result = supervisor.terminate(&handle.id).await;
    assert!(result.success, "{result:?}");
    assert_eq!(result.method, Some(TerminationMethod::Graceful));
    assert!(started.elapsed() < Duration::from_secs(1));

    let poll = supervisor.poll(&handle.id, "agent", None).unwrap();
    assert_eq!(poll.status, ProcessStatus::Terminated);

    let again = supervisor.terminate(&handle.id).await;
    assert!(!again.success);
}

#[tokio::test]
async fn output_is_buffered_as_lines() {
    let launcher = launcher();
    let supervisor = launcher.supervisor().clone();
    let handle = launcher
        .launch(&ExecutionRequest::new("printf 'a\\nb\\n'; printf 'tail'", "."))
        .await
        .unwrap();

    let lines = wait_for_terminal(&supervisor, &handle.id).await;
    assert_eq!(lines, vec!["a", "b", "tail"]);

    let summary = supervisor.get(&handle.id).unwrap();
    assert_eq!(summary.status, ProcessStatus::Completed);
    assert_eq!(summary.exit_code, Some(0));
    assert_eq!(supervisor.list().len(), 1);
}

#[tokio::test]
async fn failing_command_completes_with_exit_code() {
    let launcher = launcher();
    let supervisor = launcher.supervisor().clone();
    let handle = launcher
        .launch(&ExecutionRequest::new("echo oops 1>&2; exit 4", "."))
        .await
        .unwrap();

    let lines = wait_for_terminal(&supervisor, &handle.id).await;
    assert_eq!(lines, vec!["oops"]);
    assert_eq!(supervisor.get(&handle.id).unwrap().exit_code, Some(4));
}

#[tokio::test]
async fn shell_diagnostics_do_not_expose_the_wrapper() {
    let launcher = launcher();
    let supervisor = launcher.supervisor().clone();
    let handle = launcher
        .launch(&ExecutionRequest::new("echo (", "."))
        .await
        .unwrap();

    let lines = wait_for_terminal(&supervisor, &handle.id).await;
    assert!(!lines.is_empty());
    for line in &lines {
        assert!(!line.contains("shellwarden_pgrep_"), "{line}");
        assert!(!line.contains("__code"), "{line}");
    }
}

#[tokio::test]
async fn spawn_and_policy_failures_are_errors() {
    let launcher = launcher();
    let missing = launcher
        .launch(&ExecutionRequest::new("sleep 1", "/definitely/not/here"))
        .await
        .unwrap_err();
    assert!(matches!(missing, ExecError::SpawnFailure(_)));

    let denied = launcher
        .launch(&ExecutionRequest::new("sudo rm -rf /", "."))
        .await
        .unwrap_err();
    assert!(matches!(denied, ExecError::PolicyDenied { .. }));
    assert!(launcher.supervisor().list().is_empty());
}
