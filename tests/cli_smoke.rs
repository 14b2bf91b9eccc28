use anyhow::Result;
use assert_cmd::Command;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use predicates::prelude::*;

fn shellwarden(dir: &TempDir) -> Result<Command> {
    let mut cmd = Command::cargo_bin("shellwarden")?;
    cmd.current_dir(dir.path())
        .env_remove("SHELLWARDEN_CONFIG")
        .env_remove("RUST_LOG")
        .env("NO_COLOR", "1");
    Ok(cmd)
}

#[test]
fn help_command_succeeds() -> Result<()> {
    let dir = TempDir::new()?;
    shellwarden(&dir)?
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("spawn"));
    Ok(())
}

#[test]
fn check_reports_roots_and_pending_confirmation() -> Result<()> {
    let dir = TempDir::new()?;
    shellwarden(&dir)?
        .args(["check", "git status && cargo test", "--approved", "git"])
        .assert()
        .success()
        .stdout(predicate::str::contains("allowed: git status && cargo test"))
        .stdout(predicate::str::contains("roots: cargo, git"))
        .stdout(predicate::str::contains("needs confirmation: cargo"));
    Ok(())
}

#[test]
fn check_denies_destructive_commands() -> Result<()> {
    let dir = TempDir::new()?;
    shellwarden(&dir)?
        .args(["check", "rm -rf /"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("denied:"));
    Ok(())
}

#[test]
fn check_emits_json() -> Result<()> {
    let dir = TempDir::new()?;
    let output = shellwarden(&dir)?
        .args(["--json", "check", "ls | wc -l"])
        .output()?;
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report["allowed"], true);
    assert_eq!(report["roots"], serde_json::json!(["ls", "wc"]));
    Ok(())
}

#[test]
fn workspace_config_is_applied() -> Result<()> {
    let dir = TempDir::new()?;
    dir.child("shellwarden.toml")
        .write_str("[policy]\nblocked_roots = [\"curl\"]\n")?;
    shellwarden(&dir)?
        .args(["check", "curl https://example.com"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("blocked by policy"));
    Ok(())
}

#[test]
fn missing_config_file_is_an_error() -> Result<()> {
    let dir = TempDir::new()?;
    shellwarden(&dir)?
        .args(["--config", "missing.toml", "check", "ls"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
    Ok(())
}

#[cfg(unix)]
#[test]
fn run_prints_summary_and_propagates_exit_code() -> Result<()> {
    let dir = TempDir::new()?;
    shellwarden(&dir)?
        .args(["run", "echo hi", "--timeout-ms", "5000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Output: hi"))
        .stdout(predicate::str::contains("Exit Code: 0"));

    shellwarden(&dir)?
        .args(["run", "exit 3"])
        .assert()
        .code(3);
    Ok(())
}

#[cfg(unix)]
#[test]
fn run_rejects_out_of_range_timeout() -> Result<()> {
    let dir = TempDir::new()?;
    shellwarden(&dir)?
        .args(["run", "ls", "--timeout-ms", "0"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("out of range"));
    Ok(())
}

#[cfg(unix)]
#[test]
fn spawn_follows_output_until_completion() -> Result<()> {
    let dir = TempDir::new()?;
    shellwarden(&dir)?
        .args(["spawn", "echo first; echo second", "--poll-interval-ms", "20"])
        .assert()
        .success()
        .stdout(predicate::str::contains("first\nsecond"))
        .stderr(predicate::str::contains("status=completed"));
    Ok(())
}

#[cfg(unix)]
#[test]
fn spawn_kill_after_terminates_process() -> Result<()> {
    let dir = TempDir::new()?;
    shellwarden(&dir)?
        .args(["spawn", "sleep 30", "--kill-after-ms", "100", "--poll-interval-ms", "20"])
        .timeout(std::time::Duration::from_secs(10))
        .assert()
        .success()
        .stderr(predicate::str::contains("status=terminated"));
    Ok(())
}
