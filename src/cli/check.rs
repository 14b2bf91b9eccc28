use std::collections::{BTreeSet, HashSet};
use std::process::ExitCode;

use anyhow::{Context, Result};
use serde::Serialize;
use shellwarden_config::ShellwardenConfig;
use shellwarden_runner::{CommandPolicy, PolicyDecision};

use super::{CheckArgs, print_json};

#[derive(Debug, Serialize)]
struct CheckReport {
    command: String,
    #[serde(flatten)]
    decision: PolicyDecision,
    roots: BTreeSet<String>,
    needs_confirmation: BTreeSet<String>,
}

/// Exit status is 0 when the command would be allowed, 1 otherwise.
pub fn handle_check_command(
    config: &ShellwardenConfig,
    args: CheckArgs,
    json: bool,
) -> Result<ExitCode> {
    let policy = CommandPolicy::from_config(&config.policy)
        .context("Failed to compile policy.deny_patterns")?;

    let approved: HashSet<String> = args.approved.into_iter().collect();
    let report = CheckReport {
        decision: policy.is_allowed(&args.command),
        roots: CommandPolicy::extract_root_commands(&args.command),
        needs_confirmation: CommandPolicy::confirmation_needed(&args.command, &approved),
        command: args.command,
    };
    let allowed = report.decision.allowed;

    if json {
        print_json(&report)?;
    } else {
        match &report.decision.reason {
            None => println!("allowed: {}", report.command),
            Some(reason) => println!("denied: {reason}"),
        }
        println!("roots: {}", join_or_none(&report.roots));
        println!(
            "needs confirmation: {}",
            join_or_none(&report.needs_confirmation)
        );
    }

    Ok(if allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn join_or_none(items: &BTreeSet<String>) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}
