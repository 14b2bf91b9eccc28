//! Best-effort discovery of processes the command left behind.
//!
//! On Unix the user script is wrapped so that, right before the shell exits,
//! it writes `pgrep -g 0` (every pid in its own process group) to a unique
//! temporary file. The file is removed when the [`DescendantProbe`] drops, on
//! every path. Other platforms skip discovery entirely.
//!
//! Shell diagnostics can quote the wrapped script back, so every text that
//! leaves the runtime goes through the [`ScriptScrubber`] returned by
//! [`DescendantProbe::wrap`].

use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempPath;
use tracing::warn;

/// Owns the side-channel file for one execution.
#[derive(Debug)]
pub struct DescendantProbe {
    path: TempPath,
}

/// Outcome of reading the side-channel file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescendantSnapshot {
    pub pids: Vec<u32>,
    pub available: bool,
}

impl DescendantProbe {
    /// Reserve a uniquely named file. Returns `None` when the temp dir is unusable.
    pub fn create() -> Option<Self> {
        match tempfile::Builder::new()
            .prefix("shellwarden_pgrep_")
            .suffix(".tmp")
            .tempfile()
        {
            Ok(file) => Some(Self {
                path: file.into_temp_path(),
            }),
            Err(err) => {
                warn!(error = %err, "could not reserve descendant probe file");
                None
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wrap `command` so it records its process group before exiting with
    /// the command's own status.
    pub fn wrap(&self, command: &str) -> (String, ScriptScrubber) {
        let probe_path = self.path.to_string_lossy();
        let script = wrap_command(command, &probe_path);
        let scrubber = ScriptScrubber::new(command.trim(), &script, &probe_path);
        (script, scrubber)
    }

    /// Parse the snapshot, excluding the shell itself.
    pub fn collect(&self, shell_pid: Option<u32>, aborted: bool) -> DescendantSnapshot {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if !content.trim().is_empty() => DescendantSnapshot {
                pids: parse_pids(&content, shell_pid),
                available: true,
            },
            Ok(_) | Err(_) => {
                if !aborted {
                    warn!(
                        path = %self.path.display(),
                        "descendant snapshot missing; background pids unavailable"
                    );
                }
                DescendantSnapshot::default()
            }
        }
    }
}

/// Rewrites wrapper text quoted in shell output back to the user's command.
///
/// Works on whole text: a wrapper fragment split across two chunks is only
/// caught once the chunks are joined, so callers scrub complete lines or the
/// cumulative output. The default scrubber leaves text untouched.
#[derive(Debug, Clone, Default)]
pub struct ScriptScrubber {
    replacements: Arc<[(String, String)]>,
}

impl ScriptScrubber {
    fn new(command: &str, script: &str, probe_path: &str) -> Self {
        let quoted = shell_words::quote(probe_path).into_owned();
        let first_line = command.lines().next().unwrap_or_default();
        let mut replacements = vec![
            (script.to_string(), command.to_string()),
            (format!("}}; {}", probe_epilogue(&quoted)), String::new()),
            (probe_epilogue(&quoted), String::new()),
        ];
        if !first_line.is_empty() {
            replacements.push((format!("{{ {first_line}"), first_line.to_string()));
        }
        replacements.push((quoted.clone(), String::new()));
        if quoted != probe_path {
            replacements.push((probe_path.to_string(), String::new()));
        }
        Self {
            replacements: replacements.into(),
        }
    }

    pub fn scrub<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut scrubbed = Cow::Borrowed(text);
        for (from, to) in self.replacements.iter() {
            if scrubbed.contains(from.as_str()) {
                scrubbed = Cow::Owned(scrubbed.replace(from.as_str(), to));
            }
        }
        scrubbed
    }
}

// The group closes on its own line so trailing comments, heredocs and a
// trailing `&` keep their meaning.
fn wrap_command(command: &str, probe_path: &str) -> String {
    let trimmed = command.trim();
    let quoted = shell_words::quote(probe_path);
    format!("{{ {trimmed}\n}}; {}", probe_epilogue(&quoted))
}

fn probe_epilogue(quoted_path: &str) -> String {
    format!("__code=$?; pgrep -g 0 >{quoted_path} 2>&1; exit $__code;")
}

fn parse_pids(content: &str, shell_pid: Option<u32>) -> Vec<u32> {
    let mut pids: Vec<u32> = content
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| Some(*pid) != shell_pid)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
