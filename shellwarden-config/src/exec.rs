use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

/// Settings for spawning and streaming a single command.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ExecConfig {
    /// Timeout applied when a request does not carry one (milliseconds).
    #[serde(default = "ExecConfig::default_default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Upper bound accepted for a per-request timeout (milliseconds).
    #[serde(default = "ExecConfig::default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    /// Minimum spacing between incremental display updates (milliseconds).
    #[serde(default = "ExecConfig::default_update_throttle_ms")]
    pub update_throttle_ms: u64,
    /// Delay between SIGTERM and SIGKILL when a run is cancelled (milliseconds).
    #[serde(default = "ExecConfig::default_kill_escalation_ms")]
    pub kill_escalation_ms: u64,
    /// How long to keep draining pipes after the shell itself exited (milliseconds).
    #[serde(default = "ExecConfig::default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Number of leading output bytes inspected for binary content.
    #[serde(default = "ExecConfig::default_binary_sniff_bytes")]
    pub binary_sniff_bytes: usize,
    /// Capacity of the bounded event channel handed to consumers.
    #[serde(default = "ExecConfig::default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Snapshot the process group before exit to report descendant pids (Unix).
    #[serde(default = "ExecConfig::default_discover_descendants")]
    pub discover_descendants: bool,
    /// Shell program to run commands with. Falls back to bash, then `/bin/sh`.
    #[serde(default)]
    pub preferred_shell: Option<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: Self::default_default_timeout_ms(),
            max_timeout_ms: Self::default_max_timeout_ms(),
            update_throttle_ms: Self::default_update_throttle_ms(),
            kill_escalation_ms: Self::default_kill_escalation_ms(),
            drain_timeout_ms: Self::default_drain_timeout_ms(),
            binary_sniff_bytes: Self::default_binary_sniff_bytes(),
            event_channel_capacity: Self::default_event_channel_capacity(),
            discover_descendants: Self::default_discover_descendants(),
            preferred_shell: None,
        }
    }
}

impl ExecConfig {
    /// Hard ceiling for `max_timeout_ms` itself.
    pub const TIMEOUT_CEILING_MS: u64 = 600_000;
    const MIN_THROTTLE_MS: u64 = 1_000;

    const fn default_default_timeout_ms() -> u64 {
        120_000
    }

    const fn default_max_timeout_ms() -> u64 {
        Self::TIMEOUT_CEILING_MS
    }

    const fn default_update_throttle_ms() -> u64 {
        1_000
    }

    const fn default_kill_escalation_ms() -> u64 {
        200
    }

    const fn default_drain_timeout_ms() -> u64 {
        500
    }

    const fn default_binary_sniff_bytes() -> usize {
        4_096
    }

    const fn default_event_channel_capacity() -> usize {
        256
    }

    const fn default_discover_descendants() -> bool {
        true
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_timeout_ms > 0 && self.max_timeout_ms <= Self::TIMEOUT_CEILING_MS,
            "exec.max_timeout_ms must be between 1 and {}",
            Self::TIMEOUT_CEILING_MS
        );
        ensure!(
            self.default_timeout_ms > 0 && self.default_timeout_ms <= self.max_timeout_ms,
            "exec.default_timeout_ms must be between 1 and exec.max_timeout_ms ({})",
            self.max_timeout_ms
        );
        ensure!(
            self.update_throttle_ms >= Self::MIN_THROTTLE_MS,
            "exec.update_throttle_ms must be at least {}ms",
            Self::MIN_THROTTLE_MS
        );
        ensure!(
            self.binary_sniff_bytes > 0,
            "exec.binary_sniff_bytes must be at least 1"
        );
        ensure!(
            self.event_channel_capacity > 0,
            "exec.event_channel_capacity must be at least 1"
        );
        if let Some(shell) = &self.preferred_shell {
            ensure!(
                !shell.trim().is_empty(),
                "exec.preferred_shell cannot be blank"
            );
        }
        Ok(())
    }
}
