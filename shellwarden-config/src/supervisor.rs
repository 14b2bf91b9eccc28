use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

/// Retention and termination settings for background processes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Maximum number of output lines retained per background process.
    #[serde(default = "SupervisorConfig::default_max_buffer_lines")]
    pub max_buffer_lines: usize,
    /// How long a finished process stays pollable before it is evicted (seconds).
    #[serde(default = "SupervisorConfig::default_eviction_grace_seconds")]
    pub eviction_grace_seconds: u64,
    /// Time granted to a terminated process before escalating to SIGKILL (milliseconds).
    #[serde(default = "SupervisorConfig::default_termination_grace_ms")]
    pub termination_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_buffer_lines: Self::default_max_buffer_lines(),
            eviction_grace_seconds: Self::default_eviction_grace_seconds(),
            termination_grace_ms: Self::default_termination_grace_ms(),
        }
    }
}

impl SupervisorConfig {
    const fn default_max_buffer_lines() -> usize {
        10_000
    }

    const fn default_eviction_grace_seconds() -> u64 {
        30 * 60
    }

    const fn default_termination_grace_ms() -> u64 {
        500
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_buffer_lines > 0,
            "supervisor.max_buffer_lines must be at least 1"
        );
        ensure!(
            self.termination_grace_ms > 0,
            "supervisor.termination_grace_ms must be at least 1ms"
        );
        Ok(())
    }
}
