use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shellwarden_config::ExecConfig;

use crate::error::{ExecError, Result};

/// A single command the caller wants to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub command: String,
    pub cwd: PathBuf,
    pub timeout_ms: Option<u64>,
    pub restricted: bool,
}

impl ExecutionRequest {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            timeout_ms: None,
            restricted: false,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn restricted(mut self, restricted: bool) -> Self {
        self.restricted = restricted;
        self
    }

    /// Check the invariants that do not depend on policy.
    pub fn validate(&self, config: &ExecConfig) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        if let Some(timeout_ms) = self.timeout_ms
            && (timeout_ms == 0 || timeout_ms > config.max_timeout_ms)
        {
            return Err(ExecError::TimeoutOutOfRange {
                timeout_ms,
                max_ms: config.max_timeout_ms,
            });
        }
        Ok(())
    }

    pub fn effective_timeout(&self, config: &ExecConfig) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(config.default_timeout_ms))
    }

    pub fn options(&self) -> ExecOptions {
        ExecOptions {
            restricted: self.restricted,
            background: false,
        }
    }
}

/// Per-spawn knobs forwarded to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Run with a minimal environment. Best effort only, not a sandbox.
    pub restricted: bool,
    /// Set by the launcher. Only a bounded tail of output is aggregated into
    /// the result; the supervisor owns the line buffer.
    pub background: bool,
}

/// Incremental output notification for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Data { chunk: String },
    BinaryDetected,
    BinaryProgress { bytes_received: u64 },
}

/// Why an execution was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller fired its own token.
    Caller,
    /// The effective timeout elapsed.
    Timeout,
}

/// Terminal outcome of one execution. Produced exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Merged stdout/stderr text, or a notice when the output was binary.
    pub output: String,
    /// Total bytes read from both pipes.
    pub raw_byte_count: u64,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub pid: Option<u32>,
    pub aborted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub binary_detected: bool,
    pub descendant_pids: Vec<u32>,
    /// False when the descendant snapshot could not be read.
    pub descendant_pids_available: bool,
}

impl ExecutionResult {
    pub(crate) fn spawn_failure(message: String) -> Self {
        Self {
            error: Some(message),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        !self.aborted && self.error.is_none() && self.exit_code == Some(0)
    }
}

/// Lifecycle of a supervised background process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Terminated,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_command_is_rejected() {
        let request = ExecutionRequest::new("   ", ".");
        assert!(matches!(
            request.validate(&ExecConfig::default()),
            Err(ExecError::EmptyCommand)
        ));
    }

    #[test]
    fn timeout_bounds_are_enforced() {
        let config = ExecConfig::default();
        let zero = ExecutionRequest::new("ls", ".").with_timeout_ms(0);
        assert!(matches!(
            zero.validate(&config),
            Err(ExecError::TimeoutOutOfRange { timeout_ms: 0, .. })
        ));

        let too_long = ExecutionRequest::new("ls", ".").with_timeout_ms(600_001);
        assert!(too_long.validate(&config).is_err());

        let max = ExecutionRequest::new("ls", ".").with_timeout_ms(600_000);
        assert!(max.validate(&config).is_ok());
    }

    #[test]
    fn default_timeout_applies_when_omitted() {
        let request = ExecutionRequest::new("ls", ".");
        assert_eq!(
            request.effective_timeout(&ExecConfig::default()),
            Duration::from_millis(120_000)
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = ExecutionEvent::BinaryProgress { bytes_received: 12 };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"binary_progress","bytes_received":12}"#);
    }
}
