use thiserror::Error;

use crate::types::ProcessStatus;

/// Failures surfaced by the execution runtime.
///
/// Nothing here is fatal to the host process: validation variants are raised
/// before any process is spawned, engine failures travel inside
/// [`ExecutionResult::error`](crate::ExecutionResult), and supervisor misses
/// carry a recovery suggestion.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command blocked by policy: {reason}")]
    PolicyDenied { reason: String },

    #[error("command cannot be empty")]
    EmptyCommand,

    #[error("could not identify a root command to run")]
    NoIdentifiableRoot,

    #[error("timeout of {timeout_ms}ms is out of range (must be between 1 and {max_ms}ms)")]
    TimeoutOutOfRange { timeout_ms: u64, max_ms: u64 },

    #[error("failed to spawn command: {0}")]
    SpawnFailure(String),

    #[error("background process `{id}` not found")]
    ProcessNotFound { id: String },

    #[error("background process `{id}` is already {status}")]
    AlreadyTerminal { id: String, status: ProcessStatus },

    #[error("invalid filter pattern `{pattern}`: {source}")]
    InvalidFilterPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("execution engine failed unexpectedly: {0}")]
    UnexpectedEngineFailure(String),
}

impl ExecError {
    /// True for errors detected before any process was spawned.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::PolicyDenied { .. }
                | Self::EmptyCommand
                | Self::NoIdentifiableRoot
                | Self::TimeoutOutOfRange { .. }
        )
    }

    /// Human-readable next step for the caller.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::PolicyDenied { .. } => {
                Some("Rewrite the command without the blocked construct or ask the user to run it.")
            }
            Self::EmptyCommand | Self::NoIdentifiableRoot => {
                Some("Provide a shell command such as `ls -la`.")
            }
            Self::TimeoutOutOfRange { .. } => {
                Some("Omit the timeout to use the default or pick a value within range.")
            }
            Self::SpawnFailure(_) => {
                Some("Check that the working directory exists and the shell is installed.")
            }
            Self::ProcessNotFound { .. } => {
                Some("List background processes to find a valid id; finished processes are evicted after a grace period.")
            }
            Self::AlreadyTerminal { .. } => {
                Some("Poll the process to read its remaining output instead.")
            }
            Self::InvalidFilterPattern { .. } => {
                Some("Fix the regular expression and poll again; no output was consumed.")
            }
            Self::UnexpectedEngineFailure(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
