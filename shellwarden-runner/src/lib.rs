//! Shell command execution for agent runtimes.
//!
//! Commands are gated by a [`CommandPolicy`], spawned by the
//! [`ExecutionEngine`] in their own process group, and either awaited by the
//! [`ForegroundRunner`] under a timeout or handed to the
//! [`ProcessSupervisor`] through the [`BackgroundLauncher`] so their output
//! can be polled later.
//!
//! ```no_run
//! use shellwarden_config::ShellwardenConfig;
//! use shellwarden_runner::{
//!     CommandPolicy, ExecutionEngine, ExecutionRequest, ForegroundRunner,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> Result<(), shellwarden_runner::ExecError> {
//! let config = ShellwardenConfig::default();
//! let runner = ForegroundRunner::new(
//!     ExecutionEngine::new(config.exec.clone()),
//!     CommandPolicy::default(),
//! );
//! let request = ExecutionRequest::new("echo hi", ".");
//! let outcome = runner
//!     .run(&request, CancellationToken::new(), |_| {})
//!     .await?;
//! println!("{}", outcome.summary);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod descendants;
pub mod engine;
pub mod error;
pub mod foreground;
pub mod launcher;
pub mod policy;
pub mod process_group;
pub mod shell;
pub mod stream;
pub mod supervisor;
pub mod types;

pub use cancel::ExecutionCancellation;
pub use engine::{ExecutionCompletion, ExecutionEngine, ExecutionHandle};
pub use error::{ExecError, Result};
pub use foreground::{ForegroundOutcome, ForegroundRunner};
pub use launcher::{BackgroundHandle, BackgroundLauncher};
pub use policy::{CommandPolicy, PolicyDecision};
pub use supervisor::{
    PollResult, ProcessSummary, ProcessSupervisor, TerminationMethod, TerminationResult,
};
pub use types::{
    CancelReason, ExecOptions, ExecutionEvent, ExecutionRequest, ExecutionResult, ProcessStatus,
};
