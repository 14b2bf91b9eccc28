//! shellwarden command-line front-end.
//!
//! The binary is a thin shell around [`shellwarden_runner`]: `check` asks the
//! command policy for a verdict, `run` executes in the foreground and `spawn`
//! drives a background process through the supervisor.

pub mod cli;

pub use shellwarden_config as config;
pub use shellwarden_runner as runner;
