//! Configuration for the shellwarden execution runtime.
//!
//! Every section deserializes from TOML with per-field defaults, so an empty
//! file (or no file at all) yields a usable configuration. Call
//! [`ShellwardenConfig::validate`] after loading; [`ConfigManager`] does this
//! for you.

pub mod exec;
pub mod loader;
pub mod logging;
pub mod policy;
pub mod supervisor;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use exec::ExecConfig;
pub use loader::{CONFIG_FILE_NAME, CONFIG_PATH_ENV, ConfigManager, ConfigSource};
pub use logging::{LogLevel, LoggingConfig};
pub use policy::PolicyConfig;
pub use supervisor::SupervisorConfig;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ShellwardenConfig {
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ShellwardenConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.exec.validate()?;
        self.supervisor.validate()?;
        self.policy.validate()?;
        Ok(())
    }
}
