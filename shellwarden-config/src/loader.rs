use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::ShellwardenConfig;

/// Environment variable pointing at an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "SHELLWARDEN_CONFIG";
/// File name looked up in the workspace root.
pub const CONFIG_FILE_NAME: &str = "shellwarden.toml";

/// Where the active configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Defaults,
    File(PathBuf),
}

/// Loaded configuration together with its provenance.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: ShellwardenConfig,
    source: ConfigSource,
}

impl ConfigManager {
    /// Resolve configuration in priority order: explicit path, the
    /// `SHELLWARDEN_CONFIG` variable, `shellwarden.toml` in `workspace`,
    /// then built-in defaults.
    pub fn load(explicit: Option<&Path>, workspace: impl AsRef<Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_file(path);
        }

        if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
            let trimmed = config_path.trim();
            if !trimmed.is_empty() {
                return Self::load_from_file(trimmed).with_context(|| {
                    format!("Failed to load configuration from {CONFIG_PATH_ENV}={trimmed}")
                });
            }
        }

        let workspace_config = workspace.as_ref().join(CONFIG_FILE_NAME);
        if workspace_config.is_file() {
            return Self::load_from_file(&workspace_config);
        }

        let config = ShellwardenConfig::default();
        config
            .validate()
            .context("Default configuration failed validation")?;
        debug!("no configuration file found; using defaults");
        Ok(Self {
            config,
            source: ConfigSource::Defaults,
        })
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = ShellwardenConfig::from_toml_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        debug!(path = %path.display(), "loaded configuration file");
        Ok(Self {
            config,
            source: ConfigSource::File(path.to_path_buf()),
        })
    }

    pub fn config(&self) -> &ShellwardenConfig {
        &self.config
    }

    pub fn into_config(self) -> ShellwardenConfig {
        self.config
    }

    pub fn source(&self) -> &ConfigSource {
        &self.source
    }
}
