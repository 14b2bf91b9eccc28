use anyhow::{Context, Result, ensure};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Command gating rules.
///
/// Deny rules always win. When `allowed_roots` is non-empty every root command
/// of a script must appear in it.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Root commands that may run without further checks against the allow list.
    #[serde(default)]
    pub allowed_roots: Vec<String>,
    /// Root commands that are always rejected.
    #[serde(default)]
    pub blocked_roots: Vec<String>,
    /// Regular expressions matched against the whole command text.
    #[serde(default)]
    pub deny_patterns: Vec<String>,
    /// Skip the built-in destructive command checks.
    #[serde(default)]
    pub disable_builtin_denylist: bool,
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        for pattern in &self.deny_patterns {
            Regex::new(pattern)
                .with_context(|| format!("policy.deny_patterns contains invalid regex `{pattern}`"))?;
        }
        for root in self.allowed_roots.iter().chain(&self.blocked_roots) {
            ensure!(
                !root.trim().is_empty() && !root.contains(char::is_whitespace),
                "policy root entries must be single non-empty words, got `{root}`"
            );
        }
        Ok(())
    }
}
