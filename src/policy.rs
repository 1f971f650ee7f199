//! Tunable policy constants for validation and tool invocation.
//!
//! The size thresholds are heuristics, not derived from any container
//! format, so they are kept configurable rather than hard-coded. A policy
//! file is optional; the defaults match the shipped behavior.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PatchPolicy {
    /// A produced image smaller than this fraction of the source tree size
    /// is treated as truncated and the strategy as failed.
    pub min_size_ratio: f64,

    /// Wall-clock limit for a single external tool invocation, in seconds.
    /// Authoring a multi-gigabyte image is slow; the default is generous.
    pub tool_timeout_secs: u64,
}

impl Default for PatchPolicy {
    fn default() -> Self {
        Self {
            min_size_ratio: 0.9,
            tool_timeout_secs: 900,
        }
    }
}

impl PatchPolicy {
    /// Load policy overrides from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading policy file '{}'", path.display()))?;
        let policy: PatchPolicy = toml::from_str(&text)
            .with_context(|| format!("parsing policy file '{}'", path.display()))?;
        Ok(policy)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Minimum acceptable output size for a given source tree size.
    pub fn min_output_bytes(&self, source_bytes: u64) -> u64 {
        (source_bytes as f64 * self.min_size_ratio) as u64
    }
}
