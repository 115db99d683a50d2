//! Run configuration, loadable from TOML.
//!
//! ```toml
//! negative_guard_prefixes = ["hide_", "disable_"]
//! blocked_markers = ["_blocked"]
//! pairwise_limit = 20
//! triple_limit = 10
//! permutation_timeout_ms = 10000
//! artifact_dir = "/tmp/tmplcov_compiled"
//! ```
//!
//! Every field is optional; `Config::default()` gives the values above.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Variables starting with one of these default to `false` in the
    /// all-true seed, e.g. `hide_banner`.
    pub negative_guard_prefixes: Vec<String>,
    /// Variables containing one of these default to `false` in the all-true
    /// seed, e.g. `user_blocked`.
    pub blocked_markers: Vec<String>,
    /// Plain variables considered for pairwise flips.
    pub pairwise_limit: usize,
    /// Plain variables considered for triple flips.
    pub triple_limit: usize,
    pub permutation_timeout_ms: u64,
    /// Scratch directory for compiled artifacts.
    pub artifact_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            negative_guard_prefixes: vec!["hide_".to_string()],
            blocked_markers: vec!["_blocked".to_string()],
            pairwise_limit: 20,
            triple_limit: 10,
            permutation_timeout_ms: 10_000,
            artifact_dir: std::env::temp_dir().join("tmplcov_compiled"),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(Error::Config(errors.join("; ")));
        }
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Human-readable problems with this configuration; empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.permutation_timeout_ms == 0 {
            errors.push("permutation_timeout_ms must be > 0".to_string());
        }
        if self.negative_guard_prefixes.iter().any(String::is_empty) {
            errors.push("negative_guard_prefixes must not contain empty strings".to_string());
        }
        if self.blocked_markers.iter().any(String::is_empty) {
            errors.push("blocked_markers must not contain empty strings".to_string());
        }
        errors
    }

    pub fn permutation_timeout(&self) -> Duration {
        Duration::from_millis(self.permutation_timeout_ms)
    }

    /// Whether `name` reads as a guard that should default to closed.
    pub fn is_negative_guard(&self, name: &str) -> bool {
        self.negative_guard_prefixes
            .iter()
            .any(|p| name.starts_with(p.as_str()))
            || self.blocked_markers.iter().any(|m| name.contains(m.as_str()))
    }
}
