use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::ConcurrencyPolicy;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

pub const ENV_CONCURRENCY_LIMIT: &str = "FANOUT_CONCURRENCY_LIMIT";
pub const ENV_PER_UNIT_MULTIPLIER: &str = "FANOUT_PER_UNIT_MULTIPLIER";
pub const ENV_POLL_INTERVAL_MS: &str = "FANOUT_POLL_INTERVAL_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read '{}'", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid {var}: '{value}' (must be a non-negative integer)")]
    Env { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Dispatcher settings as they appear in YAML and the environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    #[serde(default)]
    pub concurrency_limit: Option<usize>,

    #[serde(default)]
    pub per_unit_multiplier: Option<usize>,

    /// Upper bound on how long the dispatch loop sleeps before re-checking
    /// for a free slot.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            per_unit_multiplier: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl DispatchConfig {
    pub fn limited(limit: usize) -> Self {
        Self {
            concurrency_limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Overlay `FANOUT_*` environment variables on top of this config.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_usize(ENV_CONCURRENCY_LIMIT)? {
            self.concurrency_limit = Some(v);
        }
        if let Some(v) = env_usize(ENV_PER_UNIT_MULTIPLIER)? {
            self.per_unit_multiplier = Some(v);
        }
        if let Some(v) = env_usize(ENV_POLL_INTERVAL_MS)? {
            self.poll_interval_ms = v as u64;
        }
        self.validate()
    }

    /// Zero caps are accepted and fall through in the policy; a zero poll
    /// interval would turn the wait into a spin.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy {
            concurrency_limit: self.concurrency_limit,
            per_unit_multiplier: self.per_unit_multiplier,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn env_usize(var: &'static str) -> Result<Option<usize>, ConfigError> {
    let Some(raw) = env::var(var).ok() else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<usize>()
        .map(Some)
        .map_err(|_| ConfigError::Env { var, value: raw })
}
