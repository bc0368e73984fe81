//! Configuration loading and validation.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CheckError, Result};

fn default_max_count() -> u64 {
    5_000
}

fn default_max_bytes() -> u64 {
    20 * 1024 * 1024
}

fn default_max_consecutive_identical_keys() -> u64 {
    16
}

fn default_health_log_every_n_batches() -> u64 {
    25
}

/// Tuning knobs for batch hashing and verification.
///
/// Ceilings bound how much work a single batch may do: the scan holds its
/// snapshot for the whole batch without yielding, so batches are kept small
/// via `max_count`/`max_bytes` rather than via voluntary yields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckConfig {
    /// Maximum items (documents plus probed index keys) per batch.
    #[serde(default = "default_max_count")]
    pub max_count: u64,

    /// Maximum hashed bytes per batch. The first item of a batch is always
    /// accepted even if it alone exceeds this, so a batch is never empty.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    /// Ceiling on a run of bytewise-identical index keys consumed at the
    /// tail of a batch. Both nodes truncate the run at the same ceiling,
    /// keeping boundaries deterministic.
    #[serde(default = "default_max_consecutive_identical_keys")]
    pub max_consecutive_identical_keys: u64,

    /// Sample rate for Info-severity batch outcomes in optimized builds:
    /// one entry every N batches. Non-Info outcomes are always emitted.
    #[serde(default = "default_health_log_every_n_batches")]
    pub health_log_every_n_batches: u64,

    /// Administratively disable batch application on secondaries. Skipped
    /// batches are still acknowledged with a Warning health-log entry.
    #[serde(default)]
    pub skip_apply_on_secondary: bool,

    /// Rate limit between consumed items, in MiB/s. Zero disables the
    /// throttle; secondaries run unthrottled.
    #[serde(default)]
    pub max_throttle_mb_per_sec: u64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            max_count: default_max_count(),
            max_bytes: default_max_bytes(),
            max_consecutive_identical_keys: default_max_consecutive_identical_keys(),
            health_log_every_n_batches: default_health_log_every_n_batches(),
            skip_apply_on_secondary: false,
            max_throttle_mb_per_sec: 0,
        }
    }
}

impl CheckConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: CheckConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_count == 0 {
            return Err(CheckError::Config("max_count must be at least 1".into()));
        }
        if self.max_bytes == 0 {
            return Err(CheckError::Config("max_bytes must be at least 1".into()));
        }
        if self.max_consecutive_identical_keys == 0 {
            return Err(CheckError::Config(
                "max_consecutive_identical_keys must be at least 1".into(),
            ));
        }
        if self.health_log_every_n_batches == 0 {
            return Err(CheckError::Config(
                "health_log_every_n_batches must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
