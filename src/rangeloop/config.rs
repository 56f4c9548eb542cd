//! Ranged loop configuration
//!
//! Supports layered configuration:
//! 1. Defaults
//! 2. A YAML file (`from_yaml_str` / `from_yaml_file`)
//! 3. Environment variables (`from_env`)
//! 4. Builder methods
//!
//! # Examples
//!
//! ```rust
//! use rangeloop::LoopConfig;
//! use std::time::Duration;
//!
//! let config = LoopConfig::default()
//!     .with_parallelism(8)
//!     .with_batch_size(10_000)
//!     .with_interval(Duration::ZERO);
//! assert!(!config.is_periodic());
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::rangeloop::error::{LoopError, LoopResult};

pub const DEFAULT_PARALLELISM: usize = 2;
pub const DEFAULT_BATCH_SIZE: usize = 2500;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SUSPICIOUS_PROCESSED_RATIO: f64 = 0.03;

/// Configuration for the ranged loop service
///
/// ## Environment Variables
/// - `RANGELOOP_PARALLELISM`: Partitions per pass (default: 2)
/// - `RANGELOOP_BATCH_SIZE`: Maximum segments per batch (default: 2500)
/// - `RANGELOOP_INTERVAL_SECS`: Seconds between passes, 0 disables (default: 7200)
/// - `RANGELOOP_SNAPSHOT_MAX_AGE_SECS`: Snapshot staleness limit, 0 reads latest (default: 300)
/// - `RANGELOOP_SUSPICIOUS_PROCESSED_RATIO`: Live count tolerance (default: 0.03)
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    /// Number of partitions processed concurrently; 0 behaves as 1
    pub parallelism: usize,

    /// Maximum segments per `process` call; 0 behaves as the default
    pub batch_size: usize,

    /// Time between passes of the periodic driver; zero disables it
    pub interval: Duration,

    /// How old a pinned read snapshot may get before it is replaced
    pub snapshot_max_age: Duration,

    /// Tolerated relative difference between processed and counted segments
    pub suspicious_processed_ratio: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            batch_size: DEFAULT_BATCH_SIZE,
            interval: DEFAULT_INTERVAL,
            snapshot_max_age: DEFAULT_SNAPSHOT_MAX_AGE,
            suspicious_processed_ratio: DEFAULT_SUSPICIOUS_PROCESSED_RATIO,
        }
    }
}

/// On-disk form; durations are whole seconds and every key is optional
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LoopConfigFile {
    parallelism: Option<usize>,
    batch_size: Option<usize>,
    interval_secs: Option<u64>,
    snapshot_max_age_secs: Option<u64>,
    suspicious_processed_ratio: Option<f64>,
}

impl LoopConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Self {
        Self::default().merge_lookup(|key| env::var(key).ok())
    }

    /// Override fields from `lookup`, which maps `RANGELOOP_*` names to values.
    /// Unparseable values are ignored.
    pub fn merge_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key).map(|v| v.trim().to_string());

        if let Some(v) = parse("RANGELOOP_PARALLELISM").and_then(|v| v.parse().ok()) {
            self.parallelism = v;
        }
        if let Some(v) = parse("RANGELOOP_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.batch_size = v;
        }
        if let Some(v) = parse("RANGELOOP_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.interval = Duration::from_secs(v);
        }
        if let Some(v) = parse("RANGELOOP_SNAPSHOT_MAX_AGE_SECS").and_then(|v| v.parse().ok()) {
            self.snapshot_max_age = Duration::from_secs(v);
        }
        if let Some(v) =
            parse("RANGELOOP_SUSPICIOUS_PROCESSED_RATIO").and_then(|v| v.parse().ok())
        {
            self.suspicious_processed_ratio = v;
        }
        self
    }

    /// Parse a YAML document; missing keys keep their defaults
    pub fn from_yaml_str(yaml: &str) -> LoopResult<Self> {
        let file: LoopConfigFile = serde_yaml::from_str(yaml)
            .map_err(|e| LoopError::configuration(format!("invalid YAML config: {}", e)))?;

        let defaults = Self::default();
        let config = Self {
            parallelism: file.parallelism.unwrap_or(defaults.parallelism),
            batch_size: file.batch_size.unwrap_or(defaults.batch_size),
            interval: file
                .interval_secs
                .map_or(defaults.interval, Duration::from_secs),
            snapshot_max_age: file
                .snapshot_max_age_secs
                .map_or(defaults.snapshot_max_age, Duration::from_secs),
            suspicious_processed_ratio: file
                .suspicious_processed_ratio
                .unwrap_or(defaults.suspicious_processed_ratio),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> LoopResult<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    /// Render as YAML in the same shape `from_yaml_str` reads
    pub fn to_yaml(&self) -> LoopResult<String> {
        let file = LoopConfigFile {
            parallelism: Some(self.parallelism),
            batch_size: Some(self.batch_size),
            interval_secs: Some(self.interval.as_secs()),
            snapshot_max_age_secs: Some(self.snapshot_max_age.as_secs()),
            suspicious_processed_ratio: Some(self.suspicious_processed_ratio),
        };
        serde_yaml::to_string(&file)
            .map_err(|e| LoopError::configuration(format!("failed to render config: {}", e)))
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_snapshot_max_age(mut self, snapshot_max_age: Duration) -> Self {
        self.snapshot_max_age = snapshot_max_age;
        self
    }

    pub fn with_suspicious_processed_ratio(mut self, ratio: f64) -> Self {
        self.suspicious_processed_ratio = ratio;
        self
    }

    /// Partitions actually used per pass
    pub fn effective_parallelism(&self) -> usize {
        self.parallelism.max(1)
    }

    /// Batch size actually used per pass
    pub fn effective_batch_size(&self) -> usize {
        if self.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            self.batch_size
        }
    }

    /// Whether the periodic driver runs at all
    pub fn is_periodic(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn validate(&self) -> LoopResult<()> {
        if !self.suspicious_processed_ratio.is_finite() || self.suspicious_processed_ratio < 0.0 {
            return Err(LoopError::configuration(format!(
                "suspicious_processed_ratio must be a non-negative number, got {}",
                self.suspicious_processed_ratio
            )));
        }
        Ok(())
    }

    /// One-line description for startup logs
    pub fn summary(&self) -> String {
        format!(
            "parallelism={}, batch_size={}, interval={:?}, snapshot_max_age={:?}, \
             suspicious_processed_ratio={}",
            self.effective_parallelism(),
            self.effective_batch_size(),
            self.interval,
            self.snapshot_max_age,
            self.suspicious_processed_ratio
        )
    }
}
