//! Configuration management for the shard query core
//!
//! TOML file support, environment variable overrides and sensible defaults
//! for the worker pools, query limits and cache refresh cadence.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Worker pool capacities
    #[serde(default)]
    pub pools: PoolConfig,

    /// Query limits
    #[serde(default)]
    pub query: QueryConfig,

    /// Cache refresh cadence
    #[serde(default)]
    pub cache: CacheConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool capacities
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Concurrent shard requests (one task per physical shard)
    #[serde(default = "default_shard_workers")]
    pub shard_workers: usize,

    /// Concurrent per-series merge tasks for range queries
    #[serde(default = "default_merge_workers")]
    pub merge_workers: usize,

    /// Concurrent fingerprint-batch submissions
    #[serde(default = "default_batch_workers")]
    pub batch_workers: usize,

    /// Concurrent detached follow-up tasks
    #[serde(default = "default_detached_workers")]
    pub detached_workers: usize,
}

/// Query limits
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Bucket budget of a single search request (series x buckets)
    #[serde(default = "default_max_points_per_query")]
    pub max_points_per_query: usize,

    /// Maximum series a single expression may resolve to
    #[serde(default = "default_max_series")]
    pub max_series: usize,

    /// Page size used when listing series fingerprints
    #[serde(default = "default_tsid_page_size")]
    pub tsid_page_size: usize,

    /// Abort sibling shard tasks as soon as one fails
    #[serde(default)]
    pub cancel_on_error: bool,

    /// Steps above this never backfill missing samples (milliseconds)
    #[serde(default = "default_fill_interval_threshold_ms")]
    pub fill_interval_threshold_ms: i64,

    /// Maximum age of a sample reused by backfill (milliseconds)
    #[serde(default = "default_lookback_delta_ms")]
    pub lookback_delta_ms: i64,
}

/// Cache refresh cadence
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Shard metadata refresh period in seconds
    #[serde(default = "default_shard_refresh_interval_secs")]
    pub shard_refresh_interval_secs: u64,

    /// Series identity entries older than this are rebuilt (seconds)
    #[serde(default = "default_tsid_full_refresh_interval_secs")]
    pub tsid_full_refresh_interval_secs: u64,

    /// Tail gaps this close to now are served without a fetch (milliseconds)
    #[serde(default = "default_tsid_tail_tolerance_ms")]
    pub tsid_tail_tolerance_ms: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_shard_workers() -> usize { 64 }
fn default_merge_workers() -> usize { num_cpus::get() }
fn default_batch_workers() -> usize { 8 }
fn default_detached_workers() -> usize { 4 }
fn default_max_points_per_query() -> usize { 1_000_000 }
fn default_max_series() -> usize { 100_000 }
fn default_tsid_page_size() -> usize { 10_000 }
fn default_fill_interval_threshold_ms() -> i64 { 300_000 }
fn default_lookback_delta_ms() -> i64 { 300_000 }
fn default_shard_refresh_interval_secs() -> u64 { 60 }
fn default_tsid_full_refresh_interval_secs() -> u64 { 3600 }
fn default_tsid_tail_tolerance_ms() -> i64 { 600_000 }
fn default_log_level() -> String { "info".to_string() }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            shard_workers: default_shard_workers(),
            merge_workers: default_merge_workers(),
            batch_workers: default_batch_workers(),
            detached_workers: default_detached_workers(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_points_per_query: default_max_points_per_query(),
            max_series: default_max_series(),
            tsid_page_size: default_tsid_page_size(),
            cancel_on_error: false,
            fill_interval_threshold_ms: default_fill_interval_threshold_ms(),
            lookback_delta_ms: default_lookback_delta_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shard_refresh_interval_secs: default_shard_refresh_interval_secs(),
            tsid_full_refresh_interval_secs: default_tsid_full_refresh_interval_secs(),
            tsid_tail_tolerance_ms: default_tsid_tail_tolerance_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl CacheConfig {
    /// Shard metadata refresh period
    pub fn shard_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.shard_refresh_interval_secs)
    }

    /// Full rebuild period of series identity entries, in milliseconds
    pub fn tsid_full_refresh_interval_ms(&self) -> i64 {
        (self.tsid_full_refresh_interval_secs as i64).saturating_mul(1000)
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {}: {}", path, e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file {}: {}", path, e))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }

        // Pools
        if let Some(n) = parsed("KUBA_SHARD_WORKERS") {
            self.pools.shard_workers = n;
        }
        if let Some(n) = parsed("KUBA_MERGE_WORKERS") {
            self.pools.merge_workers = n;
        }
        if let Some(n) = parsed("KUBA_BATCH_WORKERS") {
            self.pools.batch_workers = n;
        }

        // Query limits
        if let Some(n) = parsed("KUBA_MAX_POINTS_PER_QUERY") {
            self.query.max_points_per_query = n;
        }
        if let Some(n) = parsed("KUBA_MAX_SERIES") {
            self.query.max_series = n;
        }
        if let Some(b) = parsed("KUBA_CANCEL_ON_ERROR") {
            self.query.cancel_on_error = b;
        }

        // Logging
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.log_level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Configuration(msg.to_string()));

        if self.pools.shard_workers == 0
            || self.pools.merge_workers == 0
            || self.pools.batch_workers == 0
            || self.pools.detached_workers == 0
        {
            return invalid("Worker pool capacities must be > 0");
        }
        if self.query.max_points_per_query == 0 {
            return invalid("max_points_per_query must be > 0");
        }
        if self.query.max_series == 0 {
            return invalid("max_series must be > 0");
        }
        if self.query.tsid_page_size == 0 {
            return invalid("tsid_page_size must be > 0");
        }
        if self.cache.shard_refresh_interval_secs == 0 {
            return invalid("shard_refresh_interval_secs must be > 0");
        }
        if self.cache.tsid_tail_tolerance_ms < 0 {
            return invalid("tsid_tail_tolerance_ms cannot be negative");
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents).map_err(|e| {
            Error::Configuration(format!("Failed to write config file {}: {}", path, e))
        })
    }
}
