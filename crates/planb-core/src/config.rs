//! Configuration management for PlanB environments
//!
//! Provides store size tier presets for different hardware classes.
//! Per-shard schema choices (key type, hash length, resolution) live with
//! each concrete shard's settings and are persisted in its schema
//! descriptor; this struct only covers the environment and its writer.

use std::time::Duration;

use crate::error::{PlanBError, PlanBResult};

/// Default number of applied actions after which the writer commits.
pub const DEFAULT_MAX_UNCOMMITTED_ACTIONS: usize = 1000;

/// Default time after the first uncommitted action at which the writer commits.
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_millis(1000);

/// PlanB environment configuration with store size presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum size of the memory map, i.e. the largest the store may grow (bytes)
    pub max_store_size_bytes: usize,
    /// Maximum number of concurrent read snapshots
    pub max_readers: u32,
    /// Maximum number of named databases in one environment
    pub max_dbs: u32,
    /// Commit once this many actions have been applied without a commit
    pub max_uncommitted_actions: usize,
    /// Commit once this long has passed since the first uncommitted action
    pub commit_interval: Duration,
    /// How often shutdown logs that the writer is still draining
    pub shutdown_log_interval: Duration,
}

impl Config {
    /// Server-class: 10GB map per shard
    pub fn server() -> Self {
        Self {
            max_store_size_bytes: 10 * 1024 * 1024 * 1024,
            max_readers: 126,
            max_dbs: 20,
            max_uncommitted_actions: DEFAULT_MAX_UNCOMMITTED_ACTIONS,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            shutdown_log_interval: Duration::from_secs(10),
        }
    }

    /// Workstation-class: 1GB map per shard
    pub fn workstation() -> Self {
        Self {
            max_store_size_bytes: 1024 * 1024 * 1024,
            max_readers: 64,
            ..Self::server()
        }
    }

    /// Budget-class: 64MB map per shard
    pub fn budget() -> Self {
        Self {
            max_store_size_bytes: 64 * 1024 * 1024,
            max_readers: 16,
            ..Self::server()
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_store_size_bytes < 1024 * 1024 {
            return Err("max_store_size_bytes must be >= 1MB".into());
        }
        if self.max_readers == 0 {
            return Err("max_readers must be > 0".into());
        }
        if self.max_dbs < 4 {
            return Err("max_dbs must be >= 4".into());
        }
        if self.max_uncommitted_actions == 0 {
            return Err("max_uncommitted_actions must be > 0".into());
        }
        if self.commit_interval.is_zero() {
            return Err("commit_interval must be > 0".into());
        }
        if self.shutdown_log_interval.is_zero() {
            return Err("shutdown_log_interval must be > 0".into());
        }
        Ok(())
    }

    pub(crate) fn checked(&self) -> PlanBResult<()> {
        self.validate().map_err(PlanBError::InvalidConfig)
    }
}

impl Default for Config {
    fn default() -> Self { Self::server() }
}
