//! Kernel configuration.
//!
//! All settings have defaults, so an empty JSON object is a valid
//! configuration. Durations are written in humantime syntax ("30s", "250ms").

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which [`IoPool`](crate::pool::IoPool) buffers pending entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    /// Heap buffers (default)
    #[default]
    Memory,
    /// Anonymous temporary files
    TempFile,
}

/// Temporary storage settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub kind: PoolKind,
    /// Directory for temp file buffers; the system temp directory if unset
    pub directory: Option<PathBuf>,
}

/// Settings of the entry cache of archive mount points
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether archive controller chains include the caching controller
    pub enabled: bool,
    /// Upper bound of cached entry bytes per mount point
    pub max_bytes: u64,
    /// Entries unused for this long are evicted
    #[serde(with = "humantime_serde")]
    pub time_to_idle: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 16 * 1024 * 1024,
            time_to_idle: Duration::from_secs(300),
        }
    }
}

/// Kernel-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Upper bound for waiting on a contended mount point lock
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// Upper bound for sync to wait for other threads to close resources
    #[serde(with = "humantime_serde")]
    pub sync_wait_timeout: Duration,
    pub cache: CacheConfig,
    pub pool: PoolConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(30),
            sync_wait_timeout: Duration::from_secs(10),
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl KernelConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
