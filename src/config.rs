//! Redlock Configuration
//!
//! This module provides configuration structures for the Redlock
//! lock manager: the set of independent stores, protocol timing knobs
//! and logging.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main Redlock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedlockConfig {
    /// Independent stores taking part in the quorum
    #[serde(default)]
    pub stores: Vec<StoreConfig>,

    /// Lock protocol configuration
    #[serde(default)]
    pub lock: LockConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A single store endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/0`
    pub url: String,

    /// Per-store timeout override in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Lock protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Expected clock drift as a fraction of the TTL
    #[serde(default = "default_drift_factor")]
    pub drift_factor: f64,

    /// Fixed drift allowance in milliseconds (store expiry precision)
    #[serde(default = "default_clock_drift_overhead_ms")]
    pub clock_drift_overhead_ms: u64,

    /// Maximum acquisition attempts
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Upper bound of the randomized delay between attempts, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Time budget for a single store call, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_drift_factor() -> f64 {
    0.01
}

fn default_clock_drift_overhead_ms() -> u64 {
    2
}

fn default_retry_count() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_store_timeout_ms() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            drift_factor: default_drift_factor(),
            clock_drift_overhead_ms: default_clock_drift_overhead_ms(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LockConfig {
    /// Validate the protocol settings on their own
    pub fn validate(&self) -> crate::Result<()> {
        if self.retry_count == 0 {
            return Err(crate::Error::Config("lock.retry_count must be at least 1".into()));
        }

        if !(0.0..1.0).contains(&self.drift_factor) {
            return Err(crate::Error::Config(format!(
                "lock.drift_factor must be in [0, 1), got {}",
                self.drift_factor
            )));
        }

        if self.store_timeout_ms == 0 {
            return Err(crate::Error::Config("lock.store_timeout_ms cannot be 0".into()));
        }

        Ok(())
    }

    /// Get the store timeout as Duration
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Get the retry delay upper bound as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl RedlockConfig {
    /// Build a configuration for the given store URLs with default settings
    pub fn with_stores<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stores: urls
                .into_iter()
                .map(|url| StoreConfig {
                    url: url.into(),
                    timeout_ms: None,
                })
                .collect(),
            lock: LockConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RedlockConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.stores.is_empty() {
            return Err(crate::Error::Config("at least one [[stores]] entry is required".into()));
        }

        for (idx, store) in self.stores.iter().enumerate() {
            if store.url.trim().is_empty() {
                return Err(crate::Error::Config(format!("stores[{}].url cannot be empty", idx)));
            }
            if store.timeout_ms == Some(0) {
                return Err(crate::Error::Config(format!("stores[{}].timeout_ms cannot be 0", idx)));
            }
        }

        self.lock.validate()
    }

    /// Calculate quorum size
    pub fn quorum_size(&self) -> usize {
        (self.stores.len() / 2) + 1
    }

    /// Effective timeout for one store (override or global)
    pub fn store_timeout(&self, idx: usize) -> Duration {
        self.stores
            .get(idx)
            .and_then(|s| s.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.lock.store_timeout())
    }

    /// Render a starter configuration file
    pub fn sample() -> String {
        r#"# Redlock configuration
#
# Each [[stores]] entry must be an independent Redis instance.
# Quorum is floor(N/2) + 1.

[[stores]]
url = "redis://127.0.0.1:6379/"

[[stores]]
url = "redis://127.0.0.1:6389/"

[[stores]]
url = "redis://127.0.0.1:6399/"

[lock]
drift_factor = 0.01
clock_drift_overhead_ms = 2
retry_count = 3
retry_delay_ms = 200
store_timeout_ms = 50

[logging]
level = "info"
format = "pretty"
"#
        .to_string()
    }
}
