//! Persistence configuration

use crate::constants::*;
use crate::{ConfigError, EmberError, EmberResult};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the persistence backbone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Root directory; every namespace gets a subdirectory.
    pub data_root: PathBuf,

    // Batch writers
    pub batch_size: usize,
    pub flush_interval: Duration,

    // Archive tool
    pub archive_tool: String,
    pub archive_format: String,
    pub archive_method: String,
    pub decompress_timeout: Duration,
    pub compress_timeout: Duration,
    pub archive_interval: Duration,

    // Shards
    /// Number of most recent periods exempt from archival (current included).
    pub active_window: u32,
    /// Maximum inclusive number of periods a map-reduce may touch.
    pub max_map_reduce_span: u32,
    /// Fixed offset used to bucket timestamps into shards.
    pub utc_offset_hours: i32,

    // Connection tuning
    pub mmap_size: i64,
    pub busy_timeout: Duration,
    pub pool_max_size: u32,

    /// Users always persisted with superuser permission.
    pub superusers: Vec<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
            archive_tool: DEFAULT_ARCHIVE_TOOL.to_string(),
            archive_format: DEFAULT_ARCHIVE_FORMAT.to_string(),
            archive_method: DEFAULT_ARCHIVE_METHOD.to_string(),
            decompress_timeout: Duration::from_secs(DEFAULT_DECOMPRESS_TIMEOUT_SECS),
            compress_timeout: Duration::from_secs(DEFAULT_COMPRESS_TIMEOUT_SECS),
            archive_interval: Duration::from_secs(DEFAULT_ARCHIVE_INTERVAL_SECS),
            active_window: DEFAULT_ACTIVE_WINDOW,
            max_map_reduce_span: DEFAULT_MAX_MAP_REDUCE_SPAN,
            utc_offset_hours: 0,
            mmap_size: DEFAULT_MMAP_SIZE,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
            superusers: Vec::new(),
        }
    }
}

impl PersistenceConfig {
    /// Create PersistenceConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `EMBER_DATA_ROOT`: Root directory for all stores (default: ./data/db)
    /// - `EMBER_BATCH_SIZE`: Items per deferred flush (default: 50)
    /// - `EMBER_FLUSH_INTERVAL_MS`: Max age of a buffered item (default: 3000)
    /// - `EMBER_ARCHIVE_TOOL`: Archive program (default: 7z)
    /// - `EMBER_ARCHIVE_FORMAT` / `EMBER_ARCHIVE_METHOD`: Passed as `-t` / `-m0=` (default: 7z / lzma2)
    /// - `EMBER_DECOMPRESS_TIMEOUT_SECS`: Hard limit on reinflating a shard (default: 45)
    /// - `EMBER_COMPRESS_TIMEOUT_SECS`: Hard limit on archiving a shard (default: 300)
    /// - `EMBER_ARCHIVE_INTERVAL_SECS`: Archiver job period (default: 86400)
    /// - `EMBER_ACTIVE_WINDOW`: Hot periods kept uncompressed (default: 2)
    /// - `EMBER_MAX_MAP_REDUCE_SPAN`: Map-reduce period bound (default: 6)
    /// - `EMBER_UTC_OFFSET_HOURS`: Offset used for shard routing (default: 0)
    /// - `EMBER_MMAP_SIZE`: SQLite mmap_size pragma (default: 268435456)
    /// - `EMBER_BUSY_TIMEOUT_MS`: SQLite busy timeout (default: 5000)
    /// - `EMBER_POOL_MAX_SIZE`: Connections per file (default: 8)
    /// - `EMBER_SUPERUSERS`: Comma separated user ids
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let data_root = std::env::var("EMBER_DATA_ROOT")
            .ok()
            .map(PathBuf::from)
            .unwrap_or(defaults.data_root);

        let batch_size = std::env::var("EMBER_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.batch_size);

        let flush_interval = std::env::var("EMBER_FLUSH_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.flush_interval);

        let archive_tool = std::env::var("EMBER_ARCHIVE_TOOL").unwrap_or(defaults.archive_tool);
        let archive_format =
            std::env::var("EMBER_ARCHIVE_FORMAT").unwrap_or(defaults.archive_format);
        let archive_method =
            std::env::var("EMBER_ARCHIVE_METHOD").unwrap_or(defaults.archive_method);

        let decompress_timeout = std::env::var("EMBER_DECOMPRESS_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.decompress_timeout);

        let compress_timeout = std::env::var("EMBER_COMPRESS_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.compress_timeout);

        let archive_interval = std::env::var("EMBER_ARCHIVE_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.archive_interval);

        let active_window = std::env::var("EMBER_ACTIVE_WINDOW")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.active_window);

        let max_map_reduce_span = std::env::var("EMBER_MAX_MAP_REDUCE_SPAN")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_map_reduce_span);

        let utc_offset_hours = std::env::var("EMBER_UTC_OFFSET_HOURS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.utc_offset_hours);

        let mmap_size = std::env::var("EMBER_MMAP_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.mmap_size);

        let busy_timeout = std::env::var("EMBER_BUSY_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.busy_timeout);

        let pool_max_size = std::env::var("EMBER_POOL_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.pool_max_size);

        let superusers = std::env::var("EMBER_SUPERUSERS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            data_root,
            batch_size,
            flush_interval,
            archive_tool,
            archive_format,
            archive_method,
            decompress_timeout,
            compress_timeout,
            archive_interval,
            active_window,
            max_map_reduce_span,
            utc_offset_hours,
            mmap_size,
            busy_timeout,
            pool_max_size,
            superusers,
        }
    }

    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = root.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_archive_tool(mut self, program: impl Into<String>) -> Self {
        self.archive_tool = program.into();
        self
    }

    pub fn with_decompress_timeout(mut self, timeout: Duration) -> Self {
        self.decompress_timeout = timeout;
        self
    }

    pub fn with_active_window(mut self, periods: u32) -> Self {
        self.active_window = periods;
        self
    }

    pub fn with_utc_offset_hours(mut self, hours: i32) -> Self {
        self.utc_offset_hours = hours;
        self
    }

    pub fn with_superusers<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.superusers = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Offset used for shard routing. Call after `validate()`.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix())
    }

    pub fn is_superuser(&self, user_id: &str) -> bool {
        self.superusers.iter().any(|id| id == user_id)
    }

    /// Validate the configuration.
    ///
    /// Returns Ok(()) if valid, Err(EmberError::Config) if invalid.
    pub fn validate(&self) -> EmberResult<()> {
        if self.data_root.as_os_str().is_empty() {
            return Err(EmberError::Config(ConfigError::MissingRequired {
                field: "data_root".to_string(),
            }));
        }

        if self.batch_size == 0 {
            return Err(invalid("batch_size", "0", "must be greater than zero"));
        }

        if self.flush_interval.is_zero() {
            return Err(invalid("flush_interval", "0", "must be greater than zero"));
        }

        if self.archive_tool.trim().is_empty() {
            return Err(EmberError::Config(ConfigError::MissingRequired {
                field: "archive_tool".to_string(),
            }));
        }

        if self.decompress_timeout.is_zero() {
            return Err(invalid("decompress_timeout", "0", "must be greater than zero"));
        }

        if self.compress_timeout.is_zero() {
            return Err(invalid("compress_timeout", "0", "must be greater than zero"));
        }

        if self.active_window == 0 {
            return Err(invalid(
                "active_window",
                "0",
                "the current period must always stay hot",
            ));
        }

        if self.max_map_reduce_span == 0 {
            return Err(invalid("max_map_reduce_span", "0", "must be greater than zero"));
        }

        if self.utc_offset_hours.abs() > MAX_UTC_OFFSET_HOURS {
            return Err(invalid(
                "utc_offset_hours",
                &self.utc_offset_hours.to_string(),
                "must be within +/-23 hours",
            ));
        }

        if self.pool_max_size == 0 {
            return Err(invalid("pool_max_size", "0", "must be greater than zero"));
        }

        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> EmberError {
    EmberError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PersistenceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.flush_interval, Duration::from_secs(3));
        assert_eq!(config.decompress_timeout, Duration::from_secs(45));
        assert_eq!(config.active_window, 2);
        assert_eq!(config.max_map_reduce_span, 6);
        assert_eq!(config.mmap_size, 268_435_456);
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let config = PersistenceConfig::default().with_batch_size(0);
        assert!(matches!(
            config.validate(),
            Err(EmberError::Config(ConfigError::InvalidValue { ref field, .. })) if field == "batch_size"
        ));
    }

    #[test]
    fn test_validate_rejects_empty_active_window() {
        let config = PersistenceConfig::default().with_active_window(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_offset() {
        let config = PersistenceConfig::default().with_utc_offset_hours(30);
        assert!(config.validate().is_err());

        let config = PersistenceConfig::default().with_utc_offset_hours(8);
        assert!(config.validate().is_ok());
        assert_eq!(config.utc_offset().local_minus_utc(), 8 * 3600);
    }

    #[test]
    fn test_superuser_lookup() {
        let config = PersistenceConfig::default().with_superusers(["10001", "10002"]);
        assert!(config.is_superuser("10002"));
        assert!(!config.is_superuser("10003"));
    }
}
