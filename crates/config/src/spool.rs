//! Spool configuration

use std::time::Duration;

use serde::Deserialize;

use crate::ConfigError;

/// Tuning for the on-disk spool behind a destination
///
/// The defaults match a queue that syncs roughly once per second under
/// sustained load: the staging buffer absorbs one sync's worth of records,
/// and the unspool throttle leaves bandwidth for live traffic.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    /// Segment file size limit; a segment rolls before exceeding this
    pub max_bytes_per_segment: u64,

    /// Fsync after this many records
    pub sync_every_n: u64,

    /// Fsync at least this often regardless of record count
    #[serde(with = "humantime_serde")]
    pub sync_period: Duration,

    /// Capacity of the in-memory staging buffer in front of the disk queue
    pub queue_buffer_size: usize,

    /// Pause between records when bulk data is fed into the spool
    #[serde(with = "humantime_serde")]
    pub spool_sleep: Duration,

    /// Pause between records emitted from the spool during replay
    #[serde(with = "humantime_serde")]
    pub unspool_sleep: Duration,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_segment: 200 * 1024 * 1024,
            sync_every_n: 10_000,
            sync_period: Duration::from_secs(1),
            queue_buffer_size: 10_000,
            spool_sleep: Duration::from_micros(500),
            unspool_sleep: Duration::from_micros(10),
        }
    }
}

impl SpoolConfig {
    /// Set the segment size limit
    #[must_use]
    pub fn with_max_bytes_per_segment(mut self, bytes: u64) -> Self {
        self.max_bytes_per_segment = bytes;
        self
    }

    /// Set the record-count sync threshold
    #[must_use]
    pub fn with_sync_every_n(mut self, n: u64) -> Self {
        self.sync_every_n = n;
        self
    }

    /// Set the wall-clock sync period
    #[must_use]
    pub fn with_sync_period(mut self, period: Duration) -> Self {
        self.sync_period = period;
        self
    }

    /// Set the staging buffer capacity
    #[must_use]
    pub fn with_queue_buffer_size(mut self, size: usize) -> Self {
        self.queue_buffer_size = size;
        self
    }

    /// Set the replay throttle interval
    #[must_use]
    pub fn with_unspool_sleep(mut self, sleep: Duration) -> Self {
        self.unspool_sleep = sleep;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bytes_per_segment == 0 {
            return Err(ConfigError::ZeroSize {
                name: "max_bytes_per_segment",
            });
        }
        if self.sync_every_n == 0 {
            return Err(ConfigError::ZeroSize {
                name: "sync_every_n",
            });
        }
        if self.sync_period.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "sync_period",
            });
        }
        if self.queue_buffer_size == 0 {
            return Err(ConfigError::ZeroSize {
                name: "queue_buffer_size",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SpoolConfig::default();
        assert_eq!(config.max_bytes_per_segment, 200 * 1024 * 1024);
        assert_eq!(config.sync_every_n, 10_000);
        assert_eq!(config.sync_period, Duration::from_secs(1));
        assert_eq!(config.queue_buffer_size, 10_000);
        assert_eq!(config.spool_sleep, Duration::from_micros(500));
        assert_eq!(config.unspool_sleep, Duration::from_micros(10));
    }

    #[test]
    fn test_validate_ok() {
        assert!(SpoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_segment_size() {
        let config = SpoolConfig::default().with_max_bytes_per_segment(0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroSize { .. }));
    }

    #[test]
    fn test_validate_zero_sync_every_n() {
        let config = SpoolConfig::default().with_sync_every_n(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let toml = r#"
            max_bytes_per_segment = 1048576
            sync_period = "2s"
        "#;
        let config: SpoolConfig = toml::from_str(toml).unwrap();

        assert_eq!(config.max_bytes_per_segment, 1024 * 1024);
        assert_eq!(config.sync_period, Duration::from_secs(2));
        assert_eq!(config.sync_every_n, 10_000);
    }
}
