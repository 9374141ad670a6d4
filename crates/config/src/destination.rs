//! Destination configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::ConfigError;

/// Configuration for a single destination
///
/// Immutable after construction except for `addr`, which the engine replaces
/// when a reconnect resolves to a new endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Destination address (host:port)
    pub addr: String,

    /// Spool records to disk while the destination is down
    pub spool_enabled: bool,

    /// Parse and re-encode records to the binary wire frame
    pub reencode: bool,

    /// Maximum interval between auto-flushes of the connection buffer
    #[serde(with = "humantime_serde")]
    pub flush_period: Duration,

    /// Minimum interval between reconnect attempts while offline
    #[serde(with = "humantime_serde")]
    pub reconnect_period: Duration,

    /// Root directory for the on-disk spool
    pub spool_dir: PathBuf,

    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Socket write/flush timeout; a connection that cannot drain within
    /// this window is declared dead
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,

    /// Capacity of the connection's outbound record buffer
    pub io_buffer_size: usize,

    /// TCP keep-alive enabled
    pub tcp_keepalive: bool,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            spool_enabled: false,
            reencode: false,
            flush_period: Duration::from_secs(1),
            reconnect_period: Duration::from_secs(10),
            spool_dir: PathBuf::from("spool"),
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            io_buffer_size: 100,
            tcp_keepalive: true,
        }
    }
}

impl DestinationConfig {
    /// Create a config for the given address with defaults for the rest
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Enable spooling to the given directory
    #[must_use]
    pub fn with_spool(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_enabled = true;
        self.spool_dir = dir.into();
        self
    }

    /// Enable binary re-encoding
    #[must_use]
    pub fn with_reencode(mut self) -> Self {
        self.reencode = true;
        self
    }

    /// Set the auto-flush period
    #[must_use]
    pub fn with_flush_period(mut self, period: Duration) -> Self {
        self.flush_period = period;
        self
    }

    /// Set the reconnect period
    #[must_use]
    pub fn with_reconnect_period(mut self, period: Duration) -> Self {
        self.reconnect_period = period;
        self
    }

    /// Set the TCP connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the socket write/flush timeout
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the connection buffer capacity
    #[must_use]
    pub fn with_io_buffer_size(mut self, size: usize) -> Self {
        self.io_buffer_size = size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.is_empty() || !self.addr.contains(':') {
            return Err(ConfigError::InvalidAddr(self.addr.clone()));
        }
        if self.spool_enabled && self.spool_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingSpoolDir);
        }
        if self.flush_period.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "flush_period",
            });
        }
        if self.reconnect_period.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "reconnect_period",
            });
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration {
                name: "write_timeout",
            });
        }
        if self.io_buffer_size == 0 {
            return Err(ConfigError::ZeroSize {
                name: "io_buffer_size",
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
        let config = DestinationConfig::new("localhost:2003");
        assert_eq!(config.addr, "localhost:2003");
        assert!(!config.spool_enabled);
        assert!(!config.reencode);
        assert_eq!(config.flush_period, Duration::from_secs(1));
        assert_eq!(config.reconnect_period, Duration::from_secs(10));
        assert_eq!(config.io_buffer_size, 100);
    }

    #[test]
    fn test_builders() {
        let config = DestinationConfig::new("localhost:2003")
            .with_spool("/tmp/spool")
            .with_reencode()
            .with_flush_period(Duration::from_millis(100))
            .with_reconnect_period(Duration::from_millis(250))
            .with_io_buffer_size(30);

        assert!(config.spool_enabled);
        assert!(config.reencode);
        assert_eq!(config.spool_dir, PathBuf::from("/tmp/spool"));
        assert_eq!(config.flush_period, Duration::from_millis(100));
        assert_eq!(config.reconnect_period, Duration::from_millis(250));
        assert_eq!(config.io_buffer_size, 30);
    }

    #[test]
    fn test_validate_ok() {
        assert!(DestinationConfig::new("localhost:2003").validate().is_ok());
    }

    #[test]
    fn test_validate_empty_addr() {
        let err = DestinationConfig::new("").validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddr(_)));
    }

    #[test]
    fn test_validate_addr_without_port() {
        let err = DestinationConfig::new("localhost").validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddr(_)));
    }

    #[test]
    fn test_validate_spool_without_dir() {
        let mut config = DestinationConfig::new("localhost:2003");
        config.spool_enabled = true;
        config.spool_dir = PathBuf::new();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingSpoolDir));
    }

    #[test]
    fn test_validate_zero_flush_period() {
        let config =
            DestinationConfig::new("localhost:2003").with_flush_period(Duration::ZERO);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroDuration { .. }));
    }

    #[test]
    fn test_deserialize_with_humantime() {
        let toml = r#"
            addr = "10.0.0.1:2003"
            spool_enabled = true
            flush_period = "500ms"
            reconnect_period = "30s"
        "#;
        let config: DestinationConfig = toml::from_str(toml).unwrap();

        assert_eq!(config.addr, "10.0.0.1:2003");
        assert!(config.spool_enabled);
        assert_eq!(config.flush_period, Duration::from_millis(500));
        assert_eq!(config.reconnect_period, Duration::from_secs(30));
        // unspecified fields fall back to defaults
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }
}
