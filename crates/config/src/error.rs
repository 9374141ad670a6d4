//! Configuration error types

use thiserror::Error;

/// Errors from validating configuration
///
/// These surface to the caller of the engine constructor; the engine never
/// starts with an invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Destination address is empty or has no port
    #[error("invalid destination address {0:?}")]
    InvalidAddr(String),

    /// Spooling enabled without a spool directory
    #[error("spool enabled but spool_dir is empty")]
    MissingSpoolDir,

    /// A period that drives a ticker must be non-zero
    #[error("{name} must be non-zero")]
    ZeroDuration {
        /// Name of the offending field
        name: &'static str,
    },

    /// A size or capacity must be non-zero
    #[error("{name} must be non-zero")]
    ZeroSize {
        /// Name of the offending field
        name: &'static str,
    },
}
