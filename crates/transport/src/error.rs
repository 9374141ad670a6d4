//! Transport error types

use thiserror::Error;

/// Errors from the TCP connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// TCP connect failed
    #[error("connection failed to {addr}: {source}")]
    ConnectFailed {
        /// Destination address
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// TCP connect did not complete within the configured timeout
    #[error("connection to {addr} timed out")]
    ConnectTimeout {
        /// Destination address
        addr: String,
    },

    /// A socket write or flush failed
    #[error("write failed: {0}")]
    WriteFailed(#[from] std::io::Error),

    /// A write or flush did not complete within the configured timeout
    #[error("write timed out")]
    WriteTimeout,

    /// The connection is no longer alive
    #[error("connection is not alive")]
    NotAlive,
}
