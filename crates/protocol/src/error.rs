//! Protocol error types

use thiserror::Error;

/// Errors from parsing or encoding metric records
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The line does not have exactly three whitespace-separated fields
    #[error("expected 3 fields (name value timestamp), got {0}")]
    FieldCount(usize),

    /// The metric name is empty
    #[error("empty metric name")]
    EmptyName,

    /// The metric name does not fit the frame's 16-bit length field
    #[error("metric name too long: {0} bytes")]
    NameTooLong(usize),

    /// The value field is not a parseable double
    #[error("invalid value {0:?}")]
    BadValue(String),

    /// The timestamp field is not parseable as unsigned 32-bit seconds
    #[error("invalid timestamp {0:?}")]
    BadTimestamp(String),

    /// The line is not valid UTF-8 where a numeric field was expected
    #[error("invalid UTF-8 in record")]
    BadEncoding,

    /// A binary frame is shorter than its declared length
    #[error("truncated frame: need {needed} bytes, have {have}")]
    TruncatedFrame { needed: usize, have: usize },
}
