//! Spool error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the disk queue
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying file I/O failed
    #[error("disk queue i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The metadata file exists but cannot be parsed
    #[error("corrupt metadata file {path}: {reason}")]
    CorruptMeta {
        /// Path of the metadata file
        path: PathBuf,
        /// What failed to parse
        reason: String,
    },

    /// A record's length prefix is impossible for its segment
    #[error("corrupt record in segment {segment}: length {len}")]
    CorruptRecord {
        /// Segment index
        segment: u64,
        /// Declared record length
        len: u32,
    },
}
