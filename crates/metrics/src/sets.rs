//! Per-component metric sets
//!
//! Each destination and each spool owns one of these sets. All fields use
//! atomics, so the engine's tasks update them without coordination and a
//! reporter can snapshot them at any time.

use crate::{Counter, Gauge, SizeHistogram, Timer};

/// Metrics for one destination, identified by its sanitised address
///
/// Every record accepted by the engine increments exactly one of
/// `num_buffered` (via the gauge), `num_spool`, or one of the drop counters.
///
/// Truncation is observed by the destination's spool and counted on its
/// [`SpoolMetrics`] (same key); the destination's reporter handle merges
/// that count into [`DestinationSnapshot::num_err_truncated`].
#[derive(Debug, Default)]
pub struct DestinationMetrics {
    /// Records written out on the wire
    pub num_out: Counter,
    /// Write/flush errors observed by the connection
    pub num_err_write: Counter,
    /// Records dropped because there was no connection and no spool
    pub num_drop_no_conn_no_spool: Counter,
    /// Records handed to the spool RT input
    pub num_spool: Counter,
    /// Records dropped because the spool RT input was full
    pub num_drop_slow_spool: Counter,
    /// Records dropped because the connection buffer was full
    pub num_drop_slow_conn: Counter,
    /// Records dropped because they could not be re-encoded
    pub num_drop_bad_reencode: Counter,

    /// Records currently queued in the connection's outbound buffer
    pub num_buffered: Gauge,

    /// Records per automatic flush
    pub auto_flush_size: SizeHistogram,
    /// Records per requested flush
    pub manu_flush_size: SizeHistogram,

    /// Socket write duration
    pub duration_write: Timer,
    /// Automatic flush duration
    pub duration_auto_flush: Timer,
    /// Requested flush duration
    pub duration_manu_flush: Timer,
}

impl DestinationMetrics {
    /// Create a new set with all instruments at zero
    pub const fn new() -> Self {
        Self {
            num_out: Counter::new(),
            num_err_write: Counter::new(),
            num_drop_no_conn_no_spool: Counter::new(),
            num_spool: Counter::new(),
            num_drop_slow_spool: Counter::new(),
            num_drop_slow_conn: Counter::new(),
            num_drop_bad_reencode: Counter::new(),
            num_buffered: Gauge::new(),
            auto_flush_size: SizeHistogram::new(),
            manu_flush_size: SizeHistogram::new(),
            duration_write: Timer::new(),
            duration_auto_flush: Timer::new(),
            duration_manu_flush: Timer::new(),
        }
    }

    /// Take a snapshot of current counter and gauge values
    ///
    /// `num_err_truncated` starts at zero here; the owner merges the spool's
    /// truncation count before handing the snapshot to a reporter.
    pub fn snapshot(&self) -> DestinationSnapshot {
        DestinationSnapshot {
            num_out: self.num_out.get(),
            num_err_write: self.num_err_write.get(),
            num_err_truncated: 0,
            num_drop_no_conn_no_spool: self.num_drop_no_conn_no_spool.get(),
            num_spool: self.num_spool.get(),
            num_drop_slow_spool: self.num_drop_slow_spool.get(),
            num_drop_slow_conn: self.num_drop_slow_conn.get(),
            num_drop_bad_reencode: self.num_drop_bad_reencode.get(),
            num_buffered: self.num_buffered.get(),
        }
    }

    /// Sum of all drop counters
    pub fn total_drops(&self) -> u64 {
        self.num_drop_no_conn_no_spool.get()
            + self.num_drop_slow_spool.get()
            + self.num_drop_slow_conn.get()
            + self.num_drop_bad_reencode.get()
    }
}

/// Point-in-time snapshot of destination metrics
#[derive(Debug, Clone, Copy, Default)]
pub struct DestinationSnapshot {
    pub num_out: u64,
    pub num_err_write: u64,
    pub num_err_truncated: u64,
    pub num_drop_no_conn_no_spool: u64,
    pub num_spool: u64,
    pub num_drop_slow_spool: u64,
    pub num_drop_slow_conn: u64,
    pub num_drop_bad_reencode: u64,
    pub num_buffered: i64,
}

/// Trait for destinations to provide metrics to a reporter
///
/// The `snapshot()` method is the main requirement - it returns a copy of
/// the current values that can be safely used for reporting.
pub trait DestinationMetricsProvider: Send + Sync {
    /// The destination's sanitised address, used as the metric label
    fn clean_addr(&self) -> &str;

    /// Get a snapshot of current metrics
    fn snapshot(&self) -> DestinationSnapshot;
}

/// Metrics for one spool
///
/// The buffered gauge tracks the staging watermark: incremented when the
/// writer stages a record, decremented when the buffer task hands it to the
/// disk queue.
#[derive(Debug, Default)]
pub struct SpoolMetrics {
    /// Records seen on the RT input
    pub num_incoming_rt: Counter,
    /// Records seen on the Bulk input
    pub num_incoming_bulk: Counter,
    /// Truncated or corrupt records skipped on read
    pub num_err_truncated: Counter,
    /// Disk write errors (the record is lost, the queue continues)
    pub num_err_write: Counter,

    /// Records staged but not yet written to the disk queue
    pub num_buffered: Gauge,

    /// Disk queue put duration
    pub duration_write: Timer,
    /// Staging channel send duration
    pub duration_buffer: Timer,
}

impl SpoolMetrics {
    /// Create a new set with all instruments at zero
    pub const fn new() -> Self {
        Self {
            num_incoming_rt: Counter::new(),
            num_incoming_bulk: Counter::new(),
            num_err_truncated: Counter::new(),
            num_err_write: Counter::new(),
            num_buffered: Gauge::new(),
            duration_write: Timer::new(),
            duration_buffer: Timer::new(),
        }
    }

    /// Take a snapshot of current values
    pub fn snapshot(&self) -> SpoolSnapshot {
        SpoolSnapshot {
            num_incoming_rt: self.num_incoming_rt.get(),
            num_incoming_bulk: self.num_incoming_bulk.get(),
            num_err_truncated: self.num_err_truncated.get(),
            num_err_write: self.num_err_write.get(),
            num_buffered: self.num_buffered.get(),
        }
    }
}

/// Point-in-time snapshot of spool metrics
#[derive(Debug, Clone, Copy, Default)]
pub struct SpoolSnapshot {
    pub num_incoming_rt: u64,
    pub num_incoming_bulk: u64,
    pub num_err_truncated: u64,
    pub num_err_write: u64,
    pub num_buffered: i64,
}
