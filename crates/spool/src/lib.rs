//! Ferry - Spool
//!
//! On-disk spooling for destinations that are down or slow.
//!
//! # Overview
//!
//! Two layers:
//!
//! - [`queue`] - a segmented append-only disk queue: length-prefixed records
//!   across numbered segment files, a persistent read cursor, and a sync
//!   policy (fsync every N records or every sync period, whichever comes
//!   first). Records between sync points may be lost on hard crash; that is
//!   explicit policy, throughput over strict durability.
//! - [`spool`] - a priority-aware front for the queue: a small real-time
//!   input for live traffic, a synchronous bulk input for recovery traffic,
//!   strict RT-over-Bulk arbitration, an in-memory staging buffer that
//!   absorbs fsync latency, and a throttled output for replay.
//!
//! # Data flow
//!
//! ```text
//! in_rt  (cap 10, non-blocking offer) ─┐
//!                                      ├─ writer ─ queue_buffer ─ buffer ─ disk queue
//! in_bulk (cap 1, paced)              ─┘
//!
//! disk queue ─ throttle (unspool_sleep) ─ out
//! ```

mod error;
pub mod queue;
pub mod spool;

pub use error::QueueError;
pub use queue::{DiskQueue, DiskQueueHandle};
pub use spool::Spool;
