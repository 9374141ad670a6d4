//! Ferry - Metrics
//!
//! Internal metrics collection for the transport engine.
//!
//! # Overview
//!
//! This crate provides:
//! - Atomic metric instruments (counters, gauges, timers, size histograms)
//! - Per-destination and per-spool metric sets with snapshot structs
//! - A process-wide register-or-fetch registry keyed by sanitised address
//! - A provider trait so reporters can collect without knowing concrete types
//!
//! # Design Principles
//!
//! - **Lock-free**: All instruments use atomic operations
//! - **Low overhead**: No allocations during metric updates
//! - **Register-or-fetch**: Registering the same key twice yields the same
//!   instrument set, so a destination that reconnects under a new address can
//!   rebuild its labels without losing older series
//!
//! # Metrics Handle Pattern
//!
//! Components hold `Arc<DestinationMetrics>` internally and expose a
//! lightweight handle implementing [`DestinationMetricsProvider`]. The handle
//! remains valid after `run()` consumes the component.
//!
//! # Example
//!
//! ```ignore
//! use ferry_metrics::MetricsRegistry;
//!
//! let registry = MetricsRegistry::new();
//! let metrics = registry.destination("10_0_0_1_2003");
//! metrics.num_out.add(3);
//! assert_eq!(metrics.snapshot().num_out, 3);
//! ```

mod registry;
mod sets;

pub use registry::MetricsRegistry;
pub use sets::{
    DestinationMetrics, DestinationMetricsProvider, DestinationSnapshot, SpoolMetrics,
    SpoolSnapshot,
};

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Atomic counter wrapper for convenient metric operations
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Create a new counter initialized to 0
    #[inline]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increment the counter by `val` (relaxed ordering for performance)
    #[inline]
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Increment the counter by 1
    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    /// Get the current value (relaxed ordering)
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Atomic gauge that can move in both directions
///
/// Used for watermarks such as the number of records currently buffered.
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    /// Create a new gauge initialized to 0
    #[inline]
    pub const fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    /// Increment the gauge by 1
    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the gauge by 1
    #[inline]
    pub fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Move the gauge by a signed delta
    #[inline]
    pub fn add(&self, delta: i64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    /// Set the gauge to an absolute value
    #[inline]
    pub fn set(&self, val: i64) {
        self.0.store(val, Ordering::Relaxed);
    }

    /// Get the current value (relaxed ordering)
    #[inline]
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Accumulating duration timer
///
/// Tracks the number of observations and the total elapsed nanoseconds.
/// Reporters derive the mean from the snapshot.
#[derive(Debug, Default)]
pub struct Timer {
    count: AtomicU64,
    total_ns: AtomicU64,
}

impl Timer {
    /// Create a new timer with no observations
    #[inline]
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
        }
    }

    /// Record one observed duration
    #[inline]
    pub fn observe(&self, elapsed: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Number of recorded observations
    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Mean observed duration, or zero when nothing was recorded
    pub fn mean(&self) -> Duration {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.total_ns.load(Ordering::Relaxed) / count)
        }
    }
}

/// Size histogram tracking count, sum and maximum
///
/// Used for flush sizes, where the interesting values are the average flush
/// and the worst case.
#[derive(Debug, Default)]
pub struct SizeHistogram {
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl SizeHistogram {
    /// Create a new histogram with no observations
    #[inline]
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Record one observed size
    #[inline]
    pub fn observe(&self, val: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(val, Ordering::Relaxed);
        self.max.fetch_max(val, Ordering::Relaxed);
    }

    /// Number of recorded observations
    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Sum of all recorded sizes
    #[inline]
    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Largest recorded size
    #[inline]
    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }
}
