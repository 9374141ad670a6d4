//! Process-wide metric registry
//!
//! Register-or-fetch semantics keyed by canonical string: asking for the
//! same key twice returns the same instrument set. A destination that
//! reconnects to a new endpoint re-registers under the new sanitised
//! address; series for the old address stay in the registry for reporters
//! that still reference them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{DestinationMetrics, SpoolMetrics};

/// Registry of metric sets, shared by all destinations in the process
///
/// Cheap to clone via `Arc`; constructors take `Arc<MetricsRegistry>` rather
/// than reaching for a hidden global.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    destinations: RwLock<HashMap<String, Arc<DestinationMetrics>>>,
    spools: RwLock<HashMap<String, Arc<SpoolMetrics>>>,
}

impl MetricsRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register or fetch the metric set for a destination
    ///
    /// `clean_addr` is the sanitised `host:port` (dots and colons replaced
    /// with underscores).
    pub fn destination(&self, clean_addr: &str) -> Arc<DestinationMetrics> {
        if let Some(existing) = self.destinations.read().get(clean_addr) {
            return Arc::clone(existing);
        }
        let mut map = self.destinations.write();
        Arc::clone(
            map.entry(clean_addr.to_string())
                .or_insert_with(|| Arc::new(DestinationMetrics::new())),
        )
    }

    /// Register or fetch the metric set for a spool
    pub fn spool(&self, key: &str) -> Arc<SpoolMetrics> {
        if let Some(existing) = self.spools.read().get(key) {
            return Arc::clone(existing);
        }
        let mut map = self.spools.write();
        Arc::clone(
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(SpoolMetrics::new())),
        )
    }

    /// All registered destination keys, for reporters
    pub fn destination_keys(&self) -> Vec<String> {
        self.destinations.read().keys().cloned().collect()
    }
}
