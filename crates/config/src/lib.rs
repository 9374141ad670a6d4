//! Ferry - Configuration
//!
//! Configuration types consumed by the transport engine. Loading (file
//! discovery, TOML parsing front-end, reload) is the embedding relay's
//! concern; this crate defines the shapes, the defaults, and validation.
//!
//! # Example
//!
//! ```toml
//! [destinations.graphite]
//! addr = "10.0.0.1:2003"
//! spool_enabled = true
//! spool_dir = "/var/spool/ferry"
//! flush_period = "1s"
//! reconnect_period = "10s"
//! ```

mod destination;
mod error;
mod spool;

pub use destination::DestinationConfig;
pub use error::ConfigError;
pub use spool::SpoolConfig;
