//! Ferry - Transport
//!
//! The per-destination transport engine: the state machine between a
//! high-rate ingress channel, a TCP connection of variable health, and an
//! on-disk spool, under strict non-blocking guarantees.
//!
//! # Components
//!
//! - [`Connection`] - a TCP sender with a bounded outbound buffer, periodic
//!   auto-flush, a redo buffer that preserves unsent records on failure, and
//!   a liveness signal.
//! - [`Destination`] - the per-destination engine. It owns one connection
//!   and optionally one spool, routes incoming records, triggers
//!   reconnects, and arbitrates between live traffic and spool replay.
//! - A redo collector: a short-lived task that drains a dead connection's
//!   redo buffer back into the spool's bulk input at a paced rate.
//!
//! # Data flow
//!
//! ```text
//! router ─ engine ─┬─ connection ─ wire
//!                  └─ spool ─ disk ─ (later) engine ─ connection
//!
//! on connection death: connection.redo ─ redo collector ─ spool.bulk
//! ```
//!
//! # The one rule
//!
//! The engine never blocks on its ingress. Every send that would block is a
//! categorised, counted drop. A slow destination cannot stall the router
//! and, transitively, any other destination.

mod conn;
mod destination;
mod error;
mod redo;

pub use conn::{Connection, EnqueueResult};
pub use destination::{Destination, DestinationHandle, DestinationMetricsHandle, DestinationStatus};
pub use error::ConnectionError;
