//! Redo collection
//!
//! When a connection dies with spooling enabled, the engine hands the dead
//! connection to a detached collector. The collector drains the redo set
//! into the spool's bulk input, paced so the spool writer's real-time path
//! stays responsive, and terminates on its own. It never calls back into
//! the engine.

use std::time::Duration;

use ferry_protocol::Record;
use tokio::sync::mpsc;

use crate::Connection;

/// Pause between re-enqueued records
const REDO_PACE: Duration = Duration::from_micros(20);

/// Drain a dead connection's redo set into the spool's bulk input
pub(crate) async fn collect_redo(conn: Connection, bulk: mpsc::Sender<Record>) {
    let records = conn.take_redo();
    if records.is_empty() {
        return;
    }

    tracing::debug!(
        dest = %conn.addr(),
        count = records.len(),
        "collecting unflushed records into spool"
    );

    for record in records {
        if bulk.send(record).await.is_err() {
            // spool is shutting down; remaining records are lost by policy
            return;
        }
        tokio::time::sleep(REDO_PACE).await;
    }
}
