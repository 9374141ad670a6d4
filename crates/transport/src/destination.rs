//! Destination engine
//!
//! One engine per destination. The relay loop selects over the reconnect
//! ticker, connection updates, reconnect accounting, flush requests,
//! shutdown, spool replay and the ingress, and must never block on the
//! ingress: every send that would block is a categorised, counted drop.
//!
//! # Replay gating
//!
//! The spool is only drained while a connection exists and no record was
//! dropped to a slow connection in the current or previous reconnect-period
//! window (`slow_now` / `slow_last_loop`). A destination whose live traffic
//! is already being dropped must not compound the problem by replaying
//! bulk data at the same time; one clean window re-enables replay.
//!
//! # States
//!
//! ```text
//! Initial ─ Connecting ─ Online ─ Dying ─ Offline ─ (tick) ─ Connecting
//!                 └─ Offline                  any state ─ Closed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ferry_config::{ConfigError, DestinationConfig, SpoolConfig};
use ferry_metrics::{
    DestinationMetrics, DestinationMetricsProvider, DestinationSnapshot, MetricsRegistry,
    SpoolMetrics,
};
use ferry_protocol::{DataPoint, Record, clean_addr, encode_frame};
use ferry_spool::{QueueError, Spool};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::conn::EnqueueResult;
use crate::redo::collect_redo;
use crate::{Connection, ConnectionError};

/// Ingress channel capacity; the relay loop services it in bounded time, a
/// little slack absorbs scheduling jitter
const INGRESS_CHANNEL_SIZE: usize = 64;

/// A per-destination transport engine, ready to be spawned
pub struct Destination {
    config: DestinationConfig,
    spool_config: SpoolConfig,
    registry: Arc<MetricsRegistry>,
    metrics: Arc<DestinationMetrics>,
    spool_metrics: Option<Arc<SpoolMetrics>>,
    clean_addr: String,
}

impl Destination {
    /// Validate the configuration and register the destination's metrics
    pub fn new(
        config: DestinationConfig,
        spool_config: SpoolConfig,
        registry: Arc<MetricsRegistry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        spool_config.validate()?;

        let clean = clean_addr(&config.addr);
        let metrics = registry.destination(&clean);
        let spool_metrics = config.spool_enabled.then(|| registry.spool(&clean));

        Ok(Self {
            config,
            spool_config,
            registry,
            metrics,
            spool_metrics,
            clean_addr: clean,
        })
    }

    /// A metrics handle valid after the engine is spawned
    pub fn metrics_handle(&self) -> DestinationMetricsHandle {
        DestinationMetricsHandle {
            clean_addr: self.clean_addr.clone(),
            metrics: Arc::clone(&self.metrics),
            spool_metrics: self.spool_metrics.clone(),
        }
    }

    /// Start the engine: open the spool (when enabled), spawn the relay
    /// loop, and kick off the first connection attempt
    pub fn spawn(self) -> Result<DestinationHandle, QueueError> {
        let spool = match &self.spool_metrics {
            Some(spool_metrics) => Some(Spool::new(
                &self.clean_addr,
                &self.config.spool_dir,
                &self.spool_config,
                Arc::clone(spool_metrics),
            )?),
            None => None,
        };

        let (in_tx, in_rx) = mpsc::channel(INGRESS_CHANNEL_SIZE);
        let (conn_update_tx, conn_update_rx) = mpsc::channel(1);
        let (conn_done_tx, conn_done_rx) = mpsc::channel(1);
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let (addr_tx, addr_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let status = Arc::new(Status {
            addr: RwLock::new(self.config.addr.clone()),
            online: AtomicBool::new(false),
            spool_enabled: self.config.spool_enabled,
        });

        let relay = Relay {
            addr: self.config.addr.clone(),
            clean_addr: self.clean_addr,
            config: self.config,
            registry: self.registry,
            metrics: self.metrics,
            conn: None,
            spool,
            slow_now: false,
            slow_last_loop: false,
            in_flight_reconnects: 0,
            in_rx,
            conn_update_rx,
            conn_update_tx,
            conn_done_rx,
            conn_done_tx,
            flush_rx,
            addr_rx,
            status: Arc::clone(&status),
            tracker: TaskTracker::new(),
        };

        let join = tokio::spawn(relay.run(shutdown_rx));

        Ok(DestinationHandle {
            in_tx,
            flush_tx,
            addr_tx,
            shutdown_tx: Some(shutdown_tx),
            join,
            status,
        })
    }
}

/// Observable state of a running destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationStatus {
    /// Current destination address
    pub addr: String,
    /// Whether a live connection exists
    pub online: bool,
    /// Whether records spool to disk while the destination is down
    pub spool_enabled: bool,
}

struct Status {
    addr: RwLock<String>,
    online: AtomicBool,
    spool_enabled: bool,
}

/// Handle to a running destination engine
///
/// The router holds one of these per destination. Dropping the handle shuts
/// the engine down as if `shutdown()` had been called.
pub struct DestinationHandle {
    in_tx: mpsc::Sender<Record>,
    flush_tx: mpsc::Sender<oneshot::Sender<Result<(), ConnectionError>>>,
    addr_tx: mpsc::Sender<String>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
    status: Arc<Status>,
}

impl DestinationHandle {
    /// Deliver one record to the engine
    ///
    /// Completes in bounded time: the relay loop never blocks on its
    /// downstream, so the channel always drains. Returns the record back
    /// when the engine has shut down.
    pub async fn send(&self, record: Record) -> Result<(), Record> {
        self.in_tx.send(record).await.map_err(|e| e.0)
    }

    /// Sender for feeding records from another task
    pub fn sender(&self) -> mpsc::Sender<Record> {
        self.in_tx.clone()
    }

    /// Flush the connection's outbound buffer, if a connection exists
    pub async fn flush(&self) -> Result<(), ConnectionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.flush_tx.send(reply_tx).await.is_err() {
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }

    /// Point the destination at a new address
    ///
    /// The current connection (if any) keeps running until it dies; the
    /// next reconnect goes to the new address. Metric labels are rebuilt
    /// immediately.
    pub async fn update_address(&self, addr: String) {
        let _ = self.addr_tx.send(addr).await;
    }

    /// Whether a live connection exists right now
    pub fn is_online(&self) -> bool {
        self.status.online.load(Ordering::Relaxed)
    }

    /// A static copy of the destination's observable state
    pub fn snapshot(&self) -> DestinationStatus {
        DestinationStatus {
            addr: self.status.addr.read().clone(),
            online: self.status.online.load(Ordering::Relaxed),
            spool_enabled: self.status.spool_enabled,
        }
    }

    /// Stop the engine: flush and close the connection, wait for any
    /// in-flight reconnect and redo collection, close the spool
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.join).await;
    }
}

/// Metrics-provider handle for reporters, valid independent of the engine
///
/// Truncation is counted by the destination's spool (same key); the handle
/// folds that count into the destination snapshot so reporters see one set
/// per destination.
#[derive(Clone)]
pub struct DestinationMetricsHandle {
    clean_addr: String,
    metrics: Arc<DestinationMetrics>,
    spool_metrics: Option<Arc<SpoolMetrics>>,
}

impl DestinationMetricsProvider for DestinationMetricsHandle {
    fn clean_addr(&self) -> &str {
        &self.clean_addr
    }

    fn snapshot(&self) -> DestinationSnapshot {
        let mut snapshot = self.metrics.snapshot();
        if let Some(spool) = &self.spool_metrics {
            snapshot.num_err_truncated = spool.num_err_truncated.get();
        }
        snapshot
    }
}

/// A connection attempt's outcome, tagged with the address it went to
struct ConnUpdate {
    addr: String,
    conn: Option<Connection>,
}

/// One loop iteration's wake-up reason
enum Event {
    ConnAttemptDone,
    ConnUpdate(ConnUpdate),
    ReconnectTick,
    FlushRequest(oneshot::Sender<Result<(), ConnectionError>>),
    SetAddr(String),
    Replay(Option<Record>),
    Ingress(Option<Record>),
    Shutdown,
}

struct Relay {
    config: DestinationConfig,
    addr: String,
    clean_addr: String,
    registry: Arc<MetricsRegistry>,
    metrics: Arc<DestinationMetrics>,

    conn: Option<Connection>,
    spool: Option<Spool>,
    slow_now: bool,
    slow_last_loop: bool,
    in_flight_reconnects: u32,

    in_rx: mpsc::Receiver<Record>,
    conn_update_rx: mpsc::Receiver<ConnUpdate>,
    conn_update_tx: mpsc::Sender<ConnUpdate>,
    conn_done_rx: mpsc::Receiver<()>,
    conn_done_tx: mpsc::Sender<()>,
    flush_rx: mpsc::Receiver<oneshot::Sender<Result<(), ConnectionError>>>,
    addr_rx: mpsc::Receiver<String>,

    status: Arc<Status>,
    tracker: TaskTracker,
}

impl Relay {
    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        tracing::info!(
            dest = %self.addr,
            spool = self.config.spool_enabled,
            reencode = self.config.reencode,
            "destination starting"
        );

        let mut reconnect = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.reconnect_period,
            self.config.reconnect_period,
        );
        reconnect.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        self.start_connect();

        loop {
            // a dead connection is detached before anything else; its redo
            // set goes to the spool when we have one
            if self.conn.as_ref().is_some_and(|c| !c.is_alive()) {
                let conn = self.conn.take().unwrap();
                self.set_online(false);
                match &self.spool {
                    Some(spool) => {
                        self.tracker.spawn(collect_redo(conn, spool.bulk_sender()));
                    }
                    None => drop(conn),
                }
            }

            // replay only when connected and the last two windows were clean
            let allow_replay = self.conn.is_some()
                && self.spool.is_some()
                && !self.slow_last_loop
                && !self.slow_now;

            let spool_out = self.spool.as_mut();
            let event = tokio::select! {
                Some(()) = self.conn_done_rx.recv() => Event::ConnAttemptDone,
                Some(update) = self.conn_update_rx.recv() => Event::ConnUpdate(update),
                _ = reconnect.tick() => Event::ReconnectTick,
                Some(reply) = self.flush_rx.recv() => Event::FlushRequest(reply),
                Some(addr) = self.addr_rx.recv() => Event::SetAddr(addr),
                _ = &mut shutdown_rx => Event::Shutdown,
                record = async { spool_out.unwrap().out().recv().await }, if allow_replay => {
                    Event::Replay(record)
                }
                record = self.in_rx.recv() => Event::Ingress(record),
            };

            match event {
                Event::ConnAttemptDone => self.in_flight_reconnects -= 1,
                Event::ConnUpdate(update) => self.handle_conn_update(update),
                Event::ReconnectTick => {
                    if self.conn.is_none() && self.in_flight_reconnects == 0 {
                        self.start_connect();
                    }
                    self.slow_last_loop = self.slow_now;
                    self.slow_now = false;
                }
                Event::FlushRequest(reply) => {
                    let result = match &self.conn {
                        Some(conn) => conn.flush().await,
                        None => Ok(()),
                    };
                    let _ = reply.send(result);
                }
                Event::SetAddr(addr) => self.set_addr(addr),
                Event::Replay(Some(record)) => {
                    // conn is non-nil here, the replay branch is gated on it
                    self.non_blocking_send(record);
                }
                Event::Replay(None) => {}
                Event::Ingress(Some(record)) => self.handle_ingress(record),
                Event::Ingress(None) | Event::Shutdown => {
                    self.shutdown().await;
                    return;
                }
            }
        }
    }

    /// Ingress record: wire if connected, spool if enabled, drop otherwise
    fn handle_ingress(&mut self, record: Record) {
        if self.conn.is_some() {
            self.non_blocking_send(record);
        } else if let Some(spool) = &self.spool {
            match spool.try_send_rt(record) {
                Ok(()) => self.metrics.num_spool.inc(),
                Err(_) => {
                    self.metrics.num_drop_slow_spool.inc();
                    tracing::debug!(dest = %self.addr, "dropping record, spool is slow");
                }
            }
        } else {
            self.metrics.num_drop_no_conn_no_spool.inc();
        }
    }

    /// Try to put a record on the buffered connection; a refusal is a drop
    /// and marks the window slow
    fn non_blocking_send(&mut self, record: Record) {
        let record = if self.config.reencode {
            match DataPoint::parse(&record) {
                Ok(dp) => encode_frame(&dp),
                Err(e) => {
                    self.metrics.num_drop_bad_reencode.inc();
                    tracing::debug!(dest = %self.addr, error = %e, "dropping unparseable record");
                    return;
                }
            }
        } else {
            record
        };

        let Some(conn) = self.conn.as_ref() else {
            self.metrics.num_drop_no_conn_no_spool.inc();
            return;
        };
        match conn.try_enqueue(record) {
            EnqueueResult::Enqueued => self.metrics.num_buffered.inc(),
            EnqueueResult::WouldBlock => {
                self.metrics.num_drop_slow_conn.inc();
                self.slow_now = true;
                tracing::debug!(dest = %self.addr, "dropping record, connection is slow");
            }
        }
    }

    /// Launch a connection attempt
    ///
    /// The in-flight counter is bumped before the task exists, so at most
    /// one attempt can ever be running; the task signals completion over
    /// `conn_done` whether or not it connected.
    fn start_connect(&mut self) {
        self.in_flight_reconnects += 1;

        let addr = self.addr.clone();
        let config = self.config.clone();
        let metrics = Arc::clone(&self.metrics);
        let updates = self.conn_update_tx.clone();
        let done = self.conn_done_tx.clone();

        self.tracker.spawn(async move {
            match Connection::connect(&addr, &config, metrics).await {
                Ok(conn) => {
                    let _ = updates
                        .send(ConnUpdate {
                            addr,
                            conn: Some(conn),
                        })
                        .await;
                }
                Err(e) => {
                    tracing::debug!(dest = %addr, error = %e, "connect failed");
                }
            }
            let _ = done.send(()).await;
        });
    }

    fn handle_conn_update(&mut self, update: ConnUpdate) {
        match update.conn {
            Some(conn) => {
                // the attempt may have raced an address change; the address
                // that actually connected wins
                if update.addr != self.addr {
                    self.set_addr(update.addr);
                }
                self.conn = Some(conn);
                self.set_online(true);
                // new connection, clean slate
                self.slow_now = false;
                self.slow_last_loop = false;
                tracing::info!(dest = %self.addr, "destination online");
            }
            None => {
                self.conn = None;
                self.set_online(false);
            }
        }
    }

    /// Swap the address and rebuild the metric labels under the new
    /// sanitised address
    fn set_addr(&mut self, addr: String) {
        if addr == self.addr {
            return;
        }
        tracing::info!(old = %self.addr, new = %addr, "destination address updated");
        self.addr = addr;
        self.clean_addr = clean_addr(&self.addr);
        self.metrics = self.registry.destination(&self.clean_addr);
        *self.status.addr.write() = self.addr.clone();
    }

    fn set_online(&self, online: bool) {
        self.status.online.store(online, Ordering::Relaxed);
    }

    /// Orderly exit: wait out any in-flight reconnect, flush and close the
    /// connection, finish redo collection, close the spool last
    async fn shutdown(mut self) {
        tracing::info!(dest = %self.addr, "destination shutting down");

        // an in-flight connect cannot be cancelled; wait for it and close
        // whatever it produced so no socket leaks
        while self.in_flight_reconnects > 0 {
            tokio::select! {
                Some(()) = self.conn_done_rx.recv() => {
                    self.in_flight_reconnects -= 1;
                }
                Some(update) = self.conn_update_rx.recv() => {
                    if let Some(conn) = update.conn {
                        conn.close().await;
                    }
                }
            }
        }

        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.flush().await {
                tracing::warn!(dest = %self.addr, error = %e, "flush on shutdown failed");
            }
            conn.close().await;
        }
        self.set_online(false);

        // redo collectors must finish feeding the spool before it closes
        self.tracker.close();
        self.tracker.wait().await;

        if let Some(spool) = self.spool.take() {
            spool.close().await;
        }

        tracing::info!(dest = %self.addr, "destination stopped");
    }
}

#[cfg(test)]
#[path = "destination_test.rs"]
mod destination_test;
