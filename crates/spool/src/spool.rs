//! Priority-aware spool
//!
//! Sits in front of the disk queue and provides buffering (to accept input
//! while storage is slow or an fsync runs), QoS between real-time and bulk
//! traffic, and controlled I/O rates.
//!
//! # Inputs
//!
//! - `in_rt` - small bounded channel for live traffic. Producers offer
//!   non-blockingly; overflow is the producer's problem to count.
//! - `in_bulk` - near-synchronous channel for recovery traffic. Producers
//!   are paced and block while the writer serves RT.
//!
//! The writer arbitrates with strict RT priority: a non-blocking RT poll
//! first, then a biased select over RT, Bulk and shutdown. Bulk can be
//! starved indefinitely under sustained RT load.
//!
//! # Output
//!
//! The disk queue's read channel behind a throttle that sleeps
//! `unspool_sleep` between deliveries, capping the replay rate so live
//! traffic keeps the upper hand.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ferry_config::SpoolConfig;
use ferry_metrics::SpoolMetrics;
use ferry_protocol::Record;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::{DiskQueue, DiskQueueHandle, QueueError};

/// Capacity of the real-time input
const IN_RT_SIZE: usize = 10;

/// A spool: RT/Bulk arbitration in front of a disk queue, with a throttled
/// replay output
pub struct Spool {
    key: String,
    in_rt_tx: mpsc::Sender<Record>,
    in_bulk_tx: mpsc::Sender<Record>,
    out_rx: mpsc::Receiver<Record>,
    spool_sleep: Duration,

    shutdown_writer_tx: Option<oneshot::Sender<()>>,
    shutdown_buffer_tx: Option<oneshot::Sender<()>>,
    queue: Option<DiskQueueHandle>,
    writer_task: JoinHandle<()>,
    buffer_task: JoinHandle<()>,
    throttle_task: JoinHandle<()>,

    metrics: Arc<SpoolMetrics>,
}

impl Spool {
    /// Create a spool keyed by the destination's sanitised address
    ///
    /// Opens (or restores) the disk queue `spool_<key>` under `dir` and
    /// spawns the writer, buffer and throttle tasks.
    pub fn new(
        key: &str,
        dir: &Path,
        config: &SpoolConfig,
        metrics: Arc<SpoolMetrics>,
    ) -> Result<Self, QueueError> {
        let queue_name = format!("spool_{key}");
        let queue = DiskQueue::open(&queue_name, dir, config, Arc::clone(&metrics))?;
        let (queue_handle, queue_read_rx) = queue.spawn();

        let (in_rt_tx, in_rt_rx) = mpsc::channel(IN_RT_SIZE);
        let (in_bulk_tx, in_bulk_rx) = mpsc::channel(1);
        let (queue_buffer_tx, queue_buffer_rx) = mpsc::channel(config.queue_buffer_size);
        let (out_tx, out_rx) = mpsc::channel(1);

        let (shutdown_writer_tx, shutdown_writer_rx) = oneshot::channel();
        let (shutdown_buffer_tx, shutdown_buffer_rx) = oneshot::channel();

        let writer_task = tokio::spawn(run_writer(
            key.to_string(),
            in_rt_rx,
            in_bulk_rx,
            queue_buffer_tx,
            shutdown_writer_rx,
            Arc::clone(&metrics),
        ));
        let buffer_task = tokio::spawn(run_buffer(
            queue_buffer_rx,
            queue_handle.put_sender(),
            shutdown_buffer_rx,
            Arc::clone(&metrics),
        ));
        let throttle_task = tokio::spawn(run_throttle(queue_read_rx, out_tx, config.unspool_sleep));

        tracing::debug!(key, dir = %dir.display(), "spool started");

        Ok(Self {
            key: key.to_string(),
            in_rt_tx,
            in_bulk_tx,
            out_rx,
            spool_sleep: config.spool_sleep,
            shutdown_writer_tx: Some(shutdown_writer_tx),
            shutdown_buffer_tx: Some(shutdown_buffer_tx),
            queue: Some(queue_handle),
            writer_task,
            buffer_task,
            throttle_task,
            metrics,
        })
    }

    /// Offer a record to the real-time input without blocking
    ///
    /// Returns the record back when the input is full (or the spool is
    /// shutting down); the caller counts the drop.
    pub fn try_send_rt(&self, record: Record) -> Result<(), Record> {
        self.in_rt_tx.try_send(record).map_err(|e| match e {
            mpsc::error::TrySendError::Full(r) => r,
            mpsc::error::TrySendError::Closed(r) => r,
        })
    }

    /// Sender for the bulk input, used by recovery tasks
    pub fn bulk_sender(&self) -> mpsc::Sender<Record> {
        self.in_bulk_tx.clone()
    }

    /// Feed a known set of records through the bulk input, paced by
    /// `spool_sleep` so the writer's RT path stays responsive
    pub async fn ingest(&self, records: Vec<Record>) {
        for record in records {
            if self.in_bulk_tx.send(record).await.is_err() {
                return;
            }
            tokio::time::sleep(self.spool_sleep).await;
        }
    }

    /// The throttled replay output
    ///
    /// The consumer decides when to read; records not read stay queued on
    /// disk (modulo the one record held by the throttle).
    pub fn out(&mut self) -> &mut mpsc::Receiver<Record> {
        &mut self.out_rx
    }

    /// Records currently queued on disk
    pub fn depth(&self) -> u64 {
        self.queue.as_ref().map(|q| q.depth()).unwrap_or(0)
    }

    /// This spool's metric set
    pub fn metrics(&self) -> &Arc<SpoolMetrics> {
        &self.metrics
    }

    /// Shut down: stop the writer and buffer, then close the disk queue
    /// (fsync + cursor persist) last
    pub async fn close(mut self) {
        tracing::debug!(key = %self.key, "spool shutting down");

        if let Some(tx) = self.shutdown_writer_tx.take() {
            let _ = tx.send(());
        }
        if let Some(tx) = self.shutdown_buffer_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.writer_task).await;
        let _ = (&mut self.buffer_task).await;

        if let Some(queue) = self.queue.take() {
            queue.close().await;
        }

        // unblock the throttle if it is mid-delivery
        drop(self.out_rx);
        let _ = (&mut self.throttle_task).await;
    }
}

/// The arbiter: strict RT priority over Bulk
///
/// Real-time traffic arrives at a fixed rate and must not slow down; bulk
/// offloads a potentially large known set and only gets spare capacity.
async fn run_writer(
    key: String,
    mut in_rt_rx: mpsc::Receiver<Record>,
    mut in_bulk_rx: mpsc::Receiver<Record>,
    queue_buffer_tx: mpsc::Sender<Record>,
    mut shutdown_rx: oneshot::Receiver<()>,
    metrics: Arc<SpoolMetrics>,
) {
    loop {
        // drain RT first; bulk only gets a chance when RT is idle
        match in_rt_rx.try_recv() {
            Ok(record) => {
                metrics.num_incoming_rt.inc();
                if !stage(&queue_buffer_tx, record, &metrics).await {
                    return;
                }
                continue;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }

        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                tracing::trace!(key = %key, "spool writer stopping");
                return;
            }
            Some(record) = in_rt_rx.recv() => {
                metrics.num_incoming_rt.inc();
                if !stage(&queue_buffer_tx, record, &metrics).await {
                    return;
                }
            }
            Some(record) = in_bulk_rx.recv() => {
                metrics.num_incoming_bulk.inc();
                if !stage(&queue_buffer_tx, record, &metrics).await {
                    return;
                }
            }
            else => return,
        }
    }
}

/// Stage a record into the queue buffer, tracking the watermark
async fn stage(
    queue_buffer_tx: &mpsc::Sender<Record>,
    record: Record,
    metrics: &SpoolMetrics,
) -> bool {
    let start = Instant::now();
    if queue_buffer_tx.send(record).await.is_err() {
        return false;
    }
    metrics.duration_buffer.observe(start.elapsed());
    metrics.num_buffered.inc();
    true
}

/// Drains the staging buffer into the disk queue
///
/// This separation absorbs the latency spikes of periodic fsyncs without
/// blocking the arbiter.
async fn run_buffer(
    mut queue_buffer_rx: mpsc::Receiver<Record>,
    put_tx: mpsc::Sender<Record>,
    mut shutdown_rx: oneshot::Receiver<()>,
    metrics: Arc<SpoolMetrics>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => return,
            record = queue_buffer_rx.recv() => {
                let Some(record) = record else { return };
                metrics.num_buffered.dec();
                let start = Instant::now();
                if put_tx.send(record).await.is_err() {
                    return;
                }
                metrics.duration_write.observe(start.elapsed());
            }
        }
    }
}

/// Caps the replay rate: one record, then a pause
async fn run_throttle(
    mut queue_read_rx: mpsc::Receiver<Record>,
    out_tx: mpsc::Sender<Record>,
    unspool_sleep: Duration,
) {
    while let Some(record) = queue_read_rx.recv().await {
        if out_tx.send(record).await.is_err() {
            return;
        }
        tokio::time::sleep(unspool_sleep).await;
    }
}

#[cfg(test)]
#[path = "spool_test.rs"]
mod spool_test;
