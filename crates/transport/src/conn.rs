//! TCP connection
//!
//! A sender with its own outbound buffer and writer task. The engine talks
//! to it through a non-blocking enqueue, an explicit flush, and a liveness
//! flag; everything else happens on the connection's own tasks.
//!
//! # Redo
//!
//! Every record accepted since the last successful flush is retained. When
//! the connection dies (write error, flush timeout, peer close), the
//! retained records plus anything still queued in the input channel become
//! the redo set, exposed through [`Connection::take_redo`] for recovery.
//!
//! # Liveness
//!
//! `alive` flips to false on any write error, read error, peer close, or
//! explicit close. The redo set is complete before the flag flips, so an
//! observer that sees `!is_alive()` can collect it immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ferry_config::DestinationConfig;
use ferry_metrics::DestinationMetrics;
use ferry_protocol::Record;
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::ConnectionError;

/// Socket write buffer size
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// TCP keep-alive probe interval
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of a non-blocking enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// The record is queued for the wire
    Enqueued,
    /// The connection's buffer cannot accept the record right now
    WouldBlock,
}

/// A live TCP connection to a destination
pub struct Connection {
    addr: String,
    in_tx: mpsc::Sender<Record>,
    flush_tx: mpsc::Sender<oneshot::Sender<Result<(), ConnectionError>>>,
    alive: Arc<AtomicBool>,
    redo: Arc<Mutex<Vec<Record>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Establish a connection and start its writer and reader tasks
    ///
    /// When `config.reencode` is set, records are pre-framed binary and go
    /// on the wire as-is; otherwise each record is followed by a newline.
    pub async fn connect(
        addr: &str,
        config: &DestinationConfig,
        metrics: Arc<DestinationMetrics>,
    ) -> Result<Self, ConnectionError> {
        let stream = match timeout(config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ConnectionError::ConnectFailed {
                    addr: addr.to_string(),
                    source: e,
                });
            }
            Err(_) => {
                return Err(ConnectionError::ConnectTimeout {
                    addr: addr.to_string(),
                });
            }
        };

        // lower latency for small metric lines (non-fatal if it fails)
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(dest = %addr, error = %e, "failed to set TCP_NODELAY");
        }

        if config.tcp_keepalive {
            let sock_ref = SockRef::from(&stream);
            let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_INTERVAL);

            #[cfg(target_os = "linux")]
            let keepalive = keepalive.with_interval(KEEPALIVE_INTERVAL);

            if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
                tracing::debug!(dest = %addr, error = %e, "failed to set TCP keep-alive");
            }
        }

        let (read_half, write_half) = stream.into_split();

        let (in_tx, in_rx) = mpsc::channel(config.io_buffer_size);
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let alive = Arc::new(AtomicBool::new(true));
        let redo = Arc::new(Mutex::new(Vec::new()));
        // writer_done stops the reader; peer_closed tells the writer to die
        // so the redo set is complete before liveness flips
        let writer_done = CancellationToken::new();
        let peer_closed = CancellationToken::new();

        let writer_state = Writer {
            addr: addr.to_string(),
            stream: BufWriter::with_capacity(WRITE_BUFFER_SIZE, write_half),
            newline: !config.reencode,
            write_timeout: config.write_timeout,
            unflushed: Vec::new(),
            alive: Arc::clone(&alive),
            redo: Arc::clone(&redo),
            done: writer_done.clone(),
            metrics,
        };

        let writer = tokio::spawn(run_writer(
            writer_state,
            in_rx,
            flush_rx,
            shutdown_rx,
            peer_closed.clone(),
            config.flush_period,
        ));
        let reader = tokio::spawn(run_reader(
            read_half,
            writer_done,
            peer_closed,
            addr.to_string(),
        ));

        tracing::debug!(dest = %addr, "connected");

        Ok(Self {
            addr: addr.to_string(),
            in_tx,
            flush_tx,
            alive,
            redo,
            shutdown_tx: Some(shutdown_tx),
            writer,
            reader,
        })
    }

    /// The address this connection was established to
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Last-known liveness
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Offer a record without blocking
    ///
    /// `WouldBlock` means the buffer is full or the writer is gone; the
    /// caller counts the drop.
    pub fn try_enqueue(&self, record: Record) -> EnqueueResult {
        match self.in_tx.try_send(record) {
            Ok(()) => EnqueueResult::Enqueued,
            Err(_) => EnqueueResult::WouldBlock,
        }
    }

    /// Block until everything enqueued so far is written to the socket
    pub async fn flush(&self) -> Result<(), ConnectionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.flush_tx.send(reply_tx).await.is_err() {
            return Err(ConnectionError::NotAlive);
        }
        reply_rx.await.unwrap_or(Err(ConnectionError::NotAlive))
    }

    /// Flush, then close the socket and stop both tasks
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.writer).await;
        let _ = (&mut self.reader).await;
        tracing::debug!(dest = %self.addr, "connection closed");
    }

    /// Take the records that were accepted but not confirmed flushed
    ///
    /// Only meaningful after death; the redo set is complete by the time
    /// `is_alive()` returns false.
    pub fn take_redo(&self) -> Vec<Record> {
        std::mem::take(&mut *self.redo.lock())
    }
}

/// Which path triggered a flush, for metric attribution
#[derive(Clone, Copy)]
enum FlushKind {
    Auto,
    Manual,
}

struct Writer {
    addr: String,
    stream: BufWriter<OwnedWriteHalf>,
    newline: bool,
    write_timeout: Duration,
    /// Records accepted since the last successful flush
    unflushed: Vec<Record>,
    alive: Arc<AtomicBool>,
    redo: Arc<Mutex<Vec<Record>>>,
    done: CancellationToken,
    metrics: Arc<DestinationMetrics>,
}

impl Writer {
    async fn write_record(&mut self, record: Record) -> Result<(), ConnectionError> {
        // retain before writing so a failed write still reaches the redo set
        self.unflushed.push(record.clone());

        let start = Instant::now();
        let result = timeout(self.write_timeout, async {
            self.stream.write_all(&record).await?;
            if self.newline {
                self.stream.write_all(b"\n").await?;
            }
            Ok::<(), std::io::Error>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                self.metrics.duration_write.observe(start.elapsed());
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    async fn flush_buffer(&mut self, kind: FlushKind) -> Result<(), ConnectionError> {
        if self.unflushed.is_empty() && self.stream.buffer().is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let result = timeout(self.write_timeout, self.stream.flush()).await;
        match result {
            Ok(Ok(())) => {
                let flushed = self.unflushed.len() as u64;
                match kind {
                    FlushKind::Auto => {
                        self.metrics.duration_auto_flush.observe(start.elapsed());
                        self.metrics.auto_flush_size.observe(flushed);
                    }
                    FlushKind::Manual => {
                        self.metrics.duration_manu_flush.observe(start.elapsed());
                        self.metrics.manu_flush_size.observe(flushed);
                    }
                }
                self.metrics.num_out.add(flushed);
                self.metrics.num_buffered.add(-(flushed as i64));
                self.unflushed.clear();
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }

    /// Capture the redo set and flip liveness; redo must be complete before
    /// the flag goes down
    fn die(&mut self, in_rx: &mut mpsc::Receiver<Record>, error: &ConnectionError) {
        self.metrics.num_err_write.inc();
        tracing::warn!(dest = %self.addr, error = %error, "connection died");

        let mut redo = self.redo.lock();
        self.metrics
            .num_buffered
            .add(-(self.unflushed.len() as i64));
        redo.append(&mut self.unflushed);
        while let Ok(record) = in_rx.try_recv() {
            self.metrics.num_buffered.dec();
            redo.push(record);
        }
        drop(redo);

        self.alive.store(false, Ordering::Release);
        self.done.cancel();
    }
}

async fn run_writer(
    mut writer: Writer,
    mut in_rx: mpsc::Receiver<Record>,
    mut flush_rx: mpsc::Receiver<oneshot::Sender<Result<(), ConnectionError>>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    peer_closed: CancellationToken,
    flush_period: Duration,
) {
    let mut ticker =
        tokio::time::interval_at(tokio::time::Instant::now() + flush_period, flush_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                if let Err(e) = writer.flush_buffer(FlushKind::Manual).await {
                    tracing::debug!(dest = %writer.addr, error = %e, "flush on close failed");
                }
                let _ = writer.stream.shutdown().await;
                writer.alive.store(false, Ordering::Release);
                writer.done.cancel();
                return;
            }
            _ = peer_closed.cancelled() => {
                writer.die(&mut in_rx, &ConnectionError::NotAlive);
                return;
            }
            Some(reply) = flush_rx.recv() => {
                match writer.flush_buffer(FlushKind::Manual).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        writer.die(&mut in_rx, &e);
                        let _ = reply.send(Err(e));
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = writer.flush_buffer(FlushKind::Auto).await {
                    writer.die(&mut in_rx, &e);
                    return;
                }
            }
            record = in_rx.recv() => {
                match record {
                    Some(record) => {
                        if let Err(e) = writer.write_record(record).await {
                            writer.die(&mut in_rx, &e);
                            return;
                        }
                    }
                    // the owning handle is gone; drain the socket and stop
                    None => {
                        let _ = writer.flush_buffer(FlushKind::Auto).await;
                        let _ = writer.stream.shutdown().await;
                        writer.alive.store(false, Ordering::Release);
                        writer.done.cancel();
                        return;
                    }
                }
            }
        }
    }
}

/// Watches the read side so a peer close is noticed even while the writer
/// is idle; destinations never send meaningful data back
async fn run_reader(
    mut read_half: OwnedReadHalf,
    writer_done: CancellationToken,
    peer_closed: CancellationToken,
    addr: String,
) {
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = writer_done.cancelled() => return,
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        tracing::debug!(dest = %addr, "peer closed connection");
                        peer_closed.cancel();
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(dest = %addr, error = %e, "read error");
                        peer_closed.cancel();
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "conn_test.rs"]
mod conn_test;
