//! Segmented disk queue
//!
//! A persistent FIFO of records. Each record is framed on disk as a 4-byte
//! big-endian length followed by the payload. Records append to the latest
//! segment file; a segment rolls when the next record would push it past the
//! configured size. The reader holds a (segment, offset) cursor that only
//! moves forward; consumed segments are deleted.
//!
//! # On-disk layout
//!
//! ```text
//! <dir>/<name>.diskqueue.000000.dat
//! <dir>/<name>.diskqueue.000001.dat
//! <dir>/<name>.diskqueue.meta.dat
//! ```
//!
//! The metadata file holds `depth`, the read cursor and the write cursor,
//! one line each, and is rewritten (write-then-rename) on every sync.
//!
//! # Durability
//!
//! `put` returns once the record is in the kernel buffer. An fsync runs
//! after every `sync_every_n` records or every `sync_period`, whichever
//! comes first; records between sync points may be lost on hard crash.
//!
//! # Failure
//!
//! Truncated or corrupt records on read are counted, skipped, and the
//! reader advances past them. Write errors are surfaced to the caller,
//! which drops the record and keeps the queue usable.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use ferry_config::SpoolConfig;
use ferry_metrics::SpoolMetrics;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::QueueError;

/// Records larger than this are rejected outright (matches the relay's
/// ingress limit; anything bigger is not a metric line)
pub const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

/// Capacity of the put channel in front of the queue task
const PUT_CHANNEL_SIZE: usize = 64;

/// A segmented, synced disk queue
///
/// The synchronous core. Most callers use [`DiskQueue::spawn`] to run it as
/// a task and talk to it over channels; the methods are public so tests and
/// tools can drive the queue directly.
pub struct DiskQueue {
    name: String,
    dir: PathBuf,

    max_bytes_per_segment: u64,
    sync_every_n: u64,
    sync_period: std::time::Duration,

    depth: u64,
    read_segment: u64,
    read_offset: u64,
    write_segment: u64,
    write_offset: u64,

    writer: Option<BufWriter<File>>,
    reader: Option<BufReader<File>>,

    /// Records written since the last fsync
    unsynced: u64,
    /// Cursor moved since the metadata file was last rewritten
    meta_dirty: bool,

    metrics: Arc<SpoolMetrics>,
}

impl DiskQueue {
    /// Open or create a disk queue named `name` under `dir`
    ///
    /// Restores the cursors from the metadata file when one exists.
    pub fn open(
        name: &str,
        dir: &Path,
        config: &SpoolConfig,
        metrics: Arc<SpoolMetrics>,
    ) -> Result<Self, QueueError> {
        fs::create_dir_all(dir)?;

        let mut queue = Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            max_bytes_per_segment: config.max_bytes_per_segment,
            sync_every_n: config.sync_every_n,
            sync_period: config.sync_period,
            depth: 0,
            read_segment: 0,
            read_offset: 0,
            write_segment: 0,
            write_offset: 0,
            writer: None,
            reader: None,
            unsynced: 0,
            meta_dirty: false,
            metrics,
        };
        queue.load_meta()?;

        tracing::debug!(
            name = %queue.name,
            depth = queue.depth,
            read_segment = queue.read_segment,
            write_segment = queue.write_segment,
            "disk queue opened"
        );

        Ok(queue)
    }

    /// Number of records written but not yet read
    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// Append a record
    ///
    /// Returns once the record is handed to the kernel. Triggers the sync
    /// policy and rolls the segment when it would grow past the limit.
    pub fn put(&mut self, record: &[u8]) -> Result<(), QueueError> {
        if record.len() > MAX_RECORD_SIZE {
            return Err(QueueError::CorruptRecord {
                segment: self.write_segment,
                len: record.len() as u32,
            });
        }

        let framed_len = 4 + record.len() as u64;
        if self.write_offset > 0 && self.write_offset + framed_len > self.max_bytes_per_segment {
            self.roll_segment()?;
        }

        if self.writer.is_none() {
            let path = self.segment_path(self.write_segment);
            let mut file = OpenOptions::new().write(true).create(true).open(&path)?;
            file.seek(SeekFrom::Start(self.write_offset))?;
            self.writer = Some(BufWriter::new(file));
        }
        let writer = self.writer.as_mut().unwrap();
        writer.write_all(&(record.len() as u32).to_be_bytes())?;
        writer.write_all(record)?;

        self.write_offset += framed_len;
        self.depth += 1;
        self.unsynced += 1;
        self.meta_dirty = true;

        if self.unsynced >= self.sync_every_n {
            self.sync()?;
        }
        Ok(())
    }

    /// Read the next record, advancing the cursor
    ///
    /// Returns `None` when the queue is empty. Corrupt or truncated data is
    /// counted and skipped; the cursor never moves backwards.
    pub fn pop(&mut self) -> Result<Option<Bytes>, QueueError> {
        loop {
            if self.depth == 0 {
                return Ok(None);
            }

            if self.read_segment == self.write_segment {
                // reading at the head; buffered writes must be visible
                self.flush_writer()?;
                if self.read_offset >= self.write_offset {
                    // cursor caught up; leftover depth means records were
                    // skipped as corrupt
                    self.depth = 0;
                    self.meta_dirty = true;
                    return Ok(None);
                }
            }

            self.open_reader()?;

            let mut len_buf = [0u8; 4];
            let read = self.reader.as_mut().unwrap().read_exact(&mut len_buf);
            match read {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    if self.read_segment < self.write_segment {
                        // clean end of a finished segment
                        self.advance_segment()?;
                        continue;
                    }
                    // truncated tail in the head segment
                    self.metrics.num_err_truncated.inc();
                    self.skip_to_head();
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_be_bytes(len_buf);
            if !self.plausible_len(len) {
                tracing::warn!(
                    name = %self.name,
                    segment = self.read_segment,
                    offset = self.read_offset,
                    len,
                    "corrupt record length, skipping rest of segment"
                );
                self.metrics.num_err_truncated.inc();
                if self.read_segment < self.write_segment {
                    self.advance_segment()?;
                    continue;
                }
                self.skip_to_head();
                return Ok(None);
            }

            let mut payload = vec![0u8; len as usize];
            let read = self.reader.as_mut().unwrap().read_exact(&mut payload);
            match read {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    self.metrics.num_err_truncated.inc();
                    if self.read_segment < self.write_segment {
                        self.advance_segment()?;
                        continue;
                    }
                    self.skip_to_head();
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }

            self.read_offset += 4 + len as u64;
            self.depth -= 1;
            self.meta_dirty = true;
            return Ok(Some(Bytes::from(payload)));
        }
    }

    /// Whether the sync policy has anything to persist
    pub fn needs_sync(&self) -> bool {
        self.unsynced > 0 || self.meta_dirty
    }

    /// Flush, fsync the write segment, and rewrite the metadata file
    pub fn sync(&mut self) -> Result<(), QueueError> {
        self.flush_writer()?;
        if let Some(writer) = self.writer.as_ref() {
            writer.get_ref().sync_all()?;
        }
        self.persist_meta()?;
        self.unsynced = 0;
        Ok(())
    }

    /// Flush, sync, and persist the cursors
    pub fn close(&mut self) -> Result<(), QueueError> {
        self.sync()?;
        tracing::debug!(name = %self.name, depth = self.depth, "disk queue closed");
        Ok(())
    }

    /// Spawn the queue task
    ///
    /// Returns a handle for puts and shutdown plus the read channel. Every
    /// record received on the read channel has already advanced the cursor.
    pub fn spawn(self) -> (DiskQueueHandle, mpsc::Receiver<Bytes>) {
        let (put_tx, put_rx) = mpsc::channel(PUT_CHANNEL_SIZE);
        let (read_tx, read_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let depth = Arc::new(AtomicU64::new(self.depth));

        let join = tokio::spawn(run_queue(self, put_rx, read_tx, shutdown_rx, Arc::clone(&depth)));

        (
            DiskQueueHandle {
                put_tx,
                shutdown_tx: Some(shutdown_tx),
                join,
                depth,
            },
            read_rx,
        )
    }

    fn plausible_len(&self, len: u32) -> bool {
        if len == 0 || len as usize > MAX_RECORD_SIZE {
            return false;
        }
        if self.read_segment == self.write_segment
            && self.read_offset + 4 + len as u64 > self.write_offset
        {
            return false;
        }
        true
    }

    fn open_reader(&mut self) -> Result<(), QueueError> {
        if self.reader.is_none() {
            let path = self.segment_path(self.read_segment);
            let mut file = File::open(&path)?;
            file.seek(SeekFrom::Start(self.read_offset))?;
            self.reader = Some(BufReader::new(file));
        }
        Ok(())
    }

    fn flush_writer(&mut self) -> Result<(), QueueError> {
        if let Some(writer) = self.writer.as_mut() {
            if !writer.buffer().is_empty() {
                writer.flush()?;
                // the reader may hold a stale buffered view of the head segment
                if self.read_segment == self.write_segment {
                    self.reader = None;
                }
            }
        }
        Ok(())
    }

    /// Move the read cursor to the next segment, deleting the consumed one
    fn advance_segment(&mut self) -> Result<(), QueueError> {
        let consumed = self.segment_path(self.read_segment);
        if let Err(e) = fs::remove_file(&consumed) {
            tracing::warn!(path = %consumed.display(), error = %e, "failed to remove consumed segment");
        }
        self.read_segment += 1;
        self.read_offset = 0;
        self.reader = None;
        self.meta_dirty = true;
        Ok(())
    }

    /// Abandon unreadable data in the head segment
    fn skip_to_head(&mut self) {
        self.reader = None;
        self.read_segment = self.write_segment;
        self.read_offset = self.write_offset;
        self.depth = 0;
        self.meta_dirty = true;
    }

    fn segment_path(&self, segment: u64) -> PathBuf {
        self.dir
            .join(format!("{}.diskqueue.{:06}.dat", self.name, segment))
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(format!("{}.diskqueue.meta.dat", self.name))
    }

    fn roll_segment(&mut self) -> Result<(), QueueError> {
        self.sync()?;
        self.writer = None;
        self.write_segment += 1;
        self.write_offset = 0;
        self.meta_dirty = true;
        tracing::debug!(name = %self.name, segment = self.write_segment, "rolled to new segment");
        Ok(())
    }

    fn persist_meta(&mut self) -> Result<(), QueueError> {
        let tmp = self.meta_path().with_extension("tmp");
        let contents = format!(
            "{}\n{},{}\n{},{}\n",
            self.depth, self.read_segment, self.read_offset, self.write_segment, self.write_offset
        );
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, self.meta_path())?;
        self.meta_dirty = false;
        Ok(())
    }

    fn load_meta(&mut self) -> Result<(), QueueError> {
        let path = self.meta_path();
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let corrupt = |reason: &str| QueueError::CorruptMeta {
            path: path.clone(),
            reason: reason.to_string(),
        };

        let mut lines = contents.lines();
        let depth = lines
            .next()
            .ok_or_else(|| corrupt("missing depth"))?
            .parse()
            .map_err(|_| corrupt("bad depth"))?;
        let (read_segment, read_offset) =
            parse_cursor(lines.next().ok_or_else(|| corrupt("missing read cursor"))?)
                .ok_or_else(|| corrupt("bad read cursor"))?;
        let (write_segment, write_offset) =
            parse_cursor(lines.next().ok_or_else(|| corrupt("missing write cursor"))?)
                .ok_or_else(|| corrupt("bad write cursor"))?;

        self.depth = depth;
        self.read_segment = read_segment;
        self.read_offset = read_offset;
        self.write_segment = write_segment;
        self.write_offset = write_offset;
        Ok(())
    }
}

fn parse_cursor(line: &str) -> Option<(u64, u64)> {
    let (segment, offset) = line.split_once(',')?;
    Some((segment.parse().ok()?, offset.parse().ok()?))
}

/// Handle to a spawned queue task
pub struct DiskQueueHandle {
    put_tx: mpsc::Sender<Bytes>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
    depth: Arc<AtomicU64>,
}

impl DiskQueueHandle {
    /// Sender for appending records
    pub fn put_sender(&self) -> mpsc::Sender<Bytes> {
        self.put_tx.clone()
    }

    /// Current queue depth as last observed by the queue task
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Relaxed)
    }

    /// Stop the queue task: flush, fsync, persist cursors
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.join).await;
    }
}

/// The queue task: serves puts, drives the sync timer, and feeds the read
/// channel whenever a record is available and the consumer has room
async fn run_queue(
    mut queue: DiskQueue,
    mut put_rx: mpsc::Receiver<Bytes>,
    read_tx: mpsc::Sender<Bytes>,
    mut shutdown_rx: oneshot::Receiver<()>,
    depth: Arc<AtomicU64>,
) {
    let mut sync_interval = tokio::time::interval(queue.sync_period);
    sync_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut next: Option<Bytes> = None;
    let mut reader_gone = false;
    let mut puts_open = true;

    loop {
        if next.is_none() && !reader_gone {
            match queue.pop() {
                Ok(record) => next = record,
                Err(e) => {
                    tracing::warn!(name = %queue.name, error = %e, "disk queue read error, abandoning unread data");
                    queue.metrics.num_err_truncated.inc();
                    queue.skip_to_head();
                }
            }
        }
        depth.store(queue.depth, Ordering::Relaxed);

        tokio::select! {
            biased;
            _ = &mut shutdown_rx => {
                // drain puts already queued, then persist and exit
                while let Ok(record) = put_rx.try_recv() {
                    if let Err(e) = queue.put(&record) {
                        queue.metrics.num_err_write.inc();
                        tracing::warn!(name = %queue.name, error = %e, "disk queue write error during shutdown");
                    }
                }
                if let Err(e) = queue.close() {
                    tracing::warn!(name = %queue.name, error = %e, "disk queue close error");
                }
                depth.store(queue.depth, Ordering::Relaxed);
                return;
            }
            record = put_rx.recv(), if puts_open => {
                match record {
                    Some(record) => {
                        if let Err(e) = queue.put(&record) {
                            queue.metrics.num_err_write.inc();
                            tracing::warn!(name = %queue.name, error = %e, "disk queue write error, record dropped");
                        }
                    }
                    // all producers gone; keep serving reads until shutdown
                    None => puts_open = false,
                }
            }
            _ = sync_interval.tick() => {
                if queue.needs_sync() {
                    if let Err(e) = queue.sync() {
                        tracing::warn!(name = %queue.name, error = %e, "disk queue sync error");
                    }
                }
            }
            permit = read_tx.reserve(), if next.is_some() => {
                match permit {
                    Ok(permit) => permit.send(next.take().unwrap()),
                    Err(_) => reader_gone = true,
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
