//! Durable work queue with three lanes: ready, delayed, and dead-letter.
//!
//! Ready messages ride a memory channel; the lane spills to a checksummed
//! frame file on shutdown and recovers it on startup, so a graceful restart
//! loses nothing. Delayed messages sit in a min-heap scored by their
//! `available_at` and are migrated into ready by a mover task. Dead letters
//! are appended straight to their file; they are terminal and must survive.
//!
//! Consumers must tolerate re-delivery: a crash between pop and ack means
//! the message is replayed on the next run.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aircraft_states::{AircraftState, DataSource};

/// Magic bytes for spill file format: "FLYQ0001"
const MAGIC: &[u8; 8] = b"FLYQ0001";

/// How often the mover migrates due delayed messages into ready.
const MOVER_INTERVAL: Duration = Duration::from_millis(250);

/// One unit of ingestion work. `available_at` is epoch milliseconds; ready
/// messages carry the enqueue time, delayed ones the due time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    pub state: AircraftState,
    pub source: DataSource,
    pub source_priority: i32,
    pub ingestion_timestamp: DateTime<Utc>,
    pub retries: u32,
    pub available_at: i64,
    /// Set by the CONUS scanner so 1 Hz sweeps do not flood the history.
    #[serde(default)]
    pub skip_history: bool,
}

/// One webhook delivery attempt waiting its turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMessage {
    pub delivery_id: uuid::Uuid,
    pub event_id: uuid::Uuid,
    pub subscription_id: uuid::Uuid,
    pub attempt: i32,
    pub retries: u32,
    pub available_at: i64,
}

/// Terminal wrapper written to the dead-letter file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter<T> {
    pub message: T,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneDepths {
    pub ready: usize,
    pub delayed: usize,
    pub dead_lettered: u64,
}

impl LaneDepths {
    pub fn total_pending(&self) -> usize {
        self.ready + self.delayed
    }
}

struct DelayedEntry<T> {
    available_at: i64,
    seq: u64,
    message: T,
}

// Heap ordering on (available_at, seq) only; seq keeps FIFO within a tick.
impl<T> PartialEq for DelayedEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.available_at == other.available_at && self.seq == other.seq
    }
}

impl<T> Eq for DelayedEntry<T> {}

impl<T> PartialOrd for DelayedEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DelayedEntry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.available_at, self.seq).cmp(&(other.available_at, other.seq))
    }
}

/// Three-lane durable queue. Lane keys name the spill files under `dir`.
pub struct DurableQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    name: String,
    ready_path: PathBuf,
    delayed_path: PathBuf,
    dlq_path: PathBuf,
    ready_tx: flume::Sender<T>,
    ready_rx: flume::Receiver<T>,
    delayed: Mutex<BinaryHeap<Reverse<DelayedEntry<T>>>>,
    delayed_seq: AtomicU64,
    dead_count: AtomicU64,
    high_water_mark: usize,
    cancel: CancellationToken,
}

impl<T> DurableQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open a queue, recovering any spilled messages from a previous run.
    pub fn open(
        name: &str,
        dir: &Path,
        ready_key: &str,
        delayed_key: &str,
        dlq_key: &str,
        high_water_mark: usize,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create queue directory: {:?}", dir))?;

        let (ready_tx, ready_rx) = flume::unbounded();

        let queue = Self {
            name: name.to_string(),
            ready_path: dir.join(format!("{ready_key}.q")),
            delayed_path: dir.join(format!("{delayed_key}.q")),
            dlq_path: dir.join(format!("{dlq_key}.q")),
            ready_tx,
            ready_rx,
            delayed: Mutex::new(BinaryHeap::new()),
            delayed_seq: AtomicU64::new(0),
            dead_count: AtomicU64::new(0),
            high_water_mark,
            cancel: CancellationToken::new(),
        };

        queue.recover()?;
        Ok(queue)
    }

    /// Append a batch to the ready lane. O(batch), never blocks.
    pub fn enqueue_batch(&self, messages: Vec<T>) {
        let count = messages.len();
        for message in messages {
            // Unbounded channel: send only fails when the queue is dropped
            if self.ready_tx.send(message).is_err() {
                warn!("Queue '{}' closed, dropping enqueue", self.name);
                return;
            }
        }
        metrics::counter!(format!("queue.{}.enqueued", self.name)).increment(count as u64);
        metrics::gauge!(format!("queue.{}.ready_depth", self.name))
            .set(self.ready_rx.len() as f64);
    }

    pub fn enqueue(&self, message: T) {
        self.enqueue_batch(vec![message]);
    }

    /// Pop one ready message, waiting up to `block_timeout`.
    pub async fn pop(&self, block_timeout: Duration) -> Option<T> {
        match tokio::time::timeout(block_timeout, self.ready_rx.recv_async()).await {
            Ok(Ok(message)) => {
                metrics::gauge!(format!("queue.{}.ready_depth", self.name))
                    .set(self.ready_rx.len() as f64);
                Some(message)
            }
            _ => None,
        }
    }

    /// Pop without waiting. Used to coalesce batches after a blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.ready_rx.try_recv().ok()
    }

    /// Move a message to the delayed lane, due `delay` from now.
    pub fn reschedule(&self, message: T, delay: Duration) {
        let available_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let seq = self.delayed_seq.fetch_add(1, Ordering::Relaxed);
        let mut delayed = self.delayed.lock().expect("delayed lane lock poisoned");
        delayed.push(Reverse(DelayedEntry {
            available_at,
            seq,
            message,
        }));
        metrics::counter!(format!("queue.{}.rescheduled", self.name)).increment(1);
        metrics::gauge!(format!("queue.{}.delayed_depth", self.name)).set(delayed.len() as f64);
    }

    /// Terminal failure: append to the dead-letter file.
    pub fn dead_letter(&self, message: T, reason: &str) {
        let letter = DeadLetter {
            message,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        };
        if let Err(e) = append_frame(&self.dlq_path, &letter) {
            error!(
                "Queue '{}' failed to write dead letter ({}): {}",
                self.name, reason, e
            );
            metrics::counter!(format!("queue.{}.file_errors_total", self.name)).increment(1);
        }
        self.dead_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(format!("queue.{}.dead_lettered", self.name)).increment(1);
        warn!("Queue '{}' dead-lettered a message: {}", self.name, reason);
    }

    pub fn depths(&self) -> LaneDepths {
        LaneDepths {
            ready: self.ready_rx.len(),
            delayed: self
                .delayed
                .lock()
                .expect("delayed lane lock poisoned")
                .len(),
            dead_lettered: self.dead_count.load(Ordering::Relaxed),
        }
    }

    /// Producers shed load above the high-water mark.
    pub fn is_backpressured(&self) -> bool {
        self.depths().total_pending() > self.high_water_mark
    }

    /// Migrate due delayed messages into ready. Returns how many moved.
    pub fn move_due(&self, now_ms: i64) -> usize {
        let mut moved = 0;
        let mut delayed = self.delayed.lock().expect("delayed lane lock poisoned");
        while let Some(Reverse(head)) = delayed.peek() {
            if head.available_at > now_ms {
                break;
            }
            let Reverse(entry) = delayed.pop().expect("peeked entry vanished");
            if self.ready_tx.send(entry.message).is_err() {
                break;
            }
            moved += 1;
        }
        if moved > 0 {
            metrics::gauge!(format!("queue.{}.delayed_depth", self.name))
                .set(delayed.len() as f64);
            metrics::gauge!(format!("queue.{}.ready_depth", self.name))
                .set(self.ready_rx.len() as f64);
        }
        moved
    }

    /// Spawn the mover task. One per queue.
    pub fn spawn_mover(self: std::sync::Arc<Self>) -> JoinHandle<()> {
        let queue = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MOVER_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = queue.cancel.cancelled() => {
                        debug!("Queue '{}' mover stopped", queue.name);
                        return;
                    }
                    _ = ticker.tick() => {
                        let moved = queue.move_due(Utc::now().timestamp_millis());
                        if moved > 0 {
                            debug!("Queue '{}' moved {} due messages to ready", queue.name, moved);
                        }
                    }
                }
            }
        })
    }

    /// Stop the mover and spill in-memory lanes to disk. Call on shutdown
    /// after consumers have drained their in-flight messages.
    pub fn flush(&self) -> Result<()> {
        self.cancel.cancel();

        let mut ready = Vec::new();
        while let Ok(message) = self.ready_rx.try_recv() {
            ready.push(message);
        }
        write_spill(&self.ready_path, &ready)
            .with_context(|| format!("Failed to spill ready lane for queue '{}'", self.name))?;

        let mut delayed_messages = Vec::new();
        {
            let mut delayed = self.delayed.lock().expect("delayed lane lock poisoned");
            while let Some(Reverse(entry)) = delayed.pop() {
                delayed_messages.push((entry.available_at, entry.message));
            }
        }
        write_delayed_spill(&self.delayed_path, &delayed_messages)
            .with_context(|| format!("Failed to spill delayed lane for queue '{}'", self.name))?;

        info!(
            "Queue '{}' spilled {} ready and {} delayed messages",
            self.name,
            ready.len(),
            delayed_messages.len()
        );
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        let mut recovered = 0usize;

        if self.ready_path.exists() {
            let messages: Vec<T> = read_spill(&self.ready_path, &self.name)?;
            recovered += messages.len();
            for message in messages {
                let _ = self.ready_tx.send(message);
            }
            std::fs::remove_file(&self.ready_path).ok();
        }

        if self.delayed_path.exists() {
            let messages: Vec<(i64, T)> = read_spill(&self.delayed_path, &self.name)?;
            recovered += messages.len();
            let mut delayed = self.delayed.lock().expect("delayed lane lock poisoned");
            for (available_at, message) in messages {
                let seq = self.delayed_seq.fetch_add(1, Ordering::Relaxed);
                delayed.push(Reverse(DelayedEntry {
                    available_at,
                    seq,
                    message,
                }));
            }
            std::fs::remove_file(&self.delayed_path).ok();
        }

        self.dead_count
            .store(count_frames(&self.dlq_path), Ordering::Relaxed);

        if recovered > 0 {
            info!(
                "Queue '{}' recovered {} messages from previous run",
                self.name, recovered
            );
            metrics::counter!(format!("queue.{}.recovered", self.name))
                .increment(recovered as u64);
        }
        Ok(())
    }
}

fn init_spill_file(path: &Path) -> Result<File> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create spill file: {:?}", path))?;
    file.write_all(MAGIC)?;
    Ok(file)
}

fn write_spill<T: Serialize>(path: &Path, messages: &[T]) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }
    let file = init_spill_file(path)?;
    let mut writer = BufWriter::new(file);
    for message in messages {
        write_frame(&mut writer, message)?;
    }
    writer.flush()?;
    writer.into_inner()?.sync_all()?;
    Ok(())
}

fn write_delayed_spill<T: Serialize>(path: &Path, messages: &[(i64, T)]) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }
    let file = init_spill_file(path)?;
    let mut writer = BufWriter::new(file);
    for entry in messages {
        write_frame(&mut writer, entry)?;
    }
    writer.flush()?;
    writer.into_inner()?.sync_all()?;
    Ok(())
}

fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let data = bincode::serialize(message).context("Failed to serialize queue message")?;
    let mut hasher = Hasher::new();
    hasher.update(&data);
    let checksum = hasher.finalize();

    writer.write_all(&(data.len() as u32).to_le_bytes())?;
    writer.write_all(&data)?;
    writer.write_all(&checksum.to_le_bytes())?;
    Ok(())
}

fn append_frame<T: Serialize>(path: &Path, message: &T) -> Result<()> {
    let mut file = if path.exists() {
        OpenOptions::new().append(true).open(path)?
    } else {
        init_spill_file(path)?
    };
    let mut buf = Vec::new();
    write_frame(&mut buf, message)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    Ok(())
}

fn read_spill<T: DeserializeOwned>(path: &Path, queue_name: &str) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("Failed to open spill: {:?}", path))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader
        .read_exact(&mut magic)
        .with_context(|| format!("Spill file too short: {:?}", path))?;
    if &magic != MAGIC {
        anyhow::bail!("Bad magic in spill file {:?}", path);
    }

    let mut messages = Vec::new();
    loop {
        let mut len_bytes = [0u8; 4];
        if reader.read_exact(&mut len_bytes).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut data = vec![0u8; len];
        if reader.read_exact(&mut data).is_err() {
            warn!("Queue '{}' spill truncated mid-frame, stopping", queue_name);
            metrics::counter!(format!("queue.{}.file_errors_total", queue_name)).increment(1);
            break;
        }

        let mut checksum_bytes = [0u8; 4];
        if reader.read_exact(&mut checksum_bytes).is_err() {
            warn!("Queue '{}' spill truncated mid-frame, stopping", queue_name);
            metrics::counter!(format!("queue.{}.file_errors_total", queue_name)).increment(1);
            break;
        }
        let expected = u32::from_le_bytes(checksum_bytes);

        let mut hasher = Hasher::new();
        hasher.update(&data);
        if hasher.finalize() != expected {
            error!("Queue '{}' checksum mismatch, skipping frame", queue_name);
            metrics::counter!(format!("queue.{}.file_errors_total", queue_name)).increment(1);
            continue;
        }

        match bincode::deserialize(&data) {
            Ok(message) => messages.push(message),
            Err(e) => {
                error!("Queue '{}' undecodable frame: {}", queue_name, e);
                metrics::counter!(format!("queue.{}.file_errors_total", queue_name)).increment(1);
            }
        }
    }
    Ok(messages)
}

fn count_frames(path: &Path) -> u64 {
    let Ok(file) = File::open(path) else {
        return 0;
    };
    let mut reader = BufReader::new(file);
    let mut magic = [0u8; 8];
    if reader.read_exact(&mut magic).is_err() || &magic != MAGIC {
        return 0;
    }

    let mut count = 0u64;
    loop {
        let mut len_bytes = [0u8; 4];
        if reader.read_exact(&mut len_bytes).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_bytes) as i64;
        if std::io::copy(
            &mut reader.by_ref().take((len + 4) as u64),
            &mut std::io::sink(),
        )
        .is_err()
        {
            break;
        }
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn open_queue(dir: &Path) -> DurableQueue<String> {
        DurableQueue::open("test", dir, "queue.ready", "queue.delayed", "queue.dlq", 100).unwrap()
    }

    #[tokio::test]
    async fn enqueue_pop_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());

        queue.enqueue_batch(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(queue.pop(Duration::from_millis(10)).await.unwrap(), "a");
        assert_eq!(queue.pop(Duration::from_millis(10)).await.unwrap(), "b");
        assert!(queue.pop(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn reschedule_holds_until_due() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());

        queue.reschedule("later".to_string(), Duration::from_secs(60));
        assert!(queue.pop(Duration::from_millis(10)).await.is_none());
        assert_eq!(queue.depths().delayed, 1);

        // Not yet due
        assert_eq!(queue.move_due(Utc::now().timestamp_millis()), 0);
        // Due one minute from now
        assert_eq!(
            queue.move_due(Utc::now().timestamp_millis() + 61_000),
            1
        );
        assert_eq!(queue.pop(Duration::from_millis(10)).await.unwrap(), "later");
    }

    #[test]
    fn move_due_preserves_due_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = open_queue(dir.path());

        queue.reschedule("second".to_string(), Duration::from_millis(200));
        queue.reschedule("first".to_string(), Duration::from_millis(100));

        queue.move_due(Utc::now().timestamp_millis() + 1000);
        assert_eq!(queue.try_pop().unwrap(), "first");
        assert_eq!(queue.try_pop().unwrap(), "second");
    }

    #[tokio::test]
    async fn flush_and_recover_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = open_queue(dir.path());
            queue.enqueue("ready1".to_string());
            queue.enqueue("ready2".to_string());
            queue.reschedule("delayed1".to_string(), Duration::from_secs(3600));
            queue.flush().unwrap();
        }

        let queue = open_queue(dir.path());
        let depths = queue.depths();
        assert_eq!(depths.ready, 2);
        assert_eq!(depths.delayed, 1);
        assert_eq!(queue.pop(Duration::from_millis(10)).await.unwrap(), "ready1");
    }

    #[test]
    fn dead_letters_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = open_queue(dir.path());
            queue.dead_letter("poison".to_string(), "icao24 malformed");
            queue.dead_letter("toxic".to_string(), "icao24 malformed");
        }

        let queue = open_queue(dir.path());
        assert_eq!(queue.depths().dead_lettered, 2);
    }

    #[test]
    fn backpressure_above_high_water_mark() {
        let dir = tempfile::tempdir().unwrap();
        let queue =
            DurableQueue::open("hwm", dir.path(), "queue.ready", "queue.delayed", "queue.dlq", 2)
                .unwrap();
        queue.enqueue_batch(vec!["a".into(), "b".into()]);
        assert!(!queue.is_backpressured());
        queue.enqueue("c".to_string());
        assert!(queue.is_backpressured());
    }

    #[tokio::test]
    async fn mover_task_migrates_due_messages() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(open_queue(dir.path()));
        let handle = queue.clone().spawn_mover();

        queue.reschedule("soon".to_string(), Duration::from_millis(50));
        let popped = queue.pop(Duration::from_secs(2)).await;
        assert_eq!(popped.unwrap(), "soon");

        queue.cancel.cancel();
        handle.await.unwrap();
    }
}
