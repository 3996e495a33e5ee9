//! Bounded multi-consumer unit queues with a configurable overflow policy.
//!
//! Every queue tracks its *outstanding* units: units enqueued for the first
//! time and not yet completed or abandoned. Retries are requeued without
//! touching the count, so a queue with zero outstanding units can never
//! receive more work from its own consumers.

use std::fmt;
use std::io::SeekFrom;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};

use crate::shutdown::StopSignal;

/// How often an idle consumer re-checks a non-empty spill file.
const SPILL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What a producer does when the channel is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Wait for room, giving up only on stop.
    Block,
    /// Append the unit to an on-disk spill file; consumers refill from it.
    #[default]
    Spill,
    /// Fail the enqueue, which aborts the run.
    FailFast,
}

impl FromStr for BackpressurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(Self::Block),
            "spill" => Ok(Self::Spill),
            "fail-fast" => Ok(Self::FailFast),
            other => Err(format!(
                "unknown backpressure policy '{other}', expected block, spill or fail-fast"
            )),
        }
    }
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Block => "block",
            Self::Spill => "spill",
            Self::FailFast => "fail-fast",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("{queue} queue is full ({capacity} units)")]
    Overflow { queue: &'static str, capacity: usize },

    #[error("{queue} queue is closed")]
    Closed { queue: &'static str },

    #[error("Stopped while waiting to enqueue")]
    Stopped,

    #[error("Spill file I/O failed: {0}")]
    Spill(#[from] std::io::Error),

    #[error("Spill file holds an undecodable unit: {0}")]
    SpillEncoding(#[from] serde_json::Error),
}

/// Append-only JSON lines file with a read cursor.
struct SpillFile<T> {
    file: NamedTempFile,
    writer: File,
    written: u64,
    read_offset: u64,
    /// A unit read back but not yet accepted by the channel
    pending: Option<T>,
}

impl<T: Serialize + DeserializeOwned> SpillFile<T> {
    fn create(directory: Option<&Path>, name: &'static str) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(name).suffix(".spill.jsonl");
        let file = match directory {
            Some(directory) => builder.tempfile_in(directory)?,
            None => builder.tempfile()?,
        };
        let writer = File::from_std(file.reopen()?);
        Ok(Self {
            file,
            writer,
            written: 0,
            read_offset: 0,
            pending: None,
        })
    }

    async fn append(&mut self, unit: &T) -> Result<(), QueueError> {
        let mut line = serde_json::to_vec(unit)?;
        line.push(b'\n');
        self.writer.seek(SeekFrom::Start(self.written)).await?;
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        self.written += line.len() as u64;
        Ok(())
    }

    /// Move spilled units into the channel until it is full or the file is
    /// exhausted. Returns how many units moved.
    async fn refill(&mut self, tx: &mpsc::Sender<T>, queue: &'static str) -> Result<u64, QueueError> {
        let mut moved = 0;
        if let Some(unit) = self.pending.take() {
            match tx.try_send(unit) {
                Ok(()) => moved += 1,
                Err(mpsc::error::TrySendError::Full(unit)) => {
                    self.pending = Some(unit);
                    return Ok(0);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(QueueError::Closed { queue }),
            }
        }

        if self.read_offset < self.written {
            let mut reader = BufReader::new(File::open(self.file.path()).await?);
            reader.seek(SeekFrom::Start(self.read_offset)).await?;
            let mut line = String::new();
            while self.read_offset < self.written {
                line.clear();
                let read = reader.read_line(&mut line).await?;
                if read == 0 {
                    break;
                }
                self.read_offset += read as u64;
                let unit: T = serde_json::from_str(line.trim_end())?;
                match tx.try_send(unit) {
                    Ok(()) => moved += 1,
                    Err(mpsc::error::TrySendError::Full(unit)) => {
                        self.pending = Some(unit);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        return Err(QueueError::Closed { queue });
                    }
                }
            }
        }

        if self.pending.is_none() && self.read_offset >= self.written {
            self.writer.set_len(0).await?;
            self.written = 0;
            self.read_offset = 0;
        }
        Ok(moved)
    }
}

struct QueueInner<T> {
    name: &'static str,
    policy: BackpressurePolicy,
    capacity: usize,
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    spill: Option<Mutex<SpillFile<T>>>,
    spilled: AtomicU64,
    outstanding: AtomicU64,
}

/// Cloneable handle on one bounded queue.
pub struct UnitQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for UnitQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for UnitQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitQueue")
            .field("name", &self.inner.name)
            .field("policy", &self.inner.policy)
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .field("spilled", &self.spilled())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl<T> UnitQueue<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    pub fn new(
        name: &'static str,
        capacity: usize,
        policy: BackpressurePolicy,
        spill_dir: Option<&Path>,
    ) -> Result<Self, QueueError> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let spill = match policy {
            BackpressurePolicy::Spill => Some(Mutex::new(SpillFile::create(spill_dir, name)?)),
            _ => None,
        };

        Ok(Self {
            inner: Arc::new(QueueInner {
                name,
                policy,
                capacity,
                tx,
                rx: Mutex::new(rx),
                spill,
                spilled: AtomicU64::new(0),
                outstanding: AtomicU64::new(0),
            }),
        })
    }

    /// Enqueue a newly discovered unit.
    pub async fn enqueue(&self, unit: T, stop: &mut StopSignal) -> Result<(), QueueError> {
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        self.deliver(unit, stop).await
    }

    /// Put a failed unit back for another attempt.
    pub async fn requeue(&self, unit: T, stop: &mut StopSignal) -> Result<(), QueueError> {
        self.deliver(unit, stop).await
    }

    /// A unit taken from this queue finished, successfully or abandoned.
    pub fn complete(&self) {
        self.inner.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    async fn deliver(&self, unit: T, stop: &mut StopSignal) -> Result<(), QueueError> {
        let inner = &self.inner;
        match inner.policy {
            BackpressurePolicy::Block => tokio::select! {
                sent = inner.tx.send(unit) => sent.map_err(|_| QueueError::Closed { queue: inner.name }),
                _ = stop.stopped() => Err(QueueError::Stopped),
            },
            BackpressurePolicy::FailFast => match inner.tx.try_send(unit) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => Err(QueueError::Overflow {
                    queue: inner.name,
                    capacity: inner.capacity,
                }),
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(QueueError::Closed { queue: inner.name })
                }
            },
            BackpressurePolicy::Spill => {
                // Spilled units go first, or FIFO order between the
                // channel and the file would invert.
                let unit = if inner.spilled.load(Ordering::SeqCst) == 0 {
                    match inner.tx.try_send(unit) {
                        Ok(()) => return Ok(()),
                        Err(mpsc::error::TrySendError::Full(unit)) => unit,
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            return Err(QueueError::Closed { queue: inner.name });
                        }
                    }
                } else {
                    unit
                };
                self.spill(unit).await
            }
        }
    }

    async fn spill(&self, unit: T) -> Result<(), QueueError> {
        let Some(spill) = &self.inner.spill else {
            return Err(QueueError::Overflow {
                queue: self.inner.name,
                capacity: self.inner.capacity,
            });
        };
        let mut spill = spill.lock().await;
        spill.append(&unit).await?;
        let total = self.inner.spilled.fetch_add(1, Ordering::SeqCst) + 1;
        if total.is_power_of_two() {
            tracing::info!(queue = self.inner.name, spilled = total, "Queue spilling to disk");
        }
        Ok(())
    }

    async fn refill(&self) -> Result<(), QueueError> {
        let Some(spill) = &self.inner.spill else {
            return Ok(());
        };
        let mut spill = spill.lock().await;
        let moved = spill.refill(&self.inner.tx, self.inner.name).await?;
        self.inner.spilled.fetch_sub(moved, Ordering::SeqCst);
        Ok(())
    }

    /// Take the next unit, or `None` once stopped.
    pub async fn recv(&self, stop: &mut StopSignal) -> Result<Option<T>, QueueError> {
        loop {
            if self.spilled() > 0 {
                self.refill().await?;
            }
            let spilling = self.spilled() > 0;

            tokio::select! {
                biased;
                _ = stop.stopped() => return Ok(None),
                unit = async { self.inner.rx.lock().await.recv().await } => {
                    return match unit {
                        Some(unit) => Ok(Some(unit)),
                        None => Err(QueueError::Closed { queue: self.inner.name }),
                    };
                }
                _ = tokio::time::sleep(SPILL_POLL_INTERVAL), if spilling => continue,
            }
        }
    }
}

impl<T> UnitQueue<T> {
    /// Units buffered in the channel.
    pub fn len(&self) -> usize {
        self.inner.tx.max_capacity() - self.inner.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Units waiting in the spill file.
    pub fn spilled(&self) -> u64 {
        self.inner.spilled.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> u64 {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::stop_channel;
    use crate::units::PrefixUnit;

    #[test]
    fn test_policy_parsing() {
        assert_eq!("block".parse(), Ok(BackpressurePolicy::Block));
        assert_eq!("spill".parse(), Ok(BackpressurePolicy::Spill));
        assert_eq!("fail-fast".parse(), Ok(BackpressurePolicy::FailFast));
        assert!("drop".parse::<BackpressurePolicy>().is_err());
        assert_eq!(BackpressurePolicy::FailFast.to_string(), "fail-fast");
        assert_eq!(BackpressurePolicy::default(), BackpressurePolicy::Spill);
    }

    #[tokio::test]
    async fn test_len_and_outstanding() {
        let (_handle, mut stop) = stop_channel();
        let queue = UnitQueue::new("prefix", 4, BackpressurePolicy::Block, None).unwrap();

        queue.enqueue(PrefixUnit::new("a"), &mut stop).await.unwrap();
        queue.enqueue(PrefixUnit::new("b"), &mut stop).await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.outstanding(), 2);

        let unit = queue.recv(&mut stop).await.unwrap().unwrap();
        assert_eq!(unit.prefix, "a");
        assert_eq!(queue.len(), 1);

        queue.requeue(unit.retried(), &mut stop).await.unwrap();
        assert_eq!(queue.outstanding(), 2);

        queue.complete();
        assert_eq!(queue.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_fail_fast_overflows() {
        let (_handle, mut stop) = stop_channel();
        let queue = UnitQueue::new("work", 1, BackpressurePolicy::FailFast, None).unwrap();

        queue.enqueue(PrefixUnit::new("a"), &mut stop).await.unwrap();
        let err = queue.enqueue(PrefixUnit::new("b"), &mut stop).await.unwrap_err();
        assert!(matches!(err, QueueError::Overflow { queue: "work", capacity: 1 }));
    }

    #[tokio::test]
    async fn test_block_gives_up_on_stop() {
        let (handle, mut stop) = stop_channel();
        let queue = UnitQueue::new("prefix", 1, BackpressurePolicy::Block, None).unwrap();
        queue.enqueue(PrefixUnit::new("a"), &mut stop).await.unwrap();

        let mut blocked_stop = stop.clone();
        let blocked = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(PrefixUnit::new("b"), &mut blocked_stop).await })
        };
        tokio::task::yield_now().await;
        handle.stop();

        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(QueueError::Stopped)));
        assert!(queue.recv(&mut stop).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spill_preserves_every_unit_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let spill_dir = dir.path();
        let (_handle, mut stop) = stop_channel();
        let queue = UnitQueue::new("prefix", 2, BackpressurePolicy::Spill, Some(spill_dir)).unwrap();

        for i in 0..10 {
            queue
                .enqueue(PrefixUnit::new(format!("p{i}")), &mut stop)
                .await
                .unwrap();
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.spilled(), 8);
        assert_eq!(queue.outstanding(), 10);
        assert_eq!(std::fs::read_dir(spill_dir).unwrap().count(), 1);

        let mut received = Vec::new();
        for _ in 0..10 {
            let unit = queue.recv(&mut stop).await.unwrap().unwrap();
            received.push(unit.prefix);
            queue.complete();
        }

        let expected: Vec<String> = (0..10).map(|i| format!("p{i}")).collect();
        assert_eq!(received, expected);
        assert_eq!(queue.spilled(), 0);
        assert_eq!(queue.outstanding(), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_spill_file_removed_with_queue() {
        let dir = tempfile::TempDir::new().unwrap();
        let spill_dir = dir.path();
        let queue: UnitQueue<PrefixUnit> =
            UnitQueue::new("prefix", 2, BackpressurePolicy::Spill, Some(spill_dir)).unwrap();
        assert_eq!(std::fs::read_dir(spill_dir).unwrap().count(), 1);

        drop(queue);
        assert_eq!(std::fs::read_dir(spill_dir).unwrap().count(), 0);
    }
}
