//! Durable audit log of every acted-upon object.
//!
//! Records arrive on a bounded sink channel and are buffered by a single
//! coordinator task. Once the buffer would exceed `chunk_size_bytes` it is
//! flushed: a shipper task gzips the batch and uploads it to
//! `<prefix>/<invocation>/<timestamp>-<sequence>.jsonl.gz`, retrying with
//! doubling backoff. At most `max_unpersisted_logs` shippers run at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use common::config::RunLogConfig;
use common::storage::StoreLocation;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::util::compress_bytes;

/// Where producers send serialized audit records.
pub type RunLogSink = mpsc::Sender<Vec<u8>>;

pub(crate) type Compressor = fn(&[u8]) -> std::io::Result<Vec<u8>>;

const SANITY_OBJECT: &str = "ignore-sanity-test";

#[derive(Debug, thiserror::Error)]
pub enum RunLogError {
    #[error("Run log destination is not writable: {0}")]
    DestinationUnwritable(#[source] object_store::Error),

    #[error("Failed to compress run log batch: {0}")]
    Compression(#[source] std::io::Error),

    #[error("Run log coordinator stopped unexpectedly: {0}")]
    Coordinator(String),
}

/// What the run log did over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunLogSummary {
    pub records_received: u64,
    pub batches_flushed: u64,
    pub batches_persisted: u64,
    pub batches_failed: u64,
    /// Every shipper finished before the shutdown wait ran out
    pub drained: bool,
}

#[derive(Debug, Default)]
struct ShipperCounters {
    persisted: AtomicU64,
    failed: AtomicU64,
}

/// Everything a shipper needs, shared with the coordinator.
#[derive(Debug, Clone)]
struct Shipper {
    store: Arc<dyn ObjectStore>,
    directory: ObjectPath,
    persist_retries: u32,
    initial_backoff: Duration,
    compress: Compressor,
    counters: Arc<ShipperCounters>,
    faults: mpsc::UnboundedSender<RunLogError>,
}

impl Shipper {
    fn object_path(&self, sequence: u64) -> ObjectPath {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.directory
            .child(format!("{timestamp}-{sequence:06}.jsonl.gz"))
    }

    async fn compress_and_persist(self, data: Vec<u8>, sequence: u64, _permit: OwnedSemaphorePermit) {
        let compressed = match (self.compress)(&data) {
            Ok(compressed) => compressed,
            Err(e) => {
                tracing::error!(error = %e, sequence, "Failed to compress run log batch");
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let _ = self.faults.send(RunLogError::Compression(e));
                return;
            }
        };

        let payload = PutPayload::from(compressed);
        let mut backoff = self.initial_backoff;
        let attempts = self.persist_retries.max(1);
        for attempt in 1..=attempts {
            let path = self.object_path(sequence);
            match self.store.put(&path, payload.clone()).await {
                Ok(_) => {
                    tracing::debug!(path = %path, bytes = data.len(), "Persisted run log batch");
                    self.counters.persisted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %path,
                        attempt,
                        attempts,
                        "Failed to persist run log batch"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        tracing::error!(sequence, "Giving up on run log batch, records are lost");
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }
}

struct LogCoordinator {
    records: mpsc::Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    chunk_size_bytes: u64,
    max_unpersisted_logs: usize,
    shippers: Arc<Semaphore>,
    shipper: Shipper,
    received: u64,
    flushed: u64,
}

impl LogCoordinator {
    async fn run(mut self, mut stop: oneshot::Receiver<()>) -> RunLogSummary {
        loop {
            tokio::select! {
                record = self.records.recv() => match record {
                    Some(record) => self.accept(record).await,
                    None => break,
                },
                _ = &mut stop => break,
            }
        }
        self.shutdown().await
    }

    async fn accept(&mut self, record: Vec<u8>) {
        let incoming = record.len() as u64 + 1;
        if !self.buffer.is_empty() && self.buffer.len() as u64 + incoming > self.chunk_size_bytes {
            self.flush().await;
        }
        self.append(record);
    }

    fn append(&mut self, record: Vec<u8>) {
        self.buffer.extend_from_slice(&record);
        self.buffer.push(b'\n');
        self.received += 1;
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let Ok(permit) = self.shippers.clone().acquire_owned().await else {
            tracing::error!("Run log shipper pool closed, dropping batch");
            return;
        };
        let data = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.chunk_size_bytes.min(1 << 20) as usize),
        );
        self.flushed += 1;
        tokio::spawn(self.shipper.clone().compress_and_persist(data, self.flushed, permit));
    }

    async fn shutdown(mut self) -> RunLogSummary {
        self.records.close();
        while let Ok(record) = self.records.try_recv() {
            self.append(record);
        }
        self.flush().await;

        let drained = self.wait_for_shippers().await;
        if !drained {
            tracing::warn!("Returned with outstanding unpersisted logs");
        }

        RunLogSummary {
            records_received: self.received,
            batches_flushed: self.flushed,
            batches_persisted: self.shipper.counters.persisted.load(Ordering::Relaxed),
            batches_failed: self.shipper.counters.failed.load(Ordering::Relaxed),
            drained,
        }
    }

    /// Poll for every shipper permit with doubling backoff, bounded by the
    /// persist retry count.
    async fn wait_for_shippers(&self) -> bool {
        let permits = self.max_unpersisted_logs as u32;
        let mut backoff = self.shipper.initial_backoff;
        for attempt in 0..=self.shipper.persist_retries {
            if self.shippers.try_acquire_many(permits).is_ok() {
                return true;
            }
            if attempt < self.shipper.persist_retries {
                tracing::info!(backoff = ?backoff, "Waiting for run log batches to persist");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        false
    }
}

/// Handle on a running run log.
#[derive(Debug)]
pub struct RunLog {
    sink: RunLogSink,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<RunLogSummary>,
    faults: Option<mpsc::UnboundedReceiver<RunLogError>>,
    invocation_id: Uuid,
}

impl RunLog {
    /// Verify the destination accepts writes, then start the coordinator.
    pub async fn start(
        config: &RunLogConfig,
        location: StoreLocation,
        invocation_id: Uuid,
    ) -> Result<Self, RunLogError> {
        Self::start_with_compressor(config, location, invocation_id, compress_bytes).await
    }

    pub(crate) async fn start_with_compressor(
        config: &RunLogConfig,
        location: StoreLocation,
        invocation_id: Uuid,
        compress: Compressor,
    ) -> Result<Self, RunLogError> {
        let sanity = location.prefix.child(SANITY_OBJECT);
        location
            .store
            .put(&sanity, PutPayload::from_static(b"Cycler write test"))
            .await
            .map_err(RunLogError::DestinationUnwritable)?;
        if let Err(e) = location.store.delete(&sanity).await {
            tracing::debug!(error = %e, "Could not remove run log sanity object");
        }

        let (sink, records) = mpsc::channel(config.channel_size.max(1));
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let coordinator = LogCoordinator {
            records,
            buffer: Vec::new(),
            chunk_size_bytes: config.chunk_size_bytes,
            max_unpersisted_logs: config.max_unpersisted_logs.max(1),
            shippers: Arc::new(Semaphore::new(config.max_unpersisted_logs.max(1))),
            shipper: Shipper {
                store: location.store,
                directory: location.prefix.child(invocation_id.to_string()),
                persist_retries: config.persist_retries,
                initial_backoff: config.initial_backoff,
                compress,
                counters: Arc::new(ShipperCounters::default()),
                faults: fault_tx,
            },
            received: 0,
            flushed: 0,
        };

        tracing::info!(
            destination = %config.destination_url,
            invocation_id = %invocation_id,
            "Run log started"
        );

        Ok(Self {
            sink,
            stop: stop_tx,
            handle: tokio::spawn(coordinator.run(stop_rx)),
            faults: Some(fault_rx),
            invocation_id,
        })
    }

    pub fn sink(&self) -> RunLogSink {
        self.sink.clone()
    }

    pub fn invocation_id(&self) -> Uuid {
        self.invocation_id
    }

    /// Fatal faults raised by shippers; can be taken once.
    pub fn take_faults(&mut self) -> Option<mpsc::UnboundedReceiver<RunLogError>> {
        self.faults.take()
    }

    /// Drain pending records, flush, and wait a bounded time for uploads.
    pub async fn stop(self) -> Result<RunLogSummary, RunLogError> {
        drop(self.sink);
        let _ = self.stop.send(());
        self.handle
            .await
            .map_err(|e| RunLogError::Coordinator(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::decompress_bytes;
    use futures::TryStreamExt;
    use futures::stream::BoxStream;
    use object_store::memory::InMemory;
    use object_store::{
        GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, PutMultipartOptions,
        PutOptions, PutResult,
    };

    #[derive(Debug, Clone, Copy)]
    enum BatchFault {
        Reject,
        Stall,
    }

    /// In-memory store whose batch uploads fail or never complete. Other
    /// writes, such as the sanity object, go through.
    #[derive(Debug)]
    struct FaultyStore {
        inner: InMemory,
        fault: BatchFault,
        batch_puts: AtomicU64,
    }

    impl FaultyStore {
        fn new(fault: BatchFault) -> Arc<Self> {
            Arc::new(Self {
                inner: InMemory::new(),
                fault,
                batch_puts: AtomicU64::new(0),
            })
        }
    }

    impl std::fmt::Display for FaultyStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "FaultyStore({:?})", self.fault)
        }
    }

    #[async_trait::async_trait]
    impl ObjectStore for FaultyStore {
        async fn put_opts(
            &self,
            location: &ObjectPath,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<PutResult> {
            if location.as_ref().ends_with(".jsonl.gz") {
                self.batch_puts.fetch_add(1, Ordering::SeqCst);
                match self.fault {
                    BatchFault::Reject => {
                        return Err(object_store::Error::Generic {
                            store: "faulty",
                            source: "batch upload rejected".into(),
                        });
                    }
                    BatchFault::Stall => std::future::pending::<()>().await,
                }
            }
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &ObjectPath,
            opts: PutMultipartOptions,
        ) -> object_store::Result<Box<dyn MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(
            &self,
            location: &ObjectPath,
            options: GetOptions,
        ) -> object_store::Result<GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &ObjectPath) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(&self, prefix: Option<&ObjectPath>) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&ObjectPath>,
        ) -> object_store::Result<ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &ObjectPath, to: &ObjectPath) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(
            &self,
            from: &ObjectPath,
            to: &ObjectPath,
        ) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    fn config(chunk_size_bytes: u64) -> RunLogConfig {
        RunLogConfig {
            destination_url: "memory://".to_string(),
            channel_size: 16,
            chunk_size_bytes,
            max_unpersisted_logs: 2,
            persist_retries: 3,
            initial_backoff: Duration::from_millis(10),
        }
    }

    fn location(store: &Arc<InMemory>, prefix: &str) -> StoreLocation {
        StoreLocation {
            store: store.clone(),
            prefix: ObjectPath::from(prefix),
        }
    }

    async fn batches(store: &Arc<InMemory>) -> Vec<(ObjectPath, Vec<String>)> {
        let metas: Vec<_> = store.list(None).try_collect().await.unwrap();
        let mut out = Vec::new();
        for meta in metas {
            let bytes = store.get(&meta.location).await.unwrap().bytes().await.unwrap();
            let text = String::from_utf8(decompress_bytes(&bytes).unwrap()).unwrap();
            out.push((meta.location, text.lines().map(String::from).collect()));
        }
        out
    }

    #[tokio::test]
    async fn test_records_persisted_on_stop() {
        let store = Arc::new(InMemory::new());
        let id = Uuid::new_v4();
        let log = RunLog::start(&config(1 << 20), location(&store, "logs"), id)
            .await
            .unwrap();

        let sink = log.sink();
        for i in 0..5 {
            sink.send(format!("{{\"n\":{i}}}").into_bytes()).await.unwrap();
        }
        drop(sink);

        let summary = log.stop().await.unwrap();
        assert_eq!(summary.records_received, 5);
        assert_eq!(summary.batches_flushed, 1);
        assert_eq!(summary.batches_persisted, 1);
        assert!(summary.drained);

        let batches = batches(&store).await;
        assert_eq!(batches.len(), 1);
        let (path, lines) = &batches[0];
        assert!(path.as_ref().starts_with(&format!("logs/{id}/")));
        assert!(path.as_ref().ends_with(".jsonl.gz"));
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "{\"n\":0}");
        // sanity object is cleaned up
        assert!(store.head(&ObjectPath::from("logs/ignore-sanity-test")).await.is_err());
    }

    #[tokio::test]
    async fn test_flushes_before_exceeding_chunk_size() {
        let store = Arc::new(InMemory::new());
        let log = RunLog::start(&config(64), location(&store, ""), Uuid::new_v4())
            .await
            .unwrap();

        let sink = log.sink();
        let record = vec![b'x'; 20];
        for _ in 0..10 {
            sink.send(record.clone()).await.unwrap();
        }
        drop(sink);

        let summary = log.stop().await.unwrap();
        assert_eq!(summary.records_received, 10);
        assert!(summary.batches_flushed > 1);

        let batches = batches(&store).await;
        let total: usize = batches.iter().map(|(_, lines)| lines.len()).sum();
        assert_eq!(total, 10);
        for (_, lines) in &batches {
            let bytes: usize = lines.iter().map(|l| l.len() + 1).sum();
            assert!(bytes <= 64, "batch of {bytes} bytes exceeds chunk size");
        }
    }

    #[tokio::test]
    async fn test_batch_may_fill_chunk_exactly() {
        let store = Arc::new(InMemory::new());
        // two 20 byte records plus newlines fill 42 bytes exactly
        let log = RunLog::start(&config(42), location(&store, ""), Uuid::new_v4())
            .await
            .unwrap();

        let sink = log.sink();
        for _ in 0..3 {
            sink.send(vec![b'x'; 20]).await.unwrap();
        }
        drop(sink);

        let summary = log.stop().await.unwrap();
        assert_eq!(summary.batches_flushed, 2);
        let mut sizes: Vec<usize> = batches(&store)
            .await
            .iter()
            .map(|(_, lines)| lines.len())
            .collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_persist_retries_exhausted() {
        let store = FaultyStore::new(BatchFault::Reject);
        let location = StoreLocation {
            store: store.clone(),
            prefix: ObjectPath::from("logs"),
        };
        let log = RunLog::start(&config(1 << 20), location, Uuid::new_v4())
            .await
            .unwrap();

        log.sink().send(b"{}".to_vec()).await.unwrap();
        let summary = log.stop().await.unwrap();

        assert!(summary.drained);
        assert_eq!(summary.batches_flushed, 1);
        assert_eq!(summary.batches_persisted, 0);
        assert_eq!(summary.batches_failed, 1);
        assert_eq!(store.batch_puts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stalled_upload_is_left_behind() {
        let store = FaultyStore::new(BatchFault::Stall);
        let location = StoreLocation {
            store: store.clone(),
            prefix: ObjectPath::default(),
        };
        let log = RunLog::start(&config(1 << 20), location, Uuid::new_v4())
            .await
            .unwrap();

        log.sink().send(b"{}".to_vec()).await.unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(5), log.stop())
            .await
            .unwrap()
            .unwrap();

        assert!(!summary.drained);
        assert_eq!(summary.batches_flushed, 1);
        assert_eq!(summary.batches_persisted, 0);
        assert_eq!(summary.batches_failed, 0);
        assert_eq!(store.batch_puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_compression_failure_raises_fault() {
        fn broken(_: &[u8]) -> std::io::Result<Vec<u8>> {
            Err(std::io::Error::other("encoder broke"))
        }

        let store = Arc::new(InMemory::new());
        let mut log = RunLog::start_with_compressor(
            &config(1 << 20),
            location(&store, ""),
            Uuid::new_v4(),
            broken,
        )
        .await
        .unwrap();
        let mut faults = log.take_faults().unwrap();
        assert!(log.take_faults().is_none());

        log.sink().send(b"{}".to_vec()).await.unwrap();
        let summary = log.stop().await.unwrap();

        assert_eq!(summary.batches_failed, 1);
        assert!(matches!(faults.recv().await, Some(RunLogError::Compression(_))));
        assert!(batches(&store).await.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_record_gets_own_batch() {
        let store = Arc::new(InMemory::new());
        let log = RunLog::start(&config(8), location(&store, ""), Uuid::new_v4())
            .await
            .unwrap();

        let sink = log.sink();
        sink.send(vec![b'y'; 100]).await.unwrap();
        sink.send(vec![b'z'; 100]).await.unwrap();
        drop(sink);

        let summary = log.stop().await.unwrap();
        assert_eq!(summary.batches_flushed, 2);
        assert_eq!(batches(&store).await.len(), 2);
    }

    #[tokio::test]
    async fn test_unwritable_destination_fails_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-directory");
        std::fs::write(&blocker, b"file").unwrap();

        let store: Arc<dyn ObjectStore> =
            Arc::new(object_store::local::LocalFileSystem::new_with_prefix(&blocker).unwrap());
        let location = StoreLocation {
            store,
            prefix: ObjectPath::default(),
        };

        let result = RunLog::start(&config(1024), location, Uuid::new_v4()).await;
        assert!(matches!(result, Err(RunLogError::DestinationUnwritable(_))));
    }
}
