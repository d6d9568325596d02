//! Generic deferred-write buffer.
//!
//! A [`BatchWriter`] owns one background worker that drains an unbounded
//! queue into a local buffer and hands the buffer to a [`FlushHandler`] once
//! it holds `batch_size` items or `flush_interval` has passed since the first
//! unflushed item arrived. Delivery is at-most-once: a failed or panicking
//! flush is logged and its batch dropped, and the worker keeps going.
//!
//! Within one writer, batches reach the handler in enqueue order. Nothing is
//! ordered across writers.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ember_core::constants::{DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL_MS};
use ember_core::{EmberResult, PersistenceConfig, StorageError, Timestamp};
use rusqlite::Transaction;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::sharded::ShardedStore;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_millis(DEFAULT_FLUSH_INTERVAL_MS),
        }
    }
}

impl From<&PersistenceConfig> for BatchConfig {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
        }
    }
}

impl BatchConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

/// Bulk sink for one writer. Must tolerate replays of the same natural key.
#[async_trait]
pub trait FlushHandler<T>: Send + Sync + 'static {
    async fn flush(&self, items: Vec<T>) -> EmberResult<()>;
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct BatchMetrics {
    pub items_enqueued: AtomicU64,
    pub items_flushed: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub batches_dropped: AtomicU64,
    pub items_dropped: AtomicU64,
    pub worker_restarts: AtomicU64,
}

impl BatchMetrics {
    pub fn snapshot(&self) -> BatchMetricsSnapshot {
        BatchMetricsSnapshot {
            items_enqueued: self.items_enqueued.load(Ordering::Relaxed),
            items_flushed: self.items_flushed.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            items_dropped: self.items_dropped.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchMetricsSnapshot {
    pub items_enqueued: u64,
    pub items_flushed: u64,
    pub batches_flushed: u64,
    pub batches_dropped: u64,
    pub items_dropped: u64,
    pub worker_restarts: u64,
}

// ============================================================================
// WRITER
// ============================================================================

struct Worker<T> {
    tx: mpsc::UnboundedSender<T>,
    join: JoinHandle<()>,
}

impl<T> Worker<T> {
    fn is_alive(&self) -> bool {
        !self.join.is_finished() && !self.tx.is_closed()
    }
}

pub struct BatchWriter<T> {
    name: Arc<str>,
    config: BatchConfig,
    handler: Arc<dyn FlushHandler<T>>,
    runtime: Handle,
    worker: Mutex<Option<Worker<T>>>,
    closed: AtomicBool,
    metrics: Arc<BatchMetrics>,
}

impl<T> std::fmt::Debug for BatchWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Send + 'static> BatchWriter<T> {
    /// Create the writer and spawn its worker on the current Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        handler: Arc<dyn FlushHandler<T>>,
        config: BatchConfig,
    ) -> EmberResult<Self> {
        let name: Arc<str> = Arc::from(name.into());
        let runtime = Handle::try_current().map_err(|e| StorageError::BlockingTask {
            reason: format!("batch writer {name} needs a Tokio runtime: {e}"),
        })?;

        let writer = Self {
            name,
            config: BatchConfig {
                batch_size: config.batch_size.max(1),
                flush_interval: config.flush_interval,
            },
            handler,
            runtime,
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
            metrics: Arc::new(BatchMetrics::default()),
        };
        {
            let mut slot = writer.lock_worker();
            *slot = Some(writer.spawn_worker());
        }
        Ok(writer)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BatchConfig {
        self.config
    }

    /// Enqueue one item. Restarts the worker if it has died.
    pub fn add(&self, item: T) -> EmberResult<()> {
        let mut slot = self.lock_worker();
        self.send_locked(&mut slot, item)
    }

    /// Enqueue items in order. An empty input is a no-op.
    pub fn add_all<I>(&self, items: I) -> EmberResult<()>
    where
        I: IntoIterator<Item = T>,
    {
        let mut items = items.into_iter().peekable();
        if items.peek().is_none() {
            return Ok(());
        }
        let mut slot = self.lock_worker();
        for item in items {
            self.send_locked(&mut slot, item)?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker().as_ref().is_some_and(Worker::is_alive)
    }

    pub fn metrics(&self) -> BatchMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop accepting items, flush what is buffered and wait for the worker.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let worker = self.lock_worker().take();
        let Some(Worker { tx, join }) = worker else {
            return;
        };
        drop(tx);
        if let Err(e) = join.await {
            tracing::error!(writer = %self.name, error = %e, "Batch worker ended abnormally");
        }
        tracing::debug!(writer = %self.name, "Batch writer shut down");
    }

    fn send_locked(&self, slot: &mut Option<Worker<T>>, item: T) -> EmberResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::WriterClosed {
                writer: self.name.to_string(),
            }
            .into());
        }

        if !slot.as_ref().is_some_and(Worker::is_alive) {
            self.restart(slot);
        }

        let Some(worker) = slot.as_ref() else {
            return Err(self.closed_error());
        };
        let item = match worker.tx.send(item) {
            Ok(()) => {
                self.metrics.items_enqueued.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(mpsc::error::SendError(item)) => item,
        };

        // The worker died between the liveness check and the send.
        self.restart(slot);
        match slot.as_ref().map(|worker| worker.tx.send(item)) {
            Some(Ok(())) => {
                self.metrics.items_enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(self.closed_error()),
        }
    }

    fn restart(&self, slot: &mut Option<Worker<T>>) {
        if slot.is_some() {
            self.metrics.worker_restarts.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(writer = %self.name, "Batch worker not running, restarting");
        }
        *slot = Some(self.spawn_worker());
    }

    fn spawn_worker(&self) -> Worker<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let join = self.runtime.spawn(run_worker(
            Arc::clone(&self.name),
            self.config,
            Arc::clone(&self.handler),
            Arc::clone(&self.metrics),
            rx,
        ));
        tracing::debug!(writer = %self.name, batch_size = self.config.batch_size, "Batch worker started");
        Worker { tx, join }
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker<T>>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn closed_error(&self) -> ember_core::EmberError {
        StorageError::WriterClosed {
            writer: self.name.to_string(),
        }
        .into()
    }

    #[cfg(test)]
    fn abort_worker(&self) {
        if let Some(worker) = self.lock_worker().as_ref() {
            worker.join.abort();
        }
    }
}

async fn run_worker<T: Send + 'static>(
    name: Arc<str>,
    config: BatchConfig,
    handler: Arc<dyn FlushHandler<T>>,
    metrics: Arc<BatchMetrics>,
    mut rx: mpsc::UnboundedReceiver<T>,
) {
    let mut buffer: Vec<T> = Vec::with_capacity(config.batch_size);
    let mut deadline: Option<Instant> = None;

    loop {
        let received = match deadline {
            Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    flush(&name, &handler, &metrics, &mut buffer).await;
                    deadline = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        match received {
            Some(item) => {
                if buffer.is_empty() {
                    deadline = Some(Instant::now() + config.flush_interval);
                }
                buffer.push(item);
                if buffer.len() >= config.batch_size {
                    flush(&name, &handler, &metrics, &mut buffer).await;
                    deadline = None;
                }
            }
            None => {
                flush(&name, &handler, &metrics, &mut buffer).await;
                break;
            }
        }
    }

    tracing::debug!(writer = %name, "Batch worker stopped");
}

async fn flush<T: Send + 'static>(
    name: &str,
    handler: &Arc<dyn FlushHandler<T>>,
    metrics: &BatchMetrics,
    buffer: &mut Vec<T>,
) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let count = batch.len() as u64;

    // Run the handler in its own task so a panic cannot take the worker down.
    let handler = Arc::clone(handler);
    let outcome = tokio::spawn(async move { handler.flush(batch).await }).await;

    match outcome {
        Ok(Ok(())) => {
            metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
            metrics.items_flushed.fetch_add(count, Ordering::Relaxed);
            tracing::debug!(writer = %name, items = count, "Batch flushed");
        }
        Ok(Err(e)) => {
            metrics.batches_dropped.fetch_add(1, Ordering::Relaxed);
            metrics.items_dropped.fetch_add(count, Ordering::Relaxed);
            tracing::error!(writer = %name, items = count, error = %e, "Batch flush failed, batch dropped");
        }
        Err(e) => {
            metrics.batches_dropped.fetch_add(1, Ordering::Relaxed);
            metrics.items_dropped.fetch_add(count, Ordering::Relaxed);
            tracing::error!(writer = %name, items = count, error = %e, "Batch flush panicked, batch dropped");
        }
    }
}

// ============================================================================
// FLUSH HELPERS
// ============================================================================

/// Collapse items sharing a key: each key keeps the position of its first
/// occurrence and the value of its last.
pub fn dedup_latest<T, K, F>(items: Vec<T>, key_fn: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::with_capacity(items.len());
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        match index.entry(key_fn(&item)) {
            Entry::Occupied(slot) => out[*slot.get()] = item,
            Entry::Vacant(slot) => {
                slot.insert(out.len());
                out.push(item);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardWriteReport {
    pub written: usize,
    pub failed: Vec<String>,
}

/// Group `items` by the shard their timestamp routes to and write each
/// group in its own unit of work. A failing shard drops only its own group.
pub async fn write_sharded<T, K, F>(
    store: &ShardedStore,
    items: Vec<T>,
    time_of: K,
    write: F,
) -> ShardWriteReport
where
    T: Send + 'static,
    K: Fn(&T) -> Timestamp,
    F: Fn(&Transaction<'_>, &[T]) -> EmberResult<()> + Clone + Send + 'static,
{
    let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for item in items {
        groups
            .entry(store.shard_key(time_of(&item)))
            .or_default()
            .push(item);
    }

    let mut report = ShardWriteReport::default();
    for (key, group) in groups {
        let count = group.len();
        let write = write.clone();
        match store
            .session_for_key(&key, true, move |tx| write(tx, &group))
            .await
        {
            Ok(()) => report.written += count,
            Err(e) => {
                tracing::error!(
                    namespace = %store.layout().namespace,
                    shard = %key,
                    items = count,
                    error = %e,
                    "Sharded write failed, items dropped"
                );
                report.failed.push(key);
            }
        }
    }
    report
}

// ============================================================================
// TESTS
// ============================================================================
