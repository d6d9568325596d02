//! Archiver Background Task
//!
//! Periodically compresses shards that left the active window of every
//! sharded store (audit log, snapshots, messages). A shard whose raw file is
//! still held open is reported as busy and retried on the next cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ember_core::constants::DEFAULT_ARCHIVE_INTERVAL_SECS;
use ember_core::PersistenceConfig;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::persistence::Persistence;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the archiver background task.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    /// Time between archive passes (default: 24 hours)
    pub interval: Duration,

    /// Whether the first pass runs immediately on start (default: true)
    pub run_on_start: bool,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_ARCHIVE_INTERVAL_SECS),
            run_on_start: true,
        }
    }
}

impl From<&PersistenceConfig> for ArchiverConfig {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            interval: config.archive_interval,
            ..Self::default()
        }
    }
}

impl ArchiverConfig {
    /// # Environment Variables
    /// - `EMBER_ARCHIVE_INTERVAL_SECS`: Seconds between passes (default: 86400)
    /// - `EMBER_ARCHIVE_ON_START`: Run a pass right away (default: true)
    pub fn from_env() -> Self {
        let interval = Duration::from_secs(
            std::env::var("EMBER_ARCHIVE_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_ARCHIVE_INTERVAL_SECS),
        );

        let run_on_start = std::env::var("EMBER_ARCHIVE_ON_START")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            interval,
            run_on_start,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters since the task started.
#[derive(Debug, Default)]
pub struct ArchiverMetrics {
    pub cycles: AtomicU64,
    pub shards_archived: AtomicU64,
    /// Shards compressed but still held open; retried next cycle.
    pub shards_busy: AtomicU64,
    pub failures: AtomicU64,
}

impl ArchiverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ArchiverSnapshot {
        ArchiverSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            shards_archived: self.shards_archived.load(Ordering::Relaxed),
            shards_busy: self.shards_busy.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiverSnapshot {
    pub cycles: u64,
    pub shards_archived: u64,
    pub shards_busy: u64,
    pub failures: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that archives cold shards until shutdown is signalled.
///
/// # Arguments
///
/// * `persistence` - Opened persistence layer whose sharded stores are archived
/// * `config` - Pass interval and start behavior
/// * `shutdown_rx` - Watch receiver for shutdown signal
///
/// # Returns
///
/// Metrics collected during the task's lifetime
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let config = ArchiverConfig::from(persistence.config());
/// let handle = tokio::spawn(archiver_task(Arc::clone(&persistence), config, shutdown_rx));
///
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn archiver_task(
    persistence: Arc<Persistence>,
    config: ArchiverConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<ArchiverMetrics> {
    let metrics = Arc::new(ArchiverMetrics::new());

    let mut archive_interval = interval(config.interval);
    archive_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    if !config.run_on_start {
        // The first tick of a tokio interval completes immediately.
        archive_interval.tick().await;
    }

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        run_on_start = config.run_on_start,
        "Archiver task started"
    );

    loop {
        tokio::select! {
            res = shutdown_rx.changed() => {
                // A dropped sender can never signal again.
                if res.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Archiver task shutting down");
                    break;
                }
            }

            _ = archive_interval.tick() => {
                archive_cycle(&persistence, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        shards_archived = snapshot.shards_archived,
        shards_busy = snapshot.shards_busy,
        failures = snapshot.failures,
        "Archiver task completed"
    );

    metrics
}

/// Run one pass over every sharded store.
async fn archive_cycle(persistence: &Persistence, metrics: &ArchiverMetrics) {
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    let mut archived = 0u64;
    for report in persistence.archive_all().await {
        archived += report.archived.len() as u64;
        metrics
            .shards_archived
            .fetch_add(report.archived.len() as u64, Ordering::Relaxed);
        metrics
            .shards_busy
            .fetch_add(report.busy.len() as u64, Ordering::Relaxed);
        metrics
            .failures
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        for failure in &report.failed {
            tracing::warn!(namespace = %report.namespace, failure = %failure, "Shard not archived");
        }
    }

    if archived > 0 {
        tracing::info!(archived, "Archive cycle completed");
    } else {
        tracing::trace!("Archive cycle completed with nothing to archive");
    }
}
