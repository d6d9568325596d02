//! Ember Storage - Connections, Stores, Batching and Cache
//!
//! The storage half of the persistence backbone:
//! - [`ConnectionManager`]: one SQLite pool per physical file, tuned once per pool
//! - [`StaticStore`]: a single named database file
//! - [`ShardedStore`]: monthly shards with hot/cold tiering through an archive tool
//! - [`BatchWriter`]: generic deferred-write buffer with a background worker
//! - [`CacheStore`]: copy-on-write in-memory cache

pub mod archive;
pub mod batch;
pub mod cache;
pub mod connection;
pub mod sharded;
pub mod static_store;

pub use archive::{safe_resolve, ArchiveTool};
pub use batch::{
    dedup_latest, write_sharded, BatchConfig, BatchMetrics, BatchMetricsSnapshot, BatchWriter,
    FlushHandler, ShardWriteReport,
};
pub use cache::{CacheStats, CacheStore, Upserted};
pub use connection::{
    apply_pragmas, sqlite_error, ConnectionManager, SqlitePool, SqliteResultExt, StorageTuning,
};
pub use sharded::{ArchiveReport, ShardInfo, ShardLayout, ShardPaths, ShardState, ShardedStore};
pub use static_store::StaticStore;

// Re-exported so dependents name transactions without a direct rusqlite import.
pub use rusqlite::{Connection, Transaction};
