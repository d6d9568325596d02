//! Pooled SQLite connections keyed by physical file.
//!
//! One `r2d2` pool exists per resolved database path. The pool is created on
//! first use. Its connection initializer applies the tuning pragmas to every
//! physical connection it opens, while the owning store's schema runs once on
//! the first connection, before the pool is published to other sessions.
//!
//! Every unit of work goes through [`ConnectionManager::session`]: the closure
//! runs inside a transaction on the blocking thread pool, and the transaction
//! commits only when the closure returns `Ok` and the caller asked to commit.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ember_core::constants::{DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_MMAP_SIZE, DEFAULT_POOL_MAX_SIZE};
use ember_core::{EmberError, EmberResult, PersistenceConfig, StorageError};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction, TransactionBehavior};

pub type SqlitePool = Pool<SqliteConnectionManager>;

/// Engine tuning applied to every pooled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTuning {
    pub mmap_size: i64,
    pub busy_timeout: Duration,
    pub pool_max_size: u32,
}

impl Default for StorageTuning {
    fn default() -> Self {
        Self {
            mmap_size: DEFAULT_MMAP_SIZE,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
        }
    }
}

impl From<&PersistenceConfig> for StorageTuning {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            mmap_size: config.mmap_size,
            busy_timeout: config.busy_timeout,
            pool_max_size: config.pool_max_size,
        }
    }
}

/// WAL journal, relaxed sync, bounded mmap. Latency over durability; the
/// cache in front of these files is authoritative for reads.
pub fn apply_pragmas(conn: &Connection, tuning: &StorageTuning) -> rusqlite::Result<()> {
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update_and_check(None, "mmap_size", tuning.mmap_size, |row| {
        row.get::<_, i64>(0)
    })?;
    conn.busy_timeout(tuning.busy_timeout)?;
    Ok(())
}

/// Convert a rusqlite error into the workspace error type.
pub fn sqlite_error(path: &Path, err: rusqlite::Error) -> EmberError {
    EmberError::Storage(StorageError::Sqlite {
        path: path.display().to_string(),
        reason: err.to_string(),
    })
}

/// `?`-friendly conversion for code that only holds a connection.
pub trait SqliteResultExt<T> {
    fn map_sqlite(self, conn: &Connection) -> EmberResult<T>;
}

impl<T> SqliteResultExt<T> for rusqlite::Result<T> {
    fn map_sqlite(self, conn: &Connection) -> EmberResult<T> {
        self.map_err(|e| {
            EmberError::Storage(StorageError::Sqlite {
                path: conn.path().unwrap_or(":memory:").to_string(),
                reason: e.to_string(),
            })
        })
    }
}

/// Owns one connection pool per physical database file.
#[derive(Clone)]
pub struct ConnectionManager {
    tuning: StorageTuning,
    pools: Arc<DashMap<PathBuf, SqlitePool>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("tuning", &self.tuning)
            .field("open_pools", &self.pools.len())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(tuning: StorageTuning) -> Self {
        Self {
            tuning,
            pools: Arc::new(DashMap::new()),
        }
    }

    pub fn tuning(&self) -> &StorageTuning {
        &self.tuning
    }

    /// Run `f` as one unit of work against the database at `path`.
    ///
    /// `commit = true` begins an IMMEDIATE transaction and commits when `f`
    /// returns `Ok`. `commit = false` is a read: the transaction is rolled
    /// back after `f` returns. An `Err` from `f` always rolls back and is
    /// returned unchanged.
    pub async fn session<T, F>(
        &self,
        path: &Path,
        schema: Option<Arc<str>>,
        commit: bool,
        f: F,
    ) -> EmberResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> EmberResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let key = resolve_key(path);
        let pools = Arc::clone(&self.pools);
        let tuning = self.tuning.clone();

        tokio::task::spawn_blocking(move || {
            let pool = pool_for(&pools, &key, &tuning, schema)?;
            let mut conn = pool.get().map_err(|e| {
                EmberError::Storage(StorageError::Pool {
                    path: key.display().to_string(),
                    reason: e.to_string(),
                })
            })?;

            let behavior = if commit {
                TransactionBehavior::Immediate
            } else {
                TransactionBehavior::Deferred
            };
            let tx = conn
                .transaction_with_behavior(behavior)
                .map_err(|e| sqlite_error(&key, e))?;

            match f(&tx) {
                Ok(value) => {
                    if commit {
                        tx.commit().map_err(|e| sqlite_error(&key, e))?;
                    } else {
                        tx.rollback().map_err(|e| sqlite_error(&key, e))?;
                    }
                    Ok(value)
                }
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback() {
                        tracing::warn!(
                            path = %key.display(),
                            error = %rollback_err,
                            "Rollback after failed unit of work also failed"
                        );
                    }
                    Err(err)
                }
            }
        })
        .await
        .map_err(|e| {
            EmberError::Storage(StorageError::BlockingTask {
                reason: e.to_string(),
            })
        })?
    }

    /// Fold the WAL back into the main file. No-op when no pool is open.
    pub async fn checkpoint(&self, path: &Path) -> EmberResult<()> {
        let key = resolve_key(path);
        let Some(pool) = self.pools.get(&key).map(|entry| entry.value().clone()) else {
            return Ok(());
        };

        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| {
                EmberError::Storage(StorageError::Pool {
                    path: key.display().to_string(),
                    reason: e.to_string(),
                })
            })?;
            conn.pragma_update_and_check(None, "wal_checkpoint", "TRUNCATE", |_| Ok(()))
                .map_err(|e| sqlite_error(&key, e))
        })
        .await
        .map_err(|e| {
            EmberError::Storage(StorageError::BlockingTask {
                reason: e.to_string(),
            })
        })?
    }

    /// Drop the pool for `path`. Idle connections close immediately, checked
    /// out ones when they are returned.
    pub fn dispose(&self, path: &Path) -> bool {
        let key = resolve_key(path);
        let removed = self.pools.remove(&key).is_some();
        if removed {
            tracing::debug!(path = %key.display(), "Disposed connection pool");
        }
        removed
    }

    /// Drop every pool.
    pub fn dispose_all(&self) {
        let count = self.pools.len();
        self.pools.clear();
        tracing::debug!(pools = count, "Disposed all connection pools");
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.pools.contains_key(&resolve_key(path))
    }

    pub fn open_pools(&self) -> usize {
        self.pools.len()
    }
}

fn pool_for(
    pools: &DashMap<PathBuf, SqlitePool>,
    key: &Path,
    tuning: &StorageTuning,
    schema: Option<Arc<str>>,
) -> EmberResult<SqlitePool> {
    if let Some(pool) = pools.get(key) {
        return Ok(pool.value().clone());
    }

    match pools.entry(key.to_path_buf()) {
        dashmap::mapref::entry::Entry::Occupied(entry) => Ok(entry.get().clone()),
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            let init_tuning = tuning.clone();
            let manager = SqliteConnectionManager::file(key)
                .with_init(move |conn| apply_pragmas(conn, &init_tuning));
            let pool_error = |reason: String| {
                EmberError::Storage(StorageError::Pool {
                    path: key.display().to_string(),
                    reason,
                })
            };

            let pool = Pool::builder()
                .max_size(tuning.pool_max_size)
                .min_idle(Some(0))
                .build(manager)
                .map_err(|e| pool_error(e.to_string()))?;

            // The entry stays locked until the schema exists, so no session
            // sees a pool without its tables.
            if let Some(ddl) = schema.as_deref() {
                let conn = pool.get().map_err(|e| pool_error(e.to_string()))?;
                conn.execute_batch(ddl).map_err(|e| sqlite_error(key, e))?;
            }

            tracing::debug!(path = %key.display(), max_size = tuning.pool_max_size, "Opened connection pool");
            Ok(entry.insert(pool).value().clone())
        }
    }
}

/// Pools are keyed by absolute path with a canonical parent directory, so
/// `./a/../db/x.db` and `db/x.db` share one pool.
fn resolve_key(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => parent
            .canonicalize()
            .map(|dir| dir.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => std::env::current_dir()
            .map(|dir| dir.join(path))
            .unwrap_or_else(|_| path.to_path_buf()),
    }
}
