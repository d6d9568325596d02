//! Single-file store: one database per logical domain.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ember_core::{EmberResult, StorageError};
use rusqlite::Transaction;

use crate::connection::ConnectionManager;

#[derive(Debug, Clone)]
pub struct StaticStore {
    manager: ConnectionManager,
    path: PathBuf,
    schema: Option<Arc<str>>,
}

impl StaticStore {
    /// Creates `base_dir` if needed. The file itself is created by the first
    /// session.
    pub fn new(
        manager: ConnectionManager,
        base_dir: impl AsRef<Path>,
        filename: &str,
    ) -> EmberResult<Self> {
        let base_dir = base_dir.as_ref();
        std::fs::create_dir_all(base_dir).map_err(|e| StorageError::Io {
            path: base_dir.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            manager,
            path: base_dir.join(filename),
            schema: None,
        })
    }

    /// DDL run on every connection the pool opens. Must be idempotent.
    pub fn with_schema(mut self, ddl: &str) -> Self {
        self.schema = Some(Arc::from(ddl));
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub async fn session<T, F>(&self, commit: bool, f: F) -> EmberResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> EmberResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.manager
            .session(&self.path, self.schema.clone(), commit, f)
            .await
    }

    /// Apply an idempotent `CREATE ... IF NOT EXISTS` batch right away.
    pub async fn init_schema(&self, ddl: &str) -> EmberResult<()> {
        let ddl = ddl.to_string();
        let path = self.path.clone();
        self.session(true, move |tx| {
            tx.execute_batch(&ddl)
                .map_err(|e| crate::connection::sqlite_error(&path, e))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{SqliteResultExt, StorageTuning};

    const DDL: &str = "CREATE TABLE IF NOT EXISTS note (id INTEGER PRIMARY KEY, body TEXT NOT NULL);";

    #[tokio::test]
    async fn test_new_creates_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("nested").join("core");
        let store =
            StaticStore::new(ConnectionManager::new(StorageTuning::default()), &base, "core.db")
                .unwrap();
        assert!(base.is_dir());
        assert_eq!(store.path(), base.join("core.db"));
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            StaticStore::new(ConnectionManager::new(StorageTuning::default()), dir.path(), "core.db")
                .unwrap();

        store.init_schema(DDL).await.unwrap();
        store.init_schema(DDL).await.unwrap();

        store
            .session(true, |tx| {
                tx.execute("INSERT INTO note (body) VALUES ('hello')", [])
                    .map_sqlite(tx)?;
                Ok(())
            })
            .await
            .unwrap();

        let body: String = store
            .session(false, |tx| {
                tx.query_row("SELECT body FROM note", [], |row| row.get(0))
                    .map_sqlite(tx)
            })
            .await
            .unwrap();
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn test_schema_applied_on_first_open() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            StaticStore::new(ConnectionManager::new(StorageTuning::default()), dir.path(), "core.db")
                .unwrap()
                .with_schema(DDL);

        let count: i64 = store
            .session(false, |tx| {
                tx.query_row("SELECT COUNT(*) FROM note", [], |row| row.get(0))
                    .map_sqlite(tx)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
