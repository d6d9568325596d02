//! Time-sharded store with a hot/cold shard lifecycle.
//!
//! A shard is one database file holding every record whose timestamp falls in
//! one calendar month. Hot shards live as `{prefix}_{key}.{db_ext}`; cold
//! shards as `{prefix}_{key}.{archive_ext}`, produced by the archive tool.
//! Reads and writes reinflate cold shards on demand. The archiver compresses
//! every hot shard outside the active window.
//!
//! Per-key locks serialize compress/extract transitions only. Ordinary
//! sessions on a hot shard never take them.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, FixedOffset, Months, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc};
use dashmap::DashMap;
use ember_core::constants::{
    ARCHIVE_EXTENSION, DB_EXTENSION, DEFAULT_ACTIVE_WINDOW, DEFAULT_MAX_MAP_REDUCE_SPAN,
    DEFAULT_SHARD_KEY_FORMAT,
};
use ember_core::{
    EmberError, EmberResult, PersistenceConfig, StorageError, Timestamp,
    ValidationError,
};
use rusqlite::Transaction;
use tokio::sync::Mutex;

use crate::archive::{safe_resolve, ArchiveTool};
use crate::connection::ConnectionManager;

// ============================================================================
// LAYOUT
// ============================================================================

/// Naming and windowing rules for one sharded namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    pub namespace: String,
    pub prefix: String,
    /// strftime pattern; must distinguish calendar months.
    pub key_format: String,
    pub db_ext: String,
    pub archive_ext: String,
    /// Current period plus `active_window - 1` previous ones are never archived.
    pub active_window: u32,
    pub max_span: u32,
    pub utc_offset: FixedOffset,
}

impl ShardLayout {
    pub fn new(namespace: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            prefix: prefix.into(),
            key_format: DEFAULT_SHARD_KEY_FORMAT.to_string(),
            db_ext: DB_EXTENSION.to_string(),
            archive_ext: ARCHIVE_EXTENSION.to_string(),
            active_window: DEFAULT_ACTIVE_WINDOW,
            max_span: DEFAULT_MAX_MAP_REDUCE_SPAN,
            utc_offset: Utc.fix(),
        }
    }

    /// Window, span and offset taken from `config`.
    pub fn from_config(
        config: &PersistenceConfig,
        namespace: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self::new(namespace, prefix)
            .with_active_window(config.active_window)
            .with_max_span(config.max_map_reduce_span)
            .with_utc_offset(config.utc_offset())
    }

    pub fn with_key_format(mut self, key_format: impl Into<String>) -> Self {
        self.key_format = key_format.into();
        self
    }

    pub fn with_active_window(mut self, periods: u32) -> Self {
        self.active_window = periods;
        self
    }

    pub fn with_max_span(mut self, periods: u32) -> Self {
        self.max_span = periods;
        self
    }

    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    pub fn validate(&self) -> EmberResult<()> {
        let invalid = |field: &str, reason: &str| {
            EmberError::Validation(ValidationError::InvalidValue {
                field: field.to_string(),
                reason: reason.to_string(),
            })
        };

        if self.prefix.is_empty() || self.prefix.contains(['/', '\\']) {
            return Err(invalid("prefix", "must be a non-empty file name component"));
        }
        if self.active_window == 0 {
            return Err(invalid("active_window", "must be at least 1"));
        }
        if self.max_span == 0 {
            return Err(invalid("max_span", "must be at least 1"));
        }

        // Periods step by calendar month, so every moment of a month must
        // land on the same key and consecutive months on different ones.
        let jan_first = sample_key(&self.key_format, 2024, 1, 1, NaiveTime::MIN);
        let jan_last = sample_key(&self.key_format, 2024, 1, 31, last_second());
        let feb_first = sample_key(&self.key_format, 2024, 2, 1, NaiveTime::MIN);
        match (jan_first, jan_last, feb_first) {
            (Some(first), Some(last), Some(next))
                if first == last && first != next && !first.contains(['/', '\\']) =>
            {
                Ok(())
            }
            (Some(first), Some(last), _) if first != last => {
                Err(invalid("key_format", "must not split a month into several shards"))
            }
            _ => Err(invalid("key_format", "must format dates and distinguish months")),
        }
    }

    fn format_key(&self, local: NaiveDateTime) -> String {
        local.format(&self.key_format).to_string()
    }
}

fn sample_key(format: &str, year: i32, month: u32, day: u32, time: NaiveTime) -> Option<String> {
    let sample = NaiveDate::from_ymd_opt(year, month, day)?.and_time(time);
    let mut out = String::new();
    write!(out, "{}", sample.format(format)).ok()?;
    Some(out)
}

fn last_second() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
}

/// Hot and cold file locations for one shard key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPaths {
    pub db: PathBuf,
    pub archive: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Hot,
    Cold,
    /// Reinflated: the raw file and its archive both exist.
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub key: String,
    pub state: ShardState,
}

/// Outcome of one archiver pass over a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub namespace: String,
    pub archived: Vec<String>,
    pub skipped_active: usize,
    /// Compressed but the raw file could not be removed; retried next pass.
    pub busy: Vec<String>,
    pub failed: Vec<String>,
}

enum ArchiveOutcome {
    Archived,
    Busy,
    Gone,
}

// ============================================================================
// STORE
// ============================================================================

#[derive(Debug, Clone)]
pub struct ShardedStore {
    manager: ConnectionManager,
    base_dir: PathBuf,
    layout: ShardLayout,
    tool: ArchiveTool,
    schema: Option<Arc<str>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ShardedStore {
    /// Validates the layout and creates `base_dir` if needed.
    pub fn new(
        manager: ConnectionManager,
        base_dir: impl AsRef<Path>,
        layout: ShardLayout,
        tool: ArchiveTool,
    ) -> EmberResult<Self> {
        layout.validate()?;
        let base_dir = base_dir.as_ref();
        std::fs::create_dir_all(base_dir).map_err(|e| StorageError::Io {
            path: base_dir.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            manager,
            base_dir: base_dir.to_path_buf(),
            layout,
            tool,
            schema: None,
            locks: Arc::new(DashMap::new()),
        })
    }

    /// DDL run on every connection opened against any shard. Must be idempotent.
    pub fn with_schema(mut self, ddl: &str) -> Self {
        self.schema = Some(Arc::from(ddl));
        self
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn shard_key(&self, ts: Timestamp) -> String {
        self.layout
            .format_key(ts.with_timezone(&self.layout.utc_offset).naive_local())
    }

    pub fn shard_paths(&self, key: &str) -> ShardPaths {
        let stem = format!("{}_{}", self.layout.prefix, key);
        ShardPaths {
            db: self.base_dir.join(format!("{stem}.{}", self.layout.db_ext)),
            archive: self
                .base_dir
                .join(format!("{stem}.{}", self.layout.archive_ext)),
        }
    }

    /// Unit of work on the shard for `time_ctx` (now when `None`).
    pub async fn session<T, F>(
        &self,
        time_ctx: Option<Timestamp>,
        commit: bool,
        f: F,
    ) -> EmberResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> EmberResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let key = self.shard_key(time_ctx.unwrap_or_else(Utc::now));
        self.session_for_key(&key, commit, f).await
    }

    /// Unit of work on the shard named `key`, reinflating it first if cold.
    pub async fn session_for_key<T, F>(&self, key: &str, commit: bool, f: F) -> EmberResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> EmberResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_shard_online(key).await?;
        let paths = self.shard_paths(key);
        self.manager
            .session(&paths.db, self.schema.clone(), commit, f)
            .await
    }

    /// Make sure a cold shard is decompressed before use.
    ///
    /// Returns immediately when the raw file exists or when neither the raw
    /// file nor its archive exist (a new shard the next write will create).
    pub async fn ensure_shard_online(&self, key: &str) -> EmberResult<()> {
        let paths = self.shard_paths(key);
        if file_exists(&paths.db).await || !file_exists(&paths.archive).await {
            return Ok(());
        }

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        if file_exists(&paths.db).await {
            return Ok(());
        }

        let archive = safe_resolve(&self.base_dir, &paths.archive)?;
        let db = safe_resolve(&self.base_dir, &paths.db)?;

        // Extract beside the store and rename into place, so the lock-free
        // fast path never observes a half-written shard.
        let staging = safe_resolve(
            &self.base_dir,
            &self
                .base_dir
                .join(format!(".staging_{}_{}", self.layout.prefix, key)),
        )?;
        let io_err = |path: &Path, e: std::io::Error| -> EmberError {
            StorageError::Io {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
            .into()
        };
        if file_exists(&staging).await {
            tokio::fs::remove_dir_all(&staging)
                .await
                .map_err(|e| io_err(&staging, e))?;
        }
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| io_err(&staging, e))?;

        tracing::info!(
            namespace = %self.layout.namespace,
            shard = %key,
            "Reinflating cold shard"
        );
        let extracted = self.tool.extract(&archive, &staging).await;

        let staged = staging.join(db.file_name().unwrap_or_default());
        let placed = match extracted {
            Ok(()) if file_exists(&staged).await => tokio::fs::rename(&staged, &db)
                .await
                .map_err(|e| io_err(&db, e)),
            Ok(()) => {
                tracing::warn!(
                    namespace = %self.layout.namespace,
                    shard = %key,
                    "Archive extracted but shard file is missing"
                );
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            tracing::warn!(path = %staging.display(), error = %e, "Could not remove staging directory");
        }
        placed
    }

    /// Compress every hot shard outside the active window.
    pub async fn run_archiver_task(&self) -> EmberResult<ArchiveReport> {
        self.run_archiver_task_at(Utc::now()).await
    }

    /// Archiver pass with an explicit notion of "now".
    pub async fn run_archiver_task_at(&self, now: Timestamp) -> EmberResult<ArchiveReport> {
        let active: HashSet<String> = self.active_keys(now)?.into_iter().collect();
        let mut report = ArchiveReport {
            namespace: self.layout.namespace.clone(),
            ..ArchiveReport::default()
        };

        for info in self.list_shards().await? {
            if info.state == ShardState::Cold {
                continue;
            }
            if active.contains(&info.key) {
                report.skipped_active += 1;
                continue;
            }

            match self.archive_shard(&info.key).await {
                Ok(ArchiveOutcome::Archived) => report.archived.push(info.key),
                Ok(ArchiveOutcome::Busy) => report.busy.push(info.key),
                Ok(ArchiveOutcome::Gone) => {}
                Err(e) => {
                    tracing::error!(
                        namespace = %self.layout.namespace,
                        shard = %info.key,
                        error = %e,
                        "Shard archival failed"
                    );
                    report.failed.push(info.key);
                }
            }
        }

        tracing::info!(
            namespace = %self.layout.namespace,
            archived = report.archived.len(),
            skipped_active = report.skipped_active,
            busy = report.busy.len(),
            failed = report.failed.len(),
            "Archiver pass complete"
        );
        Ok(report)
    }

    async fn archive_shard(&self, key: &str) -> EmberResult<ArchiveOutcome> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let paths = self.shard_paths(key);
        if !file_exists(&paths.db).await {
            return Ok(ArchiveOutcome::Gone);
        }
        let db = safe_resolve(&self.base_dir, &paths.db)?;
        let archive = safe_resolve(&self.base_dir, &paths.archive)?;

        if let Err(e) = self.manager.checkpoint(&db).await {
            tracing::warn!(shard = %key, error = %e, "WAL checkpoint failed, retrying next pass");
            return Ok(ArchiveOutcome::Busy);
        }

        self.tool.compress(&archive, &db).await?;
        self.manager.dispose(&db);

        if let Err(e) = tokio::fs::remove_file(&db).await {
            tracing::warn!(
                namespace = %self.layout.namespace,
                shard = %key,
                error = %e,
                "Shard compressed but file is still in use, retrying next pass"
            );
            return Ok(ArchiveOutcome::Busy);
        }
        for sidecar in ["-wal", "-shm"] {
            let mut name = db.clone().into_os_string();
            name.push(sidecar);
            match tokio::fs::remove_file(PathBuf::from(name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(shard = %key, sidecar, error = %e, "Could not remove sidecar");
                }
            }
        }

        tracing::info!(namespace = %self.layout.namespace, shard = %key, "Shard archived");
        Ok(ArchiveOutcome::Archived)
    }

    /// Keys of the current period and the `active_window - 1` before it.
    pub fn active_keys(&self, now: Timestamp) -> EmberResult<Vec<String>> {
        let current = self.month_start(now)?;
        (0..self.layout.active_window)
            .map(|back| {
                current
                    .checked_sub_months(Months::new(back))
                    .map(|month| self.layout.format_key(month.and_time(NaiveTime::MIN)))
                    .ok_or_else(|| out_of_range("now", now))
            })
            .collect()
    }

    /// Distinct shard keys covering `[start, end]`, in chronological order.
    ///
    /// Fails before touching any file when the range is inverted or covers
    /// more than `max_span` periods.
    pub fn period_keys(&self, start: Timestamp, end: Timestamp) -> EmberResult<Vec<String>> {
        if start > end {
            return Err(ValidationError::InvalidRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            }
            .into());
        }

        let first = self.month_start(start)?;
        let last = self.month_start(end)?;
        let months = (last.year() - first.year()) * 12 + last.month() as i32
            - first.month() as i32
            + 1;
        let span = u32::try_from(months).unwrap_or(u32::MAX);
        if span > self.layout.max_span {
            return Err(ValidationError::SpanExceeded {
                span,
                max: self.layout.max_span,
            }
            .into());
        }

        let mut seen = HashSet::new();
        let mut keys = Vec::with_capacity(span as usize);
        for step in 0..span {
            let month = first
                .checked_add_months(Months::new(step))
                .ok_or_else(|| out_of_range("end", end))?;
            let key = self.layout.format_key(month.and_time(NaiveTime::MIN));
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Run `query` read-only against every existing shard in `[start, end]`.
    ///
    /// Cold shards are reinflated first. Periods without a shard file are
    /// skipped, so the result holds one `(key, value)` per shard with data.
    pub async fn map_reduce<T, F>(
        &self,
        start: Timestamp,
        end: Timestamp,
        query: F,
    ) -> EmberResult<Vec<(String, T)>>
    where
        F: Fn(&Transaction<'_>) -> EmberResult<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let keys = self.period_keys(start, end)?;
        let mut results = Vec::with_capacity(keys.len());

        for key in keys {
            self.ensure_shard_online(&key).await?;
            let paths = self.shard_paths(&key);
            if !file_exists(&paths.db).await {
                tracing::debug!(namespace = %self.layout.namespace, shard = %key, "No shard for period");
                continue;
            }

            let query = query.clone();
            let value = self
                .manager
                .session(&paths.db, self.schema.clone(), false, move |tx| query(tx))
                .await?;
            results.push((key, value));
        }
        Ok(results)
    }

    /// Every shard present on disk, hot or cold, sorted by key.
    pub async fn list_shards(&self) -> EmberResult<Vec<ShardInfo>> {
        let io_err = |e: std::io::Error| -> EmberError {
            StorageError::Io {
                path: self.base_dir.display().to_string(),
                reason: e.to_string(),
            }
            .into()
        };

        let stem_prefix = format!("{}_", self.layout.prefix);
        let db_suffix = format!(".{}", self.layout.db_ext);
        let archive_suffix = format!(".{}", self.layout.archive_ext);

        let mut found: BTreeMap<String, (bool, bool)> = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&stem_prefix) else { continue };

            if let Some(key) = rest.strip_suffix(&db_suffix) {
                found.entry(key.to_string()).or_default().0 = true;
            } else if let Some(key) = rest.strip_suffix(&archive_suffix) {
                found.entry(key.to_string()).or_default().1 = true;
            }
        }

        Ok(found
            .into_iter()
            .filter_map(|(key, flags)| {
                let state = match flags {
                    (true, true) => ShardState::Both,
                    (true, false) => ShardState::Hot,
                    (false, true) => ShardState::Cold,
                    (false, false) => return None,
                };
                Some(ShardInfo { key, state })
            })
            .collect())
    }

    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks.entry(key.to_string()).or_default().clone()
    }

    fn month_start(&self, ts: Timestamp) -> EmberResult<NaiveDate> {
        let local = ts.with_timezone(&self.layout.utc_offset);
        NaiveDate::from_ymd_opt(local.year(), local.month(), 1)
            .ok_or_else(|| out_of_range("timestamp", ts))
    }
}

fn out_of_range(field: &str, ts: Timestamp) -> EmberError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        reason: format!("{} is outside the supported calendar", ts.to_rfc3339()),
    }
    .into()
}

async fn file_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{SqliteResultExt, StorageTuning};
    use chrono::TimeZone;

    const DDL: &str = "CREATE TABLE IF NOT EXISTS event (id INTEGER PRIMARY KEY, body TEXT NOT NULL);";

    fn ts(year: i32, month: u32, day: u32) -> Timestamp {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    fn store_in(dir: &Path, tool: ArchiveTool) -> ShardedStore {
        ShardedStore::new(
            ConnectionManager::new(StorageTuning::default()),
            dir.join("log"),
            ShardLayout::new("log", "log").with_key_format("%Y%m"),
            tool,
        )
        .unwrap()
        .with_schema(DDL)
    }

    async fn insert(store: &ShardedStore, at: Timestamp, body: &str) {
        let body = body.to_string();
        store
            .session(Some(at), true, move |tx| {
                tx.execute("INSERT INTO event (body) VALUES (?1)", [body])
                    .map_sqlite(tx)?;
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn bodies(store: &ShardedStore, at: Timestamp) -> Vec<String> {
        store
            .session(Some(at), false, |tx| {
                let mut stmt = tx
                    .prepare("SELECT body FROM event ORDER BY id")
                    .map_sqlite(tx)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_sqlite(tx)?;
                rows.collect::<Result<Vec<_>, _>>().map_sqlite(tx)
            })
            .await
            .unwrap()
    }

    #[test]
    fn test_layout_rejects_yearly_format() {
        let layout = ShardLayout::new("log", "log").with_key_format("%Y");
        assert!(layout.validate().is_err());
        assert!(ShardLayout::new("log", "log").validate().is_ok());
        assert!(ShardLayout::new("log", "").validate().is_err());
        assert!(ShardLayout::new("log", "log")
            .with_active_window(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_layout_rejects_sub_monthly_formats() {
        for format in ["%Y_%m_%d", "%Y%m%H", "%Y-%m-%a", "%Y%m_%M"] {
            let layout = ShardLayout::new("log", "log").with_key_format(format);
            let err = layout.validate().unwrap_err();
            assert!(
                matches!(
                    &err,
                    EmberError::Validation(ValidationError::InvalidValue { field, .. }) if field == "key_format"
                ),
                "{format} accepted"
            );
        }
        assert!(ShardLayout::new("log", "log")
            .with_key_format("%Y-%m")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_active_keys_include_today() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), ArchiveTool::default());
        let now = ts(2024, 6, 15);
        let active = store.active_keys(now).unwrap();
        assert!(active.contains(&store.shard_key(now)));
        assert_eq!(store.period_keys(ts(2024, 6, 1), now).unwrap(), [store.shard_key(now)]);
    }

    #[test]
    fn test_shard_key_same_month_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), ArchiveTool::default());

        assert_eq!(store.shard_key(ts(2024, 3, 1)), "202403");
        assert_eq!(store.shard_key(ts(2024, 3, 1)), store.shard_key(ts(2024, 3, 31)));
        assert_ne!(store.shard_key(ts(2024, 3, 31)), store.shard_key(ts(2024, 4, 1)));
        assert!(store
            .shard_paths("202403")
            .db
            .ends_with("log/log_202403.db"));
        assert!(store
            .shard_paths("202403")
            .archive
            .ends_with("log/log_202403.7z"));
    }

    #[test]
    fn test_shard_key_uses_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShardedStore::new(
            ConnectionManager::new(StorageTuning::default()),
            dir.path(),
            ShardLayout::new("log", "log")
                .with_utc_offset(FixedOffset::east_opt(8 * 3600).unwrap()),
            ArchiveTool::default(),
        )
        .unwrap();

        let late_utc = Utc.with_ymd_and_hms(2024, 1, 31, 20, 0, 0).unwrap();
        assert_eq!(store.shard_key(late_utc), "2024_02");
    }

    #[test]
    fn test_period_keys_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), ArchiveTool::default());

        let six = store.period_keys(ts(2024, 1, 15), ts(2024, 6, 2)).unwrap();
        assert_eq!(six, ["202401", "202402", "202403", "202404", "202405", "202406"]);

        let err = store
            .period_keys(ts(2024, 1, 15), ts(2024, 7, 2))
            .unwrap_err();
        assert_eq!(
            err,
            EmberError::Validation(ValidationError::SpanExceeded { span: 7, max: 6 })
        );

        let across_year = store.period_keys(ts(2023, 11, 1), ts(2024, 2, 1)).unwrap();
        assert_eq!(across_year, ["202311", "202312", "202401", "202402"]);

        assert!(matches!(
            store.period_keys(ts(2024, 2, 1), ts(2024, 1, 1)),
            Err(EmberError::Validation(ValidationError::InvalidRange { .. }))
        ));
    }

    #[test]
    fn test_active_keys_cover_current_and_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), ArchiveTool::default());
        assert_eq!(
            store.active_keys(ts(2024, 1, 10)).unwrap(),
            ["202401", "202312"]
        );
    }

    #[tokio::test]
    async fn test_session_writes_to_period_shard() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), ArchiveTool::default());

        insert(&store, ts(2024, 1, 5), "jan").await;
        insert(&store, ts(2024, 2, 5), "feb").await;

        assert_eq!(bodies(&store, ts(2024, 1, 28)).await, ["jan"]);
        assert_eq!(bodies(&store, ts(2024, 2, 1)).await, ["feb"]);

        let shards = store.list_shards().await.unwrap();
        let keys: Vec<_> = shards.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, ["202401", "202402"]);
        assert!(shards.iter().all(|s| s.state == ShardState::Hot));
    }

    #[tokio::test]
    async fn test_map_reduce_skips_missing_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), ArchiveTool::default());

        for month in [1, 2, 4, 6] {
            insert(&store, ts(2024, month, 3), "x").await;
        }

        let results = store
            .map_reduce(ts(2024, 1, 1), ts(2024, 6, 30), |tx| {
                tx.query_row("SELECT COUNT(*) FROM event", [], |row| row.get::<_, i64>(0))
                    .map_sqlite(tx)
            })
            .await
            .unwrap();

        let keys: Vec<_> = results.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["202401", "202402", "202404", "202406"]);
        assert!(results.iter().all(|(_, count)| *count == 1));
    }

    #[tokio::test]
    async fn test_map_reduce_rejects_wide_range_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path(), ArchiveTool::default().with_program("ember-no-such-archiver"));

        let result = store
            .map_reduce(ts(2024, 1, 1), ts(2024, 7, 1), |_| Ok(()))
            .await;
        assert!(matches!(
            result,
            Err(EmberError::Validation(ValidationError::SpanExceeded { .. }))
        ));
        assert_eq!(store.manager.open_pools(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_archive_round_trip_reinflates_identical_content() {
        use ember_test_utils::fixtures::FakeArchiveTool;

        let dir = tempfile::tempdir().unwrap();
        let fake = FakeArchiveTool::install(dir.path()).unwrap();
        let store = store_in(dir.path(), ArchiveTool::default().with_program(fake.program_str()));

        let now = ts(2024, 6, 15);
        insert(&store, ts(2024, 1, 3), "old-1").await;
        insert(&store, ts(2024, 1, 9), "old-2").await;
        insert(&store, ts(2024, 5, 3), "previous").await;
        insert(&store, ts(2024, 6, 3), "current").await;

        let before = bodies(&store, ts(2024, 1, 3)).await;
        let report = store.run_archiver_task_at(now).await.unwrap();
        assert_eq!(report.archived, ["202401"]);
        assert_eq!(report.skipped_active, 2);
        assert!(report.failed.is_empty());

        let paths = store.shard_paths("202401");
        assert!(!paths.db.exists());
        assert!(paths.archive.exists());

        let after = bodies(&store, ts(2024, 1, 3)).await;
        assert_eq!(before, after);
        assert_eq!(fake.invocations("x"), 1);

        let states: Vec<_> = store
            .list_shards()
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.key, s.state))
            .collect();
        assert_eq!(states[0], ("202401".to_string(), ShardState::Both));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_archiver_leaves_active_window_alone() {
        use ember_test_utils::fixtures::FakeArchiveTool;

        let dir = tempfile::tempdir().unwrap();
        let fake = FakeArchiveTool::install(dir.path()).unwrap();
        let store = store_in(dir.path(), ArchiveTool::default().with_program(fake.program_str()));

        insert(&store, ts(2024, 6, 3), "current").await;
        insert(&store, ts(2024, 5, 3), "previous").await;

        let report = store.run_archiver_task_at(ts(2024, 6, 20)).await.unwrap();
        assert!(report.archived.is_empty());
        assert_eq!(report.skipped_active, 2);
        assert_eq!(fake.invocations("a"), 0);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_online_decompresses_once() {
        use ember_test_utils::fixtures::FakeArchiveTool;

        let dir = tempfile::tempdir().unwrap();
        let fake = FakeArchiveTool::install_slow(dir.path(), 1).unwrap();
        let store = store_in(dir.path(), ArchiveTool::default().with_program(fake.program_str()));

        insert(&store, ts(2024, 1, 3), "cold").await;
        let report = store.run_archiver_task_at(ts(2024, 6, 1)).await.unwrap();
        assert_eq!(report.archived, ["202401"]);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.ensure_shard_online("202401").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(fake.invocations("x"), 1);
        assert!(store.shard_paths("202401").db.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_compression_keeps_raw_file() {
        use ember_test_utils::fixtures::FakeArchiveTool;

        let dir = tempfile::tempdir().unwrap();
        let fake = FakeArchiveTool::install_failing(dir.path(), 2).unwrap();
        let store = store_in(dir.path(), ArchiveTool::default().with_program(fake.program_str()));

        insert(&store, ts(2024, 1, 3), "keep").await;
        let report = store.run_archiver_task_at(ts(2024, 6, 1)).await.unwrap();

        assert_eq!(report.failed, ["202401"]);
        assert!(store.shard_paths("202401").db.exists());
        assert_eq!(bodies(&store, ts(2024, 1, 3)).await, ["keep"]);
    }
}
