//! Startup wiring: stores, caches, writers and repositories.
//!
//! Directory layout under `data_root`:
//!
//! ```text
//! core.db
//! log/log_YYYYMM.db           (sys_audit_log)
//! snapshot/snapshot_YYYYMM.db (name and card history)
//! message/logs_YYYY_MM.db     (message_log)
//! message/summary.db          (message_daily_summary)
//! ```

use std::sync::Arc;

use ember_core::constants::COMPACT_SHARD_KEY_FORMAT;
use ember_core::{EmberResult, PersistenceConfig};
use ember_storage::{
    ArchiveReport, ArchiveTool, BatchConfig, CacheStore, ConnectionManager, ShardLayout,
    ShardedStore, StaticStore, StorageTuning,
};

use crate::items::{BanItem, GroupItem, MemberItem, UserItem};
use crate::repositories::{
    BlacklistRepository, GroupRepository, InvitationRepository, MemberRepository,
    MessageLogRepository, UserRepository,
};
use crate::schema::{CORE_SCHEMA, LOG_SCHEMA, MESSAGE_LOG_SCHEMA, SNAPSHOT_SCHEMA, SUMMARY_SCHEMA};
use crate::writers::Writers;

// ============================================================================
// STORES
// ============================================================================

/// Every physical store, sharing one connection manager.
#[derive(Debug, Clone)]
pub struct Stores {
    pub manager: ConnectionManager,
    pub core: StaticStore,
    pub log: ShardedStore,
    pub snapshot: ShardedStore,
    pub messages: ShardedStore,
    pub summary: StaticStore,
}

impl Stores {
    /// Build the stores and create their directories. No database file is
    /// opened until [`Stores::init_schemas`] or the first session.
    pub fn new(config: &PersistenceConfig) -> EmberResult<Self> {
        let manager = ConnectionManager::new(StorageTuning::from(config));
        let tool = ArchiveTool::from(config);
        let root = &config.data_root;
        let message_dir = root.join("message");

        let core = StaticStore::new(manager.clone(), root, "core.db")?.with_schema(CORE_SCHEMA);
        let log = ShardedStore::new(
            manager.clone(),
            root.join("log"),
            ShardLayout::from_config(config, "log", "log").with_key_format(COMPACT_SHARD_KEY_FORMAT),
            tool.clone(),
        )?
        .with_schema(LOG_SCHEMA);
        let snapshot = ShardedStore::new(
            manager.clone(),
            root.join("snapshot"),
            ShardLayout::from_config(config, "snapshot", "snapshot")
                .with_key_format(COMPACT_SHARD_KEY_FORMAT),
            tool.clone(),
        )?
        .with_schema(SNAPSHOT_SCHEMA);
        let messages = ShardedStore::new(
            manager.clone(),
            &message_dir,
            ShardLayout::from_config(config, "message", "logs"),
            tool,
        )?
        .with_schema(MESSAGE_LOG_SCHEMA);
        let summary =
            StaticStore::new(manager.clone(), &message_dir, "summary.db")?.with_schema(SUMMARY_SCHEMA);

        Ok(Self {
            manager,
            core,
            log,
            snapshot,
            messages,
            summary,
        })
    }

    /// Create the static databases eagerly. Shards get their schema when
    /// first opened.
    pub async fn init_schemas(&self) -> EmberResult<()> {
        self.core.init_schema(CORE_SCHEMA).await?;
        self.summary.init_schema(SUMMARY_SCHEMA).await
    }

    pub fn sharded(&self) -> [&ShardedStore; 3] {
        [&self.log, &self.snapshot, &self.messages]
    }
}

// ============================================================================
// CACHES
// ============================================================================

/// The entity caches, created once and injected into the repositories.
#[derive(Debug, Clone)]
pub struct Caches {
    pub users: Arc<CacheStore<UserItem>>,
    pub groups: Arc<CacheStore<GroupItem>>,
    pub members: Arc<CacheStore<MemberItem>>,
    pub bans: Arc<CacheStore<BanItem>>,
}

impl Default for Caches {
    fn default() -> Self {
        Self {
            users: Arc::new(CacheStore::new("users")),
            groups: Arc::new(CacheStore::new("groups")),
            members: Arc::new(CacheStore::new("members")),
            bans: Arc::new(CacheStore::new("bans")),
        }
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

/// Counts loaded by [`Persistence::warm_up_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmUpReport {
    pub users: usize,
    pub groups: usize,
    pub members: usize,
    pub bans: usize,
}

#[derive(Debug)]
pub struct Persistence {
    config: PersistenceConfig,
    stores: Stores,
    caches: Caches,
    writers: Arc<Writers>,
    pub users: UserRepository,
    pub groups: GroupRepository,
    pub members: MemberRepository,
    pub blacklist: BlacklistRepository,
    pub invitations: InvitationRepository,
    pub messages: MessageLogRepository,
}

impl Persistence {
    /// Validate `config`, open every store and start the batch writers.
    ///
    /// Must be called inside a Tokio runtime.
    pub async fn open(config: PersistenceConfig) -> EmberResult<Self> {
        config.validate()?;

        let stores = Stores::new(&config)?;
        stores.init_schemas().await?;

        let caches = Caches::default();
        let writers = Arc::new(Writers::new(&stores, BatchConfig::from(&config))?);

        let users = UserRepository::new(
            Arc::clone(&caches.users),
            stores.clone(),
            Arc::clone(&writers),
            config.superusers.iter().cloned(),
        );
        let groups = GroupRepository::new(Arc::clone(&caches.groups), stores.clone(), Arc::clone(&writers));
        let members =
            MemberRepository::new(Arc::clone(&caches.members), stores.clone(), Arc::clone(&writers));
        let blacklist = BlacklistRepository::new(Arc::clone(&caches.bans), stores.clone());
        let invitations = InvitationRepository::new(stores.clone());
        let messages = MessageLogRepository::new(stores.clone(), Arc::clone(&writers), config.utc_offset());

        tracing::info!(
            data_root = %config.data_root.display(),
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            active_window = config.active_window,
            "Persistence opened"
        );

        Ok(Self {
            config,
            stores,
            caches,
            writers,
            users,
            groups,
            members,
            blacklist,
            invitations,
            messages,
        })
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn caches(&self) -> &Caches {
        &self.caches
    }

    pub fn writers(&self) -> &Writers {
        &self.writers
    }

    /// Load every cache from `core.db`. Called once at startup.
    pub async fn warm_up_all(&self) -> EmberResult<WarmUpReport> {
        let (users, groups, members, bans) = futures_util::try_join!(
            self.users.warm_up(),
            self.groups.warm_up(),
            self.members.warm_up(),
            self.blacklist.warm_up(),
        )?;
        let report = WarmUpReport {
            users,
            groups,
            members,
            bans,
        };
        tracing::info!(
            users = report.users,
            groups = report.groups,
            members = report.members,
            bans = report.bans,
            "Caches warmed up"
        );
        Ok(report)
    }

    /// One archival pass over every sharded store.
    ///
    /// A store that fails as a whole yields a report whose `failed` holds the
    /// error text; per-shard failures are listed by shard key.
    pub async fn archive_all(&self) -> Vec<ArchiveReport> {
        let mut reports = Vec::with_capacity(3);
        for store in self.stores.sharded() {
            let namespace = store.layout().namespace.clone();
            match store.run_archiver_task().await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!(namespace = %namespace, error = %e, "Archive pass failed");
                    reports.push(ArchiveReport {
                        namespace,
                        failed: vec![e.to_string()],
                        ..ArchiveReport::default()
                    });
                }
            }
        }
        reports
    }

    /// Flush every writer, then close all pools.
    pub async fn shutdown(&self) {
        self.writers.shutdown_all().await;
        self.stores.manager.dispose_all();
        tracing::info!("Persistence shut down");
    }
}
