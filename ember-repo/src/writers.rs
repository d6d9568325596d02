//! Deferred writers: one [`BatchWriter`] per field class.
//!
//! Splitting creates, renames and permission changes across writers keeps
//! an unrelated bulk operation from delaying another. Every core handler
//! collapses the batch to the latest payload per natural key, writes the
//! core rows in one unit of work, and then appends the history and audit
//! rows to the shards of their own timestamps. History is taken from the
//! whole batch, so intermediate renames inside one flush are kept.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use ember_core::constants::MESSAGE_LOG_BATCH_SIZE;
use ember_core::{
    timestamp_from_unix, AuditAction, AuditCategory, AuditContext, EmberResult, StorageError,
};
use ember_storage::{
    dedup_latest, write_sharded, BatchConfig, BatchMetricsSnapshot, BatchWriter, FlushHandler,
    ShardedStore, StaticStore,
};
use rusqlite::{Connection, Transaction};
use serde_json::json;

use crate::effects::SideEffects;
use crate::ops::audit::AuditRecord;
use crate::ops::groups::{self, GroupNameChange, GroupRecord, GroupStatusChange};
use crate::ops::members::{self, MemberCardChange, MemberPermissionChange, MemberRecord};
use crate::ops::messages::{self, MessageRecord};
use crate::ops::snapshots::{GroupSnapshot, UserSnapshot};
use crate::ops::users::{self, UserNameChange, UserPermissionChange, UserRecord};
use crate::persistence::Stores;

// ============================================================================
// PAYLOADS
// ============================================================================

/// A record placed on a core writer.
pub trait DeferredPayload: Sized + Send + Sync + 'static {
    type Key: Eq + Hash;

    /// Natural key used to collapse duplicates within a batch.
    fn key(&self) -> Self::Key;

    /// Write a deduplicated batch to `core.db`.
    fn write_core(conn: &Connection, items: &[Self]) -> EmberResult<usize>;

    /// History and audit rows this payload produces.
    fn side_effects(&self, effects: &mut SideEffects);
}

impl DeferredPayload for UserRecord {
    type Key = String;

    fn key(&self) -> String {
        self.user_id.clone()
    }

    fn write_core(conn: &Connection, items: &[Self]) -> EmberResult<usize> {
        users::bulk_upsert(conn, items)
    }

    fn side_effects(&self, effects: &mut SideEffects) {
        if !self.user_name.is_empty() {
            effects.user_snapshot(UserSnapshot::name(&self.user_id, &self.user_name, self.at));
        }
    }
}

impl DeferredPayload for UserNameChange {
    type Key = String;

    fn key(&self) -> String {
        self.user_id.clone()
    }

    fn write_core(conn: &Connection, items: &[Self]) -> EmberResult<usize> {
        users::bulk_upsert_names(conn, items)
    }

    fn side_effects(&self, effects: &mut SideEffects) {
        effects.user_snapshot(UserSnapshot::name(&self.user_id, &self.user_name, self.at));
    }
}

impl DeferredPayload for UserPermissionChange {
    type Key = String;

    fn key(&self) -> String {
        self.user_id.clone()
    }

    fn write_core(conn: &Connection, items: &[Self]) -> EmberResult<usize> {
        users::bulk_update_permissions(conn, items)
    }

    fn side_effects(&self, effects: &mut SideEffects) {
        effects.audit(user_permission_audit(self));
    }
}

impl DeferredPayload for GroupRecord {
    type Key = String;

    fn key(&self) -> String {
        self.group_id.clone()
    }

    fn write_core(conn: &Connection, items: &[Self]) -> EmberResult<usize> {
        groups::bulk_upsert(conn, items)
    }

    fn side_effects(&self, effects: &mut SideEffects) {
        if !self.group_name.is_empty() {
            effects.group_snapshot(GroupSnapshot::name(&self.group_id, &self.group_name, self.at));
        }
    }
}

impl DeferredPayload for GroupNameChange {
    type Key = String;

    fn key(&self) -> String {
        self.group_id.clone()
    }

    fn write_core(conn: &Connection, items: &[Self]) -> EmberResult<usize> {
        groups::bulk_upsert_names(conn, items)
    }

    fn side_effects(&self, effects: &mut SideEffects) {
        effects.group_snapshot(GroupSnapshot::name(&self.group_id, &self.group_name, self.at));
    }
}

impl DeferredPayload for GroupStatusChange {
    type Key = String;

    fn key(&self) -> String {
        self.group_id.clone()
    }

    fn write_core(conn: &Connection, items: &[Self]) -> EmberResult<usize> {
        groups::bulk_update_statuses(conn, items)
    }

    fn side_effects(&self, effects: &mut SideEffects) {
        effects.audit(group_status_audit(self));
    }
}

impl DeferredPayload for MemberRecord {
    type Key = (String, String);

    fn key(&self) -> (String, String) {
        (self.group_id.clone(), self.user_id.clone())
    }

    /// Parent user and group rows are created first if missing.
    fn write_core(conn: &Connection, items: &[Self]) -> EmberResult<usize> {
        let at = items.iter().map(|m| m.at).max().unwrap_or_default();
        let user_ids: BTreeSet<&str> = items.iter().map(|m| m.user_id.as_str()).collect();
        let group_ids: BTreeSet<&str> = items.iter().map(|m| m.group_id.as_str()).collect();
        users::insert_ignore(conn, &user_ids.into_iter().collect::<Vec<_>>(), at)?;
        groups::insert_ignore(conn, &group_ids.into_iter().collect::<Vec<_>>(), at)?;
        members::bulk_upsert(conn, items)
    }

    fn side_effects(&self, effects: &mut SideEffects) {
        if !self.group_card.is_empty() {
            effects.user_snapshot(UserSnapshot::card(
                &self.group_id,
                &self.user_id,
                &self.group_card,
                self.at,
            ));
        }
    }
}

impl DeferredPayload for MemberCardChange {
    type Key = (String, String);

    fn key(&self) -> (String, String) {
        (self.group_id.clone(), self.user_id.clone())
    }

    fn write_core(conn: &Connection, items: &[Self]) -> EmberResult<usize> {
        members::bulk_upsert_cards(conn, items)
    }

    fn side_effects(&self, effects: &mut SideEffects) {
        effects.user_snapshot(UserSnapshot::card(
            &self.group_id,
            &self.user_id,
            &self.group_card,
            self.at,
        ));
    }
}

impl DeferredPayload for MemberPermissionChange {
    type Key = (String, String);

    fn key(&self) -> (String, String) {
        (self.group_id.clone(), self.user_id.clone())
    }

    fn write_core(conn: &Connection, items: &[Self]) -> EmberResult<usize> {
        members::bulk_update_permissions(conn, items)
    }

    fn side_effects(&self, effects: &mut SideEffects) {
        effects.audit(member_permission_audit(self));
    }
}

// ============================================================================
// AUDIT RECORDS
// ============================================================================

pub(crate) fn user_permission_audit(change: &UserPermissionChange) -> AuditRecord {
    AuditRecord::new(
        AuditContext::User,
        AuditCategory::Permission,
        AuditAction::Change,
        change.at,
    )
    .target(change.user_id.clone())
    .operator(change.operator_id.clone())
    .meta(json!({ "permission": change.permission.to_db() }))
}

pub(crate) fn group_status_audit(change: &GroupStatusChange) -> AuditRecord {
    AuditRecord::new(
        AuditContext::Group,
        AuditCategory::Access,
        AuditAction::Change,
        change.at,
    )
    .target(change.group_id.clone())
    .context(change.group_id.clone())
    .operator(change.operator_id.clone())
    .meta(json!({ "status": change.status.as_db_str() }))
}

pub(crate) fn member_permission_audit(change: &MemberPermissionChange) -> AuditRecord {
    AuditRecord::new(
        AuditContext::Group,
        AuditCategory::Permission,
        AuditAction::Change,
        change.at,
    )
    .target(change.user_id.clone())
    .context(change.group_id.clone())
    .operator(change.operator_id.clone())
    .meta(json!({ "permission": change.permission.to_db() }))
}

// ============================================================================
// FLUSH HANDLERS
// ============================================================================

/// Flushes one payload kind to `core.db` plus its side-effect shards.
pub struct CoreFlush<P> {
    core: StaticStore,
    snapshot: ShardedStore,
    log: ShardedStore,
    _payload: PhantomData<fn(P)>,
}

impl<P> CoreFlush<P> {
    pub fn new(stores: &Stores) -> Self {
        Self {
            core: stores.core.clone(),
            snapshot: stores.snapshot.clone(),
            log: stores.log.clone(),
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<P: DeferredPayload> FlushHandler<P> for CoreFlush<P> {
    async fn flush(&self, items: Vec<P>) -> EmberResult<()> {
        let mut effects = SideEffects::default();
        for item in &items {
            item.side_effects(&mut effects);
        }

        let items = dedup_latest(items, P::key);
        let rows = items.len();
        let written = self
            .core
            .session(true, move |tx| P::write_core(tx, &items))
            .await?;

        let report = effects.persist_best_effort(&self.snapshot, &self.log).await;
        tracing::debug!(
            rows,
            written,
            side_effects = report.written,
            failed_shards = report.failed.len(),
            "Core batch written"
        );
        Ok(())
    }
}

/// Appends message records to the shard of each message's timestamp.
pub struct MessageLogFlush {
    messages: ShardedStore,
}

impl MessageLogFlush {
    pub fn new(messages: ShardedStore) -> Self {
        Self { messages }
    }
}

#[async_trait]
impl FlushHandler<MessageRecord> for MessageLogFlush {
    async fn flush(&self, items: Vec<MessageRecord>) -> EmberResult<()> {
        let total = items.len();
        let report = write_sharded(
            &self.messages,
            items,
            |m: &MessageRecord| timestamp_from_unix(m.created_at),
            |tx: &Transaction<'_>, batch: &[MessageRecord]| {
                messages::bulk_insert(tx, batch).map(|_| ())
            },
        )
        .await;

        if report.written == 0 && total > 0 {
            return Err(StorageError::TransactionFailed {
                reason: format!("no message shard accepted writes: {:?}", report.failed),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// WRITER SET
// ============================================================================

/// Every deferred writer, constructed together at startup.
#[derive(Debug)]
pub struct Writers {
    pub user_create: BatchWriter<UserRecord>,
    pub user_name: BatchWriter<UserNameChange>,
    pub user_permission: BatchWriter<UserPermissionChange>,
    pub group_create: BatchWriter<GroupRecord>,
    pub group_name: BatchWriter<GroupNameChange>,
    pub group_status: BatchWriter<GroupStatusChange>,
    pub member_create: BatchWriter<MemberRecord>,
    pub member_card: BatchWriter<MemberCardChange>,
    pub member_permission: BatchWriter<MemberPermissionChange>,
    pub message_log: BatchWriter<MessageRecord>,
}

fn core_writer<P: DeferredPayload>(
    name: &str,
    stores: &Stores,
    config: BatchConfig,
) -> EmberResult<BatchWriter<P>> {
    BatchWriter::new(name, Arc::new(CoreFlush::<P>::new(stores)), config)
}

impl Writers {
    /// Spawns every worker on the current Tokio runtime. The message-log
    /// writer batches at least [`MESSAGE_LOG_BATCH_SIZE`] records.
    pub fn new(stores: &Stores, config: BatchConfig) -> EmberResult<Self> {
        let message_config =
            config.with_batch_size(config.batch_size.max(MESSAGE_LOG_BATCH_SIZE));

        Ok(Self {
            user_create: core_writer("user_create", stores, config)?,
            user_name: core_writer("user_name", stores, config)?,
            user_permission: core_writer("user_permission", stores, config)?,
            group_create: core_writer("group_create", stores, config)?,
            group_name: core_writer("group_name", stores, config)?,
            group_status: core_writer("group_status", stores, config)?,
            member_create: core_writer("member_create", stores, config)?,
            member_card: core_writer("member_card", stores, config)?,
            member_permission: core_writer("member_permission", stores, config)?,
            message_log: BatchWriter::new(
                "message_log",
                Arc::new(MessageLogFlush::new(stores.messages.clone())),
                message_config,
            )?,
        })
    }

    /// Flush and stop every writer. Creates go first so that field updates
    /// flushed afterwards find their rows.
    pub async fn shutdown_all(&self) {
        self.user_create.shutdown().await;
        self.group_create.shutdown().await;
        self.member_create.shutdown().await;
        self.user_name.shutdown().await;
        self.user_permission.shutdown().await;
        self.group_name.shutdown().await;
        self.group_status.shutdown().await;
        self.member_card.shutdown().await;
        self.member_permission.shutdown().await;
        self.message_log.shutdown().await;
        tracing::info!("All batch writers shut down");
    }

    pub fn metrics(&self) -> Vec<(String, BatchMetricsSnapshot)> {
        macro_rules! collect {
            ($($writer:ident),+ $(,)?) => {
                vec![$((self.$writer.name().to_string(), self.$writer.metrics())),+]
            };
        }
        collect!(
            user_create,
            user_name,
            user_permission,
            group_create,
            group_name,
            group_status,
            member_create,
            member_card,
            member_permission,
            message_log,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{GroupStatus, Permission};

    #[test]
    fn test_member_key_includes_user() {
        let a = MemberRecord {
            group_id: "g1".to_string(),
            user_id: "u1".to_string(),
            group_card: String::new(),
            permission: Permission::NORMAL,
            at: 1,
        };
        let b = MemberRecord {
            user_id: "u2".to_string(),
            ..a.clone()
        };
        assert_ne!(a.key(), b.key());
        assert_eq!(dedup_latest(vec![a.clone(), b, a], MemberRecord::key).len(), 2);
    }

    #[test]
    fn test_empty_names_produce_no_history() {
        let mut effects = SideEffects::default();
        UserRecord {
            user_id: "u1".to_string(),
            user_name: String::new(),
            permission: Permission::NORMAL,
            at: 1,
        }
        .side_effects(&mut effects);
        GroupRecord {
            group_id: "g1".to_string(),
            group_name: String::new(),
            status: GroupStatus::Unauthorized,
            at: 1,
        }
        .side_effects(&mut effects);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_status_audit_is_scoped_to_group() {
        let record = group_status_audit(&GroupStatusChange {
            group_id: "g1".to_string(),
            status: GroupStatus::Banned,
            operator_id: Some("op".to_string()),
            at: 7,
        });
        assert_eq!(record.context_type, AuditContext::Group);
        assert_eq!(record.context_id.as_deref(), Some("g1"));
        assert_eq!(record.category, AuditCategory::Access);
        assert_eq!(record.meta_data, Some(json!({ "status": "BANNED" })));
    }
}
