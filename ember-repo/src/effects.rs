//! Side-effect rows that accompany core writes: name/card history in the
//! snapshot shards and the audit trail in the log shards.
//!
//! Each row is routed to the shard of its own `created_at`.

use std::collections::BTreeMap;

use ember_core::{timestamp_from_unix, EmberResult};
use ember_storage::{write_sharded, ShardWriteReport, ShardedStore};
use rusqlite::{Connection, Transaction};

use crate::ops::audit::{self, AuditRecord};
use crate::ops::snapshots::{self, GroupSnapshot, UserSnapshot};

#[derive(Debug, Clone, PartialEq)]
enum SnapshotRow {
    User(UserSnapshot),
    Group(GroupSnapshot),
}

impl SnapshotRow {
    fn created_at(&self) -> i64 {
        match self {
            SnapshotRow::User(snap) => snap.created_at,
            SnapshotRow::Group(snap) => snap.created_at,
        }
    }
}

fn write_snapshots(conn: &Connection, rows: &[SnapshotRow]) -> EmberResult<()> {
    let mut users = Vec::new();
    let mut groups = Vec::new();
    for row in rows {
        match row {
            SnapshotRow::User(snap) => users.push(snap.clone()),
            SnapshotRow::Group(snap) => groups.push(snap.clone()),
        }
    }
    snapshots::bulk_insert_user(conn, &users)?;
    snapshots::bulk_insert_group(conn, &groups)?;
    Ok(())
}

fn write_audits(conn: &Connection, rows: &[AuditRecord]) -> EmberResult<()> {
    audit::bulk_insert(conn, rows).map(|_| ())
}

/// Snapshot and audit rows collected while building a core write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SideEffects {
    snapshots: Vec<SnapshotRow>,
    audits: Vec<AuditRecord>,
}

impl SideEffects {
    pub fn user_snapshot(&mut self, snapshot: UserSnapshot) {
        self.snapshots.push(SnapshotRow::User(snapshot));
    }

    pub fn group_snapshot(&mut self, snapshot: GroupSnapshot) {
        self.snapshots.push(SnapshotRow::Group(snapshot));
    }

    pub fn audit(&mut self, record: AuditRecord) {
        self.audits.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.audits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len() + self.audits.len()
    }

    /// Write every row, one unit of work per shard, stopping at the first
    /// failure. Used by the immediate policy.
    pub async fn persist(self, snapshot: &ShardedStore, log: &ShardedStore) -> EmberResult<()> {
        write_grouped(snapshot, self.snapshots, SnapshotRow::created_at, write_snapshots).await?;
        write_grouped(log, self.audits, |r: &AuditRecord| r.created_at, write_audits).await
    }

    /// Write every row, isolating failures per shard. Used by flush handlers.
    pub async fn persist_best_effort(
        self,
        snapshot: &ShardedStore,
        log: &ShardedStore,
    ) -> ShardWriteReport {
        let mut report = ShardWriteReport::default();
        for part in [
            write_sharded(
                snapshot,
                self.snapshots,
                |row: &SnapshotRow| timestamp_from_unix(row.created_at()),
                |tx: &Transaction<'_>, rows: &[SnapshotRow]| write_snapshots(tx, rows),
            )
            .await,
            write_sharded(
                log,
                self.audits,
                |record: &AuditRecord| timestamp_from_unix(record.created_at),
                |tx: &Transaction<'_>, rows: &[AuditRecord]| write_audits(tx, rows),
            )
            .await,
        ] {
            report.written += part.written;
            report.failed.extend(part.failed);
        }
        report
    }
}

async fn write_grouped<T, K>(
    store: &ShardedStore,
    rows: Vec<T>,
    created_at: K,
    write: fn(&Connection, &[T]) -> EmberResult<()>,
) -> EmberResult<()>
where
    T: Send + 'static,
    K: Fn(&T) -> i64,
{
    let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for row in rows {
        let key = store.shard_key(timestamp_from_unix(created_at(&row)));
        groups.entry(key).or_default().push(row);
    }
    for (key, group) in groups {
        store
            .session_for_key(&key, true, move |tx| write(tx, &group))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{AuditAction, AuditCategory, AuditContext};

    #[test]
    fn test_collects_rows() {
        let mut effects = SideEffects::default();
        assert!(effects.is_empty());
        effects.user_snapshot(UserSnapshot::name("u1", "Alice", 1));
        effects.group_snapshot(GroupSnapshot::name("g1", "Rust", 1));
        effects.audit(AuditRecord::new(
            AuditContext::User,
            AuditCategory::Permission,
            AuditAction::Change,
            1,
        ));
        assert_eq!(effects.len(), 3);
        assert!(!effects.is_empty());
    }
}
