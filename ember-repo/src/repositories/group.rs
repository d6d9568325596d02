use std::sync::Arc;

use ember_core::{
    unix_now, AuditAction, AuditCategory, AuditContext, EmberResult, Fingerprint, GroupStatus,
    Timestamp, WritePolicy,
};
use ember_storage::CacheStore;
use serde_json::json;

use super::Outbox;
use crate::items::GroupItem;
use crate::ops::audit::AuditRecord;
use crate::ops::groups::{self, GroupNameChange, GroupRecord, GroupStatusChange};
use crate::ops::plugins;
use crate::ops::snapshots::{self, GroupSnapshot};
use crate::persistence::Stores;
use crate::writers::Writers;

/// Fields of a group that a call actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupChange {
    pub created: bool,
    pub name: Option<String>,
    pub status: Option<GroupStatus>,
    /// Cache-only; never persisted.
    pub is_all_shut: Option<bool>,
}

impl GroupChange {
    pub fn is_empty(&self) -> bool {
        !self.created && self.name.is_none() && self.status.is_none() && self.is_all_shut.is_none()
    }

    fn needs_write(&self) -> bool {
        self.created || self.name.is_some() || self.status.is_some()
    }
}

#[derive(Debug)]
pub struct GroupRepository {
    cache: Arc<CacheStore<GroupItem>>,
    stores: Stores,
    writers: Arc<Writers>,
}

impl GroupRepository {
    pub fn new(cache: Arc<CacheStore<GroupItem>>, stores: Stores, writers: Arc<Writers>) -> Self {
        Self {
            cache,
            stores,
            writers,
        }
    }

    /// Record the latest known name, status and mute flag of a group.
    ///
    /// `operator_id` is attached to the status audit record.
    pub async fn save_group(
        &self,
        group_id: &str,
        name: Option<&str>,
        status: Option<GroupStatus>,
        is_all_shut: Option<bool>,
        operator_id: Option<&str>,
        policy: WritePolicy,
    ) -> EmberResult<GroupChange> {
        let upserted = self.cache.upsert_with(
            group_id,
            || GroupItem::new(group_id),
            |current| {
                let mut next = Arc::clone(current);
                if let Some(name) = name {
                    next = GroupItem::with_name(&next, name);
                }
                if let Some(status) = status {
                    next = GroupItem::with_status(&next, status);
                }
                if let Some(flag) = is_all_shut {
                    next = GroupItem::with_all_shut(&next, flag);
                }
                next
            },
        );

        let change = match &upserted.old {
            None => GroupChange {
                created: true,
                name: name.map(str::to_string),
                status: status.filter(|s| *s != GroupStatus::default()),
                is_all_shut: is_all_shut.filter(|flag| *flag),
            },
            Some(old) => GroupChange {
                created: false,
                name: name
                    .filter(|n| old.name_fp != Fingerprint::of(n))
                    .map(str::to_string),
                status: status.filter(|s| old.status != *s),
                is_all_shut: is_all_shut.filter(|flag| old.is_all_shut != *flag),
            },
        };
        if !change.needs_write() {
            return Ok(change);
        }

        let at = unix_now();
        let mut outbox = Outbox::new(policy, &self.stores);
        if change.created {
            outbox.push(
                &self.writers.group_create,
                GroupRecord {
                    group_id: group_id.to_string(),
                    group_name: name.unwrap_or_default().to_string(),
                    status: upserted.new.status,
                    at,
                },
            )?;
        } else if let Some(name) = &change.name {
            outbox.push(
                &self.writers.group_name,
                GroupNameChange {
                    group_id: group_id.to_string(),
                    group_name: name.clone(),
                    at,
                },
            )?;
        }
        if let Some(status) = change.status {
            outbox.push(
                &self.writers.group_status,
                GroupStatusChange {
                    group_id: group_id.to_string(),
                    status,
                    operator_id: operator_id.map(str::to_string),
                    at,
                },
            )?;
        }
        outbox.commit().await?;

        tracing::trace!(group_id, created = change.created, policy = %policy, "Group saved");
        Ok(change)
    }

    /// Immediate status change with audit.
    pub async fn update_status(
        &self,
        group_id: &str,
        status: GroupStatus,
        operator_id: Option<&str>,
    ) -> EmberResult<GroupChange> {
        self.save_group(group_id, None, Some(status), None, operator_id, WritePolicy::Immediate)
            .await
    }

    /// Immediate rename with history.
    pub async fn update_name(&self, group_id: &str, name: &str) -> EmberResult<GroupChange> {
        self.save_group(group_id, Some(name), None, None, None, WritePolicy::Immediate)
            .await
    }

    /// Toggle a plugin for a group. The setting and its audit record are
    /// written immediately; returns whether anything changed.
    pub async fn set_plugin_enabled(
        &self,
        group_id: &str,
        plugin: &str,
        enabled: bool,
        operator_id: Option<&str>,
    ) -> EmberResult<bool> {
        let upserted = self.cache.upsert_with(
            group_id,
            || GroupItem::new(group_id),
            |current| GroupItem::with_plugin_enabled(current, plugin, enabled),
        );
        if !upserted.changed {
            return Ok(false);
        }

        let at = unix_now();
        let mut outbox = Outbox::new(WritePolicy::Immediate, &self.stores);
        if upserted.is_new() {
            outbox.push(
                &self.writers.group_create,
                GroupRecord {
                    group_id: group_id.to_string(),
                    group_name: String::new(),
                    status: upserted.new.status,
                    at,
                },
            )?;
        }

        let (group, name, operator) = (
            group_id.to_string(),
            plugin.to_string(),
            operator_id.map(str::to_string),
        );
        outbox.core(move |conn| {
            plugins::set_enabled(conn, &group, &name, enabled, operator.as_deref(), at)
        });

        let action = if enabled {
            AuditAction::Enable
        } else {
            AuditAction::Disable
        };
        outbox.audit(
            AuditRecord::new(AuditContext::Group, AuditCategory::Plugin, action, at)
                .target(plugin)
                .context(group_id)
                .operator(operator_id.map(str::to_string))
                .meta(json!({ "plugin": plugin, "enabled": enabled })),
        );
        outbox.commit().await?;

        tracing::info!(group_id, plugin, enabled, "Plugin toggled");
        Ok(true)
    }

    /// Cache-only check. Unknown groups have every plugin enabled.
    pub fn is_plugin_enabled(&self, group_id: &str, plugin: &str) -> bool {
        self.cache
            .get(group_id)
            .map_or(true, |group| group.is_plugin_enabled(plugin))
    }

    /// Cached entry, loaded from `core.db` on a miss.
    pub async fn get_group(&self, group_id: &str) -> EmberResult<Option<Arc<GroupItem>>> {
        if let Some(item) = self.cache.get(group_id) {
            return Ok(Some(item));
        }

        let id = group_id.to_string();
        let found = self
            .stores
            .core
            .session(false, move |tx| {
                let Some(row) = groups::get(tx, &id)? else {
                    return Ok(None);
                };
                let disabled = plugins::disabled_by_group(tx)?
                    .remove(&row.group_id)
                    .unwrap_or_default();
                Ok(Some(GroupItem::from_row(&row, disabled)))
            })
            .await?;

        Ok(found.map(|item| self.cache.upsert_with(group_id, || item, Arc::clone).new))
    }

    /// Replace the cache with every stored group and its disabled plugins.
    pub async fn warm_up(&self) -> EmberResult<usize> {
        let (rows, mut disabled) = self
            .stores
            .core
            .session(false, |tx| {
                Ok((groups::all(tx)?, plugins::disabled_by_group(tx)?))
            })
            .await?;

        self.cache.clear();
        Ok(self.cache.set_batch(rows.iter().map(|row| {
            let plugins = disabled.remove(&row.group_id).unwrap_or_default();
            (row.group_id.clone(), GroupItem::from_row(row, plugins))
        })))
    }

    /// Name history of a group between `start` and `end`, oldest first.
    pub async fn name_history(
        &self,
        group_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> EmberResult<Vec<GroupSnapshot>> {
        let id = group_id.to_string();
        let per_shard = self
            .stores
            .snapshot
            .map_reduce(start, end, move |tx| snapshots::group_history(tx, &id))
            .await?;

        let (start, end) = (start.timestamp(), end.timestamp());
        Ok(per_shard
            .into_iter()
            .flat_map(|(_, rows)| rows)
            .filter(|snap| (start..=end).contains(&snap.created_at))
            .collect())
    }
}
