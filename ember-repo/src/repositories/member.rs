use std::sync::Arc;

use ember_core::{unix_now, EmberResult, Fingerprint, Permission, WritePolicy};
use ember_storage::CacheStore;

use super::Outbox;
use crate::items::{member_key, MemberItem};
use crate::ops::members::{self, MemberCardChange, MemberPermissionChange, MemberRecord};
use crate::persistence::Stores;
use crate::writers::Writers;

/// Fields of a membership that a call actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberChange {
    pub created: bool,
    pub card: Option<String>,
    pub permission: Option<Permission>,
}

impl MemberChange {
    pub fn is_empty(&self) -> bool {
        !self.created && self.card.is_none() && self.permission.is_none()
    }
}

#[derive(Debug)]
pub struct MemberRepository {
    cache: Arc<CacheStore<MemberItem>>,
    stores: Stores,
    writers: Arc<Writers>,
}

impl MemberRepository {
    pub fn new(cache: Arc<CacheStore<MemberItem>>, stores: Stores, writers: Arc<Writers>) -> Self {
        Self {
            cache,
            stores,
            writers,
        }
    }

    /// Record the latest known card and permission of a user in a group.
    /// A new membership also creates the user and group rows if missing.
    pub async fn save_member(
        &self,
        group_id: &str,
        user_id: &str,
        card: Option<&str>,
        permission: Option<Permission>,
        operator_id: Option<&str>,
        policy: WritePolicy,
    ) -> EmberResult<MemberChange> {
        let key = member_key(group_id, user_id);
        let upserted = self.cache.upsert_with(&key, MemberItem::default, |current| {
            let mut next = Arc::clone(current);
            if let Some(card) = card {
                next = MemberItem::with_card(&next, card);
            }
            if let Some(permission) = permission {
                next = MemberItem::with_permission(&next, permission);
            }
            next
        });

        let change = match &upserted.old {
            None => MemberChange {
                created: true,
                card: card.map(str::to_string),
                permission: permission.filter(|p| *p != Permission::NORMAL),
            },
            Some(old) => MemberChange {
                created: false,
                card: card
                    .filter(|c| old.card_fp != Fingerprint::of(c))
                    .map(str::to_string),
                permission: permission.filter(|p| old.permission != *p),
            },
        };
        if change.is_empty() {
            return Ok(change);
        }

        let at = unix_now();
        let mut outbox = Outbox::new(policy, &self.stores);
        if change.created {
            outbox.push(
                &self.writers.member_create,
                MemberRecord {
                    group_id: group_id.to_string(),
                    user_id: user_id.to_string(),
                    group_card: card.unwrap_or_default().to_string(),
                    permission: upserted.new.permission,
                    at,
                },
            )?;
        } else if let Some(card) = &change.card {
            outbox.push(
                &self.writers.member_card,
                MemberCardChange {
                    group_id: group_id.to_string(),
                    user_id: user_id.to_string(),
                    group_card: card.clone(),
                    at,
                },
            )?;
        }
        if let Some(permission) = change.permission {
            outbox.push(
                &self.writers.member_permission,
                MemberPermissionChange {
                    group_id: group_id.to_string(),
                    user_id: user_id.to_string(),
                    permission,
                    operator_id: operator_id.map(str::to_string),
                    at,
                },
            )?;
        }
        outbox.commit().await?;

        tracing::trace!(group_id, user_id, created = change.created, policy = %policy, "Member saved");
        Ok(change)
    }

    pub async fn get_member(
        &self,
        group_id: &str,
        user_id: &str,
    ) -> EmberResult<Option<Arc<MemberItem>>> {
        let key = member_key(group_id, user_id);
        if let Some(item) = self.cache.get(&key) {
            return Ok(Some(item));
        }

        let (group, user) = (group_id.to_string(), user_id.to_string());
        let row = self
            .stores
            .core
            .session(false, move |tx| members::get(tx, &group, &user))
            .await?;

        Ok(row.map(|row| {
            self.cache
                .upsert_with(&key, || MemberItem::from_row(&row), Arc::clone)
                .new
        }))
    }

    pub async fn warm_up(&self) -> EmberResult<usize> {
        let rows = self.stores.core.session(false, |tx| members::all(tx)).await?;
        self.cache.clear();
        Ok(self.cache.set_batch(
            rows.iter()
                .map(|row| (member_key(&row.group_id, &row.user_id), MemberItem::from_row(row))),
        ))
    }
}
