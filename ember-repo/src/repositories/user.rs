use std::collections::HashSet;
use std::sync::Arc;

use ember_core::{unix_now, EmberResult, Fingerprint, Permission, Timestamp, WritePolicy};
use ember_storage::CacheStore;

use super::Outbox;
use crate::items::UserItem;
use crate::ops::snapshots::{self, UserSnapshot};
use crate::ops::users::{self, UserNameChange, UserPermissionChange, UserRecord};
use crate::persistence::Stores;
use crate::writers::Writers;

/// Fields of a user that a call actually changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserChange {
    /// The user was not cached before; a full create record was written.
    pub created: bool,
    pub name: Option<String>,
    pub permission: Option<Permission>,
}

impl UserChange {
    /// True when nothing needs to reach disk.
    pub fn is_empty(&self) -> bool {
        !self.created && self.name.is_none() && self.permission.is_none()
    }
}

#[derive(Debug)]
pub struct UserRepository {
    cache: Arc<CacheStore<UserItem>>,
    stores: Stores,
    writers: Arc<Writers>,
    superusers: HashSet<String>,
}

impl UserRepository {
    pub fn new<I>(
        cache: Arc<CacheStore<UserItem>>,
        stores: Stores,
        writers: Arc<Writers>,
        superusers: I,
    ) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            cache,
            stores,
            writers,
            superusers: superusers.into_iter().collect(),
        }
    }

    pub fn is_superuser(&self, user_id: &str) -> bool {
        self.superusers.contains(user_id)
    }

    /// Record the latest known name and permission of a user.
    ///
    /// Configured superusers always carry [`Permission::SUPERUSER`], whatever
    /// `permission` says.
    pub async fn save_user(
        &self,
        user_id: &str,
        name: Option<&str>,
        permission: Option<Permission>,
        policy: WritePolicy,
    ) -> EmberResult<UserChange> {
        let permission = if self.is_superuser(user_id) {
            Some(Permission::SUPERUSER)
        } else {
            permission
        };

        let upserted = self.cache.upsert_with(
            user_id,
            || UserItem::new(user_id),
            |current| {
                let mut next = Arc::clone(current);
                if let Some(name) = name {
                    next = UserItem::with_name(&next, name);
                }
                if let Some(permission) = permission {
                    next = UserItem::with_permission(&next, permission);
                }
                next
            },
        );

        let change = match &upserted.old {
            None => UserChange {
                created: true,
                name: name.map(str::to_string),
                permission: permission.filter(|p| *p != Permission::NORMAL),
            },
            Some(old) => UserChange {
                created: false,
                name: name
                    .filter(|n| old.name_fp != Fingerprint::of(n))
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
                &self.writers.user_create,
                UserRecord {
                    user_id: user_id.to_string(),
                    user_name: name.unwrap_or_default().to_string(),
                    permission: upserted.new.permission,
                    at,
                },
            )?;
        } else if let Some(name) = &change.name {
            outbox.push(
                &self.writers.user_name,
                UserNameChange {
                    user_id: user_id.to_string(),
                    user_name: name.clone(),
                    at,
                },
            )?;
        }
        // A create only sets the permission of a brand new row.
        if let Some(permission) = change.permission {
            outbox.push(
                &self.writers.user_permission,
                UserPermissionChange {
                    user_id: user_id.to_string(),
                    permission,
                    operator_id: None,
                    at,
                },
            )?;
        }
        outbox.commit().await?;

        tracing::trace!(user_id, created = change.created, policy = %policy, "User saved");
        Ok(change)
    }

    /// Cached entry, loaded from `core.db` on a miss. A miss that hits disk
    /// hydrates the cache without writing anything back.
    pub async fn get_user(&self, user_id: &str) -> EmberResult<Option<Arc<UserItem>>> {
        if let Some(item) = self.cache.get(user_id) {
            return Ok(Some(item));
        }

        let id = user_id.to_string();
        let row = self
            .stores
            .core
            .session(false, move |tx| users::get(tx, &id))
            .await?;

        Ok(row.map(|row| {
            self.cache
                .upsert_with(user_id, || UserItem::from_row(&row), Arc::clone)
                .new
        }))
    }

    /// Replace the cache with every stored user.
    pub async fn warm_up(&self) -> EmberResult<usize> {
        let rows = self.stores.core.session(false, |tx| users::all(tx)).await?;
        self.cache.clear();
        Ok(self
            .cache
            .set_batch(rows.iter().map(|row| (row.user_id.clone(), UserItem::from_row(row)))))
    }

    /// Cache-only flag. Returns whether the value changed.
    pub fn set_self_ignore(&self, user_id: &str, is_self_ignore: bool) -> bool {
        self.cache
            .upsert_with(
                user_id,
                || UserItem::new(user_id),
                |current| UserItem::with_self_ignore(current, is_self_ignore),
            )
            .changed
    }

    /// Global name history of a user between `start` and `end`, oldest first.
    pub async fn name_history(
        &self,
        user_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> EmberResult<Vec<UserSnapshot>> {
        let id = user_id.to_string();
        let per_shard = self
            .stores
            .snapshot
            .map_reduce(start, end, move |tx| {
                snapshots::user_history(tx, &id, ember_core::GLOBAL_SCOPE)
            })
            .await?;

        let (start, end) = (start.timestamp(), end.timestamp());
        Ok(per_shard
            .into_iter()
            .flat_map(|(_, rows)| rows)
            .filter(|snap| (start..=end).contains(&snap.created_at))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::test_support::Harness;

    fn user_repo(h: &Harness, superusers: &[&str]) -> UserRepository {
        UserRepository::new(
            Arc::clone(&h.caches.users),
            h.stores.clone(),
            Arc::clone(&h.writers),
            superusers.iter().map(|s| s.to_string()),
        )
    }

    #[tokio::test]
    async fn test_unchanged_name_produces_no_payload() {
        let h = Harness::new().await;
        let repo = user_repo(&h, &[]);

        let first = repo
            .save_user("u1", Some("A"), None, WritePolicy::Deferred)
            .await
            .unwrap();
        assert!(first.created);

        let second = repo
            .save_user("u1", Some("A"), None, WritePolicy::Deferred)
            .await
            .unwrap();
        assert!(second.is_empty());

        let third = repo
            .save_user("u1", Some("B"), None, WritePolicy::Deferred)
            .await
            .unwrap();
        assert_eq!(third.name.as_deref(), Some("B"));
        assert!(!third.created);

        assert_eq!(h.writers.user_create.metrics().items_enqueued, 1);
        assert_eq!(h.writers.user_name.metrics().items_enqueued, 1);
    }

    #[tokio::test]
    async fn test_unchanged_save_keeps_entry_identity() {
        let h = Harness::new().await;
        let repo = user_repo(&h, &[]);
        repo
            .save_user("u1", Some("A"), Some(Permission::NORMAL), WritePolicy::Deferred)
            .await
            .unwrap();
        let before = h.caches.users.get("u1").unwrap();
        repo
            .save_user("u1", Some("A"), Some(Permission::NORMAL), WritePolicy::Deferred)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&before, &h.caches.users.get("u1").unwrap()));
    }

    #[tokio::test]
    async fn test_superuser_is_forced() {
        let h = Harness::new().await;
        let repo = user_repo(&h, &["root"]);
        let change = repo
            .save_user("root", Some("admin"), Some(Permission::NORMAL), WritePolicy::Immediate)
            .await
            .unwrap();
        assert_eq!(change.permission, Some(Permission::SUPERUSER));

        let row = h
            .stores
            .core
            .session(false, |tx| users::get(tx, "root"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.permission, Permission::SUPERUSER);
    }

    #[tokio::test]
    async fn test_immediate_rename_writes_row_and_history() {
        let h = Harness::new().await;
        let repo = user_repo(&h, &[]);
        repo
            .save_user("u1", Some("Alice"), None, WritePolicy::Immediate)
            .await
            .unwrap();
        repo
            .save_user("u1", Some("Alicia"), None, WritePolicy::Immediate)
            .await
            .unwrap();

        let row = h
            .stores
            .core
            .session(false, |tx| users::get(tx, "u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.user_name, "Alicia");

        let now = chrono::Utc::now();
        let history = repo
            .name_history("u1", now - chrono::Duration::days(1), now + chrono::Duration::days(1))
            .await
            .unwrap();
        let names: Vec<_> = history.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Alicia"]);
    }

    #[tokio::test]
    async fn test_get_user_reads_through_without_writing() {
        let h = Harness::new().await;
        h.stores
            .core
            .session(true, |tx| {
                users::bulk_upsert(
                    tx,
                    &[UserRecord {
                        user_id: "u9".to_string(),
                        user_name: "Stored".to_string(),
                        permission: Permission::GROUP_ADMIN,
                        at: 1,
                    }],
                )
            })
            .await
            .unwrap();

        let repo = user_repo(&h, &[]);
        assert!(repo.get_user("missing").await.unwrap().is_none());
        let item = repo.get_user("u9").await.unwrap().unwrap();
        assert_eq!(item.name_fp, Fingerprint::of("Stored"));
        assert_eq!(item.permission, Permission::GROUP_ADMIN);
        assert!(h.caches.users.exists("u9"));
        assert_eq!(h.writers.user_create.metrics().items_enqueued, 0);
    }

    #[tokio::test]
    async fn test_warm_up_and_self_ignore() {
        let h = Harness::new().await;
        let repo = user_repo(&h, &[]);
        repo
            .save_user("u1", Some("A"), None, WritePolicy::Immediate)
            .await
            .unwrap();
        h.caches.users.clear();

        assert_eq!(repo.warm_up().await.unwrap(), 1);
        assert!(repo.set_self_ignore("u1", true));
        assert!(!repo.set_self_ignore("u1", true));
        assert!(h.caches.users.get("u1").unwrap().is_self_ignore);
    }
}
