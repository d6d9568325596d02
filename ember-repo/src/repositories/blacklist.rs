//! Bans are rare and must hold across restarts, so every change is written
//! immediately.

use std::sync::Arc;

use chrono::{Duration, Utc};
use ember_core::{
    unix_now, AuditAction, AuditCategory, AuditContext, EmberResult, WritePolicy, GLOBAL_SCOPE,
};
use ember_storage::CacheStore;
use serde_json::json;

use super::Outbox;
use crate::items::{ban_key, BanItem};
use crate::ops::audit::AuditRecord;
use crate::ops::blacklist;
use crate::persistence::Stores;

#[derive(Debug)]
pub struct BlacklistRepository {
    cache: Arc<CacheStore<BanItem>>,
    stores: Stores,
}

fn ban_audit(scope: &str, target: &str, action: AuditAction, at: i64) -> AuditRecord {
    let record = if scope == GLOBAL_SCOPE {
        AuditRecord::new(AuditContext::Global, AuditCategory::Access, action, at)
    } else {
        AuditRecord::new(AuditContext::Group, AuditCategory::Access, action, at).context(scope)
    };
    record.target(target)
}

impl BlacklistRepository {
    pub fn new(cache: Arc<CacheStore<BanItem>>, stores: Stores) -> Self {
        Self { cache, stores }
    }

    /// Ban `target` in `scope` (a group id or [`GLOBAL_SCOPE`]). `None`
    /// duration is permanent. Banning again refreshes expiry and reason.
    pub async fn add_ban(
        &self,
        target: &str,
        scope: &str,
        operator_id: &str,
        duration: Option<Duration>,
        reason: Option<&str>,
    ) -> EmberResult<BanItem> {
        let now = Utc::now();
        let item = BanItem {
            expiry: duration.and_then(|d| now.checked_add_signed(d)),
        };
        self.cache.set(ban_key(scope, target), item.clone());

        let at = now.timestamp();
        let expiry = item.expiry.map(|e| e.timestamp());
        let (t, s, op, why) = (
            target.to_string(),
            scope.to_string(),
            operator_id.to_string(),
            reason.map(str::to_string),
        );

        let mut outbox = Outbox::new(WritePolicy::Immediate, &self.stores);
        outbox.core(move |conn| blacklist::add_ban(conn, &t, &s, &op, expiry, why.as_deref(), at));
        let mut audit = ban_audit(scope, target, AuditAction::Ban, at)
            .operator(Some(operator_id.to_string()))
            .meta(json!({ "expiry": expiry }));
        if let Some(reason) = reason {
            audit = audit.summary(reason);
        }
        outbox.audit(audit);
        outbox.commit().await?;

        tracing::info!(target_user = target, scope, permanent = expiry.is_none(), "User banned");
        Ok(item)
    }

    /// Lift a ban. Returns whether a ban was stored.
    pub async fn unban(&self, target: &str, scope: &str, operator_id: &str) -> EmberResult<bool> {
        self.cache.delete(&ban_key(scope, target));

        let (t, s) = (target.to_string(), scope.to_string());
        let removed = self
            .stores
            .core
            .session(true, move |tx| blacklist::unban(tx, &t, &s))
            .await?;
        if removed == 0 {
            return Ok(false);
        }

        let mut outbox = Outbox::new(WritePolicy::Immediate, &self.stores);
        outbox.audit(
            ban_audit(scope, target, AuditAction::Unban, unix_now())
                .operator(Some(operator_id.to_string())),
        );
        outbox.commit().await?;

        tracing::info!(target_user = target, scope, "User unbanned");
        Ok(true)
    }

    /// Ban of `target` in exactly `scope`, loaded from disk on a cache miss.
    pub async fn get_ban(&self, target: &str, scope: &str) -> EmberResult<Option<BanItem>> {
        let key = ban_key(scope, target);
        if let Some(item) = self.cache.get(&key) {
            return Ok(Some((*item).clone()));
        }

        let (t, s) = (target.to_string(), scope.to_string());
        let row = self
            .stores
            .core
            .session(false, move |tx| blacklist::get(tx, &t, &s))
            .await?;

        Ok(row.map(|row| {
            let item = BanItem::from_row(&row);
            self.cache.upsert_with(&key, || item.clone(), Arc::clone);
            item
        }))
    }

    /// Whether `target` is banned in `group_id` or globally right now.
    ///
    /// Answers from the cache, which holds every ban after [`Self::warm_up`].
    pub fn is_banned(&self, target: &str, group_id: &str) -> bool {
        let now = Utc::now();
        [group_id, GLOBAL_SCOPE].into_iter().any(|scope| {
            self.cache
                .get(&ban_key(scope, target))
                .is_some_and(|ban| ban.is_active_at(now))
        })
    }

    pub async fn warm_up(&self) -> EmberResult<usize> {
        let rows = self.stores.core.session(false, |tx| blacklist::all(tx)).await?;
        self.cache.clear();
        Ok(self.cache.set_batch(
            rows.iter()
                .map(|row| (ban_key(&row.group_id, &row.target_user_id), BanItem::from_row(row))),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::audit;
    use crate::repositories::test_support::Harness;

    #[tokio::test]
    async fn test_global_ban_covers_every_group() {
        let h = Harness::new().await;
        let repo = BlacklistRepository::new(Arc::clone(&h.caches.bans), h.stores.clone());

        repo.add_ban("u1", GLOBAL_SCOPE, "op", None, Some("spam"))
            .await
            .unwrap();
        assert!(repo.is_banned("u1", "g1"));
        assert!(repo.is_banned("u1", "g2"));
        assert!(!repo.is_banned("u2", "g1"));

        let trail = h
            .stores
            .log
            .session(None, false, |tx| audit::by_target(tx, "u1"))
            .await
            .unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].context_type, AuditContext::Global);
        assert_eq!(trail[0].action, AuditAction::Ban);
        assert_eq!(trail[0].summary.as_deref(), Some("spam"));
    }

    #[tokio::test]
    async fn test_group_ban_expires() {
        let h = Harness::new().await;
        let repo = BlacklistRepository::new(Arc::clone(&h.caches.bans), h.stores.clone());

        repo.add_ban("u1", "g1", "op", Some(Duration::seconds(-1)), None)
            .await
            .unwrap();
        assert!(!repo.is_banned("u1", "g1"));

        repo.add_ban("u1", "g1", "op", Some(Duration::hours(1)), None)
            .await
            .unwrap();
        assert!(repo.is_banned("u1", "g1"));
        assert!(!repo.is_banned("u1", "g2"));
    }

    #[tokio::test]
    async fn test_unban_and_reload() {
        let h = Harness::new().await;
        let repo = BlacklistRepository::new(Arc::clone(&h.caches.bans), h.stores.clone());
        repo.add_ban("u1", "g1", "op", None, None).await.unwrap();
        repo.add_ban("u2", "g1", "op", None, None).await.unwrap();

        assert!(repo.unban("u1", "g1", "op").await.unwrap());
        assert!(!repo.unban("u1", "g1", "op").await.unwrap());
        assert!(!repo.is_banned("u1", "g1"));

        h.caches.bans.clear();
        assert!(repo.get_ban("u2", "g1").await.unwrap().is_some());
        assert!(repo.get_ban("u1", "g1").await.unwrap().is_none());
        assert_eq!(repo.warm_up().await.unwrap(), 1);
        assert!(repo.is_banned("u2", "g1"));
    }
}
