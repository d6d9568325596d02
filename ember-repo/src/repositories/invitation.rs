//! Group invitations. Not cached; every call goes straight to `core.db`.

use ember_core::{
    unix_now, AuditAction, AuditCategory, AuditContext, EmberResult, InvitationStatus, WritePolicy,
};
use serde_json::json;

use super::Outbox;
use crate::ops::audit::AuditRecord;
use crate::ops::invitations::{self, InvitationRow};
use crate::persistence::Stores;

#[derive(Debug, Clone)]
pub struct InvitationRepository {
    stores: Stores,
}

impl InvitationRepository {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Open an invitation for `group_id`, resetting any earlier one back to
    /// pending. `message_id` is the notification that announced it.
    pub async fn create_invitation(
        &self,
        group_id: &str,
        inviter_id: &str,
        flag: &str,
        message_id: Option<&str>,
    ) -> EmberResult<InvitationRow> {
        let (group, inviter, flag, message) = (
            group_id.to_string(),
            inviter_id.to_string(),
            flag.to_string(),
            message_id.map(str::to_string),
        );
        let at = unix_now();
        let row = self
            .stores
            .core
            .session(true, move |tx| {
                invitations::create(tx, &group, &inviter, &flag, message.as_deref(), at)
            })
            .await?;

        tracing::info!(invitation_id = row.id, group_id, inviter_id, "Invitation created");
        Ok(row)
    }

    /// Link another notification message to an invitation.
    pub async fn add_message_record(&self, invitation_id: i64, message_id: &str) -> EmberResult<i64> {
        let message = message_id.to_string();
        let at = unix_now();
        self.stores
            .core
            .session(true, move |tx| {
                invitations::add_message_record(tx, invitation_id, &message, at)
            })
            .await
    }

    /// Record a review decision. Returns `None` for an unknown invitation.
    pub async fn update_status(
        &self,
        invitation_id: i64,
        status: InvitationStatus,
        operator_id: Option<&str>,
    ) -> EmberResult<Option<InvitationRow>> {
        let at = unix_now();
        let Some(row) = self
            .stores
            .core
            .session(true, move |tx| invitations::update_status(tx, invitation_id, status, at))
            .await?
        else {
            return Ok(None);
        };

        let action = match status {
            InvitationStatus::Approved => AuditAction::Approve,
            InvitationStatus::Rejected => AuditAction::Reject,
            InvitationStatus::Pending | InvitationStatus::Ignored => AuditAction::Update,
        };
        let mut outbox = Outbox::new(WritePolicy::Immediate, &self.stores);
        outbox.audit(
            AuditRecord::new(AuditContext::Group, AuditCategory::Access, action, at)
                .target(row.inviter_id.clone())
                .context(row.group_id.clone())
                .operator(operator_id.map(str::to_string))
                .meta(json!({ "invitation_id": row.id, "status": status.as_db_str() })),
        );
        outbox.commit().await?;

        tracing::info!(invitation_id, status = %status, "Invitation reviewed");
        Ok(Some(row))
    }

    pub async fn get_by_flag(&self, flag: &str) -> EmberResult<Option<InvitationRow>> {
        let flag = flag.to_string();
        self.stores
            .core
            .session(false, move |tx| invitations::get_by_flag(tx, &flag))
            .await
    }

    pub async fn get_by_message_id(&self, message_id: &str) -> EmberResult<Option<InvitationRow>> {
        let message = message_id.to_string();
        self.stores
            .core
            .session(false, move |tx| invitations::get_by_message_id(tx, &message))
            .await
    }

    /// Pending invitations, optionally for one group.
    pub async fn pending(&self, group_id: Option<&str>) -> EmberResult<Vec<InvitationRow>> {
        let group = group_id.map(str::to_string);
        self.stores
            .core
            .session(false, move |tx| invitations::pending(tx, group.as_deref()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::audit;
    use crate::repositories::test_support::Harness;

    #[tokio::test]
    async fn test_invitation_lifecycle() {
        let h = Harness::new().await;
        let repo = InvitationRepository::new(h.stores.clone());

        let created = repo
            .create_invitation("g1", "u1", "flag-1", Some("m1"))
            .await
            .unwrap();
        assert_eq!(created.status, InvitationStatus::Pending);
        repo.add_message_record(created.id, "m2").await.unwrap();

        assert_eq!(
            repo.get_by_message_id("m2").await.unwrap().map(|r| r.id),
            Some(created.id)
        );
        assert_eq!(
            repo.get_by_flag("flag-1").await.unwrap().map(|r| r.id),
            Some(created.id)
        );
        assert_eq!(repo.pending(Some("g1")).await.unwrap().len(), 1);

        let approved = repo
            .update_status(created.id, InvitationStatus::Approved, Some("admin"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(approved.status, InvitationStatus::Approved);
        assert!(repo.pending(None).await.unwrap().is_empty());

        let trail = h
            .stores
            .log
            .session(None, false, |tx| audit::by_target(tx, "u1"))
            .await
            .unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, AuditAction::Approve);
        assert_eq!(trail[0].context_id.as_deref(), Some("g1"));
    }

    #[tokio::test]
    async fn test_unknown_invitation() {
        let h = Harness::new().await;
        let repo = InvitationRepository::new(h.stores.clone());
        assert!(repo
            .update_status(404, InvitationStatus::Rejected, None)
            .await
            .unwrap()
            .is_none());
        assert!(repo.get_by_flag("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recreate_resets_to_pending() {
        let h = Harness::new().await;
        let repo = InvitationRepository::new(h.stores.clone());
        let first = repo.create_invitation("g1", "u1", "f1", None).await.unwrap();
        repo.update_status(first.id, InvitationStatus::Rejected, None)
            .await
            .unwrap();

        let again = repo.create_invitation("g1", "u2", "f2", None).await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.status, InvitationStatus::Pending);
        assert_eq!(again.inviter_id, "u2");
    }
}
