//! Cache entries for each entity kind.
//!
//! Entries are immutable. The `with_*` constructors take the current entry
//! and return it unchanged (the same `Arc`) when the requested value is
//! already in place, or a fresh copy carrying the new value. That identity
//! is what [`ember_storage::CacheStore::upsert_with`] uses to decide whether
//! anything changed.

use std::collections::BTreeSet;
use std::sync::Arc;

use ember_core::{Fingerprint, GroupStatus, Permission, Timestamp};

use crate::ops::blacklist::BanRow;
use crate::ops::groups::GroupRow;
use crate::ops::members::MemberRow;
use crate::ops::users::UserRow;

/// Cache key for a membership.
pub fn member_key(group_id: &str, user_id: &str) -> String {
    format!("MEMBER:{group_id}:{user_id}")
}

/// Cache key for a ban in `scope` (a group id or the global scope).
pub fn ban_key(scope: &str, user_id: &str) -> String {
    format!("BAN:{scope}:{user_id}")
}

// ============================================================================
// USER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserItem {
    pub user_id: String,
    pub name_fp: Fingerprint,
    pub permission: Permission,
    pub is_self_ignore: bool,
}

impl UserItem {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            name_fp: Fingerprint::EMPTY,
            permission: Permission::NORMAL,
            is_self_ignore: false,
        }
    }

    pub fn from_row(row: &UserRow) -> Self {
        Self {
            user_id: row.user_id.clone(),
            name_fp: Fingerprint::of(&row.user_name),
            permission: row.permission,
            is_self_ignore: row.is_self_ignore,
        }
    }

    pub fn with_name(current: &Arc<Self>, name: &str) -> Arc<Self> {
        let name_fp = Fingerprint::of(name);
        if current.name_fp == name_fp {
            return Arc::clone(current);
        }
        Arc::new(Self {
            name_fp,
            ..(**current).clone()
        })
    }

    pub fn with_permission(current: &Arc<Self>, permission: Permission) -> Arc<Self> {
        if current.permission == permission {
            return Arc::clone(current);
        }
        Arc::new(Self {
            permission,
            ..(**current).clone()
        })
    }

    pub fn with_self_ignore(current: &Arc<Self>, is_self_ignore: bool) -> Arc<Self> {
        if current.is_self_ignore == is_self_ignore {
            return Arc::clone(current);
        }
        Arc::new(Self {
            is_self_ignore,
            ..(**current).clone()
        })
    }
}

// ============================================================================
// GROUP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupItem {
    pub group_id: String,
    pub name_fp: Fingerprint,
    pub status: GroupStatus,
    pub is_all_shut: bool,
    /// Shared between copies until membership changes.
    pub disabled_plugins: Arc<BTreeSet<String>>,
}

impl GroupItem {
    pub fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            name_fp: Fingerprint::EMPTY,
            status: GroupStatus::default(),
            is_all_shut: false,
            disabled_plugins: Arc::new(BTreeSet::new()),
        }
    }

    pub fn from_row(row: &GroupRow, disabled_plugins: BTreeSet<String>) -> Self {
        Self {
            group_id: row.group_id.clone(),
            name_fp: Fingerprint::of(&row.group_name),
            status: row.status,
            is_all_shut: false,
            disabled_plugins: Arc::new(disabled_plugins),
        }
    }

    pub fn is_plugin_enabled(&self, plugin: &str) -> bool {
        !self.disabled_plugins.contains(plugin)
    }

    pub fn with_name(current: &Arc<Self>, name: &str) -> Arc<Self> {
        let name_fp = Fingerprint::of(name);
        if current.name_fp == name_fp {
            return Arc::clone(current);
        }
        Arc::new(Self {
            name_fp,
            ..(**current).clone()
        })
    }

    pub fn with_status(current: &Arc<Self>, status: GroupStatus) -> Arc<Self> {
        if current.status == status {
            return Arc::clone(current);
        }
        Arc::new(Self {
            status,
            ..(**current).clone()
        })
    }

    pub fn with_all_shut(current: &Arc<Self>, is_all_shut: bool) -> Arc<Self> {
        if current.is_all_shut == is_all_shut {
            return Arc::clone(current);
        }
        Arc::new(Self {
            is_all_shut,
            ..(**current).clone()
        })
    }

    pub fn with_plugin_enabled(current: &Arc<Self>, plugin: &str, enabled: bool) -> Arc<Self> {
        if current.is_plugin_enabled(plugin) == enabled {
            return Arc::clone(current);
        }
        let mut disabled = (*current.disabled_plugins).clone();
        if enabled {
            disabled.remove(plugin);
        } else {
            disabled.insert(plugin.to_string());
        }
        Arc::new(Self {
            disabled_plugins: Arc::new(disabled),
            ..(**current).clone()
        })
    }
}

// ============================================================================
// MEMBER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberItem {
    pub card_fp: Fingerprint,
    pub permission: Permission,
}

impl Default for MemberItem {
    fn default() -> Self {
        Self {
            card_fp: Fingerprint::EMPTY,
            permission: Permission::NORMAL,
        }
    }
}

impl MemberItem {
    pub fn from_row(row: &MemberRow) -> Self {
        Self {
            card_fp: Fingerprint::of(&row.group_card),
            permission: row.permission,
        }
    }

    pub fn with_card(current: &Arc<Self>, card: &str) -> Arc<Self> {
        let card_fp = Fingerprint::of(card);
        if current.card_fp == card_fp {
            return Arc::clone(current);
        }
        Arc::new(Self {
            card_fp,
            ..(**current).clone()
        })
    }

    pub fn with_permission(current: &Arc<Self>, permission: Permission) -> Arc<Self> {
        if current.permission == permission {
            return Arc::clone(current);
        }
        Arc::new(Self {
            permission,
            ..(**current).clone()
        })
    }
}

// ============================================================================
// BAN
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BanItem {
    /// `None` is a permanent ban.
    pub expiry: Option<Timestamp>,
}

impl BanItem {
    pub fn from_row(row: &BanRow) -> Self {
        Self {
            expiry: row.ban_expiry.map(ember_core::timestamp_from_unix),
        }
    }

    pub fn is_active_at(&self, now: Timestamp) -> bool {
        self.expiry.map_or(true, |expiry| expiry > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_keys() {
        assert_eq!(member_key("g1", "u1"), "MEMBER:g1:u1");
        assert_eq!(ban_key(ember_core::GLOBAL_SCOPE, "u1"), "BAN:GLOBAL:u1");
    }

    #[test]
    fn test_user_unchanged_name_keeps_identity() {
        let user = Arc::new(UserItem::new("u1"));
        let named = UserItem::with_name(&user, "Alice");
        assert!(!Arc::ptr_eq(&user, &named));
        assert!(Arc::ptr_eq(&named, &UserItem::with_name(&named, "Alice")));
        assert!(Arc::ptr_eq(
            &named,
            &UserItem::with_permission(&named, Permission::NORMAL)
        ));
    }

    #[test]
    fn test_empty_name_matches_default_entry() {
        let user = Arc::new(UserItem::new("u1"));
        assert!(Arc::ptr_eq(&user, &UserItem::with_name(&user, "")));
    }

    #[test]
    fn test_group_plugin_toggle_copies_on_write() {
        let group = Arc::new(GroupItem::new("g1"));
        let disabled = GroupItem::with_plugin_enabled(&group, "water", false);
        assert!(group.is_plugin_enabled("water"));
        assert!(!disabled.is_plugin_enabled("water"));

        let again = GroupItem::with_plugin_enabled(&disabled, "water", false);
        assert!(Arc::ptr_eq(&disabled, &again));

        let renamed = GroupItem::with_name(&disabled, "Rust");
        assert!(Arc::ptr_eq(&renamed.disabled_plugins, &disabled.disabled_plugins));
    }

    #[test]
    fn test_member_card_change() {
        let member = Arc::new(MemberItem::default());
        let carded = MemberItem::with_card(&member, "captain");
        assert_eq!(carded.card_fp, Fingerprint::of("captain"));
        assert_eq!(carded.permission, Permission::NORMAL);
    }

    #[test]
    fn test_ban_expiry() {
        let now = Utc::now();
        assert!(BanItem::default().is_active_at(now));
        let expired = BanItem {
            expiry: Some(now - Duration::seconds(1)),
        };
        assert!(!expired.is_active_at(now));
        let running = BanItem {
            expiry: Some(now + Duration::hours(1)),
        };
        assert!(running.is_active_at(now));
    }
}
