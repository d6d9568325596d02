//! Enum types for ember entities and audit records
//!
//! Every enum stores as a fixed database string (`as_db_str`), parses back
//! case-insensitively (`from_db_str`), and carries a human-readable label
//! from a lookup table declared next to it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error when parsing an invalid enum string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl EnumParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

fn lookup<T: PartialEq + Copy>(table: &[(T, &'static str)], value: T) -> &'static str {
    table
        .iter()
        .find(|(variant, _)| *variant == value)
        .map(|(_, label)| *label)
        .unwrap_or("")
}

// ============================================================================
// CORE ENTITY STATES
// ============================================================================

/// Authorization state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum GroupStatus {
    Authorized,
    Banned,
    Left,
    #[default]
    Unauthorized,
}

const GROUP_STATUS_LABELS: [(GroupStatus, &str); 4] = [
    (GroupStatus::Authorized, "Authorized"),
    (GroupStatus::Banned, "Banned"),
    (GroupStatus::Left, "Left the group"),
    (GroupStatus::Unauthorized, "Not authorized"),
];

impl GroupStatus {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            GroupStatus::Authorized => "AUTHORIZED",
            GroupStatus::Banned => "BANNED",
            GroupStatus::Left => "LEFT",
            GroupStatus::Unauthorized => "UNAUTHORIZED",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_uppercase().as_str() {
            "AUTHORIZED" => Ok(GroupStatus::Authorized),
            "BANNED" => Ok(GroupStatus::Banned),
            "LEFT" => Ok(GroupStatus::Left),
            "UNAUTHORIZED" => Ok(GroupStatus::Unauthorized),
            _ => Err(EnumParseError::new("group status", s)),
        }
    }

    pub fn label(&self) -> &'static str {
        lookup(&GROUP_STATUS_LABELS, *self)
    }
}

/// Account state of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum UserStatus {
    #[default]
    Normal,
    Banned,
}

const USER_STATUS_LABELS: [(UserStatus, &str); 2] = [
    (UserStatus::Normal, "Normal"),
    (UserStatus::Banned, "Banned"),
];

impl UserStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            UserStatus::Normal => "NORMAL",
            UserStatus::Banned => "BANNED",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_uppercase().as_str() {
            "NORMAL" => Ok(UserStatus::Normal),
            "BANNED" => Ok(UserStatus::Banned),
            _ => Err(EnumParseError::new("user status", s)),
        }
    }

    pub fn label(&self) -> &'static str {
        lookup(&USER_STATUS_LABELS, *self)
    }
}

/// Review state of a group invitation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InvitationStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Ignored,
}

const INVITATION_STATUS_LABELS: [(InvitationStatus, &str); 4] = [
    (InvitationStatus::Pending, "Awaiting review"),
    (InvitationStatus::Approved, "Approved"),
    (InvitationStatus::Rejected, "Rejected"),
    (InvitationStatus::Ignored, "Ignored"),
];

impl InvitationStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            InvitationStatus::Pending => "PENDING",
            InvitationStatus::Approved => "APPROVED",
            InvitationStatus::Rejected => "REJECTED",
            InvitationStatus::Ignored => "IGNORED",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(InvitationStatus::Pending),
            "APPROVED" => Ok(InvitationStatus::Approved),
            "REJECTED" => Ok(InvitationStatus::Rejected),
            "IGNORED" => Ok(InvitationStatus::Ignored),
            _ => Err(EnumParseError::new("invitation status", s)),
        }
    }

    pub fn label(&self) -> &'static str {
        lookup(&INVITATION_STATUS_LABELS, *self)
    }

    /// Whether the invitation has been reviewed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvitationStatus::Pending)
    }
}

// ============================================================================
// WRITE POLICY
// ============================================================================

/// How urgently a repository change must reach disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WritePolicy {
    /// Buffered in a batch writer and flushed periodically. Best effort.
    #[default]
    Deferred,
    /// Committed synchronously inside the triggering operation.
    Immediate,
}

const WRITE_POLICY_LABELS: [(WritePolicy, &str); 2] = [
    (WritePolicy::Deferred, "Batched write"),
    (WritePolicy::Immediate, "Immediate write"),
];

impl WritePolicy {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            WritePolicy::Deferred => "buffered",
            WritePolicy::Immediate => "immediate",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_lowercase().as_str() {
            "buffered" | "deferred" => Ok(WritePolicy::Deferred),
            "immediate" => Ok(WritePolicy::Immediate),
            _ => Err(EnumParseError::new("write policy", s)),
        }
    }

    pub fn label(&self) -> &'static str {
        lookup(&WRITE_POLICY_LABELS, *self)
    }
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Scope an audit record applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditContext {
    Global,
    Group,
    User,
    Guild,
    System,
}

const AUDIT_CONTEXT_LABELS: [(AuditContext, &str); 5] = [
    (AuditContext::Global, "Global"),
    (AuditContext::Group, "Group"),
    (AuditContext::User, "User"),
    (AuditContext::Guild, "Guild"),
    (AuditContext::System, "System"),
];

impl AuditContext {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            AuditContext::Global => "GLOBAL",
            AuditContext::Group => "GROUP",
            AuditContext::User => "USER",
            AuditContext::Guild => "GUILD",
            AuditContext::System => "SYSTEM",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_uppercase().as_str() {
            "GLOBAL" => Ok(AuditContext::Global),
            "GROUP" => Ok(AuditContext::Group),
            "USER" => Ok(AuditContext::User),
            "GUILD" => Ok(AuditContext::Guild),
            "SYSTEM" => Ok(AuditContext::System),
            _ => Err(EnumParseError::new("audit context", s)),
        }
    }

    pub fn label(&self) -> &'static str {
        lookup(&AUDIT_CONTEXT_LABELS, *self)
    }
}

/// Broad class of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditCategory {
    Access,
    Permission,
    Plugin,
    System,
    Task,
    File,
}

const AUDIT_CATEGORY_LABELS: [(AuditCategory, &str); 6] = [
    (AuditCategory::Access, "Access control"),
    (AuditCategory::Permission, "Permissions"),
    (AuditCategory::Plugin, "Plugins"),
    (AuditCategory::System, "System"),
    (AuditCategory::Task, "Scheduled tasks"),
    (AuditCategory::File, "Files"),
];

impl AuditCategory {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            AuditCategory::Access => "ACCESS",
            AuditCategory::Permission => "PERMISSION",
            AuditCategory::Plugin => "PLUGIN",
            AuditCategory::System => "SYSTEM",
            AuditCategory::Task => "TASK",
            AuditCategory::File => "FILE",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_uppercase().as_str() {
            "ACCESS" => Ok(AuditCategory::Access),
            "PERMISSION" => Ok(AuditCategory::Permission),
            "PLUGIN" => Ok(AuditCategory::Plugin),
            "SYSTEM" => Ok(AuditCategory::System),
            "TASK" => Ok(AuditCategory::Task),
            "FILE" => Ok(AuditCategory::File),
            _ => Err(EnumParseError::new("audit category", s)),
        }
    }

    pub fn label(&self) -> &'static str {
        lookup(&AUDIT_CATEGORY_LABELS, *self)
    }
}

/// Specific audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Login,
    Logout,
    Connect,
    Kick,
    Ban,
    Unban,
    Mute,
    Unmute,
    Approve,
    Reject,
    Enable,
    Disable,
    Trigger,
    Reload,
    Change,
    Grant,
    Revoke,
}

const AUDIT_ACTION_LABELS: [(AuditAction, &str); 20] = [
    (AuditAction::Create, "Created"),
    (AuditAction::Update, "Updated"),
    (AuditAction::Delete, "Deleted"),
    (AuditAction::Login, "Logged in"),
    (AuditAction::Logout, "Logged out"),
    (AuditAction::Connect, "Connected"),
    (AuditAction::Kick, "Kicked member"),
    (AuditAction::Ban, "Banned"),
    (AuditAction::Unban, "Unbanned"),
    (AuditAction::Mute, "Muted"),
    (AuditAction::Unmute, "Unmuted"),
    (AuditAction::Approve, "Approved"),
    (AuditAction::Reject, "Rejected"),
    (AuditAction::Enable, "Enabled feature"),
    (AuditAction::Disable, "Disabled feature"),
    (AuditAction::Trigger, "Triggered"),
    (AuditAction::Reload, "Reloaded configuration"),
    (AuditAction::Change, "Permission changed"),
    (AuditAction::Grant, "Permission granted"),
    (AuditAction::Revoke, "Permission revoked"),
];

impl AuditAction {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "CREATE",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
            AuditAction::Login => "LOGIN",
            AuditAction::Logout => "LOGOUT",
            AuditAction::Connect => "CONNECT",
            AuditAction::Kick => "KICK",
            AuditAction::Ban => "BAN",
            AuditAction::Unban => "UNBAN",
            AuditAction::Mute => "MUTE",
            AuditAction::Unmute => "UNMUTE",
            AuditAction::Approve => "APPROVE",
            AuditAction::Reject => "REJECT",
            AuditAction::Enable => "ENABLE",
            AuditAction::Disable => "DISABLE",
            AuditAction::Trigger => "TRIGGER",
            AuditAction::Reload => "RELOAD",
            AuditAction::Change => "CHANGE",
            AuditAction::Grant => "GRANT",
            AuditAction::Revoke => "REVOKE",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        let upper = s.to_uppercase();
        AUDIT_ACTION_LABELS
            .iter()
            .map(|(action, _)| *action)
            .find(|action| action.as_db_str() == upper)
            .ok_or_else(|| EnumParseError::new("audit action", s))
    }

    pub fn label(&self) -> &'static str {
        lookup(&AUDIT_ACTION_LABELS, *self)
    }
}

// ============================================================================
// CHANGE HISTORY
// ============================================================================

/// Kind of text change recorded in the snapshot history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotEventType {
    UserName,
    Card,
    GroupName,
}

const SNAPSHOT_EVENT_LABELS: [(SnapshotEventType, &str); 3] = [
    (SnapshotEventType::UserName, "User name"),
    (SnapshotEventType::Card, "Group card"),
    (SnapshotEventType::GroupName, "Group name"),
];

impl SnapshotEventType {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            SnapshotEventType::UserName => "NAME",
            SnapshotEventType::Card => "CARD",
            SnapshotEventType::GroupName => "GROUPNAME",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s.to_uppercase().as_str() {
            "NAME" => Ok(SnapshotEventType::UserName),
            "CARD" => Ok(SnapshotEventType::Card),
            "GROUPNAME" => Ok(SnapshotEventType::GroupName),
            _ => Err(EnumParseError::new("snapshot event type", s)),
        }
    }

    pub fn label(&self) -> &'static str {
        lookup(&SNAPSHOT_EVENT_LABELS, *self)
    }
}

// ============================================================================
// DISPLAY / FROMSTR
// ============================================================================

macro_rules! db_str_traits {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.as_db_str())
                }
            }

            impl FromStr for $ty {
                type Err = EnumParseError;

                fn from_str(s: &str) -> Result<Self, Self::Err> {
                    Self::from_db_str(s)
                }
            }
        )+
    };
}

db_str_traits!(
    GroupStatus,
    UserStatus,
    InvitationStatus,
    WritePolicy,
    AuditContext,
    AuditCategory,
    AuditAction,
    SnapshotEventType,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_status_db_roundtrip() {
        for status in [
            GroupStatus::Authorized,
            GroupStatus::Banned,
            GroupStatus::Left,
            GroupStatus::Unauthorized,
        ] {
            assert_eq!(GroupStatus::from_db_str(status.as_db_str()), Ok(status));
        }
        assert_eq!(GroupStatus::default(), GroupStatus::Unauthorized);
    }

    #[test]
    fn test_from_db_str_is_case_insensitive() {
        assert_eq!("pending".parse::<InvitationStatus>(), Ok(InvitationStatus::Pending));
        assert_eq!("Ban".parse::<AuditAction>(), Ok(AuditAction::Ban));
        assert_eq!("name".parse::<SnapshotEventType>(), Ok(SnapshotEventType::UserName));
    }

    #[test]
    fn test_write_policy_accepts_legacy_name() {
        assert_eq!(WritePolicy::from_db_str("buffered"), Ok(WritePolicy::Deferred));
        assert_eq!(WritePolicy::from_db_str("deferred"), Ok(WritePolicy::Deferred));
        assert_eq!(WritePolicy::Deferred.to_string(), "buffered");
    }

    #[test]
    fn test_invalid_string_reports_kind() {
        let err = AuditCategory::from_db_str("nope").unwrap_err();
        assert_eq!(err.kind, "audit category");
        assert_eq!(err.to_string(), "Invalid audit category: nope");
    }

    #[test]
    fn test_every_action_has_label() {
        for (action, label) in AUDIT_ACTION_LABELS {
            assert_eq!(action.label(), label);
            assert!(!label.is_empty());
            assert_eq!(AuditAction::from_db_str(action.as_db_str()), Ok(action));
        }
    }

    #[test]
    fn test_invitation_terminal_states() {
        assert!(!InvitationStatus::Pending.is_terminal());
        assert!(InvitationStatus::Approved.is_terminal());
        assert!(InvitationStatus::Ignored.is_terminal());
    }
}
