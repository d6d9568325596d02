//! Permission bit flags shared by users and group members.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Permission bits stored as an integer column.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permission: u8 {
        const NORMAL = 1 << 0;
        const GROUP_ADMIN = 1 << 1;
        const GROUP_OWNER = 1 << 2;
        const SUPERUSER = 1 << 3;
    }
}

const PERMISSION_LABELS: [(Permission, &str); 4] = [
    (Permission::NORMAL, "Member"),
    (Permission::GROUP_ADMIN, "Group admin"),
    (Permission::GROUP_OWNER, "Group owner"),
    (Permission::SUPERUSER, "Superuser"),
];

impl Permission {
    pub const NONE: Permission = Permission::empty();

    /// True when every bit of `other` is present.
    pub fn has(&self, other: Permission) -> bool {
        self.contains(other)
    }

    pub fn to_db(self) -> i64 {
        i64::from(self.bits())
    }

    /// Unknown bits are dropped.
    pub fn from_db(value: i64) -> Self {
        let bits = u8::try_from(value.clamp(0, i64::from(u8::MAX))).unwrap_or(0);
        Permission::from_bits_truncate(bits)
    }

    /// Label for the highest flag held, or "No permission".
    pub fn label(&self) -> &'static str {
        PERMISSION_LABELS
            .iter()
            .rev()
            .find(|(flag, _)| self.contains(*flag))
            .map(|(_, label)| *label)
            .unwrap_or("No permission")
    }
}

impl Default for Permission {
    fn default() -> Self {
        Permission::NORMAL
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_requires_all_bits() {
        let perm = Permission::NORMAL | Permission::GROUP_ADMIN;
        assert!(perm.has(Permission::NORMAL));
        assert!(perm.has(Permission::GROUP_ADMIN));
        assert!(!perm.has(Permission::GROUP_ADMIN | Permission::GROUP_OWNER));
        assert!(perm.has(Permission::NONE));
    }

    #[test]
    fn test_db_roundtrip_truncates_unknown_bits() {
        assert_eq!(Permission::from_db(Permission::SUPERUSER.to_db()), Permission::SUPERUSER);
        assert_eq!(Permission::from_db(0b1111_0001), Permission::NORMAL);
        assert_eq!(Permission::from_db(-3), Permission::NONE);
    }

    #[test]
    fn test_label_uses_highest_flag() {
        assert_eq!(Permission::NONE.label(), "No permission");
        assert_eq!((Permission::NORMAL | Permission::GROUP_OWNER).label(), "Group owner");
        assert_eq!(Permission::default(), Permission::NORMAL);
    }
}
