//! Ember Core - Shared Types
//!
//! Pure data structures used by every other ember crate: errors, enums,
//! permission flags, fingerprints and configuration. No I/O lives here.

use chrono::{DateTime, Utc};

pub mod config;
pub mod constants;
pub mod enums;
pub mod error;
pub mod fingerprint;
pub mod permission;

pub use config::PersistenceConfig;
pub use constants::GLOBAL_SCOPE;
pub use enums::{
    AuditAction, AuditCategory, AuditContext, EnumParseError, GroupStatus, InvitationStatus,
    SnapshotEventType, UserStatus, WritePolicy,
};
pub use error::{
    ArchiveError, ConfigError, EmberError, EmberResult, StorageError, ValidationError,
};
pub use fingerprint::Fingerprint;
pub use permission::Permission;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Current time as unix seconds, the integer form stored in `created_at` columns.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Convert unix seconds into a timestamp, clamping values chrono cannot represent.
pub fn timestamp_from_unix(secs: i64) -> Timestamp {
    DateTime::from_timestamp(secs, 0).unwrap_or(if secs < 0 {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_from_unix_roundtrip() {
        let ts = timestamp_from_unix(1_735_660_800);
        assert_eq!(ts.timestamp(), 1_735_660_800);
    }

    #[test]
    fn test_timestamp_from_unix_clamps() {
        assert_eq!(timestamp_from_unix(i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(timestamp_from_unix(i64::MIN), DateTime::<Utc>::MIN_UTC);
    }
}
