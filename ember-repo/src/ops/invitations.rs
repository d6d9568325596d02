//! `biz_invitation` and `biz_invitation_message` operations.
//!
//! A group has at most one invitation row. Inviting the bot again resets
//! that row to PENDING with the new inviter and flag.

use ember_core::{EmberResult, InvitationStatus};
use ember_storage::SqliteResultExt;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::enum_column;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationRow {
    pub id: i64,
    pub group_id: String,
    pub inviter_id: String,
    pub flag: String,
    pub status: InvitationStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

const SELECT_INVITATION: &str = "SELECT i.id, i.group_id, i.inviter_id, i.flag, i.status, i.created_at, i.updated_at FROM biz_invitation i";

fn map_row(row: &Row<'_>) -> rusqlite::Result<InvitationRow> {
    Ok(InvitationRow {
        id: row.get(0)?,
        group_id: row.get(1)?,
        inviter_id: row.get(2)?,
        flag: row.get(3)?,
        status: enum_column(row, 4, InvitationStatus::from_db_str)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Create or reset the group's invitation and record its first message.
pub fn create(
    conn: &Connection,
    group_id: &str,
    inviter_id: &str,
    flag: &str,
    first_message_id: Option<&str>,
    at: i64,
) -> EmberResult<InvitationRow> {
    {
        let mut stmt = conn
            .prepare_cached(
                "INSERT INTO biz_invitation (group_id, inviter_id, flag, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(group_id) DO UPDATE SET
                     inviter_id = excluded.inviter_id,
                     flag = excluded.flag,
                     status = excluded.status,
                     updated_at = excluded.updated_at",
            )
            .map_sqlite(conn)?;
        stmt.execute(params![
            group_id,
            inviter_id,
            flag,
            InvitationStatus::Pending.as_db_str(),
            at
        ])
        .map_sqlite(conn)?;
    }

    let invitation = by_group(conn, group_id)?.ok_or_else(|| {
        ember_core::StorageError::NotFound {
            entity: "invitation".to_string(),
            key: group_id.to_string(),
        }
    })?;
    if let Some(message_id) = first_message_id {
        add_message_record(conn, invitation.id, message_id, at)?;
    }
    Ok(invitation)
}

pub fn add_message_record(
    conn: &Connection,
    invitation_id: i64,
    message_id: &str,
    at: i64,
) -> EmberResult<i64> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO biz_invitation_message (invitation_id, message_id, created_at) VALUES (?1, ?2, ?3)",
        )
        .map_sqlite(conn)?;
    stmt.execute(params![invitation_id, message_id, at])
        .map_sqlite(conn)?;
    Ok(conn.last_insert_rowid())
}

/// Returns the updated row, or `None` for an unknown id.
pub fn update_status(
    conn: &Connection,
    invitation_id: i64,
    status: InvitationStatus,
    at: i64,
) -> EmberResult<Option<InvitationRow>> {
    let changed = {
        let mut stmt = conn
            .prepare_cached("UPDATE biz_invitation SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .map_sqlite(conn)?;
        stmt.execute(params![invitation_id, status.as_db_str(), at])
            .map_sqlite(conn)?
    };
    if changed == 0 {
        return Ok(None);
    }
    get(conn, invitation_id)
}

pub fn get(conn: &Connection, invitation_id: i64) -> EmberResult<Option<InvitationRow>> {
    let mut stmt = conn
        .prepare_cached(&format!("{SELECT_INVITATION} WHERE i.id = ?1"))
        .map_sqlite(conn)?;
    stmt.query_row([invitation_id], map_row)
        .optional()
        .map_sqlite(conn)
}

pub fn by_group(conn: &Connection, group_id: &str) -> EmberResult<Option<InvitationRow>> {
    let mut stmt = conn
        .prepare_cached(&format!("{SELECT_INVITATION} WHERE i.group_id = ?1"))
        .map_sqlite(conn)?;
    stmt.query_row([group_id], map_row)
        .optional()
        .map_sqlite(conn)
}

pub fn get_by_flag(conn: &Connection, flag: &str) -> EmberResult<Option<InvitationRow>> {
    let mut stmt = conn
        .prepare_cached(&format!("{SELECT_INVITATION} WHERE i.flag = ?1 ORDER BY i.id DESC LIMIT 1"))
        .map_sqlite(conn)?;
    stmt.query_row([flag], map_row).optional().map_sqlite(conn)
}

/// The invitation a notification message belongs to.
pub fn get_by_message_id(conn: &Connection, message_id: &str) -> EmberResult<Option<InvitationRow>> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "{SELECT_INVITATION}
             JOIN biz_invitation_message m ON m.invitation_id = i.id
             WHERE m.message_id = ?1
             ORDER BY m.id DESC LIMIT 1"
        ))
        .map_sqlite(conn)?;
    stmt.query_row([message_id], map_row)
        .optional()
        .map_sqlite(conn)
}

/// Pending invitations, optionally limited to one group, oldest first.
pub fn pending(conn: &Connection, group_id: Option<&str>) -> EmberResult<Vec<InvitationRow>> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "{SELECT_INVITATION} WHERE i.status = ?1 AND (?2 IS NULL OR i.group_id = ?2) ORDER BY i.id"
        ))
        .map_sqlite(conn)?;
    let rows = stmt
        .query_map(params![InvitationStatus::Pending.as_db_str(), group_id], map_row)
        .map_sqlite(conn)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_sqlite(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::memory_db;
    use crate::schema::CORE_SCHEMA;

    #[test]
    fn test_create_records_first_message() {
        let conn = memory_db(CORE_SCHEMA);
        let invitation = create(&conn, "g1", "u1", "flag-1", Some("m1"), 10).unwrap();
        assert_eq!(invitation.status, InvitationStatus::Pending);

        let found = get_by_message_id(&conn, "m1").unwrap().unwrap();
        assert_eq!(found.id, invitation.id);
        assert_eq!(get_by_flag(&conn, "flag-1").unwrap().unwrap().group_id, "g1");
    }

    #[test]
    fn test_reinvite_resets_to_pending() {
        let conn = memory_db(CORE_SCHEMA);
        let first = create(&conn, "g1", "u1", "flag-1", None, 10).unwrap();
        update_status(&conn, first.id, InvitationStatus::Rejected, 11).unwrap();
        assert!(pending(&conn, None).unwrap().is_empty());

        let second = create(&conn, "g1", "u2", "flag-2", Some("m2"), 20).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.inviter_id, "u2");
        assert_eq!(second.status, InvitationStatus::Pending);
        assert_eq!(second.created_at, 10);
        assert_eq!(pending(&conn, Some("g1")).unwrap().len(), 1);
        assert!(pending(&conn, Some("g2")).unwrap().is_empty());
    }

    #[test]
    fn test_update_unknown_invitation() {
        let conn = memory_db(CORE_SCHEMA);
        assert!(update_status(&conn, 42, InvitationStatus::Approved, 1)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_additional_messages_resolve_to_invitation() {
        let conn = memory_db(CORE_SCHEMA);
        let invitation = create(&conn, "g1", "u1", "f", Some("m1"), 1).unwrap();
        add_message_record(&conn, invitation.id, "m2", 2).unwrap();
        let approved = update_status(&conn, invitation.id, InvitationStatus::Approved, 3)
            .unwrap()
            .unwrap();
        assert_eq!(approved.status, InvitationStatus::Approved);
        assert_eq!(get_by_message_id(&conn, "m2").unwrap().unwrap().id, invitation.id);
    }
}
