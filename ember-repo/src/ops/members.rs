//! `biz_group_member` operations, keyed by `(group_id, user_id)`.

use ember_core::{EmberResult, Permission};
use ember_storage::SqliteResultExt;
use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRow {
    pub group_id: String,
    pub user_id: String,
    pub group_card: String,
    pub permission: Permission,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRecord {
    pub group_id: String,
    pub user_id: String,
    pub group_card: String,
    pub permission: Permission,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberCardChange {
    pub group_id: String,
    pub user_id: String,
    pub group_card: String,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberPermissionChange {
    pub group_id: String,
    pub user_id: String,
    pub permission: Permission,
    pub operator_id: Option<String>,
    pub at: i64,
}

const SELECT_MEMBER: &str =
    "SELECT group_id, user_id, group_card, permission, created_at, updated_at FROM biz_group_member";

fn map_row(row: &Row<'_>) -> rusqlite::Result<MemberRow> {
    Ok(MemberRow {
        group_id: row.get(0)?,
        user_id: row.get(1)?,
        group_card: row.get(2)?,
        permission: Permission::from_db(row.get(3)?),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Insert memberships. An existing row takes card and permission only from
/// a newer record; an empty card is always filled.
pub fn bulk_upsert(conn: &Connection, members: &[MemberRecord]) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO biz_group_member (group_id, user_id, group_card, permission, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(group_id, user_id) DO UPDATE SET
                 group_card = CASE
                     WHEN excluded.updated_at > biz_group_member.updated_at
                          OR biz_group_member.group_card = ''
                     THEN excluded.group_card ELSE biz_group_member.group_card END,
                 permission = CASE
                     WHEN excluded.updated_at > biz_group_member.updated_at
                     THEN excluded.permission ELSE biz_group_member.permission END,
                 updated_at = MAX(biz_group_member.updated_at, excluded.updated_at)",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for member in members {
        affected += stmt
            .execute(params![
                member.group_id,
                member.user_id,
                member.group_card,
                member.permission.to_db(),
                member.at
            ])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

pub fn bulk_upsert_cards(conn: &Connection, changes: &[MemberCardChange]) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO biz_group_member (group_id, user_id, group_card, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(group_id, user_id) DO UPDATE SET
                 group_card = excluded.group_card,
                 updated_at = excluded.updated_at",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for change in changes {
        affected += stmt
            .execute(params![change.group_id, change.user_id, change.group_card, change.at])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

pub fn bulk_update_permissions(
    conn: &Connection,
    changes: &[MemberPermissionChange],
) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "UPDATE biz_group_member SET permission = ?3, updated_at = ?4
             WHERE group_id = ?1 AND user_id = ?2",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for change in changes {
        affected += stmt
            .execute(params![
                change.group_id,
                change.user_id,
                change.permission.to_db(),
                change.at
            ])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

pub fn get(conn: &Connection, group_id: &str, user_id: &str) -> EmberResult<Option<MemberRow>> {
    let mut stmt = conn
        .prepare_cached(&format!("{SELECT_MEMBER} WHERE group_id = ?1 AND user_id = ?2"))
        .map_sqlite(conn)?;
    stmt.query_row([group_id, user_id], map_row)
        .optional()
        .map_sqlite(conn)
}

pub fn all(conn: &Connection) -> EmberResult<Vec<MemberRow>> {
    let mut stmt = conn.prepare_cached(SELECT_MEMBER).map_sqlite(conn)?;
    let rows = stmt.query_map([], map_row).map_sqlite(conn)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_sqlite(conn)
}

pub fn by_group(conn: &Connection, group_id: &str) -> EmberResult<Vec<MemberRow>> {
    let mut stmt = conn
        .prepare_cached(&format!("{SELECT_MEMBER} WHERE group_id = ?1 ORDER BY user_id"))
        .map_sqlite(conn)?;
    let rows = stmt.query_map([group_id], map_row).map_sqlite(conn)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_sqlite(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::memory_db;
    use crate::schema::CORE_SCHEMA;

    fn record(group: &str, user: &str, card: &str) -> MemberRecord {
        MemberRecord {
            group_id: group.to_string(),
            user_id: user.to_string(),
            group_card: card.to_string(),
            permission: Permission::NORMAL,
            at: 10,
        }
    }

    #[test]
    fn test_same_user_in_two_groups_is_two_rows() {
        let conn = memory_db(CORE_SCHEMA);
        bulk_upsert(&conn, &[record("g1", "u1", "a"), record("g2", "u1", "b")]).unwrap();

        assert_eq!(all(&conn).unwrap().len(), 2);
        assert_eq!(get(&conn, "g1", "u1").unwrap().unwrap().group_card, "a");
        assert_eq!(get(&conn, "g2", "u1").unwrap().unwrap().group_card, "b");
        assert_eq!(by_group(&conn, "g2").unwrap().len(), 1);
    }

    #[test]
    fn test_card_upsert_keeps_permission() {
        let conn = memory_db(CORE_SCHEMA);
        let mut admin = record("g1", "u1", "old");
        admin.permission = Permission::GROUP_ADMIN;
        bulk_upsert(&conn, &[admin]).unwrap();

        let change = MemberCardChange {
            group_id: "g1".to_string(),
            user_id: "u1".to_string(),
            group_card: "new".to_string(),
            at: 20,
        };
        bulk_upsert_cards(&conn, &[change]).unwrap();

        let row = get(&conn, "g1", "u1").unwrap().unwrap();
        assert_eq!(row.group_card, "new");
        assert_eq!(row.permission, Permission::GROUP_ADMIN);
        assert_eq!((row.created_at, row.updated_at), (10, 20));
    }

    #[test]
    fn test_permission_update_targets_one_membership() {
        let conn = memory_db(CORE_SCHEMA);
        bulk_upsert(&conn, &[record("g1", "u1", ""), record("g2", "u1", "")]).unwrap();
        let change = MemberPermissionChange {
            group_id: "g2".to_string(),
            user_id: "u1".to_string(),
            permission: Permission::GROUP_OWNER,
            operator_id: None,
            at: 30,
        };
        assert_eq!(bulk_update_permissions(&conn, &[change]).unwrap(), 1);
        assert_eq!(get(&conn, "g1", "u1").unwrap().unwrap().permission, Permission::NORMAL);
        assert_eq!(get(&conn, "g2", "u1").unwrap().unwrap().permission, Permission::GROUP_OWNER);
    }
}
