//! `biz_user` operations.

use ember_core::{EmberResult, Permission, UserStatus};
use ember_storage::SqliteResultExt;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::enum_column;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub user_id: String,
    pub user_name: String,
    pub permission: Permission,
    pub status: UserStatus,
    pub is_self_ignore: bool,
    pub remark: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Full create record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: String,
    pub user_name: String,
    pub permission: Permission,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNameChange {
    pub user_id: String,
    pub user_name: String,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPermissionChange {
    pub user_id: String,
    pub permission: Permission,
    pub operator_id: Option<String>,
    pub at: i64,
}

const SELECT_USER: &str = "SELECT user_id, user_name, permission, status, is_self_ignore, remark, created_at, updated_at FROM biz_user";

fn map_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        user_id: row.get(0)?,
        user_name: row.get(1)?,
        permission: Permission::from_db(row.get(2)?),
        status: enum_column(row, 3, UserStatus::from_db_str)?,
        is_self_ignore: row.get(4)?,
        remark: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Insert users. An existing row only takes the name, and only when the row
/// is older or still unnamed, so a rename flushed first is not overwritten.
pub fn bulk_upsert(conn: &Connection, users: &[UserRecord]) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO biz_user (user_id, user_name, permission, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                 user_name = CASE
                     WHEN excluded.updated_at > biz_user.updated_at OR biz_user.user_name = ''
                     THEN excluded.user_name ELSE biz_user.user_name END,
                 updated_at = MAX(biz_user.updated_at, excluded.updated_at)",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for user in users {
        affected += stmt
            .execute(params![user.user_id, user.user_name, user.permission.to_db(), user.at])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

/// Make sure a row exists for each id without touching existing ones.
/// Placeholders carry `updated_at = 0` so any real write supersedes them.
pub fn insert_ignore(conn: &Connection, user_ids: &[&str], at: i64) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO biz_user (user_id, created_at, updated_at) VALUES (?1, ?2, 0)
             ON CONFLICT(user_id) DO NOTHING",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for user_id in user_ids {
        affected += stmt.execute(params![user_id, at]).map_sqlite(conn)?;
    }
    Ok(affected)
}

pub fn bulk_upsert_names(conn: &Connection, changes: &[UserNameChange]) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO biz_user (user_id, user_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                 user_name = excluded.user_name,
                 updated_at = excluded.updated_at",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for change in changes {
        affected += stmt
            .execute(params![change.user_id, change.user_name, change.at])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

/// Update permissions of existing users. Unknown ids are skipped.
pub fn bulk_update_permissions(
    conn: &Connection,
    changes: &[UserPermissionChange],
) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached("UPDATE biz_user SET permission = ?2, updated_at = ?3 WHERE user_id = ?1")
        .map_sqlite(conn)?;
    let mut affected = 0;
    for change in changes {
        affected += stmt
            .execute(params![change.user_id, change.permission.to_db(), change.at])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

pub fn get(conn: &Connection, user_id: &str) -> EmberResult<Option<UserRow>> {
    let mut stmt = conn
        .prepare_cached(&format!("{SELECT_USER} WHERE user_id = ?1"))
        .map_sqlite(conn)?;
    stmt.query_row([user_id], map_row).optional().map_sqlite(conn)
}

pub fn all(conn: &Connection) -> EmberResult<Vec<UserRow>> {
    let mut stmt = conn.prepare_cached(SELECT_USER).map_sqlite(conn)?;
    let rows = stmt.query_map([], map_row).map_sqlite(conn)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_sqlite(conn)
}
