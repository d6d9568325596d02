//! `sys_blacklist` operations, keyed by `(target_user_id, group_id)`.
//!
//! `group_id` is either a group or [`ember_core::GLOBAL_SCOPE`]. A NULL
//! `ban_expiry` is a permanent ban.

use ember_core::EmberResult;
use ember_storage::SqliteResultExt;
use rusqlite::{params, Connection, OptionalExtension, Row};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRow {
    pub target_user_id: String,
    pub group_id: String,
    pub operator_id: String,
    pub ban_expiry: Option<i64>,
    pub reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

const SELECT_BAN: &str = "SELECT target_user_id, group_id, operator_id, ban_expiry, reason, created_at, updated_at FROM sys_blacklist";

fn map_row(row: &Row<'_>) -> rusqlite::Result<BanRow> {
    Ok(BanRow {
        target_user_id: row.get(0)?,
        group_id: row.get(1)?,
        operator_id: row.get(2)?,
        ban_expiry: row.get(3)?,
        reason: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Insert a ban, or refresh expiry and reason of an existing one.
pub fn add_ban(
    conn: &Connection,
    target_user_id: &str,
    group_id: &str,
    operator_id: &str,
    ban_expiry: Option<i64>,
    reason: Option<&str>,
    at: i64,
) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO sys_blacklist
                 (target_user_id, group_id, operator_id, ban_expiry, reason, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(target_user_id, group_id) DO UPDATE SET
                 ban_expiry = excluded.ban_expiry,
                 reason = excluded.reason,
                 updated_at = excluded.updated_at",
        )
        .map_sqlite(conn)?;
    stmt.execute(params![target_user_id, group_id, operator_id, ban_expiry, reason, at])
        .map_sqlite(conn)
}

/// Returns the number of rows removed.
pub fn unban(conn: &Connection, target_user_id: &str, group_id: &str) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached("DELETE FROM sys_blacklist WHERE target_user_id = ?1 AND group_id = ?2")
        .map_sqlite(conn)?;
    stmt.execute([target_user_id, group_id]).map_sqlite(conn)
}

pub fn get(conn: &Connection, target_user_id: &str, group_id: &str) -> EmberResult<Option<BanRow>> {
    let mut stmt = conn
        .prepare_cached(&format!("{SELECT_BAN} WHERE target_user_id = ?1 AND group_id = ?2"))
        .map_sqlite(conn)?;
    stmt.query_row([target_user_id, group_id], map_row)
        .optional()
        .map_sqlite(conn)
}

pub fn all(conn: &Connection) -> EmberResult<Vec<BanRow>> {
    let mut stmt = conn.prepare_cached(SELECT_BAN).map_sqlite(conn)?;
    let rows = stmt.query_map([], map_row).map_sqlite(conn)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_sqlite(conn)
}
