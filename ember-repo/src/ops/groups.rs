//! `biz_group` operations.

use ember_core::{EmberResult, GroupStatus};
use ember_storage::SqliteResultExt;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::enum_column;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRow {
    pub group_id: String,
    pub group_name: String,
    pub status: GroupStatus,
    pub last_operator_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub group_id: String,
    pub group_name: String,
    pub status: GroupStatus,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupNameChange {
    pub group_id: String,
    pub group_name: String,
    pub at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStatusChange {
    pub group_id: String,
    pub status: GroupStatus,
    pub operator_id: Option<String>,
    pub at: i64,
}

const SELECT_GROUP: &str =
    "SELECT group_id, group_name, status, last_operator_id, created_at, updated_at FROM biz_group";

fn map_row(row: &Row<'_>) -> rusqlite::Result<GroupRow> {
    Ok(GroupRow {
        group_id: row.get(0)?,
        group_name: row.get(1)?,
        status: enum_column(row, 2, GroupStatus::from_db_str)?,
        last_operator_id: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Insert groups. An existing row takes name and status only from a newer
/// record; an unnamed row always takes the name.
pub fn bulk_upsert(conn: &Connection, groups: &[GroupRecord]) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO biz_group (group_id, group_name, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(group_id) DO UPDATE SET
                 group_name = CASE
                     WHEN excluded.updated_at > biz_group.updated_at OR biz_group.group_name = ''
                     THEN excluded.group_name ELSE biz_group.group_name END,
                 status = CASE
                     WHEN excluded.updated_at > biz_group.updated_at
                     THEN excluded.status ELSE biz_group.status END,
                 updated_at = MAX(biz_group.updated_at, excluded.updated_at)",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for group in groups {
        affected += stmt
            .execute(params![
                group.group_id,
                group.group_name,
                group.status.as_db_str(),
                group.at
            ])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

pub fn insert_ignore(conn: &Connection, group_ids: &[&str], at: i64) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO biz_group (group_id, created_at, updated_at) VALUES (?1, ?2, 0)
             ON CONFLICT(group_id) DO NOTHING",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for group_id in group_ids {
        affected += stmt.execute(params![group_id, at]).map_sqlite(conn)?;
    }
    Ok(affected)
}

pub fn bulk_upsert_names(conn: &Connection, changes: &[GroupNameChange]) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO biz_group (group_id, group_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(group_id) DO UPDATE SET
                 group_name = excluded.group_name,
                 updated_at = excluded.updated_at",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for change in changes {
        affected += stmt
            .execute(params![change.group_id, change.group_name, change.at])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

pub fn bulk_update_statuses(conn: &Connection, changes: &[GroupStatusChange]) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "UPDATE biz_group SET status = ?2, last_operator_id = ?3, updated_at = ?4
             WHERE group_id = ?1",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for change in changes {
        affected += stmt
            .execute(params![
                change.group_id,
                change.status.as_db_str(),
                change.operator_id,
                change.at
            ])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

pub fn get(conn: &Connection, group_id: &str) -> EmberResult<Option<GroupRow>> {
    let mut stmt = conn
        .prepare_cached(&format!("{SELECT_GROUP} WHERE group_id = ?1"))
        .map_sqlite(conn)?;
    stmt.query_row([group_id], map_row).optional().map_sqlite(conn)
}

pub fn all(conn: &Connection) -> EmberResult<Vec<GroupRow>> {
    let mut stmt = conn.prepare_cached(SELECT_GROUP).map_sqlite(conn)?;
    let rows = stmt.query_map([], map_row).map_sqlite(conn)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_sqlite(conn)
}
