//! `obs_user_snapshot` / `obs_group_snapshot` operations (snapshot shards).
//!
//! User names are recorded under [`GLOBAL_SCOPE`]; member cards under the
//! group they belong to.

use ember_core::{EmberResult, SnapshotEventType, GLOBAL_SCOPE};
use ember_storage::SqliteResultExt;
use rusqlite::{params, Connection, Row};

use super::enum_column;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSnapshot {
    pub user_id: String,
    pub group_id: String,
    pub event_type: SnapshotEventType,
    pub content: String,
    pub created_at: i64,
}

impl UserSnapshot {
    pub fn name(user_id: &str, name: &str, created_at: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            group_id: GLOBAL_SCOPE.to_string(),
            event_type: SnapshotEventType::UserName,
            content: name.to_string(),
            created_at,
        }
    }

    pub fn card(group_id: &str, user_id: &str, card: &str, created_at: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            group_id: group_id.to_string(),
            event_type: SnapshotEventType::Card,
            content: card.to_string(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub group_id: String,
    pub event_type: SnapshotEventType,
    pub content: String,
    pub created_at: i64,
}

impl GroupSnapshot {
    pub fn name(group_id: &str, name: &str, created_at: i64) -> Self {
        Self {
            group_id: group_id.to_string(),
            event_type: SnapshotEventType::GroupName,
            content: name.to_string(),
            created_at,
        }
    }
}

pub fn bulk_insert_user(conn: &Connection, snapshots: &[UserSnapshot]) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO obs_user_snapshot (user_id, group_id, event_type, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for snap in snapshots {
        affected += stmt
            .execute(params![
                snap.user_id,
                snap.group_id,
                snap.event_type.as_db_str(),
                snap.content,
                snap.created_at
            ])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

pub fn bulk_insert_group(conn: &Connection, snapshots: &[GroupSnapshot]) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO obs_group_snapshot (group_id, event_type, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for snap in snapshots {
        affected += stmt
            .execute(params![
                snap.group_id,
                snap.event_type.as_db_str(),
                snap.content,
                snap.created_at
            ])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<UserSnapshot> {
    Ok(UserSnapshot {
        user_id: row.get(0)?,
        group_id: row.get(1)?,
        event_type: enum_column(row, 2, SnapshotEventType::from_db_str)?,
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Snapshots of one user within `group_id` (use [`GLOBAL_SCOPE`] for names).
pub fn user_history(
    conn: &Connection,
    user_id: &str,
    group_id: &str,
) -> EmberResult<Vec<UserSnapshot>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT user_id, group_id, event_type, content, created_at FROM obs_user_snapshot
             WHERE user_id = ?1 AND group_id = ?2 ORDER BY created_at, id",
        )
        .map_sqlite(conn)?;
    let rows = stmt.query_map([user_id, group_id], map_user).map_sqlite(conn)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_sqlite(conn)
}

pub fn group_history(conn: &Connection, group_id: &str) -> EmberResult<Vec<GroupSnapshot>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT group_id, event_type, content, created_at FROM obs_group_snapshot
             WHERE group_id = ?1 ORDER BY created_at, id",
        )
        .map_sqlite(conn)?;
    let rows = stmt
        .query_map([group_id], |row| {
            Ok(GroupSnapshot {
                group_id: row.get(0)?,
                event_type: enum_column(row, 1, SnapshotEventType::from_db_str)?,
                content: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .map_sqlite(conn)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_sqlite(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::memory_db;
    use crate::schema::SNAPSHOT_SCHEMA;

    #[test]
    fn test_names_and_cards_are_separate_histories() {
        let conn = memory_db(SNAPSHOT_SCHEMA);
        bulk_insert_user(
            &conn,
            &[
                UserSnapshot::name("u1", "Alice", 1),
                UserSnapshot::card("g1", "u1", "Al", 2),
                UserSnapshot::name("u1", "Alicia", 3),
            ],
        )
        .unwrap();

        let names: Vec<_> = user_history(&conn, "u1", GLOBAL_SCOPE)
            .unwrap()
            .into_iter()
            .map(|s| s.content)
            .collect();
        assert_eq!(names, ["Alice", "Alicia"]);

        let cards = user_history(&conn, "u1", "g1").unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].event_type, SnapshotEventType::Card);
    }

    #[test]
    fn test_group_history() {
        let conn = memory_db(SNAPSHOT_SCHEMA);
        bulk_insert_group(&conn, &[GroupSnapshot::name("g1", "Rust", 5)]).unwrap();
        let history = group_history(&conn, "g1").unwrap();
        assert_eq!(history, vec![GroupSnapshot::name("g1", "Rust", 5)]);
        assert!(group_history(&conn, "g2").unwrap().is_empty());
    }
}
