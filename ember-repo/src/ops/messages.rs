//! `message_log` operations (message shards).
//!
//! Time bounds are unix seconds, inclusive at both ends.

use ember_core::EmberResult;
use ember_storage::SqliteResultExt;
use rusqlite::{params, Connection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub group_id: String,
    pub user_id: String,
    pub created_at: i64,
}

pub fn bulk_insert(conn: &Connection, messages: &[MessageRecord]) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached("INSERT INTO message_log (group_id, user_id, created_at) VALUES (?1, ?2, ?3)")
        .map_sqlite(conn)?;
    let mut affected = 0;
    for message in messages {
        affected += stmt
            .execute(params![message.group_id, message.user_id, message.created_at])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

/// Most active users of a group, highest count first.
pub fn top_users(
    conn: &Connection,
    group_id: &str,
    start: i64,
    end: i64,
    limit: usize,
) -> EmberResult<Vec<(String, i64)>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT user_id, COUNT(id) AS cnt FROM message_log
             WHERE group_id = ?1 AND created_at >= ?2 AND created_at <= ?3
             GROUP BY user_id ORDER BY cnt DESC, user_id LIMIT ?4",
        )
        .map_sqlite(conn)?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt
        .query_map(params![group_id, start, end, limit], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .map_sqlite(conn)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_sqlite(conn)
}

pub fn count_for_group(conn: &Connection, group_id: &str, start: i64, end: i64) -> EmberResult<i64> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT COUNT(id) FROM message_log
             WHERE group_id = ?1 AND created_at >= ?2 AND created_at <= ?3",
        )
        .map_sqlite(conn)?;
    stmt.query_row(params![group_id, start, end], |row| row.get(0))
        .map_sqlite(conn)
}

/// `(user_id, created_at)` for every message of the given users.
pub fn user_timestamps(
    conn: &Connection,
    group_id: &str,
    user_ids: &[String],
    start: i64,
    end: i64,
) -> EmberResult<Vec<(String, i64)>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT user_id, created_at FROM message_log
             WHERE group_id = ?1 AND user_id = ?2 AND created_at >= ?3 AND created_at <= ?4",
        )
        .map_sqlite(conn)?;
    let mut out = Vec::new();
    for user_id in user_ids {
        let rows = stmt
            .query_map(params![group_id, user_id, start, end], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_sqlite(conn)?;
        for row in rows {
            out.push(row.map_sqlite(conn)?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::memory_db;
    use crate::schema::MESSAGE_LOG_SCHEMA;

    fn msg(group: &str, user: &str, at: i64) -> MessageRecord {
        MessageRecord {
            group_id: group.to_string(),
            user_id: user.to_string(),
            created_at: at,
        }
    }

    fn seeded() -> Connection {
        let conn = memory_db(MESSAGE_LOG_SCHEMA);
        bulk_insert(
            &conn,
            &[
                msg("g1", "alice", 10),
                msg("g1", "alice", 20),
                msg("g1", "bob", 30),
                msg("g1", "alice", 40),
                msg("g1", "carol", 500),
                msg("g2", "bob", 15),
            ],
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_top_users_ranks_by_count() {
        let conn = seeded();
        let top = top_users(&conn, "g1", 0, 100, 10).unwrap();
        assert_eq!(top, vec![("alice".to_string(), 3), ("bob".to_string(), 1)]);

        let limited = top_users(&conn, "g1", 0, 1_000, 1).unwrap();
        assert_eq!(limited, vec![("alice".to_string(), 3)]);
    }

    #[test]
    fn test_count_bounds_are_inclusive() {
        let conn = seeded();
        assert_eq!(count_for_group(&conn, "g1", 10, 40).unwrap(), 4);
        assert_eq!(count_for_group(&conn, "g1", 11, 39).unwrap(), 2);
        assert_eq!(count_for_group(&conn, "g3", 0, 1_000).unwrap(), 0);
    }

    #[test]
    fn test_user_timestamps_filters_users() {
        let conn = seeded();
        let mut stamps = user_timestamps(&conn, "g1", &["bob".to_string(), "carol".to_string()], 0, 1_000)
            .unwrap();
        stamps.sort();
        assert_eq!(stamps, vec![("bob".to_string(), 30), ("carol".to_string(), 500)]);
    }
}
