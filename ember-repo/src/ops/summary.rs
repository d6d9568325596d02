//! `message_daily_summary` operations (static `summary.db`).

use std::collections::HashMap;

use ember_core::{EmberResult, ValidationError};
use ember_storage::SqliteResultExt;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

pub const HOURS_PER_DAY: usize = 24;

/// One user's activity on one day. `record_date` is `YYYYMMDD`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub group_id: String,
    pub user_id: String,
    pub record_date: i64,
    pub msg_count: i64,
    pub hourly_counts: Vec<u32>,
}

/// Insert summaries, refreshing count and histogram of an existing day.
pub fn bulk_upsert(conn: &Connection, records: &[SummaryRecord]) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO message_daily_summary (group_id, user_id, record_date, msg_count, hourly_counts)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(group_id, user_id, record_date) DO UPDATE SET
                 msg_count = excluded.msg_count,
                 hourly_counts = excluded.hourly_counts",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for record in records {
        if record.hourly_counts.len() != HOURS_PER_DAY {
            return Err(ValidationError::InvalidValue {
                field: "hourly_counts".to_string(),
                reason: format!("expected {HOURS_PER_DAY} slots, got {}", record.hourly_counts.len()),
            }
            .into());
        }
        let hourly = serde_json::to_string(&record.hourly_counts).map_err(|e| {
            ValidationError::InvalidValue {
                field: "hourly_counts".to_string(),
                reason: e.to_string(),
            }
        })?;
        affected += stmt
            .execute(params![
                record.group_id,
                record.user_id,
                record.record_date,
                record.msg_count,
                hourly
            ])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

/// 1-based rank of every user of a group on `record_date`, by message count.
pub fn ranks_by_date(
    conn: &Connection,
    group_id: &str,
    record_date: i64,
) -> EmberResult<HashMap<String, usize>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT user_id FROM message_daily_summary
             WHERE group_id = ?1 AND record_date = ?2
             ORDER BY msg_count DESC, user_id",
        )
        .map_sqlite(conn)?;
    let rows = stmt
        .query_map(params![group_id, record_date], |row| row.get::<_, String>(0))
        .map_sqlite(conn)?;

    let mut ranks = HashMap::new();
    for (idx, row) in rows.enumerate() {
        ranks.insert(row.map_sqlite(conn)?, idx + 1);
    }
    Ok(ranks)
}

/// Stored summary for one user and day.
pub fn get(
    conn: &Connection,
    group_id: &str,
    user_id: &str,
    record_date: i64,
) -> EmberResult<Option<SummaryRecord>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT msg_count, hourly_counts FROM message_daily_summary
             WHERE group_id = ?1 AND user_id = ?2 AND record_date = ?3",
        )
        .map_sqlite(conn)?;
    let row = stmt
        .query_row(params![group_id, user_id, record_date], |row| {
            let hourly: String = row.get(1)?;
            let hourly_counts = serde_json::from_str::<Vec<u32>>(&hourly).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
            })?;
            Ok((row.get::<_, i64>(0)?, hourly_counts))
        })
        .optional()
        .map_sqlite(conn)?;

    Ok(row.map(|(msg_count, hourly_counts)| SummaryRecord {
        group_id: group_id.to_string(),
        user_id: user_id.to_string(),
        record_date,
        msg_count,
        hourly_counts,
    }))
}
