//! `biz_group_plugin_setting` operations.

use std::collections::{BTreeMap, BTreeSet};

use ember_core::EmberResult;
use ember_storage::SqliteResultExt;
use rusqlite::{params, Connection};

pub fn set_enabled(
    conn: &Connection,
    group_id: &str,
    plugin_name: &str,
    enabled: bool,
    operator_id: Option<&str>,
    at: i64,
) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO biz_group_plugin_setting
                 (group_id, plugin_name, is_enabled, last_operator_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(group_id, plugin_name) DO UPDATE SET
                 is_enabled = excluded.is_enabled,
                 last_operator_id = excluded.last_operator_id,
                 updated_at = excluded.updated_at",
        )
        .map_sqlite(conn)?;
    stmt.execute(params![group_id, plugin_name, enabled, operator_id, at])
        .map_sqlite(conn)
}

/// Disabled plugin names per group. Groups with nothing disabled are absent.
pub fn disabled_by_group(conn: &Connection) -> EmberResult<BTreeMap<String, BTreeSet<String>>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT group_id, plugin_name FROM biz_group_plugin_setting WHERE is_enabled = 0",
        )
        .map_sqlite(conn)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_sqlite(conn)?;

    let mut disabled: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for row in rows {
        let (group_id, plugin) = row.map_sqlite(conn)?;
        disabled.entry(group_id).or_default().insert(plugin);
    }
    Ok(disabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::memory_db;
    use crate::schema::CORE_SCHEMA;

    #[test]
    fn test_disable_then_enable() {
        let conn = memory_db(CORE_SCHEMA);
        set_enabled(&conn, "g1", "water", false, Some("10001"), 1).unwrap();
        set_enabled(&conn, "g1", "echo", false, None, 1).unwrap();
        set_enabled(&conn, "g2", "water", true, None, 1).unwrap();

        let disabled = disabled_by_group(&conn).unwrap();
        assert_eq!(disabled.len(), 1);
        assert_eq!(
            disabled["g1"].iter().map(String::as_str).collect::<Vec<_>>(),
            ["echo", "water"]
        );

        set_enabled(&conn, "g1", "water", true, None, 2).unwrap();
        let disabled = disabled_by_group(&conn).unwrap();
        assert!(!disabled["g1"].contains("water"));
    }
}
