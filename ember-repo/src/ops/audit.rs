//! `sys_audit_log` operations (log shards).

use ember_core::{AuditAction, AuditCategory, AuditContext, EmberResult};
use ember_storage::SqliteResultExt;
use rusqlite::{params, Connection, Row};
use serde_json::Value;

use super::enum_column;

#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub target_id: Option<String>,
    pub context_type: AuditContext,
    pub context_id: Option<String>,
    pub operator_id: Option<String>,
    pub category: AuditCategory,
    pub action: AuditAction,
    pub summary: Option<String>,
    pub meta_data: Option<Value>,
    pub created_at: i64,
}

impl AuditRecord {
    pub fn new(
        context_type: AuditContext,
        category: AuditCategory,
        action: AuditAction,
        created_at: i64,
    ) -> Self {
        Self {
            target_id: None,
            context_type,
            context_id: None,
            operator_id: None,
            category,
            action,
            summary: None,
            meta_data: None,
            created_at,
        }
    }

    pub fn target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    pub fn operator(mut self, operator_id: Option<String>) -> Self {
        self.operator_id = operator_id;
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn meta(mut self, meta_data: Value) -> Self {
        self.meta_data = Some(meta_data);
        self
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let meta: Option<String> = row.get(7)?;
    Ok(AuditRecord {
        target_id: row.get(0)?,
        context_type: enum_column(row, 1, AuditContext::from_db_str)?,
        context_id: row.get(2)?,
        operator_id: row.get(3)?,
        category: enum_column(row, 4, AuditCategory::from_db_str)?,
        action: enum_column(row, 5, AuditAction::from_db_str)?,
        summary: row.get(6)?,
        // Unparseable metadata reads as absent rather than failing the row.
        meta_data: meta.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: row.get(8)?,
    })
}

pub fn insert(conn: &Connection, record: &AuditRecord) -> EmberResult<()> {
    bulk_insert(conn, std::slice::from_ref(record)).map(|_| ())
}

pub fn bulk_insert(conn: &Connection, records: &[AuditRecord]) -> EmberResult<usize> {
    let mut stmt = conn
        .prepare_cached(
            "INSERT INTO sys_audit_log
                 (target_id, context_type, context_id, operator_id, category, action, summary, meta_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .map_sqlite(conn)?;
    let mut affected = 0;
    for record in records {
        let meta = record.meta_data.as_ref().map(Value::to_string);
        affected += stmt
            .execute(params![
                record.target_id,
                record.context_type.as_db_str(),
                record.context_id,
                record.operator_id,
                record.category.as_db_str(),
                record.action.as_db_str(),
                record.summary,
                meta,
                record.created_at
            ])
            .map_sqlite(conn)?;
    }
    Ok(affected)
}

/// Records about `target_id`, oldest first.
pub fn by_target(conn: &Connection, target_id: &str) -> EmberResult<Vec<AuditRecord>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT target_id, context_type, context_id, operator_id, category, action, summary, meta_data, created_at
             FROM sys_audit_log WHERE target_id = ?1 ORDER BY created_at, id",
        )
        .map_sqlite(conn)?;
    let rows = stmt.query_map([target_id], map_row).map_sqlite(conn)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_sqlite(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::memory_db;
    use crate::schema::LOG_SCHEMA;
    use serde_json::json;

    #[test]
    fn test_insert_and_read_back() {
        let conn = memory_db(LOG_SCHEMA);
        let record = AuditRecord::new(
            AuditContext::Group,
            AuditCategory::Access,
            AuditAction::Ban,
            1_700_000_000,
        )
        .target("u1")
        .context("g1")
        .operator(Some("op".to_string()))
        .meta(json!({ "reason": "spam" }));
        insert(&conn, &record).unwrap();

        let found = by_target(&conn, "u1").unwrap();
        assert_eq!(found, vec![record]);
    }

    #[test]
    fn test_bulk_insert_orders_by_time() {
        let conn = memory_db(LOG_SCHEMA);
        let late = AuditRecord::new(AuditContext::User, AuditCategory::Permission, AuditAction::Change, 20)
            .target("u1");
        let early = AuditRecord::new(AuditContext::User, AuditCategory::Permission, AuditAction::Grant, 10)
            .target("u1");
        assert_eq!(bulk_insert(&conn, &[late, early]).unwrap(), 2);

        let actions: Vec<_> = by_target(&conn, "u1").unwrap().into_iter().map(|r| r.action).collect();
        assert_eq!(actions, [AuditAction::Grant, AuditAction::Change]);
    }
}
