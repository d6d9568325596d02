//! SQL operations, one module per table family.
//!
//! Every function takes a `&Connection` (a `&Transaction` derefs to one) and
//! runs inside whatever unit of work the caller opened. Bulk operations
//! prepare their statement once with `prepare_cached` and execute it per row.

pub mod audit;
pub mod blacklist;
pub mod groups;
pub mod invitations;
pub mod members;
pub mod messages;
pub mod plugins;
pub mod snapshots;
pub mod summary;
pub mod users;

use ember_core::EnumParseError;
use rusqlite::types::Type;
use rusqlite::Row;

/// Read a TEXT column through an enum's `from_db_str`.
pub(crate) fn enum_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: fn(&str) -> Result<T, EnumParseError>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

#[cfg(test)]
pub(crate) fn memory_db(ddl: &str) -> rusqlite::Connection {
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    conn.execute_batch(ddl).unwrap();
    conn
}
