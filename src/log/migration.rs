//! `sync_schema_migrations` bookkeeping: the additive-change history a peer
//! handshake and [`crate::replica::Replica::check_compatibility`] use to
//! reason about whether a replica announcing an older `schema_version` can
//! be caught up safely without a full resync.

use rusqlite::{params, Row};

use crate::codec::new_id;
use crate::error::Result;

/// One applied migration: currently always an `ADD COLUMN`, since that is
/// the only additive change [`crate::replica::Replica::migrate_schema`]
/// exposes.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaMigration {
    pub table_name: String,
    pub column_name: Option<String>,
    pub column_type: Option<String>,
    pub default_value: Option<String>,
    pub applied_at: i64,
    pub schema_version_after: i64,
}

const SELECT_COLUMNS: &str =
    "table_name, column_name, column_type, default_value, applied_at, schema_version_after";

fn from_row(row: &Row<'_>) -> rusqlite::Result<SchemaMigration> {
    Ok(SchemaMigration {
        table_name: row.get(0)?,
        column_name: row.get(1)?,
        column_type: row.get(2)?,
        default_value: row.get(3)?,
        applied_at: row.get(4)?,
        schema_version_after: row.get(5)?,
    })
}

/// Records an additive column migration and the schema version it produced.
pub fn record_add_column(
    conn: &rusqlite::Connection,
    table_name: &str,
    column_name: &str,
    column_type: &str,
    default_value: Option<&str>,
    applied_at: i64,
    schema_version_after: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_schema_migrations \
         (migration_id, table_name, migration_type, column_name, column_type, default_value, applied_at, schema_version_after) \
         VALUES (?, ?, 'ADD_COLUMN', ?, ?, ?, ?, ?)",
        params![
            new_id().to_vec(),
            table_name,
            column_name,
            column_type,
            default_value,
            applied_at,
            schema_version_after,
        ],
    )?;
    Ok(())
}

/// Every migration applied after `since_version`, oldest first — the set a
/// peer announcing `since_version` still needs in order to catch up.
pub fn pending_since(conn: &rusqlite::Connection, since_version: i64) -> Result<Vec<SchemaMigration>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM sync_schema_migrations WHERE schema_version_after > ? ORDER BY schema_version_after ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![since_version], from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
