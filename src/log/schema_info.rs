//! Table introspection for change capture and trigger generation.
//!
//! Primary key columns must be read in *primary key sequence*, not table
//! column-declaration order: `PRAGMA table_info` reports each column's
//! position in a composite key via its `pk` field (1-based, 0 if the column
//! isn't part of the key), but it yields rows in column-declaration order.
//! A table declared `PRIMARY KEY (b, a)` with columns `(a, b)` reports `a`
//! before `b` positionally even though `b` is the first key column — sorting
//! by `pk` index is the only way to recover the declared key order, which
//! is what `row_pk` encoding and decoding must agree on.

use rusqlite::Connection;

use crate::error::{Result, SyncError};

/// All columns of `table_name` in declaration order, alongside which of
/// them form the primary key (see module docs for why the latter needs a
/// sort pass the former doesn't).
pub struct TableInfo {
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
}

pub fn table_info(conn: &Connection, table_name: &str) -> Result<TableInfo> {
    let sql = format!("PRAGMA table_info({table_name})");
    let mut stmt = conn.prepare(&sql)?;

    let mut columns = Vec::new();
    let mut pk_candidates: Vec<(i64, String)> = Vec::new();

    let rows = stmt.query_map([], |row| {
        let name: String = row.get(1)?;
        let pk_index: i64 = row.get(5)?;
        Ok((name, pk_index))
    })?;

    for row in rows {
        let (name, pk_index) = row?;
        if pk_index > 0 {
            pk_candidates.push((pk_index, name.clone()));
        }
        columns.push(name);
    }

    if columns.is_empty() {
        return Err(SyncError::schema(format!(
            "table '{table_name}' not found or has no columns"
        )));
    }

    pk_candidates.sort_by_key(|(index, _)| *index);
    let primary_key = pk_candidates.into_iter().map(|(_, name)| name).collect();

    Ok(TableInfo { columns, primary_key })
}

/// Primary key column names for `table_name`, in declared key order.
pub fn primary_key_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let info = table_info(conn, table_name)?;
    if info.primary_key.is_empty() {
        return Err(SyncError::validation_field(
            "table has no primary key; sync requires one",
            "table_name",
            table_name,
        ));
    }
    Ok(info.primary_key)
}
