//! Applying decoded operations to the user's own tables: the "Normal apply"
//! and conflict-merge steps of the import pipeline (§4.6). Every function
//! here writes into tables the caller does not own; the caller is
//! responsible for suppressing change capture around every call, or the
//! write would be captured as a brand new local operation.

use rusqlite::{params_from_iter, types::Value as SqlValue};

use crate::codec::{decode_pk, Value, ValueMap};
use crate::error::Result;
use crate::log::schema_info::primary_key_columns;

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_sql(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
        // Arrays never appear as a column value; capture only ever produces
        // scalar columns from `json_object(...)`.
        Value::Array(_) => SqlValue::Null,
    }
}

fn where_pk(pk_columns: &[String]) -> String {
    pk_columns
        .iter()
        .map(|c| format!("{} = ?", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `INSERT OR IGNORE` of `values`, which must already include the primary
/// key columns (capture always records them as ordinary columns).
pub fn insert_or_ignore(conn: &rusqlite::Connection, table_name: &str, values: &ValueMap) -> Result<()> {
    let columns: Vec<&String> = values.keys().collect();
    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
    let sql = format!(
        "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
        quote_ident(table_name),
        quoted.join(", "),
        placeholders.join(", ")
    );
    let params: Vec<SqlValue> = columns.iter().map(|c| to_sql(&values[**c])).collect();
    conn.execute(&sql, params_from_iter(params))?;
    Ok(())
}

/// `UPDATE` of `values` matched by primary key; falls back to
/// [`insert_or_ignore`] if no row matched, since the remote op may be
/// creating a row that does not exist locally yet.
pub fn update_or_insert(conn: &rusqlite::Connection, table_name: &str, row_pk: &[u8], values: &ValueMap) -> Result<()> {
    let pk_columns = primary_key_columns(conn, table_name)?;
    let pk_values = decode_pk(row_pk)?;

    let set_columns: Vec<&String> = values.keys().filter(|c| !pk_columns.contains(c)).collect();
    if !set_columns.is_empty() {
        let set_clause: Vec<String> = set_columns.iter().map(|c| format!("{} = ?", quote_ident(c))).collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(table_name),
            set_clause.join(", "),
            where_pk(&pk_columns)
        );
        let mut params: Vec<SqlValue> = set_columns.iter().map(|c| to_sql(&values[**c])).collect();
        params.extend(pk_values.iter().map(to_sql));
        let affected = conn.execute(&sql, params_from_iter(params))?;
        if affected > 0 {
            return Ok(());
        }
    }
    insert_or_ignore(conn, table_name, values)
}

/// Deletes the row keyed by `row_pk`, if it exists.
pub fn delete(conn: &rusqlite::Connection, table_name: &str, row_pk: &[u8]) -> Result<()> {
    let pk_columns = primary_key_columns(conn, table_name)?;
    let pk_values = decode_pk(row_pk)?;
    let sql = format!("DELETE FROM {} WHERE {}", quote_ident(table_name), where_pk(&pk_columns));
    let params: Vec<SqlValue> = pk_values.iter().map(to_sql).collect();
    conn.execute(&sql, params_from_iter(params))?;
    Ok(())
}

/// Upserts `values` keyed by primary key: the conflict path's merge apply.
/// A true upsert rather than insert-or-ignore, since a resolved merge must
/// win over whatever is currently in the row.
pub fn upsert(conn: &rusqlite::Connection, table_name: &str, row_pk: &[u8], values: &ValueMap) -> Result<()> {
    let pk_columns = primary_key_columns(conn, table_name)?;
    let pk_values = decode_pk(row_pk)?;

    let mut columns: Vec<String> = values.keys().cloned().collect();
    for pk_col in &pk_columns {
        if !columns.contains(pk_col) {
            columns.push(pk_col.clone());
        }
    }

    let col_values: Vec<SqlValue> = columns
        .iter()
        .map(|c| match values.get(c) {
            Some(v) => to_sql(v),
            None => {
                let pos = pk_columns.iter().position(|p| p == c).expect("pk column added above");
                to_sql(&pk_values[pos])
            }
        })
        .collect();

    let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<&str> = columns.iter().map(|_| "?").collect();
    let conflict_cols: Vec<String> = pk_columns.iter().map(|c| quote_ident(c)).collect();
    let update_clause: Vec<String> = columns
        .iter()
        .filter(|c| !pk_columns.contains(c))
        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
        .collect();

    let sql = if update_clause.is_empty() {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING",
            quote_ident(table_name),
            quoted.join(", "),
            placeholders.join(", "),
            conflict_cols.join(", ")
        )
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
            quote_ident(table_name),
            quoted.join(", "),
            placeholders.join(", "),
            conflict_cols.join(", "),
            update_clause.join(", ")
        )
    };

    conn.execute(&sql, params_from_iter(col_values))?;
    Ok(())
}
