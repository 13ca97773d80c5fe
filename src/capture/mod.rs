//! Change capture (C4): SQLite triggers that turn ordinary `INSERT`/
//! `UPDATE`/`DELETE` statements against a user table into appended rows in
//! `sync_operations`, inside the same transaction as the write itself.
//!
//! The trigger bodies are generated once, at [`enable`] time, from the
//! table's current column list and declared primary key — they contain no
//! dynamic SQL of their own, only calls into a handful of scalar functions
//! registered by [`install_scalar_functions`] that bridge into the codec,
//! clock, and id modules. This keeps the SQL itself simple and keeps the
//! actual encoding/ordering logic in one place, tested once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::functions::{Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};

use crate::clock::{HlClock, VectorClock};
use crate::codec::{self, id_to_hex, new_id, Value};
use crate::config;
use crate::error::{Result, SyncError};
use crate::log::{metadata, schema_info};

fn to_user_fn_error(e: SyncError) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(e))
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

fn sqlite_value_to_value(ctx: &Context<'_>, idx: usize) -> rusqlite::Result<Value> {
    Ok(match ctx.get_raw(idx) {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    })
}

/// Registers every `sync_*` scalar function the generated triggers call.
/// Safe to call more than once on the same connection: each registration
/// simply replaces the previous one under the same name.
///
/// `hlc` supplies per-row HLC timestamps and `suppressed` lets
/// [`crate::import`] silence capture while it replays a batch — without
/// that flag, applying an imported operation to the user's table would
/// itself be captured as a brand new local operation, duplicating history
/// forever.
pub fn install_scalar_functions(conn: &Connection, hlc: Arc<HlClock>, suppressed: Arc<AtomicBool>) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8;

    conn.create_scalar_function("sync_is_disabled", 0, flags, move |_ctx: &Context<'_>| {
        Ok(suppressed.load(Ordering::SeqCst) as i64)
    })?;

    conn.create_scalar_function("sync_uuid_v7", 0, flags, |_ctx: &Context<'_>| Ok(new_id().to_vec()))?;

    conn.create_scalar_function("sync_now_micros", 0, flags, |_ctx: &Context<'_>| Ok(now_micros()))?;

    conn.create_scalar_function("sync_schema_version_i64", 1, flags, |ctx: &Context<'_>| {
        let bytes: Vec<u8> = ctx.get(0)?;
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| to_user_fn_error(SyncError::schema("malformed schema_version metadata blob")))?;
        Ok(i64::from_be_bytes(array))
    })?;

    conn.create_scalar_function("sync_vector_clock_increment", 2, flags, |ctx: &Context<'_>| {
        let device_id: Vec<u8> = ctx.get(0)?;
        let vc_text: String = ctx.get(1)?;
        let mut vc = VectorClock::from_json(&vc_text).map_err(to_user_fn_error)?;
        vc.increment(&hex::encode(&device_id));
        vc.to_json().map_err(to_user_fn_error)
    })?;

    {
        let hlc = hlc.clone();
        conn.create_scalar_function("sync_hlc_now", 1, flags, move |_ctx: &Context<'_>| Ok(hlc.now().pack()))?;
    }

    conn.create_scalar_function("sync_pack_values", 1, flags, |ctx: &Context<'_>| {
        let json: String = ctx.get(0)?;
        let map = codec::value::map_from_json(&json).map_err(to_user_fn_error)?;
        codec::encode_map(&map).map_err(to_user_fn_error)
    })?;

    conn.create_scalar_function("sync_pack_pk", -1, flags, |ctx: &Context<'_>| {
        let mut parts = Vec::with_capacity(ctx.len());
        for i in 0..ctx.len() {
            parts.push(sqlite_value_to_value(ctx, i)?);
        }
        codec::encode_pk(&parts).map_err(to_user_fn_error)
    })?;

    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn trigger_name(table_name: &str, op: &str) -> String {
    format!("sync_trg_{table_name}_{op}")
}

fn json_object_expr(row_ref: &str, columns: &[String]) -> String {
    let pairs: Vec<String> = columns
        .iter()
        .map(|c| format!("'{c}', {row_ref}.{}", quote_ident(c)))
        .collect();
    format!("json_object({})", pairs.join(", "))
}

fn pk_pack_expr(row_ref: &str, pk_columns: &[String]) -> String {
    let args: Vec<String> = pk_columns.iter().map(|c| format!("{row_ref}.{}", quote_ident(c))).collect();
    format!("sync_pack_pk({})", args.join(", "))
}

/// Builds the `BEGIN ... END` body shared by all three trigger kinds. Each
/// capture fires two statements: one that advances the device's vector
/// clock counter in `sync_metadata` (reading the pre-increment value so two
/// rows touched in the same transaction still get distinct counters), and
/// one that appends the operation reading the now-advanced clock back out.
/// `applied_at` and `created_at` both call `sync_now_micros()` independently
/// and may differ by a few microseconds — harmless, since neither ordering
/// nor causality ever consults `applied_at`.
fn trigger_sql(
    table_name: &str,
    op: &str,
    device_hex: &str,
    row_pk_expr: &str,
    old_values_expr: &str,
    new_values_expr: &str,
    event: &str,
) -> String {
    format!(
        "CREATE TRIGGER {trigger_name}
AFTER {event} ON {table}
WHEN sync_is_disabled() = 0
BEGIN
  UPDATE sync_metadata SET value = CAST(sync_vector_clock_increment(X'{device_hex}', CAST(value AS TEXT)) AS BLOB)
    WHERE key = 'vector_clock';
  INSERT INTO sync_operations (
    op_id, device_id, parent_op_id, vector_clock, hlc, table_name, op_type,
    row_pk, old_values, new_values, schema_version, created_at, is_local, applied_at
  ) VALUES (
    sync_uuid_v7(),
    X'{device_hex}',
    (SELECT op_id FROM sync_operations WHERE device_id = X'{device_hex}' ORDER BY created_at DESC LIMIT 1),
    CAST((SELECT value FROM sync_metadata WHERE key = 'vector_clock') AS TEXT),
    sync_hlc_now(X'{device_hex}'),
    '{table}',
    '{op_type}',
    {row_pk_expr},
    {old_values_expr},
    {new_values_expr},
    sync_schema_version_i64((SELECT value FROM sync_metadata WHERE key = 'schema_version')),
    sync_now_micros(),
    1,
    sync_now_micros()
  );
END",
        trigger_name = trigger_name(table_name, op),
        table = quote_ident(table_name),
        op_type = op.to_uppercase(),
    )
}

/// Installs (or reinstalls) change-capture triggers on `table_name`.
/// Idempotent: any previously installed triggers for this table are
/// dropped first, so calling this again after [`crate::replica::Replica::migrate_schema`]
/// adds a column picks up the new column in the captured row snapshot.
pub fn enable(conn: &Connection, table_name: &str) -> Result<()> {
    config::validate_table_name(table_name)?;
    let device_id = metadata::get_device_id(conn)?;
    let info = schema_info::table_info(conn, table_name)?;
    if info.primary_key.is_empty() {
        return Err(SyncError::validation_field(
            "table has no primary key; change capture requires one",
            "table_name",
            table_name,
        ));
    }

    disable(conn, table_name)?;

    let device_hex = id_to_hex(&device_id);
    let columns = &info.columns;
    let pk = &info.primary_key;

    let insert_sql = trigger_sql(
        table_name,
        "insert",
        &device_hex,
        &pk_pack_expr("NEW", pk),
        "NULL",
        &format!("sync_pack_values({})", json_object_expr("NEW", columns)),
        "INSERT",
    );
    let update_sql = trigger_sql(
        table_name,
        "update",
        &device_hex,
        &pk_pack_expr("NEW", pk),
        &format!("sync_pack_values({})", json_object_expr("OLD", columns)),
        &format!("sync_pack_values({})", json_object_expr("NEW", columns)),
        "UPDATE",
    );
    let delete_sql = trigger_sql(
        table_name,
        "delete",
        &device_hex,
        &pk_pack_expr("OLD", pk),
        &format!("sync_pack_values({})", json_object_expr("OLD", columns)),
        "NULL",
        "DELETE",
    );

    conn.execute_batch(&format!("{insert_sql};\n{update_sql};\n{delete_sql};"))?;
    Ok(())
}

/// Drops `table_name`'s capture triggers, if any. Not an error if they were
/// never installed.
pub fn disable(conn: &Connection, table_name: &str) -> Result<()> {
    for op in ["insert", "update", "delete"] {
        conn.execute(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(&trigger_name(table_name, op))), [])?;
    }
    Ok(())
}

pub fn is_enabled(conn: &Connection, table_name: &str) -> Result<bool> {
    let name = trigger_name(table_name, "insert");
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'trigger' AND name = ?",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Every table with capture currently enabled, derived from the installed
/// trigger names rather than a separate bookkeeping table.
pub fn captured_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'trigger' AND name LIKE 'sync_trg_%_insert'")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names
        .into_iter()
        .filter_map(|n| n.strip_prefix("sync_trg_").and_then(|s| s.strip_suffix("_insert")).map(String::from))
        .collect())
}
