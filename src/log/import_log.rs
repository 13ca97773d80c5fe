//! `sync_import_log`: the audit trail of every bundle import, keyed by
//! content hash for idempotency (invariant `IDEMPOTENT_IMPORT`).

use rusqlite::{params, OptionalExtension, Row};

use crate::codec::{new_id, Id};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq)]
pub struct ImportLogEntry {
    pub import_id: Id,
    pub bundle_id: Id,
    pub bundle_hash: [u8; 32],
    pub imported_at: i64,
    pub source_device_id: Id,
    pub op_count: i64,
    pub applied_count: i64,
    pub conflict_count: i64,
    pub duplicate_count: i64,
}

fn to_id(bytes: Vec<u8>) -> Id {
    bytes.try_into().unwrap_or([0u8; 16])
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<ImportLogEntry> {
    let import_id: Vec<u8> = row.get(0)?;
    let bundle_id: Vec<u8> = row.get(1)?;
    let bundle_hash: Vec<u8> = row.get(2)?;
    Ok(ImportLogEntry {
        import_id: to_id(import_id),
        bundle_id: to_id(bundle_id),
        bundle_hash: bundle_hash.try_into().unwrap_or([0u8; 32]),
        imported_at: row.get(3)?,
        source_device_id: to_id(row.get::<_, Vec<u8>>(4)?),
        op_count: row.get(5)?,
        applied_count: row.get(6)?,
        conflict_count: row.get(7)?,
        duplicate_count: row.get(8)?,
    })
}

const SELECT_COLUMNS: &str = "import_id, bundle_id, bundle_hash, imported_at, source_device_id, \
op_count, applied_count, conflict_count, duplicate_count";

/// Records a bundle import. Fails if `bundle_hash` was already imported —
/// callers should treat that as "nothing new to do", not a hard error, by
/// checking [`get_import_by_bundle_hash`] first.
#[allow(clippy::too_many_arguments)]
pub fn record_import(
    conn: &rusqlite::Connection,
    bundle_id: &Id,
    bundle_hash: &[u8; 32],
    source_device_id: &Id,
    imported_at: i64,
    op_count: i64,
    applied_count: i64,
    conflict_count: i64,
    duplicate_count: i64,
) -> Result<Id> {
    let import_id = new_id();
    let sql = format!("INSERT INTO sync_import_log ({SELECT_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?)");
    conn.execute(
        &sql,
        params![
            import_id.to_vec(),
            bundle_id.to_vec(),
            bundle_hash.to_vec(),
            imported_at,
            source_device_id.to_vec(),
            op_count,
            applied_count,
            conflict_count,
            duplicate_count,
        ],
    )
    .map_err(|e| match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
            SyncError::database("bundle already imported (duplicate hash)", "record_import")
        }
        _ => SyncError::database(e.to_string(), "record_import"),
    })?;
    Ok(import_id)
}

pub fn get_import_history(conn: &rusqlite::Connection, limit: i64) -> Result<Vec<ImportLogEntry>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_import_log ORDER BY imported_at DESC LIMIT ?");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![limit], from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get_import_by_bundle_hash(conn: &rusqlite::Connection, bundle_hash: &[u8; 32]) -> Result<Option<ImportLogEntry>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_import_log WHERE bundle_hash = ?");
    conn.query_row(&sql, params![bundle_hash.to_vec()], from_row)
        .optional()
        .map_err(SyncError::from)
}
