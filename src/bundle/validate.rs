//! Bundle validation (§4.5): a bundle file is never trusted until every one
//! of these checks passes. Each failure mode maps to a specific
//! [`BundleErrorReason`] so callers can tell a corrupt file from a
//! schema-incompatible one from a tampered one.

use std::path::Path;

use rusqlite::OptionalExtension;

use crate::codec::{hash::sha256_sequence, Id};
use crate::error::{BundleErrorReason, Result, SyncError};
use crate::log::operation::OperationType;

use super::format::BundleMetadata;

/// Hashes a set of operation ids after sorting them ascending by byte value,
/// so generation and validation always hash in the same order regardless of
/// the order operations were selected or stored in.
pub fn content_hash_for_ops(ids: impl IntoIterator<Item = Id>) -> [u8; 32] {
    let mut sorted: Vec<Id> = ids.into_iter().collect();
    sorted.sort();
    sha256_sequence(sorted.iter())
}

fn bundle_err(message: impl Into<String>, path: &Path, reason: BundleErrorReason) -> SyncError {
    SyncError::bundle(message, Some(path.display().to_string()), reason)
}

/// Validates a bundle file's structural integrity, table shape, metadata
/// well-formedness, schema compatibility, content hash, and per-operation
/// well-formedness, returning the declared metadata only once every check
/// has passed.
pub fn validate(path: &Path, expected_schema_version: i64) -> Result<BundleMetadata> {
    let conn = rusqlite::Connection::open(path)
        .map_err(|e| bundle_err(format!("failed to open bundle: {e}"), path, BundleErrorReason::OpenFailed))?;

    check_integrity(&conn, path)?;
    check_tables_exist(&conn, path)?;
    let bundle_metadata = load_metadata(&conn, path)?;

    if bundle_metadata.schema_version != expected_schema_version {
        return Err(bundle_err(
            format!(
                "bundle schema_version {} does not match expected {expected_schema_version}",
                bundle_metadata.schema_version
            ),
            path,
            BundleErrorReason::SchemaMismatch,
        ));
    }

    verify_content_hash(&conn, &bundle_metadata, path)?;
    validate_operations(&conn, path)?;

    Ok(bundle_metadata)
}

fn check_integrity(conn: &rusqlite::Connection, path: &Path) -> Result<()> {
    let result: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|_| bundle_err("integrity check failed", path, BundleErrorReason::IntegrityCheckFailed))?;
    if result != "ok" {
        return Err(bundle_err(
            format!("integrity check reported: {result}"),
            path,
            BundleErrorReason::IntegrityCheckFailed,
        ));
    }
    Ok(())
}

fn check_tables_exist(conn: &rusqlite::Connection, path: &Path) -> Result<()> {
    for table in ["bundle_metadata", "bundle_operations"] {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
                [table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|_| bundle_err("failed reading table list", path, BundleErrorReason::MissingTables))?;
        if found.is_none() {
            return Err(bundle_err(format!("missing required table '{table}'"), path, BundleErrorReason::MissingTables));
        }
    }
    Ok(())
}

fn load_metadata(conn: &rusqlite::Connection, path: &Path) -> Result<BundleMetadata> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM bundle_metadata", [], |row| row.get(0))
        .map_err(|_| bundle_err("failed reading bundle_metadata", path, BundleErrorReason::InvalidMetadata))?;
    if count == 0 {
        return Err(bundle_err("bundle has no metadata row", path, BundleErrorReason::NoMetadata));
    }
    if count > 1 {
        return Err(bundle_err(
            format!("bundle has {count} metadata rows, expected exactly one"),
            path,
            BundleErrorReason::MultipleMetadata,
        ));
    }

    let sql = format!("SELECT {} FROM bundle_metadata", super::format::SELECT_COLUMNS);
    conn.query_row(&sql, [], BundleMetadata::from_row)
        .map_err(|e| bundle_err(format!("malformed metadata row: {e}"), path, BundleErrorReason::InvalidMetadata))
}

fn verify_content_hash(conn: &rusqlite::Connection, bundle_metadata: &BundleMetadata, path: &Path) -> Result<()> {
    let mut stmt = conn
        .prepare("SELECT op_id FROM bundle_operations ORDER BY op_id ASC")
        .map_err(|_| bundle_err("failed reading bundle_operations", path, BundleErrorReason::OpCountMismatch))?;
    let ids: Vec<Id> = stmt
        .query_map([], |row| {
            let bytes: Vec<u8> = row.get(0)?;
            Ok(bytes.try_into().unwrap_or([0u8; 16]))
        })
        .map_err(|_| bundle_err("failed reading bundle_operations", path, BundleErrorReason::OpCountMismatch))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|_| bundle_err("failed reading bundle_operations", path, BundleErrorReason::OpCountMismatch))?;

    if ids.len() as i64 != bundle_metadata.op_count {
        return Err(bundle_err(
            format!("bundle declares op_count={} but contains {} operations", bundle_metadata.op_count, ids.len()),
            path,
            BundleErrorReason::OpCountMismatch,
        ));
    }

    // `ids` is already sorted ascending by the query; hashing it directly
    // (rather than re-sorting) still matches `content_hash_for_ops` because
    // that function sorts its input regardless.
    let recomputed = content_hash_for_ops(ids);
    if recomputed != bundle_metadata.content_hash {
        return Err(bundle_err("content hash does not match declared metadata", path, BundleErrorReason::HashMismatch));
    }
    Ok(())
}

fn validate_operations(conn: &rusqlite::Connection, path: &Path) -> Result<()> {
    let mut stmt = conn
        .prepare("SELECT op_id, device_id, op_type FROM bundle_operations")
        .map_err(|e| bundle_err(format!("failed reading bundle_operations: {e}"), path, BundleErrorReason::InvalidOpId))?;
    let rows = stmt
        .query_map([], |row| {
            let op_id: Vec<u8> = row.get(0)?;
            let device_id: Vec<u8> = row.get(1)?;
            let op_type: String = row.get(2)?;
            Ok((op_id, device_id, op_type))
        })
        .map_err(|e| bundle_err(format!("failed reading bundle_operations: {e}"), path, BundleErrorReason::InvalidOpId))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| bundle_err(format!("failed reading bundle_operations: {e}"), path, BundleErrorReason::InvalidOpId))?;

    for (op_id, device_id, op_type) in rows {
        if op_id.len() != 16 {
            return Err(bundle_err("operation has malformed op_id", path, BundleErrorReason::InvalidOpId));
        }
        if device_id.len() != 16 {
            return Err(bundle_err("operation has malformed device_id", path, BundleErrorReason::InvalidDeviceId));
        }
        if OperationType::parse(&op_type).is_err() {
            return Err(bundle_err(format!("operation has unknown op_type '{op_type}'"), path, BundleErrorReason::InvalidOpType));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::generate::generate_bundle;
    use crate::log::metadata;

    fn open_replica_with_table() -> rusqlite::Connection {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        metadata::initialize_sync_tables(&conn).unwrap();
        conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
        conn
    }

    fn insert_row(conn: &rusqlite::Connection, hlc: &std::sync::Arc<crate::clock::HlClock>, suppressed: &std::sync::Arc<std::sync::atomic::AtomicBool>) {
        crate::capture::install_scalar_functions(conn, hlc.clone(), suppressed.clone()).unwrap();
        crate::capture::enable(conn, "items").unwrap();
        conn.execute("INSERT INTO items (id, name) VALUES (1, 'a')", []).unwrap();
    }

    #[test]
    fn generate_then_validate_round_trips_metadata() {
        let conn = open_replica_with_table();
        let device_id = metadata::get_device_id(&conn).unwrap();
        let hlc = std::sync::Arc::new(crate::clock::HlClock::new(crate::codec::id_to_hex(&device_id)));
        let suppressed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        insert_row(&conn, &hlc, &suppressed);

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("peer.bundle.db");
        let produced = generate_bundle(&conn, &[9; 16], &out).unwrap().unwrap();

        let schema_version = metadata::get_schema_version(&conn).unwrap();
        let validated = validate(&produced, schema_version).unwrap();
        assert_eq!(validated.op_count, 1);
        assert_eq!(validated.source_device_id, device_id);
    }

    #[test]
    fn validate_rejects_schema_mismatch() {
        let conn = open_replica_with_table();
        let device_id = metadata::get_device_id(&conn).unwrap();
        let hlc = std::sync::Arc::new(crate::clock::HlClock::new(crate::codec::id_to_hex(&device_id)));
        let suppressed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        insert_row(&conn, &hlc, &suppressed);

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("peer.bundle.db");
        let produced = generate_bundle(&conn, &[9; 16], &out).unwrap().unwrap();

        let err = validate(&produced, 999).unwrap_err();
        assert!(matches!(err, SyncError::Bundle { reason: BundleErrorReason::SchemaMismatch, .. }));
    }

    #[test]
    fn validate_rejects_missing_file() {
        let err = validate(Path::new("/nonexistent/bundle.db"), 1).unwrap_err();
        assert!(matches!(err, SyncError::Bundle { reason: BundleErrorReason::OpenFailed, .. }));
    }

    #[test]
    fn validate_rejects_tampered_hash() {
        let conn = open_replica_with_table();
        let device_id = metadata::get_device_id(&conn).unwrap();
        let hlc = std::sync::Arc::new(crate::clock::HlClock::new(crate::codec::id_to_hex(&device_id)));
        let suppressed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        insert_row(&conn, &hlc, &suppressed);

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("peer.bundle.db");
        let produced = generate_bundle(&conn, &[9; 16], &out).unwrap().unwrap();

        let bundle_conn = rusqlite::Connection::open(&produced).unwrap();
        bundle_conn.execute("UPDATE bundle_metadata SET op_count = op_count + 1", []).unwrap();
        drop(bundle_conn);

        let schema_version = metadata::get_schema_version(&conn).unwrap();
        let err = validate(&produced, schema_version).unwrap_err();
        assert!(matches!(err, SyncError::Bundle { reason: BundleErrorReason::OpCountMismatch, .. }));
    }
}
