//! Append-only storage and causal queries over the operation log (C3).
//!
//! Every function here takes a `&Connection` rather than owning one: the
//! log shares the same embedded database and the same transaction scope as
//! the user's tables (§3), so callers (capture, import, replica) control
//! transaction boundaries.

use rusqlite::{params, OptionalExtension};

use crate::clock::VectorClock;
use crate::codec::{id_to_hex, Id};
use crate::error::{Result, SyncError};

use super::operation::{SyncOperation, SELECT_COLUMNS};

/// Inserts a new operation. Fails with [`SyncError::Database`] (wrapping the
/// `UNIQUE` constraint violation) if `op_id` already exists — callers that
/// want idempotent-dedup semantics should check [`exists`] first.
pub fn append(conn: &rusqlite::Connection, op: &SyncOperation) -> Result<()> {
    let sql = format!(
        "INSERT INTO sync_operations ({SELECT_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)"
    );
    conn.execute(
        &sql,
        params![
            op.op_id.to_vec(),
            op.device_id.to_vec(),
            op.parent_op_id.map(|id| id.to_vec()),
            op.vector_clock,
            op.hlc,
            op.table_name,
            op.op_type.as_str(),
            op.row_pk,
            op.old_values,
            op.new_values,
            op.schema_version,
            op.created_at,
            op.is_local as i64,
            op.applied_at,
        ],
    )
    .map_err(|e| match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation => {
            SyncError::database(
                format!("operation {} already exists", id_to_hex(&op.op_id)),
                "append",
            )
        }
        _ => SyncError::database(e.to_string(), "append"),
    })?;
    Ok(())
}

pub fn exists(conn: &rusqlite::Connection, op_id: &Id) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sync_operations WHERE op_id = ?",
            params![op_id.to_vec()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn get(conn: &rusqlite::Connection, op_id: &Id) -> Result<Option<SyncOperation>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_operations WHERE op_id = ?");
    conn.query_row(&sql, params![op_id.to_vec()], |row| SyncOperation::from_row(row))
        .optional()
        .map_err(SyncError::from)
}

/// Every operation recorded on `(table_name, row_pk)`, oldest first. Used
/// for conflict detection and staleness checks.
pub fn ops_for_row(
    conn: &rusqlite::Connection,
    table_name: &str,
    row_pk: &[u8],
) -> Result<Vec<SyncOperation>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM sync_operations WHERE table_name = ? AND row_pk = ? ORDER BY created_at ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![table_name, row_pk], SyncOperation::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Every operation in the log whose vector clock is not dominated by
/// `peer_vc`, oldest first — the set a peer at `peer_vc` has not yet seen.
/// Includes operations this replica itself imported from a third peer, so
/// bundles can relay across more than one hop.
pub fn ops_since(conn: &rusqlite::Connection, peer_vc: &VectorClock) -> Result<Vec<SyncOperation>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_operations ORDER BY created_at ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], SyncOperation::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut unseen = Vec::new();
    for op in rows {
        let op_vc = op.vector_clock()?;
        if !peer_vc.dominates(&op_vc) {
            unseen.push(op);
        }
    }
    Ok(unseen)
}

/// The most recent operation originated by `device_id`, used to set
/// `parent_op_id` on the next one (provenance only, not replay order).
pub fn last_local_op(conn: &rusqlite::Connection, device_id: &Id) -> Result<Option<SyncOperation>> {
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM sync_operations WHERE device_id = ? ORDER BY created_at DESC LIMIT 1"
    );
    conn.query_row(&sql, params![device_id.to_vec()], SyncOperation::from_row)
        .optional()
        .map_err(SyncError::from)
}
