//! Conflict bookkeeping: detection against the existing log, and the
//! `sync_conflicts` audit trail. Conflicts are recorded unconditionally —
//! never hidden or silently auto-applied (invariant `EXPLICIT_CONFLICTS`).

use rusqlite::{params, OptionalExtension, Row};

use crate::codec::{new_id, Id};
use crate::error::{Result, SyncError};

use super::operation::SyncOperation;
use super::store;

/// An immutable record of a detected conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConflict {
    pub conflict_id: Id,
    pub table_name: String,
    pub row_pk: Vec<u8>,
    pub local_op_id: Id,
    pub remote_op_id: Id,
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
    pub resolution_op_id: Option<Id>,
    pub resolution_strategy: Option<String>,
}

fn to_id(bytes: Vec<u8>) -> Id {
    bytes.try_into().unwrap_or([0u8; 16])
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<SyncConflict> {
    let conflict_id: Vec<u8> = row.get(0)?;
    let table_name: String = row.get(1)?;
    let row_pk: Vec<u8> = row.get(2)?;
    let local_op_id: Vec<u8> = row.get(3)?;
    let remote_op_id: Vec<u8> = row.get(4)?;
    let detected_at: i64 = row.get(5)?;
    let resolved_at: Option<i64> = row.get(6)?;
    let resolution_op_id: Option<Vec<u8>> = row.get(7)?;
    let resolution_strategy: Option<String> = row.get(8)?;
    Ok(SyncConflict {
        conflict_id: to_id(conflict_id),
        table_name,
        row_pk,
        local_op_id: to_id(local_op_id),
        remote_op_id: to_id(remote_op_id),
        detected_at,
        resolved_at,
        resolution_op_id: resolution_op_id.map(to_id),
        resolution_strategy,
    })
}

const SELECT_COLUMNS: &str = "conflict_id, table_name, row_pk, local_op_id, remote_op_id, \
detected_at, resolved_at, resolution_op_id, resolution_strategy";

/// The first existing operation on `incoming_op`'s row whose vector clock is
/// concurrent with it, if any — the conflict partner to record and resolve.
pub fn detect_conflict(
    conn: &rusqlite::Connection,
    incoming_op: &SyncOperation,
) -> Result<Option<SyncOperation>> {
    let incoming_vc = incoming_op.vector_clock()?;
    for existing in store::ops_for_row(conn, &incoming_op.table_name, &incoming_op.row_pk)? {
        if existing.op_id == incoming_op.op_id {
            continue;
        }
        let existing_vc = existing.vector_clock()?;
        if incoming_vc.concurrent_with(&existing_vc) {
            return Ok(Some(existing));
        }
    }
    Ok(None)
}

/// `true` if some existing operation on the same row causally dominates
/// `incoming_op` — i.e. `incoming_op` is stale and must not be applied.
pub fn is_dominated(conn: &rusqlite::Connection, incoming_op: &SyncOperation) -> Result<bool> {
    let incoming_vc = incoming_op.vector_clock()?;
    for existing in store::ops_for_row(conn, &incoming_op.table_name, &incoming_op.row_pk)? {
        if existing.op_id == incoming_op.op_id {
            continue;
        }
        let existing_vc = existing.vector_clock()?;
        if existing_vc.dominates(&incoming_vc) {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn record_conflict(
    conn: &rusqlite::Connection,
    table_name: &str,
    row_pk: &[u8],
    local_op_id: &Id,
    remote_op_id: &Id,
    detected_at: i64,
) -> Result<Id> {
    let conflict_id = new_id();
    conn.execute(
        "INSERT INTO sync_conflicts (conflict_id, table_name, row_pk, local_op_id, remote_op_id, \
         detected_at, resolved_at, resolution_op_id, resolution_strategy) VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, NULL)",
        params![
            conflict_id.to_vec(),
            table_name,
            row_pk,
            local_op_id.to_vec(),
            remote_op_id.to_vec(),
            detected_at,
        ],
    )?;
    Ok(conflict_id)
}

pub fn get_unresolved_conflicts(conn: &rusqlite::Connection) -> Result<Vec<SyncConflict>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_conflicts WHERE resolved_at IS NULL ORDER BY detected_at ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get_conflict_by_id(conn: &rusqlite::Connection, conflict_id: &Id) -> Result<Option<SyncConflict>> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM sync_conflicts WHERE conflict_id = ?");
    conn.query_row(&sql, params![conflict_id.to_vec()], from_row)
        .optional()
        .map_err(SyncError::from)
}

pub fn mark_conflict_resolved(
    conn: &rusqlite::Connection,
    conflict_id: &Id,
    resolution_op_id: &Id,
    resolution_strategy: &str,
    resolved_at: i64,
) -> Result<()> {
    let affected = conn.execute(
        "UPDATE sync_conflicts SET resolved_at = ?, resolution_op_id = ?, resolution_strategy = ? \
         WHERE conflict_id = ? AND resolved_at IS NULL",
        params![resolved_at, resolution_op_id.to_vec(), resolution_strategy, conflict_id.to_vec()],
    )?;
    if affected == 0 {
        return Err(SyncError::conflict(
            "conflict not found or already resolved",
            Some(crate::codec::id_to_hex(conflict_id)),
            None::<String>,
        ));
    }
    Ok(())
}
