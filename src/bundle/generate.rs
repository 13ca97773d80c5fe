//! Bundle generation (§4.5): pick every local operation a peer has not yet
//! seen, write it into a fresh bundle file, and advance the peer's
//! last-sent state.

use std::path::{Path, PathBuf};

use crate::codec::{id_to_hex, new_id};
use crate::error::Result;
use crate::log::{metadata, operation::SELECT_COLUMNS, peer, schema, store};

use super::format::{self, BundleMetadata};

/// Generates a bundle of every operation the replica has that
/// `peer_device_id` has not last-sent-acknowledged, writing it to
/// `out_path`. Returns `None` (and creates no file) if there is nothing new
/// to send.
pub fn generate_bundle(
    conn: &rusqlite::Connection,
    peer_device_id: &crate::codec::Id,
    out_path: &Path,
) -> Result<Option<PathBuf>> {
    let peer_last_sent = peer::last_sent_vector_clock(conn, peer_device_id)?;
    let ops = store::ops_since(conn, &peer_last_sent)?;
    if ops.is_empty() {
        return Ok(None);
    }

    let bundle_conn = rusqlite::Connection::open(out_path)?;
    schema::create_bundle_schema(&bundle_conn)?;

    let insert_sql = format!("INSERT INTO bundle_operations ({SELECT_COLUMNS}) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)");
    {
        let mut stmt = bundle_conn.prepare(&insert_sql)?;
        for op in &ops {
            stmt.execute(rusqlite::params![
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
            ])?;
        }
    }

    let content_hash = super::validate::content_hash_for_ops(ops.iter().map(|op| op.op_id));
    let bundle_metadata = BundleMetadata {
        bundle_id: new_id(),
        source_device_id: metadata::get_device_id(conn)?,
        created_at: format::now_micros(),
        schema_version: metadata::get_schema_version(conn)?,
        op_count: ops.len() as i64,
        content_hash,
    };
    bundle_metadata.insert(&bundle_conn)?;
    bundle_conn.close().map_err(|(_, e)| e)?;

    let current_vc = metadata::get_vector_clock(conn)?;
    peer::record_sent(conn, peer_device_id, &current_vc, format::now_micros())?;

    tracing::debug!(
        peer_device_id = %id_to_hex(peer_device_id),
        op_count = ops.len(),
        bundle_path = %out_path.display(),
        "generated bundle"
    );

    Ok(Some(out_path.to_path_buf()))
}
