//! The import pipeline (§4.6): the only path by which a bundle's operations
//! ever reach a replica's own tables. Every public entry point here runs
//! inside one exclusive transaction, with change capture suppressed for its
//! whole duration — a write applied while importing must never be recorded
//! as a brand new local operation.

pub mod apply;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bundle::{self, format::now_micros};
use crate::clock::HlClock;
use crate::codec::{decode_map, new_id, Id};
use crate::error::Result;
use crate::log::operation::SELECT_COLUMNS;
use crate::log::{conflict, import_log, metadata, peer, store, OperationType, SyncOperation};
use crate::resolver::{ConflictContext, ConflictPolicy, ResolutionOutcome};

/// Outcome of importing a bundle or applying a batch of operations directly.
///
/// `skipped` is `true` only when the bundle's content hash was already
/// present in the import log — every count is then zero, since nothing ran.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportResult {
    pub bundle_id: Id,
    pub source_device_id: Id,
    pub op_count: i64,
    pub applied_count: i64,
    pub conflict_count: i64,
    pub duplicate_count: i64,
    pub skipped: bool,
}

impl ImportResult {
    fn skipped(bundle_id: Id, source_device_id: Id, op_count: i64) -> Self {
        ImportResult {
            bundle_id,
            source_device_id,
            op_count,
            applied_count: 0,
            conflict_count: 0,
            duplicate_count: 0,
            skipped: true,
        }
    }
}

/// Holds `suppressed` at `true` for its lifetime, resetting it on drop even
/// if the import fails partway through.
///
/// `pub(crate)` so [`crate::replica::Replica::resolve_conflict`] can reuse it
/// for the same reason: applying a manually chosen resolution must not be
/// recaptured as a brand new local write.
pub(crate) struct SuppressGuard<'a> {
    flag: &'a Arc<AtomicBool>,
}

impl<'a> SuppressGuard<'a> {
    pub(crate) fn new(flag: &'a Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        SuppressGuard { flag }
    }
}

impl Drop for SuppressGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Validates `bundle_path`, then imports every operation it carries that
/// this replica does not already have.
pub fn import_bundle(
    conn: &rusqlite::Connection,
    bundle_path: &Path,
    expected_schema_version: i64,
    hlc: &HlClock,
    suppressed: &Arc<AtomicBool>,
    policy: &ConflictPolicy,
) -> Result<ImportResult> {
    let bundle_metadata = bundle::validate(bundle_path, expected_schema_version)?;

    if import_log::get_import_by_bundle_hash(conn, &bundle_metadata.content_hash)?.is_some() {
        tracing::debug!(bundle_path = %bundle_path.display(), "bundle already imported, skipping");
        return Ok(ImportResult::skipped(
            bundle_metadata.bundle_id,
            bundle_metadata.source_device_id,
            bundle_metadata.op_count,
        ));
    }

    let bundle_conn = rusqlite::Connection::open(bundle_path)?;
    let sql = format!("SELECT {SELECT_COLUMNS} FROM bundle_operations");
    let ops: Vec<SyncOperation> = {
        let mut stmt = bundle_conn.prepare(&sql)?;
        stmt.query_map([], SyncOperation::from_row)?.collect::<rusqlite::Result<_>>()?
    };
    bundle_conn.close().map_err(|(_, e)| e)?;

    run_in_transaction(
        conn,
        bundle_metadata.bundle_id,
        bundle_metadata.content_hash,
        bundle_metadata.source_device_id,
        ops,
        hlc,
        suppressed,
        policy,
    )
}

/// Applies `ops` directly, without a bundle file — the streaming path used
/// by a live peer connection (§6). The batch is content-hashed the same way
/// a bundle is, so re-sending an identical batch is idempotent.
pub fn apply_batch(
    conn: &rusqlite::Connection,
    ops: Vec<SyncOperation>,
    source_device_id: Id,
    hlc: &HlClock,
    suppressed: &Arc<AtomicBool>,
    policy: &ConflictPolicy,
) -> Result<ImportResult> {
    let bundle_id = new_id();
    let bundle_hash = bundle::validate::content_hash_for_ops(ops.iter().map(|op| op.op_id));

    if import_log::get_import_by_bundle_hash(conn, &bundle_hash)?.is_some() {
        return Ok(ImportResult::skipped(bundle_id, source_device_id, ops.len() as i64));
    }

    run_in_transaction(conn, bundle_id, bundle_hash, source_device_id, ops, hlc, suppressed, policy)
}

#[allow(clippy::too_many_arguments)]
fn run_in_transaction(
    conn: &rusqlite::Connection,
    bundle_id: Id,
    bundle_hash: [u8; 32],
    source_device_id: Id,
    ops: Vec<SyncOperation>,
    hlc: &HlClock,
    suppressed: &Arc<AtomicBool>,
    policy: &ConflictPolicy,
) -> Result<ImportResult> {
    let _suppress = SuppressGuard::new(suppressed);
    conn.execute_batch("BEGIN IMMEDIATE")?;

    match apply_ops(conn, bundle_id, bundle_hash, source_device_id, ops, hlc, policy) {
        Ok(result) => {
            conn.execute_batch("COMMIT")?;
            Ok(result)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Steps 2-6 of the pipeline: dedup, deterministic ordering, conflict
/// detection/resolution or normal apply, clock advance, and the
/// import-log/peer-state commit. Assumes it is already inside a transaction.
#[allow(clippy::too_many_arguments)]
fn apply_ops(
    conn: &rusqlite::Connection,
    bundle_id: Id,
    bundle_hash: [u8; 32],
    source_device_id: Id,
    ops: Vec<SyncOperation>,
    hlc: &HlClock,
    policy: &ConflictPolicy,
) -> Result<ImportResult> {
    let op_count = ops.len() as i64;
    let mut duplicate_count = 0i64;
    let mut new_ops = Vec::with_capacity(ops.len());
    for op in ops {
        if store::exists(conn, &op.op_id)? {
            duplicate_count += 1;
        } else {
            new_ops.push(op);
        }
    }

    let mut keyed = Vec::with_capacity(new_ops.len());
    for op in new_ops {
        let vc = op.vector_clock()?;
        keyed.push((vc.sort_key(), op.op_id, vc, op));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut current_vc = metadata::get_vector_clock(conn)?;
    let mut received_vc = crate::clock::VectorClock::new();
    let mut applied_count = 0i64;
    let mut conflict_count = 0i64;

    for (_, _, op_vc, op) in keyed {
        let op_hlc = op.hlc()?;

        if let Some(local_op) = conflict::detect_conflict(conn, &op)? {
            conflict_count += 1;
            let conflict_id =
                conflict::record_conflict(conn, &op.table_name, &op.row_pk, &local_op.op_id, &op.op_id, now_micros())?;
            store::append(conn, &op)?;

            if policy.auto_resolve() {
                let ctx = ConflictContext::new(&local_op, &op);
                match policy.resolve(&ctx)? {
                    ResolutionOutcome::Apply(values) => {
                        apply::upsert(conn, &op.table_name, &op.row_pk, &values)?;
                        conflict::mark_conflict_resolved(conn, &conflict_id, &op.op_id, policy.name(), now_micros())?;
                        applied_count += 1;
                    }
                    ResolutionOutcome::Delete => {
                        apply::delete(conn, &op.table_name, &op.row_pk)?;
                        conflict::mark_conflict_resolved(conn, &conflict_id, &op.op_id, policy.name(), now_micros())?;
                        applied_count += 1;
                    }
                    ResolutionOutcome::Decline => {}
                }
            }
        } else if conflict::is_dominated(conn, &op)? {
            // Stale relative to what we already have; still logged and
            // counted as applied (it changes no row, but it is recorded).
            store::append(conn, &op)?;
            applied_count += 1;
        } else {
            store::append(conn, &op)?;
            apply_normal(conn, &op)?;
            applied_count += 1;
        }

        current_vc.merge_in_place(&op_vc);
        received_vc.merge_in_place(&op_vc);
        hlc.update(&op_hlc);
    }

    metadata::update_vector_clock(conn, &current_vc)?;
    peer::record_received(conn, &source_device_id, &received_vc, now_micros())?;
    import_log::record_import(
        conn,
        &bundle_id,
        &bundle_hash,
        &source_device_id,
        now_micros(),
        op_count,
        applied_count,
        conflict_count,
        duplicate_count,
    )?;

    Ok(ImportResult {
        bundle_id,
        source_device_id,
        op_count,
        applied_count,
        conflict_count,
        duplicate_count,
        skipped: false,
    })
}

fn apply_normal(conn: &rusqlite::Connection, op: &SyncOperation) -> Result<()> {
    match op.op_type {
        OperationType::Insert => {
            let values = op.new_values.as_ref().ok_or_else(|| {
                crate::error::SyncError::operation(
                    "INSERT operation missing new_values",
                    Some(crate::codec::id_to_hex(&op.op_id)),
                    Some(op.op_type.as_str()),
                    Some(op.table_name.clone()),
                )
            })?;
            apply::insert_or_ignore(conn, &op.table_name, &decode_map(values)?)
        }
        OperationType::Update => {
            let values = op.new_values.as_ref().ok_or_else(|| {
                crate::error::SyncError::operation(
                    "UPDATE operation missing new_values",
                    Some(crate::codec::id_to_hex(&op.op_id)),
                    Some(op.op_type.as_str()),
                    Some(op.table_name.clone()),
                )
            })?;
            apply::update_or_insert(conn, &op.table_name, &op.row_pk, &decode_map(values)?)
        }
        OperationType::Delete => apply::delete(conn, &op.table_name, &op.row_pk),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_map, Value};

    fn open_replica() -> (rusqlite::Connection, Id) {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let device_id = metadata::initialize_sync_tables(&conn).unwrap();
        conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)").unwrap();
        (conn, device_id)
    }

    fn insert_op(id: Id, device_id: Id, vc_json: &str, hlc: &str, pk: i64, name: &str) -> SyncOperation {
        let values = encode_map(
            &[("id".to_string(), Value::Int(pk)), ("name".to_string(), Value::Text(name.to_string()))]
                .into_iter()
                .collect(),
        )
        .unwrap();
        SyncOperation::new(
            id,
            device_id,
            None,
            vc_json.to_string(),
            hlc.to_string(),
            "items".to_string(),
            OperationType::Insert,
            crate::codec::encode_pk(&[Value::Int(pk)]).unwrap(),
            None,
            Some(values),
            1,
            0,
            false,
            None,
        )
        .unwrap()
    }

    fn update_op(id: Id, device_id: Id, vc_json: &str, hlc: &str, pk: i64, old_name: &str, new_name: &str) -> SyncOperation {
        let old = encode_map(
            &[("id".to_string(), Value::Int(pk)), ("name".to_string(), Value::Text(old_name.to_string()))]
                .into_iter()
                .collect(),
        )
        .unwrap();
        let new = encode_map(
            &[("id".to_string(), Value::Int(pk)), ("name".to_string(), Value::Text(new_name.to_string()))]
                .into_iter()
                .collect(),
        )
        .unwrap();
        SyncOperation::new(
            id,
            device_id,
            None,
            vc_json.to_string(),
            hlc.to_string(),
            "items".to_string(),
            OperationType::Update,
            crate::codec::encode_pk(&[Value::Int(pk)]).unwrap(),
            Some(old),
            Some(new),
            1,
            0,
            false,
            None,
        )
        .unwrap()
    }

    #[test]
    fn apply_batch_inserts_new_rows() {
        let (conn, _device_id) = open_replica();
        let hlc = HlClock::new("local");
        let suppressed = Arc::new(AtomicBool::new(false));
        let policy = ConflictPolicy::ColumnLevelLww;
        let remote = [9; 16];

        let op = insert_op([1; 16], remote, r#"{"remote":1}"#, "10:0:remote", 1, "a");
        let result = apply_batch(&conn, vec![op], remote, &hlc, &suppressed, &policy).unwrap();

        assert_eq!(result.applied_count, 1);
        assert_eq!(result.conflict_count, 0);
        assert!(!result.skipped);
        let name: String = conn.query_row("SELECT name FROM items WHERE id = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(name, "a");
        assert!(!suppressed.load(Ordering::SeqCst));
    }

    #[test]
    fn re_applying_the_same_batch_is_skipped() {
        let (conn, _device_id) = open_replica();
        let hlc = HlClock::new("local");
        let suppressed = Arc::new(AtomicBool::new(false));
        let policy = ConflictPolicy::ColumnLevelLww;
        let remote = [9; 16];

        let op = insert_op([1; 16], remote, r#"{"remote":1}"#, "10:0:remote", 1, "a");
        apply_batch(&conn, vec![op.clone()], remote, &hlc, &suppressed, &policy).unwrap();
        let second = apply_batch(&conn, vec![op], remote, &hlc, &suppressed, &policy).unwrap();

        assert!(second.skipped);
        assert_eq!(second.applied_count, 0);
    }

    #[test]
    fn concurrent_updates_are_recorded_as_conflicts_and_resolved() {
        let (conn, device_id) = open_replica();
        conn.execute("INSERT INTO items (id, name) VALUES (1, 'orig')", []).unwrap();

        let hlc = HlClock::new("local");
        let suppressed = Arc::new(AtomicBool::new(false));
        let policy = ConflictPolicy::ColumnLevelLww;
        let remote = [9; 16];

        let local = update_op([1; 16], device_id, r#"{"local":1}"#, "10:0:local", 1, "orig", "from-local");
        store::append(&conn, &local).unwrap();

        let incoming = update_op([2; 16], remote, r#"{"remote":1}"#, "20:0:remote", 1, "orig", "from-remote");
        let result = apply_batch(&conn, vec![incoming], remote, &hlc, &suppressed, &policy).unwrap();

        assert_eq!(result.conflict_count, 1);
        assert_eq!(result.applied_count, 1);
        let name: String = conn.query_row("SELECT name FROM items WHERE id = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(name, "from-remote");

        let unresolved = conflict::get_unresolved_conflicts(&conn).unwrap();
        assert!(unresolved.is_empty());
    }

    #[test]
    fn manual_policy_records_conflict_without_applying() {
        let (conn, device_id) = open_replica();
        conn.execute("INSERT INTO items (id, name) VALUES (1, 'orig')", []).unwrap();

        let hlc = HlClock::new("local");
        let suppressed = Arc::new(AtomicBool::new(false));
        let policy = ConflictPolicy::Manual;
        let remote = [9; 16];

        let local = update_op([1; 16], device_id, r#"{"local":1}"#, "10:0:local", 1, "orig", "from-local");
        store::append(&conn, &local).unwrap();

        let incoming = update_op([2; 16], remote, r#"{"remote":1}"#, "20:0:remote", 1, "orig", "from-remote");
        let result = apply_batch(&conn, vec![incoming], remote, &hlc, &suppressed, &policy).unwrap();

        assert_eq!(result.conflict_count, 1);
        assert_eq!(result.applied_count, 0);
        let name: String = conn.query_row("SELECT name FROM items WHERE id = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(name, "orig");
        assert_eq!(conflict::get_unresolved_conflicts(&conn).unwrap().len(), 1);
    }

    #[test]
    fn stale_operation_is_still_counted_as_applied() {
        let (conn, device_id) = open_replica();
        conn.execute("INSERT INTO items (id, name) VALUES (1, 'fresh')", []).unwrap();

        let hlc = HlClock::new("local");
        let suppressed = Arc::new(AtomicBool::new(false));
        let policy = ConflictPolicy::ColumnLevelLww;
        let remote = [9; 16];

        let newer = update_op([1; 16], device_id, r#"{"aa":2}"#, "20:0:local", 1, "orig", "fresh");
        store::append(&conn, &newer).unwrap();

        let stale = update_op([2; 16], remote, r#"{"aa":1}"#, "10:0:remote", 1, "orig", "stale");
        let result = apply_batch(&conn, vec![stale], remote, &hlc, &suppressed, &policy).unwrap();

        assert_eq!(result.applied_count, 1);
        assert_eq!(result.conflict_count, 0);
        let name: String = conn.query_row("SELECT name FROM items WHERE id = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(name, "fresh");
    }

    #[test]
    fn import_bundle_round_trips_through_generate() {
        let (source_conn, source_device_id) = open_replica();
        let source_hlc = Arc::new(HlClock::new(crate::codec::id_to_hex(&source_device_id)));
        let source_suppressed = Arc::new(AtomicBool::new(false));
        crate::capture::install_scalar_functions(&source_conn, source_hlc.clone(), source_suppressed.clone()).unwrap();
        crate::capture::enable(&source_conn, "items").unwrap();
        source_conn.execute("INSERT INTO items (id, name) VALUES (1, 'from-source')", []).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let bundle_path = dir.path().join("out.bundle.db");
        crate::bundle::generate_bundle(&source_conn, &[7; 16], &bundle_path).unwrap().unwrap();

        let (dest_conn, _dest_device_id) = open_replica();
        let dest_hlc = HlClock::new("dest");
        let dest_suppressed = Arc::new(AtomicBool::new(false));
        let policy = ConflictPolicy::ColumnLevelLww;
        let schema_version = metadata::get_schema_version(&dest_conn).unwrap();

        let result =
            import_bundle(&dest_conn, &bundle_path, schema_version, &dest_hlc, &dest_suppressed, &policy).unwrap();
        assert_eq!(result.applied_count, 1);
        assert_eq!(result.source_device_id, source_device_id);

        let name: String = dest_conn.query_row("SELECT name FROM items WHERE id = 1", [], |r| r.get(0)).unwrap();
        assert_eq!(name, "from-source");

        let second =
            import_bundle(&dest_conn, &bundle_path, schema_version, &dest_hlc, &dest_suppressed, &policy).unwrap();
        assert!(second.skipped);
    }
}
