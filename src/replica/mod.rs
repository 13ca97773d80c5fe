//! The replica: the single entry point that owns a connection and exposes
//! the §6 core API. Where the donor's `storage` module split responsibility
//! across a `StorageEngine` trait and several backends behind a
//! `StorageFactory`, there is exactly one kind of replica here, so the two
//! collapse into one concrete struct that owns its own connection and wires
//! together the log, capture, bundle, import, and resolver modules.
//!
//! Every public method takes `&self` and acquires the connection mutex for
//! its own duration; nothing here spans a lock across an `.await` because
//! nothing here is async — the core has no asynchronous primitives (§5).

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::bundle;
use crate::capture;
use crate::clock::{HlClock, VectorClock};
use crate::codec::{decode_map, id_to_hex, Id};
use crate::config::{self, ReplicaConfig};
use crate::error::{Result, SyncError};
use crate::import::{self, apply, ImportResult};
use crate::log::{conflict, metadata, migration, operation::OperationType, peer, store, SyncConflict, SyncOperation};
use crate::resolver::ConflictPolicy;

/// Which side of a manually adjudicated conflict wins (§6:
/// `resolve_conflict(conflict_id, "local"|"remote")`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSide {
    Local,
    Remote,
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SyncError::validation_field(
            format!("{kind} must be a non-empty alphanumeric/underscore identifier"),
            kind,
            name,
        ));
    }
    Ok(())
}

/// A single embedded database, replicating via vector-clocked operations and
/// offline bundle exchange. One `Replica` per SQLite file; the same
/// connection is used for the caller's own tables and the sync core's
/// auxiliary tables, since they must commit together (§3).
pub struct Replica {
    conn: Mutex<Connection>,
    hlc: Arc<HlClock>,
    suppressed: Arc<AtomicBool>,
    device_id: Id,
    config: ReplicaConfig,
}

impl Replica {
    /// Opens (creating if absent) the SQLite file at `path`, applies the
    /// durability pragmas (§10.3), and bootstraps the sync core tables.
    pub fn open<P: AsRef<Path>>(path: P, config: ReplicaConfig) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, config)
    }

    /// Opens an in-memory replica, primarily for tests and short-lived
    /// embedding scenarios that don't need durability across process exit.
    pub fn open_in_memory(config: ReplicaConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, config)
    }

    fn from_connection(conn: Connection, config: ReplicaConfig) -> Result<Self> {
        let pragma_sql: String = config::SQLITE_PRAGMAS
            .iter()
            .map(|(name, value)| format!("PRAGMA {name} = {value};"))
            .collect();
        conn.execute_batch(&pragma_sql)?;

        let device_id = metadata::initialize_sync_tables(&conn)?;
        let hlc = Arc::new(HlClock::new(id_to_hex(&device_id)));
        let suppressed = Arc::new(AtomicBool::new(false));
        capture::install_scalar_functions(&conn, hlc.clone(), suppressed.clone())?;

        tracing::info!(device_id = %id_to_hex(&device_id), "replica opened");

        Ok(Replica {
            conn: Mutex::new(conn),
            hlc,
            suppressed,
            device_id,
            config,
        })
    }

    /// Runs `f` against the replica's own connection, for DDL and reads and
    /// writes against the caller's tables. Writes made here are captured by
    /// whatever triggers [`enable_sync_for_table`] installed, in the same
    /// transaction as the statement itself.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Returns this replica's device id. Idempotent and infallible after
    /// construction; kept as an explicit call because the embedding
    /// application typically persists it for peer bookkeeping.
    pub fn initialize(&self) -> Result<Id> {
        Ok(self.device_id)
    }

    pub fn device_id(&self) -> Id {
        self.device_id
    }

    #[tracing::instrument(skip(self))]
    pub fn enable_sync_for_table(&self, table_name: &str) -> Result<()> {
        let conn = self.conn.lock();
        capture::enable(&conn, table_name)
    }

    pub fn is_sync_enabled(&self, table_name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        capture::is_enabled(&conn, table_name)
    }

    pub fn captured_tables(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        capture::captured_tables(&conn)
    }

    #[tracing::instrument(skip(self, out_path))]
    pub fn generate_bundle(&self, peer_device_id: &Id, out_path: &Path) -> Result<Option<PathBuf>> {
        let conn = self.conn.lock();
        bundle::generate_bundle(&conn, peer_device_id, out_path)
    }

    /// Imports a bundle using the replica's configured default conflict
    /// policy. Use [`Self::import_bundle_with_policy`] to override it for a
    /// single call.
    #[tracing::instrument(skip(self, bundle_path))]
    pub fn import_bundle(&self, bundle_path: &Path) -> Result<ImportResult> {
        self.import_bundle_with_policy(bundle_path, &self.config.default_conflict_policy)
    }

    pub fn import_bundle_with_policy(&self, bundle_path: &Path, policy: &ConflictPolicy) -> Result<ImportResult> {
        let conn = self.conn.lock();
        let schema_version = metadata::get_schema_version(&conn)?;
        import::import_bundle(&conn, bundle_path, schema_version, &self.hlc, &self.suppressed, policy)
    }

    /// Applies `ops` directly (the streaming path for a live peer
    /// connection), using the replica's configured default conflict policy.
    #[tracing::instrument(skip(self, ops))]
    pub fn apply_batch(&self, ops: Vec<SyncOperation>, source_device_id: Id) -> Result<ImportResult> {
        let conn = self.conn.lock();
        import::apply_batch(&conn, ops, source_device_id, &self.hlc, &self.suppressed, &self.config.default_conflict_policy)
    }

    /// Every operation this replica has that `since_vc` does not dominate —
    /// the same selection [`Self::generate_bundle`] uses, exposed directly
    /// for transports that stream operations instead of exchanging files.
    pub fn get_new_operations(&self, since_vc: &VectorClock) -> Result<Vec<SyncOperation>> {
        let conn = self.conn.lock();
        store::ops_since(&conn, since_vc)
    }

    pub fn get_vector_clock(&self) -> Result<VectorClock> {
        let conn = self.conn.lock();
        metadata::get_vector_clock(&conn)
    }

    pub fn get_unresolved_conflicts(&self) -> Result<Vec<SyncConflict>> {
        let conn = self.conn.lock();
        conflict::get_unresolved_conflicts(&conn)
    }

    /// Manually resolves a conflict left behind by [`ConflictPolicy::Manual`]
    /// (or one a `Custom` policy declined): applies the chosen side's values
    /// — or deletes the row, if the winning operation was itself a DELETE —
    /// and marks the conflict resolved.
    #[tracing::instrument(skip(self))]
    pub fn resolve_conflict(&self, conflict_id: &Id, winner: ResolutionSide) -> Result<()> {
        let conn = self.conn.lock();
        let record = conflict::get_conflict_by_id(&conn, conflict_id)?.ok_or_else(|| {
            SyncError::conflict("conflict not found", Some(crate::codec::id_to_hex(conflict_id)), None::<String>)
        })?;
        if record.resolved_at.is_some() {
            return Err(SyncError::conflict(
                "conflict already resolved",
                Some(crate::codec::id_to_hex(conflict_id)),
                Some(record.table_name.clone()),
            ));
        }

        let local_op = store::get(&conn, &record.local_op_id)?
            .ok_or_else(|| SyncError::invariant(crate::error::Invariant::CausalConsistency, "conflict references a missing local operation"))?;
        let remote_op = store::get(&conn, &record.remote_op_id)?
            .ok_or_else(|| SyncError::invariant(crate::error::Invariant::CausalConsistency, "conflict references a missing remote operation"))?;
        let (winning_op, strategy) = match winner {
            ResolutionSide::Local => (&local_op, "MANUAL_LOCAL"),
            ResolutionSide::Remote => (&remote_op, "MANUAL_REMOTE"),
        };

        {
            let _suppress = import::SuppressGuard::new(&self.suppressed);
            match winning_op.op_type {
                OperationType::Delete => apply::delete(&conn, &record.table_name, &record.row_pk)?,
                OperationType::Insert | OperationType::Update => {
                    let values = winning_op.new_values.as_ref().ok_or_else(|| {
                        SyncError::operation(
                            "winning operation has no new_values to apply",
                            Some(crate::codec::id_to_hex(&winning_op.op_id)),
                            Some(winning_op.op_type.as_str()),
                            Some(record.table_name.clone()),
                        )
                    })?;
                    apply::upsert(&conn, &record.table_name, &record.row_pk, &decode_map(values)?)?;
                }
            }
        }

        conflict::mark_conflict_resolved(&conn, conflict_id, &winning_op.op_id, strategy, bundle::format::now_micros())
    }

    /// Applies an additive column migration: `ALTER TABLE ... ADD COLUMN`,
    /// a bump of the recorded schema version, and a row in
    /// `sync_schema_migrations` so [`Self::check_compatibility`] can reason
    /// about peers still on the prior version. Reinstalls capture triggers
    /// on `table_name` if they were enabled, so the new column is included
    /// in future captured snapshots.
    #[tracing::instrument(skip(self))]
    pub fn migrate_schema(
        &self,
        table_name: &str,
        column_name: &str,
        column_type: &str,
        default_value: Option<&str>,
    ) -> Result<()> {
        config::validate_table_name(table_name)?;
        validate_identifier("column_name", column_name)?;
        validate_identifier("column_type", column_type)?;

        let conn = self.conn.lock();
        let was_captured = capture::is_enabled(&conn, table_name)?;

        let alter_sql = match default_value {
            Some(default) => format!(
                "ALTER TABLE {} ADD COLUMN {} {} DEFAULT {}",
                quote_ident(table_name),
                quote_ident(column_name),
                column_type,
                default
            ),
            None => format!("ALTER TABLE {} ADD COLUMN {} {}", quote_ident(table_name), quote_ident(column_name), column_type),
        };
        conn.execute(&alter_sql, [])?;

        let new_version = metadata::get_schema_version(&conn)? + 1;
        metadata::set_schema_version(&conn, new_version)?;
        migration::record_add_column(&conn, table_name, column_name, column_type, default_value, bundle::format::now_micros(), new_version)?;

        if was_captured {
            capture::enable(&conn, table_name)?;
        }
        Ok(())
    }

    pub fn get_schema_version(&self) -> Result<i64> {
        let conn = self.conn.lock();
        metadata::get_schema_version(&conn)
    }

    /// Whether a peer announcing `remote_schema_version` can safely
    /// exchange bundles with this replica. Equal versions are always
    /// compatible; a peer behind us is compatible iff every migration we've
    /// applied since their version is additive (§6) — which every row in
    /// `sync_schema_migrations` already is, by construction. A peer ahead of
    /// us is never compatible from this side: we have no way to replay
    /// migrations we haven't been told about.
    pub fn check_compatibility(&self, remote_schema_version: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let local_version = metadata::get_schema_version(&conn)?;
        if local_version == remote_schema_version {
            return Ok(true);
        }
        if local_version > remote_schema_version {
            migration::pending_since(&conn, remote_schema_version)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Removes operations every known peer has already acknowledged
    /// receiving, capped at `max_ops` if given. Never removes an operation
    /// referenced by a conflict (resolved or not — the audit trail must
    /// still be able to name its operands) or named as another operation's
    /// `parent_op_id`. Returns the number of rows removed; user-table state
    /// is never touched.
    #[tracing::instrument(skip(self))]
    pub fn compact_log(&self, max_ops: Option<usize>) -> Result<usize> {
        let conn = self.conn.lock();
        let peers = peer::all_peer_states(&conn)?;
        if peers.is_empty() {
            return Ok(0);
        }

        let floors: Vec<VectorClock> = peers.into_iter().map(|p| p.last_sent_vector_clock).collect();
        let floor = match VectorClock::elementwise_min(&floors) {
            Some(floor) => floor,
            None => return Ok(0),
        };

        let referenced = referenced_op_ids(&conn)?;

        let candidates = store::ops_since(&conn, &VectorClock::new())?;
        let mut removed = 0usize;
        for op in candidates {
            if let Some(limit) = max_ops {
                if removed >= limit {
                    break;
                }
            }
            if referenced.contains(&op.op_id) {
                continue;
            }
            let op_vc = op.vector_clock()?;
            if !floor.dominates(&op_vc) {
                continue;
            }
            conn.execute("DELETE FROM sync_operations WHERE op_id = ?", rusqlite::params![op.op_id.to_vec()])?;
            removed += 1;
        }
        tracing::debug!(removed, "compacted operation log");
        Ok(removed)
    }
}

fn referenced_op_ids(conn: &Connection) -> Result<std::collections::HashSet<Id>> {
    fn to_id(bytes: Vec<u8>) -> Id {
        bytes.try_into().unwrap_or([0u8; 16])
    }

    let mut referenced = std::collections::HashSet::new();

    let mut conflict_stmt = conn.prepare("SELECT local_op_id, remote_op_id, resolution_op_id FROM sync_conflicts")?;
    let conflict_rows = conflict_stmt
        .query_map([], |row| {
            let local: Vec<u8> = row.get(0)?;
            let remote: Vec<u8> = row.get(1)?;
            let resolution: Option<Vec<u8>> = row.get(2)?;
            Ok((local, remote, resolution))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (local, remote, resolution) in conflict_rows {
        referenced.insert(to_id(local));
        referenced.insert(to_id(remote));
        if let Some(resolution) = resolution {
            referenced.insert(to_id(resolution));
        }
    }

    let mut parent_stmt = conn.prepare("SELECT parent_op_id FROM sync_operations WHERE parent_op_id IS NOT NULL")?;
    let parent_rows = parent_stmt
        .query_map([], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for parent in parent_rows {
        referenced.insert(to_id(parent));
    }

    Ok(referenced)
}
