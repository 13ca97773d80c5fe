//! SQL DDL for the sync core's auxiliary tables.
//!
//! Translated directly from the reference implementation's schema module,
//! keeping the same table/column/index names and `STRICT` typing so a
//! bundle produced by one replica is byte-for-byte structurally compatible
//! with another.

/// `sync_operations`: the append-only operation log (C3).
pub const SYNC_OPERATIONS: &str = "
CREATE TABLE IF NOT EXISTS sync_operations (
    op_id BLOB PRIMARY KEY CHECK(length(op_id) = 16),
    device_id BLOB NOT NULL CHECK(length(device_id) = 16),
    parent_op_id BLOB CHECK(parent_op_id IS NULL OR length(parent_op_id) = 16),
    vector_clock TEXT NOT NULL,
    hlc TEXT NOT NULL,
    table_name TEXT NOT NULL,
    op_type TEXT NOT NULL CHECK(op_type IN ('INSERT', 'UPDATE', 'DELETE')),
    row_pk BLOB NOT NULL,
    old_values BLOB,
    new_values BLOB,
    schema_version INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    is_local INTEGER NOT NULL CHECK(is_local IN (0, 1)),
    applied_at INTEGER,
    FOREIGN KEY (parent_op_id) REFERENCES sync_operations(op_id)
) STRICT";

pub const SYNC_OPERATIONS_INDICES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_ops_device_created ON sync_operations(device_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_ops_table_pk ON sync_operations(table_name, row_pk)",
    "CREATE INDEX IF NOT EXISTS idx_ops_id ON sync_operations(op_id)",
];

/// `sync_metadata`: device id, schema version, current vector clock.
pub const SYNC_METADATA: &str = "
CREATE TABLE IF NOT EXISTS sync_metadata (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
) STRICT";

/// `sync_conflicts`: one row per detected conflict.
pub const SYNC_CONFLICTS: &str = "
CREATE TABLE IF NOT EXISTS sync_conflicts (
    conflict_id BLOB PRIMARY KEY CHECK(length(conflict_id) = 16),
    table_name TEXT NOT NULL,
    row_pk BLOB NOT NULL,
    local_op_id BLOB NOT NULL CHECK(length(local_op_id) = 16),
    remote_op_id BLOB NOT NULL CHECK(length(remote_op_id) = 16),
    detected_at INTEGER NOT NULL,
    resolved_at INTEGER,
    resolution_op_id BLOB CHECK(resolution_op_id IS NULL OR length(resolution_op_id) = 16),
    resolution_strategy TEXT,
    FOREIGN KEY (local_op_id) REFERENCES sync_operations(op_id),
    FOREIGN KEY (remote_op_id) REFERENCES sync_operations(op_id),
    FOREIGN KEY (resolution_op_id) REFERENCES sync_operations(op_id)
) STRICT";

pub const SYNC_CONFLICTS_INDICES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_conflicts_unresolved ON sync_conflicts(detected_at) WHERE resolved_at IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_conflicts_row ON sync_conflicts(table_name, row_pk)",
];

/// `sync_peer_state`: per-peer last-sent/last-received vector clocks.
pub const SYNC_PEER_STATE: &str = "
CREATE TABLE IF NOT EXISTS sync_peer_state (
    peer_device_id BLOB PRIMARY KEY CHECK(length(peer_device_id) = 16),
    last_sent_vector_clock TEXT NOT NULL,
    last_sent_at INTEGER NOT NULL,
    last_received_vector_clock TEXT NOT NULL,
    last_received_at INTEGER NOT NULL
) STRICT";

/// `sync_import_log`: one row per imported bundle, keyed by content hash.
pub const SYNC_IMPORT_LOG: &str = "
CREATE TABLE IF NOT EXISTS sync_import_log (
    import_id BLOB PRIMARY KEY CHECK(length(import_id) = 16),
    bundle_id BLOB NOT NULL CHECK(length(bundle_id) = 16),
    bundle_hash BLOB NOT NULL CHECK(length(bundle_hash) = 32),
    imported_at INTEGER NOT NULL,
    source_device_id BLOB NOT NULL CHECK(length(source_device_id) = 16),
    op_count INTEGER NOT NULL,
    applied_count INTEGER NOT NULL,
    conflict_count INTEGER NOT NULL,
    duplicate_count INTEGER NOT NULL,
    UNIQUE(bundle_hash)
) STRICT";

pub const SYNC_IMPORT_LOG_INDICES: &[&str] =
    &["CREATE INDEX IF NOT EXISTS idx_import_log_time ON sync_import_log(imported_at)"];

/// `sync_schema_migrations`: history of additive migrations applied via
/// `migrate_schema`, used by `check_compatibility` to reason about whether a
/// peer announcing a different `schema_version` can be caught up safely.
pub const SYNC_SCHEMA_MIGRATIONS: &str = "
CREATE TABLE IF NOT EXISTS sync_schema_migrations (
    migration_id BLOB PRIMARY KEY CHECK(length(migration_id) = 16),
    table_name TEXT NOT NULL,
    migration_type TEXT NOT NULL CHECK(migration_type IN ('ADD_COLUMN', 'ADD_TABLE')),
    column_name TEXT,
    column_type TEXT,
    default_value TEXT,
    applied_at INTEGER NOT NULL,
    schema_version_after INTEGER NOT NULL
) STRICT";

pub const SYNC_SCHEMA_MIGRATIONS_INDICES: &[&str] =
    &["CREATE INDEX IF NOT EXISTS idx_schema_migrations_version ON sync_schema_migrations(schema_version_after)"];

/// `bundle_metadata`: mirrors [`SYNC_METADATA`]'s sibling concept but scoped
/// to a single exported bundle file; exactly one row per bundle.
pub const BUNDLE_METADATA: &str = "
CREATE TABLE IF NOT EXISTS bundle_metadata (
    bundle_id BLOB PRIMARY KEY CHECK(length(bundle_id) = 16),
    source_device_id BLOB NOT NULL CHECK(length(source_device_id) = 16),
    created_at INTEGER NOT NULL,
    schema_version INTEGER NOT NULL,
    op_count INTEGER NOT NULL,
    content_hash BLOB NOT NULL CHECK(length(content_hash) = 32)
) STRICT";

/// `bundle_operations`: column-for-column identical to `sync_operations`,
/// minus the self-referential foreign key (a bundle is read in isolation,
/// never written to incrementally, so there is nothing for it to reference).
pub const BUNDLE_OPERATIONS: &str = "
CREATE TABLE IF NOT EXISTS bundle_operations (
    op_id BLOB PRIMARY KEY CHECK(length(op_id) = 16),
    device_id BLOB NOT NULL CHECK(length(device_id) = 16),
    parent_op_id BLOB CHECK(parent_op_id IS NULL OR length(parent_op_id) = 16),
    vector_clock TEXT NOT NULL,
    hlc TEXT NOT NULL,
    table_name TEXT NOT NULL,
    op_type TEXT NOT NULL CHECK(op_type IN ('INSERT', 'UPDATE', 'DELETE')),
    row_pk BLOB NOT NULL,
    old_values BLOB,
    new_values BLOB,
    schema_version INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    is_local INTEGER NOT NULL CHECK(is_local IN (0, 1)),
    applied_at INTEGER
) STRICT";

/// Applies every auxiliary-table statement, in dependency order. Idempotent:
/// every statement is `IF NOT EXISTS`.
pub fn create_all(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute(SYNC_OPERATIONS, [])?;
    for stmt in SYNC_OPERATIONS_INDICES {
        conn.execute(stmt, [])?;
    }
    conn.execute(SYNC_METADATA, [])?;
    conn.execute(SYNC_CONFLICTS, [])?;
    for stmt in SYNC_CONFLICTS_INDICES {
        conn.execute(stmt, [])?;
    }
    conn.execute(SYNC_PEER_STATE, [])?;
    conn.execute(SYNC_IMPORT_LOG, [])?;
    for stmt in SYNC_IMPORT_LOG_INDICES {
        conn.execute(stmt, [])?;
    }
    conn.execute(SYNC_SCHEMA_MIGRATIONS, [])?;
    for stmt in SYNC_SCHEMA_MIGRATIONS_INDICES {
        conn.execute(stmt, [])?;
    }
    Ok(())
}

/// Creates the two bundle-file tables in a freshly opened bundle database.
pub fn create_bundle_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute(BUNDLE_METADATA, [])?;
    conn.execute(BUNDLE_OPERATIONS, [])?;
    Ok(())
}
