//! Configuration constants and the per-replica configuration struct.
//!
//! All configuration here is explicit and constructed by the embedding
//! application; no file or environment parsing lives in the core (that
//! belongs to a layer above it).

use std::collections::HashSet;

use once_cell::sync::Lazy;

use crate::resolver::ConflictPolicy;

/// Current schema version for the sync auxiliary tables. Bump when
/// `sync_operations`/`sync_conflicts`/etc. change shape.
pub const SCHEMA_VERSION: i64 = 1;

/// Operation types the log understands.
pub const OPERATION_TYPES: [&str; 3] = ["INSERT", "UPDATE", "DELETE"];

/// Default ceiling on operations per generated bundle; callers may lower it.
pub const DEFAULT_MAX_BUNDLE_OPERATIONS: usize = 100_000;

/// Table names owned by the sync core; user tables may not use these names.
pub static RESERVED_TABLE_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "sync_operations",
        "sync_metadata",
        "sync_conflicts",
        "sync_peer_state",
        "sync_import_log",
        "sync_schema_versions",
        "sync_schema_migrations",
    ]
    .into_iter()
    .collect()
});

/// PRAGMAs applied to every replica connection for durability/consistency.
pub const SQLITE_PRAGMAS: &[(&str, &str)] = &[
    ("journal_mode", "WAL"),
    ("synchronous", "NORMAL"),
    ("foreign_keys", "ON"),
    ("busy_timeout", "5000"),
];

pub const METADATA_KEY_DEVICE_ID: &str = "device_id";
pub const METADATA_KEY_SCHEMA_VERSION: &str = "schema_version";
pub const METADATA_KEY_VECTOR_CLOCK: &str = "vector_clock";

pub const BUNDLE_METADATA_TABLE: &str = "bundle_metadata";
pub const BUNDLE_OPERATIONS_TABLE: &str = "bundle_operations";

/// Per-replica configuration supplied by the embedding application.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub schema_version: i64,
    pub default_conflict_policy: ConflictPolicy,
    pub max_bundle_operations: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            schema_version: SCHEMA_VERSION,
            default_conflict_policy: ConflictPolicy::ColumnLevelLww,
            max_bundle_operations: DEFAULT_MAX_BUNDLE_OPERATIONS,
        }
    }
}

/// Checks a table name is safe to use as a dynamic SQL identifier fragment:
/// non-empty, not reserved, and restricted to ASCII alphanumerics/underscore.
pub fn validate_table_name(table_name: &str) -> crate::error::Result<()> {
    if table_name.is_empty() {
        return Err(crate::error::SyncError::validation_field(
            "table name cannot be empty",
            "table_name",
            table_name,
        ));
    }
    if RESERVED_TABLE_NAMES.contains(table_name) {
        return Err(crate::error::SyncError::validation_field(
            "table name is reserved for sync's own tables",
            "table_name",
            table_name,
        ));
    }
    if !table_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(crate::error::SyncError::validation_field(
            "table name must be alphanumeric/underscore only",
            "table_name",
            table_name,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reserved_table_names() {
        assert!(validate_table_name("sync_operations").is_err());
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        assert!(validate_table_name("items; DROP TABLE x").is_err());
        assert!(validate_table_name("").is_err());
    }

    #[test]
    fn accepts_plain_identifiers() {
        assert!(validate_table_name("items").is_ok());
        assert!(validate_table_name("user_docs_2").is_ok());
    }
}
