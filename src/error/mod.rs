//! Error types for the replication core.
//!
//! One enum covers the taxonomy the replication algorithm needs: malformed
//! inputs, schema problems, bundle integrity failures, conflict-resolution
//! misuse, operation application failures, underlying storage failures, and
//! internal invariant violations. Each variant carries structured context
//! rather than a bare string so callers can branch on it without parsing
//! messages.

use std::fmt;
use std::result;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = result::Result<T, SyncError>;

/// A single named invariant, used as context on [`SyncError::InvariantViolation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invariant {
    AppendOnly,
    CausalConsistency,
    DeterministicOrdering,
    ExplicitConflicts,
    IdempotentImport,
    AtomicTransactions,
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Invariant::AppendOnly => "APPEND_ONLY",
            Invariant::CausalConsistency => "CAUSAL_CONSISTENCY",
            Invariant::DeterministicOrdering => "DETERMINISTIC_ORDERING",
            Invariant::ExplicitConflicts => "EXPLICIT_CONFLICTS",
            Invariant::IdempotentImport => "IDEMPOTENT_IMPORT",
            Invariant::AtomicTransactions => "ATOMIC_TRANSACTIONS",
        };
        f.write_str(s)
    }
}

/// Reason code for a [`SyncError::Bundle`] failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleErrorReason {
    OpenFailed,
    IntegrityCheckFailed,
    MissingTables,
    NoMetadata,
    MultipleMetadata,
    InvalidMetadata,
    SchemaMismatch,
    OpCountMismatch,
    HashMismatch,
    InvalidOpId,
    InvalidDeviceId,
    InvalidOpType,
}

impl fmt::Display for BundleErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BundleErrorReason::OpenFailed => "open_failed",
            BundleErrorReason::IntegrityCheckFailed => "integrity_check_failed",
            BundleErrorReason::MissingTables => "missing_tables",
            BundleErrorReason::NoMetadata => "no_metadata",
            BundleErrorReason::MultipleMetadata => "multiple_metadata",
            BundleErrorReason::InvalidMetadata => "invalid_metadata",
            BundleErrorReason::SchemaMismatch => "schema_mismatch",
            BundleErrorReason::OpCountMismatch => "op_count_mismatch",
            BundleErrorReason::HashMismatch => "hash_mismatch",
            BundleErrorReason::InvalidOpId => "invalid_op_id",
            BundleErrorReason::InvalidDeviceId => "invalid_device_id",
            BundleErrorReason::InvalidOpType => "invalid_op_type",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation error: {message} (field={field:?}, value={value:?})")]
    Validation {
        message: String,
        field: Option<String>,
        value: Option<String>,
    },

    #[error("schema error: {message} (expected={expected:?}, actual={actual:?})")]
    Schema {
        message: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("bundle error: {message} (path={bundle_path:?}, reason={reason})")]
    Bundle {
        message: String,
        bundle_path: Option<String>,
        reason: BundleErrorReason,
    },

    #[error("conflict error: {message} (conflict_id={conflict_id:?}, table={table_name:?})")]
    Conflict {
        message: String,
        conflict_id: Option<String>,
        table_name: Option<String>,
    },

    #[error("operation error: {message} (op_id={op_id:?}, op_type={op_type:?}, table={table_name:?})")]
    Operation {
        message: String,
        op_id: Option<String>,
        op_type: Option<String>,
        table_name: Option<String>,
    },

    #[error("database error during {operation}: {message}")]
    Database {
        message: String,
        operation: String,
        sql: Option<String>,
    },

    #[error("invariant violation [{invariant}]: {details}")]
    InvariantViolation {
        invariant: Invariant,
        details: String,
    },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::Validation {
            message: message.into(),
            field: None,
            value: None,
        }
    }

    pub fn validation_field(
        message: impl Into<String>,
        field: impl Into<String>,
        value: impl fmt::Debug,
    ) -> Self {
        let mut repr = format!("{value:?}");
        if repr.len() > 100 {
            repr.truncate(100);
        }
        SyncError::Validation {
            message: message.into(),
            field: Some(field.into()),
            value: Some(repr),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        SyncError::Schema {
            message: message.into(),
            expected: None,
            actual: None,
        }
    }

    pub fn schema_mismatch(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        SyncError::Schema {
            message: "schema version mismatch".to_string(),
            expected: Some(expected.to_string()),
            actual: Some(actual.to_string()),
        }
    }

    pub fn bundle(
        message: impl Into<String>,
        bundle_path: Option<impl Into<String>>,
        reason: BundleErrorReason,
    ) -> Self {
        SyncError::Bundle {
            message: message.into(),
            bundle_path: bundle_path.map(Into::into),
            reason,
        }
    }

    pub fn conflict(
        message: impl Into<String>,
        conflict_id: Option<impl Into<String>>,
        table_name: Option<impl Into<String>>,
    ) -> Self {
        SyncError::Conflict {
            message: message.into(),
            conflict_id: conflict_id.map(Into::into),
            table_name: table_name.map(Into::into),
        }
    }

    pub fn operation(
        message: impl Into<String>,
        op_id: Option<impl Into<String>>,
        op_type: Option<impl Into<String>>,
        table_name: Option<impl Into<String>>,
    ) -> Self {
        SyncError::Operation {
            message: message.into(),
            op_id: op_id.map(Into::into),
            op_type: op_type.map(Into::into),
            table_name: table_name.map(Into::into),
        }
    }

    pub fn database(message: impl Into<String>, operation: impl Into<String>) -> Self {
        SyncError::Database {
            message: message.into(),
            operation: operation.into(),
            sql: None,
        }
    }

    pub fn database_sql(
        message: impl Into<String>,
        operation: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        let mut truncated = sql.into();
        if truncated.len() > 200 {
            truncated.truncate(200);
        }
        SyncError::Database {
            message: message.into(),
            operation: operation.into(),
            sql: Some(truncated),
        }
    }

    pub fn invariant(invariant: Invariant, details: impl Into<String>) -> Self {
        SyncError::InvariantViolation {
            invariant,
            details: details.into(),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Database {
            message: e.to_string(),
            operation: "rusqlite".to_string(),
            sql: None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Encoding(e.to_string())
    }
}
