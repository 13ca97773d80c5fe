//! [`SyncOperation`]: the immutable unit of change in the replication log.

use rusqlite::Row;

use crate::codec::Id;
use crate::error::{Result, SyncError};

/// The three mutation kinds the log understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(OperationType::Insert),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            other => Err(SyncError::validation_field(
                "unknown operation type",
                "op_type",
                other,
            )),
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable row of the append-only operation log.
///
/// Mirrors `sync_operations` column-for-column. Constructed either by
/// [`crate::capture`] from a local write or by [`crate::import`] from a
/// deserialized bundle row; never mutated once built.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOperation {
    pub op_id: Id,
    pub device_id: Id,
    pub parent_op_id: Option<Id>,
    /// Canonical JSON vector clock (sorted keys), as carried on the wire.
    pub vector_clock: String,
    /// Packed `wall_ms:counter:node_id` hybrid logical clock.
    pub hlc: String,
    pub table_name: String,
    pub op_type: OperationType,
    /// Canonically encoded primary key (single value or tuple).
    pub row_pk: Vec<u8>,
    /// Canonically encoded column map; required for UPDATE/DELETE.
    pub old_values: Option<Vec<u8>>,
    /// Canonically encoded column map; required for INSERT/UPDATE.
    pub new_values: Option<Vec<u8>>,
    pub schema_version: i64,
    /// Unix microseconds.
    pub created_at: i64,
    pub is_local: bool,
    /// Unix microseconds; unset while the op is pending or unresolved.
    pub applied_at: Option<i64>,
}

impl SyncOperation {
    /// Builds and validates an operation against the per-type value
    /// requirements (§3: INSERT needs `new_values`, DELETE needs `old_values`).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        op_id: Id,
        device_id: Id,
        parent_op_id: Option<Id>,
        vector_clock: String,
        hlc: String,
        table_name: String,
        op_type: OperationType,
        row_pk: Vec<u8>,
        old_values: Option<Vec<u8>>,
        new_values: Option<Vec<u8>>,
        schema_version: i64,
        created_at: i64,
        is_local: bool,
        applied_at: Option<i64>,
    ) -> Result<Self> {
        if op_type == OperationType::Insert && new_values.is_none() {
            return Err(SyncError::operation(
                "INSERT operation must have new_values",
                Some(crate::codec::id_to_hex(&op_id)),
                Some(op_type.as_str()),
                Some(table_name),
            ));
        }
        if op_type == OperationType::Delete && old_values.is_none() {
            return Err(SyncError::operation(
                "DELETE operation must have old_values",
                Some(crate::codec::id_to_hex(&op_id)),
                Some(op_type.as_str()),
                Some(table_name),
            ));
        }
        Ok(SyncOperation {
            op_id,
            device_id,
            parent_op_id,
            vector_clock,
            hlc,
            table_name,
            op_type,
            row_pk,
            old_values,
            new_values,
            schema_version,
            created_at,
            is_local,
            applied_at,
        })
    }

    pub fn vector_clock(&self) -> Result<crate::clock::VectorClock> {
        crate::clock::VectorClock::from_json(&self.vector_clock)
    }

    pub fn hlc(&self) -> Result<crate::clock::Hlc> {
        crate::clock::Hlc::unpack(&self.hlc)
    }

    /// Reconstructs an operation from a `SELECT * FROM sync_operations` (or
    /// `bundle_operations`, which shares the same column order) row.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let op_id: Vec<u8> = row.get(0)?;
        let device_id: Vec<u8> = row.get(1)?;
        let parent_op_id: Option<Vec<u8>> = row.get(2)?;
        let op_type_str: String = row.get(6)?;

        let op = SyncOperation {
            op_id: to_id(op_id),
            device_id: to_id(device_id),
            parent_op_id: parent_op_id.map(to_id),
            vector_clock: row.get(3)?,
            hlc: row.get(4)?,
            table_name: row.get(5)?,
            op_type: OperationType::parse(&op_type_str)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e)))?,
            row_pk: row.get(7)?,
            old_values: row.get(8)?,
            new_values: row.get(9)?,
            schema_version: row.get(10)?,
            created_at: row.get(11)?,
            is_local: row.get::<_, i64>(12)? != 0,
            applied_at: row.get(13)?,
        };
        Ok(op)
    }
}

fn to_id(bytes: Vec<u8>) -> Id {
    bytes.try_into().unwrap_or([0u8; 16])
}

pub(crate) const SELECT_COLUMNS: &str = "op_id, device_id, parent_op_id, vector_clock, hlc, \
table_name, op_type, row_pk, old_values, new_values, schema_version, created_at, is_local, applied_at";
