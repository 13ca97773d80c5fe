//! The bundle file's own shape: `bundle_metadata` (exactly one row) and
//! `bundle_operations`, created fresh in every bundle file by
//! [`crate::log::schema::create_bundle_schema`].

use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Row};

use crate::codec::Id;

/// Conventional suffix for a generated bundle file, matching the reference
/// tooling so bundles are recognizable by name alone.
pub const BUNDLE_EXTENSION: &str = ".bundle.db";

/// The single metadata row every valid bundle carries.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleMetadata {
    pub bundle_id: Id,
    pub source_device_id: Id,
    pub created_at: i64,
    pub schema_version: i64,
    pub op_count: i64,
    pub content_hash: [u8; 32],
}

pub(crate) const SELECT_COLUMNS: &str =
    "bundle_id, source_device_id, created_at, schema_version, op_count, content_hash";

impl BundleMetadata {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let bundle_id: Vec<u8> = row.get(0)?;
        let source_device_id: Vec<u8> = row.get(1)?;
        let content_hash: Vec<u8> = row.get(5)?;
        Ok(BundleMetadata {
            bundle_id: bundle_id.try_into().unwrap_or([0u8; 16]),
            source_device_id: source_device_id.try_into().unwrap_or([0u8; 16]),
            created_at: row.get(2)?,
            schema_version: row.get(3)?,
            op_count: row.get(4)?,
            content_hash: content_hash.try_into().unwrap_or([0u8; 32]),
        })
    }

    pub(crate) fn insert(&self, conn: &rusqlite::Connection) -> rusqlite::Result<()> {
        let sql = format!("INSERT INTO bundle_metadata ({SELECT_COLUMNS}) VALUES (?,?,?,?,?,?)");
        conn.execute(
            &sql,
            params![
                self.bundle_id.to_vec(),
                self.source_device_id.to_vec(),
                self.created_at,
                self.schema_version,
                self.op_count,
                self.content_hash.to_vec(),
            ],
        )?;
        Ok(())
    }
}

pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}
