//! Sync core bootstrap: auxiliary table creation and the `sync_metadata`
//! key/value rows every replica keeps (device id, schema version, vector
//! clock).

use rusqlite::OptionalExtension;

use crate::clock::VectorClock;
use crate::codec::{id_to_hex, new_id, Id};
use crate::config::{METADATA_KEY_DEVICE_ID, METADATA_KEY_SCHEMA_VERSION, METADATA_KEY_VECTOR_CLOCK, SCHEMA_VERSION};
use crate::error::{Result, SyncError};

use super::schema;

/// Creates the auxiliary tables and, on first run, a fresh device id and an
/// empty vector clock seeded with that device. Idempotent: a second call on
/// an already-initialized database just verifies the schema version and
/// returns the existing device id.
pub fn initialize_sync_tables(conn: &rusqlite::Connection) -> Result<Id> {
    if let Some(existing) = get_device_id_opt(conn)? {
        verify_schema_version(conn)?;
        return Ok(existing);
    }

    schema::create_all(conn)?;

    let device_id = new_id();
    let mut initial_vc = VectorClock::new();
    initial_vc.set(&id_to_hex(&device_id), 0);

    conn.execute(
        "INSERT INTO sync_metadata (key, value) VALUES (?, ?)",
        rusqlite::params![METADATA_KEY_DEVICE_ID, device_id.to_vec()],
    )?;
    conn.execute(
        "INSERT INTO sync_metadata (key, value) VALUES (?, ?)",
        rusqlite::params![METADATA_KEY_SCHEMA_VERSION, SCHEMA_VERSION.to_be_bytes().to_vec()],
    )?;
    conn.execute(
        "INSERT INTO sync_metadata (key, value) VALUES (?, ?)",
        rusqlite::params![METADATA_KEY_VECTOR_CLOCK, initial_vc.to_json()?.into_bytes()],
    )?;

    Ok(device_id)
}

fn get_device_id_opt(conn: &rusqlite::Connection) -> Result<Option<Id>> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM sync_metadata WHERE key = ?",
            [METADATA_KEY_DEVICE_ID],
            |row| row.get(0),
        )
        .optional()
        .or_else(|e| match e {
            rusqlite::Error::SqliteFailure(_, _) => Ok(None),
            other => Err(other),
        })?;
    Ok(bytes.map(|b| b.try_into().unwrap_or([0u8; 16])))
}

fn verify_schema_version(conn: &rusqlite::Connection) -> Result<()> {
    let actual = get_schema_version(conn)?;
    if actual != SCHEMA_VERSION {
        return Err(SyncError::schema_mismatch(SCHEMA_VERSION, actual));
    }
    Ok(())
}

pub fn get_device_id(conn: &rusqlite::Connection) -> Result<Id> {
    get_device_id_opt(conn)?.ok_or_else(|| SyncError::schema("database not initialized: device_id not found"))
}

pub fn get_schema_version(conn: &rusqlite::Connection) -> Result<i64> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM sync_metadata WHERE key = ?",
            [METADATA_KEY_SCHEMA_VERSION],
            |row| row.get(0),
        )
        .optional()?;
    let bytes = bytes.ok_or_else(|| SyncError::schema("database not initialized: schema_version not found"))?;
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| SyncError::schema("malformed schema_version metadata"))?;
    Ok(i64::from_be_bytes(array))
}

pub fn get_vector_clock(conn: &rusqlite::Connection) -> Result<VectorClock> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT value FROM sync_metadata WHERE key = ?",
            [METADATA_KEY_VECTOR_CLOCK],
            |row| row.get(0),
        )
        .optional()?;
    let bytes = bytes.ok_or_else(|| SyncError::schema("database not initialized: vector_clock not found"))?;
    let json = String::from_utf8(bytes).map_err(|e| SyncError::Encoding(e.to_string()))?;
    VectorClock::from_json(&json)
}

pub fn update_vector_clock(conn: &rusqlite::Connection, vc: &VectorClock) -> Result<()> {
    conn.execute(
        "UPDATE sync_metadata SET value = ? WHERE key = ?",
        rusqlite::params![vc.to_json()?.into_bytes(), METADATA_KEY_VECTOR_CLOCK],
    )?;
    Ok(())
}

/// Bumps the replica's recorded schema version, e.g. after
/// [`crate::replica::Replica::migrate_schema`] applies an additive change.
pub fn set_schema_version(conn: &rusqlite::Connection, version: i64) -> Result<()> {
    conn.execute(
        "UPDATE sync_metadata SET value = ? WHERE key = ?",
        rusqlite::params![version.to_be_bytes().to_vec(), METADATA_KEY_SCHEMA_VERSION],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_memory() -> rusqlite::Connection {
        rusqlite::Connection::open_in_memory().unwrap()
    }

    #[test]
    fn initialize_is_idempotent() {
        let conn = open_memory();
        let first = initialize_sync_tables(&conn).unwrap();
        let second = initialize_sync_tables(&conn).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn initial_state_has_schema_version_and_self_seeded_clock() {
        let conn = open_memory();
        let device_id = initialize_sync_tables(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let vc = get_vector_clock(&conn).unwrap();
        assert_eq!(vc.get(&id_to_hex(&device_id)), 0);
    }

    #[test]
    fn vector_clock_round_trips_through_update() {
        let conn = open_memory();
        let device_id = initialize_sync_tables(&conn).unwrap();
        let mut vc = get_vector_clock(&conn).unwrap();
        vc.increment(&id_to_hex(&device_id));
        update_vector_clock(&conn, &vc).unwrap();
        let reloaded = get_vector_clock(&conn).unwrap();
        assert_eq!(reloaded.get(&id_to_hex(&device_id)), 1);
    }

    #[test]
    fn get_device_id_before_init_is_an_error() {
        let conn = open_memory();
        conn.execute_batch("CREATE TABLE sync_metadata (key TEXT PRIMARY KEY, value BLOB)").unwrap();
        assert!(get_device_id(&conn).is_err());
    }
}
