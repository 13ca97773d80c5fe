//! Per-peer replication state: what we last sent to, and last received
//! from, each device we exchange bundles with (§4.5).

use rusqlite::{params, OptionalExtension};

use crate::clock::VectorClock;
use crate::codec::Id;
use crate::error::Result;

/// `last_sent_vector_clock`/`last_received_vector_clock` for one peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerState {
    pub peer_device_id: Id,
    pub last_sent_vector_clock: VectorClock,
    pub last_sent_at: i64,
    pub last_received_vector_clock: VectorClock,
    pub last_received_at: i64,
}

/// The vector clock we last sent to `peer_device_id`, or an empty clock for
/// a peer we've never exchanged bundles with.
pub fn last_sent_vector_clock(conn: &rusqlite::Connection, peer_device_id: &Id) -> Result<VectorClock> {
    let json: Option<String> = conn
        .query_row(
            "SELECT last_sent_vector_clock FROM sync_peer_state WHERE peer_device_id = ?",
            params![peer_device_id.to_vec()],
            |row| row.get(0),
        )
        .optional()?;
    match json {
        Some(json) => VectorClock::from_json(&json),
        None => Ok(VectorClock::new()),
    }
}

/// Records the vector clock just sent to a peer, upserting its row.
pub fn record_sent(
    conn: &rusqlite::Connection,
    peer_device_id: &Id,
    sent_vc: &VectorClock,
    sent_at: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_peer_state (peer_device_id, last_sent_vector_clock, last_sent_at, \
         last_received_vector_clock, last_received_at) VALUES (?, ?, ?, ?, 0) \
         ON CONFLICT(peer_device_id) DO UPDATE SET \
         last_sent_vector_clock = excluded.last_sent_vector_clock, last_sent_at = excluded.last_sent_at",
        params![peer_device_id.to_vec(), sent_vc.to_json()?, sent_at, VectorClock::new().to_json()?],
    )?;
    Ok(())
}

/// Records the vector clock just received from a peer (i.e. the sender's
/// clock carried in an imported bundle's metadata), upserting its row.
pub fn record_received(
    conn: &rusqlite::Connection,
    peer_device_id: &Id,
    received_vc: &VectorClock,
    received_at: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_peer_state (peer_device_id, last_sent_vector_clock, last_sent_at, \
         last_received_vector_clock, last_received_at) VALUES (?, ?, 0, ?, ?) \
         ON CONFLICT(peer_device_id) DO UPDATE SET \
         last_received_vector_clock = excluded.last_received_vector_clock, last_received_at = excluded.last_received_at",
        params![peer_device_id.to_vec(), VectorClock::new().to_json()?, received_vc.to_json()?, received_at],
    )?;
    Ok(())
}

/// Every known peer's state, in no particular order. Used by log
/// compaction to compute the floor below which every peer has caught up.
pub fn all_peer_states(conn: &rusqlite::Connection) -> Result<Vec<PeerState>> {
    let mut stmt = conn.prepare(
        "SELECT peer_device_id, last_sent_vector_clock, last_sent_at, last_received_vector_clock, last_received_at \
         FROM sync_peer_state",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let id: Vec<u8> = row.get(0)?;
            let sent_json: String = row.get(1)?;
            let sent_at: i64 = row.get(2)?;
            let received_json: String = row.get(3)?;
            let received_at: i64 = row.get(4)?;
            Ok((id, sent_json, sent_at, received_json, received_at))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(id, sent_json, sent_at, received_json, received_at)| {
            Ok(PeerState {
                peer_device_id: id.try_into().unwrap_or([0u8; 16]),
                last_sent_vector_clock: VectorClock::from_json(&sent_json)?,
                last_sent_at: sent_at,
                last_received_vector_clock: VectorClock::from_json(&received_json)?,
                last_received_at: received_at,
            })
        })
        .collect()
}

pub fn get_peer_state(conn: &rusqlite::Connection, peer_device_id: &Id) -> Result<Option<PeerState>> {
    conn.query_row(
        "SELECT peer_device_id, last_sent_vector_clock, last_sent_at, last_received_vector_clock, last_received_at \
         FROM sync_peer_state WHERE peer_device_id = ?",
        params![peer_device_id.to_vec()],
        |row| {
            let id: Vec<u8> = row.get(0)?;
            let sent_json: String = row.get(1)?;
            let sent_at: i64 = row.get(2)?;
            let received_json: String = row.get(3)?;
            let received_at: i64 = row.get(4)?;
            Ok((id, sent_json, sent_at, received_json, received_at))
        },
    )
    .optional()?
    .map(|(id, sent_json, sent_at, received_json, received_at)| {
        Ok(PeerState {
            peer_device_id: id.try_into().unwrap_or([0u8; 16]),
            last_sent_vector_clock: VectorClock::from_json(&sent_json)?,
            last_sent_at: sent_at,
            last_received_vector_clock: VectorClock::from_json(&received_json)?,
            last_received_at: received_at,
        })
    })
    .transpose()
}
