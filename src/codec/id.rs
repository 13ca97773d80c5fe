//! Time-ordered 128-bit identifiers.
//!
//! Every operation, device, bundle and conflict id is a UUIDv7: a 48-bit
//! millisecond timestamp in the high bits, a 4-bit version and 2-bit variant
//! tag in their standard fixed positions, and 74 bits of randomness filling
//! the rest. This gives ids that sort lexicographically by creation time
//! while remaining effectively unique across replicas with no coordination.

use uuid::Uuid;

/// A 128-bit time-ordered identifier, stored as its raw 16 bytes.
pub type Id = [u8; 16];

/// Generates a fresh time-ordered identifier.
pub fn new_id() -> Id {
    *Uuid::now_v7().as_bytes()
}

/// Hex-encodes an id the way the wire format and error messages expect.
pub fn id_to_hex(id: &Id) -> String {
    hex::encode(id)
}

/// Parses a 32-character hex string back into an id.
pub fn id_from_hex(s: &str) -> Option<Id> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_ids() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_are_time_ordered() {
        let mut prev = new_id();
        for _ in 0..16 {
            let next = new_id();
            assert!(next >= prev, "ids must sort non-decreasing by creation time");
            prev = next;
        }
    }

    #[test]
    fn hex_round_trips() {
        let id = new_id();
        let hex = id_to_hex(&id);
        assert_eq!(hex.len(), 32);
        assert_eq!(id_from_hex(&hex), Some(id));
    }
}
