//! SHA-256 content hashing, used for bundle integrity.

use sha2::{Digest, Sha256};

use crate::codec::id::Id;

/// Hashes an arbitrary byte slice.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hashes a sequence of 16-byte operation ids, concatenated in the order
/// given by the caller. Callers that need a canonical hash must sort the
/// ids themselves before calling this (see `bundle::content_hash_for_ops`).
pub fn sha256_sequence<'a>(ids: impl IntoIterator<Item = &'a Id>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for id in ids {
        hasher.update(id);
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_deterministic() {
        assert_eq!(sha256(b"hello"), sha256(b"hello"));
        assert_ne!(sha256(b"hello"), sha256(b"world"));
    }

    #[test]
    fn sequence_hash_is_order_sensitive() {
        let a: Id = [1u8; 16];
        let b: Id = [2u8; 16];
        let forward = sha256_sequence([&a, &b]);
        let backward = sha256_sequence([&b, &a]);
        assert_ne!(forward, backward);
    }
}
