//! Canonical codecs (C1): deterministic binary encoding of primary keys and
//! column maps, content hashing, and time-ordered identifiers.
//!
//! Everything else in the crate builds on top of this module: the operation
//! log stores `row_pk`/`old_values`/`new_values` as the bytes produced here,
//! bundles are integrity-checked with [`hash::sha256_sequence`], and every
//! id — operation, device, bundle, conflict — comes from [`id::new_id`].

pub mod hash;
pub mod id;
pub mod value;

pub use hash::{sha256, sha256_sequence};
pub use id::{id_from_hex, id_to_hex, new_id, Id};
pub use value::{decode_map, decode_pk, encode_map, encode_pk, Value, ValueMap};
