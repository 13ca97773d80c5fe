//! An embedded, offline-first replication core for SQLite.
//!
//! Two or more replicas of the same schema can each accept local writes
//! while disconnected, exchange what changed as self-contained bundle
//! files, and converge on the same row state and the same causal history —
//! without a central server or a live connection between them. Causality is
//! tracked with per-device vector clocks; a hybrid logical clock breaks ties
//! deterministically so two replicas that see the same set of operations
//! always resolve conflicts the same way.
//!
//! # Layout
//!
//! The crate is organized leaves-first, matching the algorithm's own
//! decomposition:
//!
//! * [`codec`] — canonical encoding of row values, ids, and content hashes.
//! * [`clock`] — vector clocks (causality) and the hybrid logical clock
//!   (deterministic total order).
//! * [`log`] — the append-only operation log and its auxiliary tables
//!   (metadata, conflicts, peer state, import history, schema migrations).
//! * [`capture`] — SQLite triggers that turn writes to a user table into
//!   appended log entries.
//! * [`bundle`] — the offline exchange unit: generating and validating
//!   bundle files.
//! * [`import`] — applying a bundle's (or a streamed batch's) operations to
//!   a replica's own tables.
//! * [`resolver`] — pluggable conflict resolution policies.
//! * [`error`] — the crate's error taxonomy.
//! * [`config`] — constants and the per-replica configuration struct.
//! * [`replica`] — [`replica::Replica`], the public entry point tying all of
//!   the above together.
//!
//! Most applications only need [`replica::Replica`] and [`resolver::ConflictPolicy`];
//! the rest is exposed for callers building their own transport or tooling
//! on top of the lower-level primitives.

pub mod bundle;
pub mod capture;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod import;
pub mod log;
pub mod replica;
pub mod resolver;

pub use clock::{HlClock, Hlc, VectorClock};
pub use config::ReplicaConfig;
pub use error::{Result, SyncError};
pub use import::ImportResult;
pub use replica::{Replica, ResolutionSide};
pub use resolver::ConflictPolicy;
