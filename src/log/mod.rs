//! Append-only operation log (C3) and its auxiliary tables: metadata,
//! conflicts, peer state, and the import log. Everything here operates on
//! a plain `&rusqlite::Connection` — transaction boundaries belong to
//! callers (`capture`, `import`, `replica`), since the log shares the same
//! database and transaction scope as the user's own tables (§3).

pub mod conflict;
pub mod import_log;
pub mod metadata;
pub mod migration;
pub mod operation;
pub mod peer;
pub mod schema;
pub mod schema_info;
pub mod store;

pub use conflict::SyncConflict;
pub use import_log::ImportLogEntry;
pub use migration::SchemaMigration;
pub use operation::{OperationType, SyncOperation};
pub use peer::PeerState;
