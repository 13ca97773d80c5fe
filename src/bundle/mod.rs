//! Bundle files (§4.5): the unit of offline exchange between two replicas.
//!
//! A bundle is a self-contained SQLite file — generated by [`generate::generate_bundle`],
//! checked by [`validate::validate`] before anything in it is trusted, and
//! applied by [`crate::import`].

pub mod format;
pub mod generate;
pub mod validate;

pub use format::{BundleMetadata, BUNDLE_EXTENSION};
pub use generate::generate_bundle;
pub use validate::validate;
