//! reelsync-store: Durable freshness records for source files
//!
//! Maps each source filename to the last freshness token observed on a
//! fully completed sync. Single writer per metadata file: concurrent runs
//! against the same path must be serialized by the caller.

pub mod metadata;

pub use metadata::{FreshnessMap, FreshnessRecord, MetadataStore};
