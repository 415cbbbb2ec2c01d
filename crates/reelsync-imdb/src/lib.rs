//! IMDb dataset sync: gzip TSV over HTTP → cleaned Arrow batches → PostgreSQL
//!
//! Pipeline per dataset:
//! 1. Compare the remote freshness token with the stored one (skip if equal)
//! 2. Stream + decompress the file into bounded batches
//! 3. Filter, rename, and derive fields per batch
//! 4. COPY each batch into the table (first batch recreates it)
//! 5. Record the new token

pub mod dataset;
pub mod detect;
pub mod extract;
pub mod load;
pub mod postgres;
pub mod runner;
pub mod transform;

pub use dataset::{ColumnSpec, DatasetConfig, Derivation, ScalarType, actors, builtin, builtins, movies};
pub use detect::{ChangeDetector, Decision, FreshnessProbe, HttpProbe};
pub use extract::{
    ChunkReader, DEFAULT_BATCH_SIZE, ExtractError, Extractor, HttpSource, OpenedSource, RawBatch,
    SourceOpener,
};
pub use load::{BatchWriter, LoadError, LoadMode, LoadStats, load};
pub use postgres::{PgDestination, PgWriter};
pub use runner::{DatasetOutcome, Destination, Pipeline, Stage, Summary};
pub use transform::{Transform, TransformStats, TransformedBatch, transform, transform_batch};
