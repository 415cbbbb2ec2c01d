//! Batch loading: replace the table on the first batch, append after

use std::time::Duration;

use arrow::array::RecordBatch;
use arrow::error::ArrowError;
use reelsync_core::is_shutdown_requested;

use crate::dataset::DatasetConfig;
use crate::extract::ExtractError;
use crate::transform::TransformedBatch;

/// How a batch lands in the destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Drop and recreate the table, then insert
    Replace,
    Append,
}

/// Error types for loading
#[derive(Debug)]
pub enum LoadError {
    /// Extraction or transformation failed while pulling the next batch
    Upstream(ExtractError),
    Database(tokio_postgres::Error),
    /// A database call exceeded its deadline
    Timeout {
        operation: String,
        after: Duration,
    },
    Arrow(ArrowError),
    Io(std::io::Error),
    /// Batch column type with no table mapping
    Schema(String),
    /// Ordinal not greater than the previous one
    OutOfOrder { previous: usize, got: usize },
    /// Shutdown requested between batches
    Interrupted,
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upstream(e) => write!(f, "{e}"),
            Self::Database(e) => write!(f, "database error: {e}"),
            Self::Timeout { operation, after } => {
                write!(f, "{operation} timed out after {}s", after.as_secs())
            }
            Self::Arrow(e) => write!(f, "arrow error: {e}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
            Self::Schema(msg) => write!(f, "schema error: {msg}"),
            Self::OutOfOrder { previous, got } => {
                write!(f, "batch {got} arrived after batch {previous}")
            }
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Upstream(e) => Some(e),
            Self::Database(e) => Some(e),
            Self::Arrow(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Timeout { .. } | Self::Schema(_) | Self::OutOfOrder { .. } | Self::Interrupted => {
                None
            }
        }
    }
}

impl From<tokio_postgres::Error> for LoadError {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::Database(e)
    }
}

impl From<ArrowError> for LoadError {
    fn from(e: ArrowError) -> Self {
        Self::Arrow(e)
    }
}

impl From<std::io::Error> for LoadError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Destination for cleaned batches.
pub trait BatchWriter {
    /// Insert `batch` into `cfg.table`, returning rows written.
    ///
    /// With [`LoadMode::Replace`] the table is recreated first.
    fn write_batch(
        &mut self,
        cfg: &DatasetConfig,
        batch: &RecordBatch,
        mode: LoadMode,
    ) -> Result<u64, LoadError>;
}

/// Running totals of a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub batches: usize,
    pub rows: u64,
    pub last_ordinal: Option<usize>,
}

/// Drain `batches` into `writer`, one batch at a time.
///
/// The first non-empty batch is written with [`LoadMode::Replace`], every
/// later one with [`LoadMode::Append`]. `on_batch` sees the totals after
/// each write. Errors stop the load immediately; nothing is rolled back.
pub fn load<W, I>(
    writer: &mut W,
    batches: I,
    cfg: &DatasetConfig,
    mut on_batch: impl FnMut(&LoadStats),
) -> Result<LoadStats, LoadError>
where
    W: BatchWriter + ?Sized,
    I: IntoIterator<Item = Result<TransformedBatch, ExtractError>>,
{
    let mut batches = batches.into_iter();
    let mut stats = LoadStats::default();

    loop {
        if is_shutdown_requested() {
            return Err(LoadError::Interrupted);
        }
        let Some(next) = batches.next() else {
            break;
        };
        let TransformedBatch { ordinal, batch } = next.map_err(LoadError::Upstream)?;
        if batch.num_rows() == 0 {
            continue;
        }
        if let Some(previous) = stats.last_ordinal {
            if ordinal <= previous {
                return Err(LoadError::OutOfOrder {
                    previous,
                    got: ordinal,
                });
            }
        }

        let mode = if stats.batches == 0 {
            LoadMode::Replace
        } else {
            LoadMode::Append
        };
        let written = writer.write_batch(cfg, &batch, mode)?;

        stats.batches += 1;
        stats.rows += written;
        stats.last_ordinal = Some(ordinal);
        on_batch(&stats);
    }

    if stats.batches == 0 {
        log::warn!("{}: no rows to load, existing table left as is", cfg.table);
    }
    Ok(stats)
}
