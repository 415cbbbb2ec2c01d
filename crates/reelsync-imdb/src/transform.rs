//! Row-level cleanup of raw batches
//!
//! Per batch, in order: prune to configured columns, drop rows with a null
//! critical field, skip if empty, rename to canonical names, normalize
//! leftover null sentinels, compute derived fields.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BooleanArray, RecordBatch, StringArray};
use arrow::compute::filter;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;

use crate::dataset::{ColumnSpec, DatasetConfig, Derivation};
use crate::extract::{ExtractError, RawBatch, is_null_token};

/// A cleaned batch, tagged with the ordinal of the raw batch it came from.
#[derive(Debug, Clone)]
pub struct TransformedBatch {
    pub ordinal: usize,
    pub batch: RecordBatch,
}

/// Counters for one transform pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub batches_in: usize,
    /// Batches with no rows left after filtering
    pub skipped_batches: usize,
    pub rows_in: u64,
    /// Rows dropped for a null critical field
    pub dropped_rows: u64,
}

fn is_null_like(array: &dyn Array, row: usize) -> bool {
    if array.is_null(row) {
        return true;
    }
    match array.as_any().downcast_ref::<StringArray>() {
        Some(strings) => is_null_token(strings.value(row)),
        None => false,
    }
}

/// Rows to keep: every critical field present and not null-like.
///
/// A critical column missing from the batch disqualifies every row.
fn critical_mask(
    retained: &[(&ColumnSpec, ArrayRef)],
    critical: &[String],
    num_rows: usize,
) -> BooleanArray {
    let columns: Option<Vec<&ArrayRef>> = critical
        .iter()
        .map(|name| {
            retained
                .iter()
                .find(|(spec, _)| &spec.source == name)
                .map(|(_, array)| array)
        })
        .collect();

    let Some(columns) = columns else {
        return BooleanArray::from(vec![false; num_rows]);
    };
    (0..num_rows)
        .map(|row| Some(columns.iter().all(|a| !is_null_like(a.as_ref(), row))))
        .collect()
}

/// Replace `\N` and empty strings that survived parsing with real nulls.
fn normalize_nulls(array: ArrayRef) -> ArrayRef {
    let Some(strings) = array.as_any().downcast_ref::<StringArray>() else {
        return array;
    };
    if !strings.iter().flatten().any(is_null_token) {
        return array;
    }
    let cleaned: StringArray = strings
        .iter()
        .map(|v| v.filter(|s| !is_null_token(s)))
        .collect();
    Arc::new(cleaned)
}

fn presence_flag(array: Option<&ArrayRef>, num_rows: usize) -> ArrayRef {
    let flags: BooleanArray = match array {
        Some(a) => (0..num_rows).map(|row| Some(!a.is_null(row))).collect(),
        None => BooleanArray::from(vec![false; num_rows]),
    };
    Arc::new(flags)
}

/// Clean one raw batch. `Ok(None)` when no rows survive filtering.
///
/// Columns absent from `raw` are skipped (upstream schema drift); extra
/// columns in `raw` are dropped.
pub fn transform_batch(
    raw: &RecordBatch,
    cfg: &DatasetConfig,
) -> Result<Option<RecordBatch>, ArrowError> {
    let schema = raw.schema();

    // 1. prune
    let mut retained: Vec<(&ColumnSpec, ArrayRef)> = cfg
        .columns
        .iter()
        .filter_map(|spec| {
            schema
                .index_of(&spec.source)
                .ok()
                .map(|idx| (spec, raw.column(idx).clone()))
        })
        .collect();

    // 2. critical-field filter
    let mask = critical_mask(&retained, &cfg.critical, raw.num_rows());
    let kept = mask.true_count();
    if kept < raw.num_rows() {
        for (_, array) in retained.iter_mut() {
            *array = filter(array.as_ref(), &mask)?;
        }
    }

    // 3. skip empty
    if kept == 0 {
        return Ok(None);
    }

    // 4. rename, 5. normalize
    let mut fields = Vec::with_capacity(retained.len() + cfg.derive.len());
    let mut arrays = Vec::with_capacity(retained.len() + cfg.derive.len());
    let mut flag_sources: Vec<(&str, ArrayRef)> = Vec::new();
    for (spec, array) in retained {
        let array = normalize_nulls(array);
        let derived_from = cfg.derive.iter().any(|d| match d {
            Derivation::PresenceFlag { source, .. } => *source == spec.source,
        });
        if derived_from {
            flag_sources.push((spec.source.as_str(), array));
            continue;
        }
        fields.push(Field::new(&spec.canonical, array.data_type().clone(), true));
        arrays.push(array);
    }

    // 6. derived fields; their sources are dropped above
    for d in &cfg.derive {
        match d {
            Derivation::PresenceFlag { source, target } => {
                let input = flag_sources
                    .iter()
                    .find(|(name, _)| *name == source.as_str())
                    .map(|(_, a)| a);
                fields.push(Field::new(target, DataType::Boolean, false));
                arrays.push(presence_flag(input, kept));
            }
        }
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).map(Some)
}

/// Lazy transform over a raw batch sequence.
///
/// Pulls one raw batch per output batch (plus any skipped empties), so it
/// runs in lockstep with the extractor.
pub struct Transform<'a, I> {
    inner: I,
    cfg: &'a DatasetConfig,
    stats: TransformStats,
}

impl<I> Transform<'_, I> {
    pub fn stats(&self) -> TransformStats {
        self.stats
    }

    /// The wrapped raw batch source.
    pub fn inner(&self) -> &I {
        &self.inner
    }
}

impl<I> Iterator for Transform<'_, I>
where
    I: Iterator<Item = Result<RawBatch, ExtractError>>,
{
    type Item = Result<TransformedBatch, ExtractError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let raw = match self.inner.next()? {
                Ok(raw) => raw,
                Err(e) => return Some(Err(e)),
            };
            self.stats.batches_in += 1;
            self.stats.rows_in += raw.batch.num_rows() as u64;

            match transform_batch(&raw.batch, self.cfg) {
                Ok(Some(batch)) => {
                    self.stats.dropped_rows += (raw.batch.num_rows() - batch.num_rows()) as u64;
                    return Some(Ok(TransformedBatch {
                        ordinal: raw.ordinal,
                        batch,
                    }));
                }
                Ok(None) => {
                    log::debug!("{}: batch {} empty after filtering", self.cfg.table, raw.ordinal);
                    self.stats.skipped_batches += 1;
                    self.stats.dropped_rows += raw.batch.num_rows() as u64;
                }
                Err(e) => return Some(Err(ExtractError::Transform(e))),
            }
        }
    }
}

/// Wrap `raw` in a lazy [`Transform`] for `cfg`.
pub fn transform<I>(raw: I, cfg: &DatasetConfig) -> Transform<'_, I::IntoIter>
where
    I: IntoIterator<Item = Result<RawBatch, ExtractError>>,
{
    Transform {
        inner: raw.into_iter(),
        cfg,
        stats: TransformStats::default(),
    }
}
