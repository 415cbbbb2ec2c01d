//! Pipeline orchestration: detect → extract → transform → load → persist
//!
//! Datasets run one at a time. A failing dataset is recorded and the next
//! one still runs; metadata is only written after a complete load.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use reelsync_core::progress::upgrade_to_bar;
use reelsync_core::{ProgressContext, SharedProgress, fmt_num, is_shutdown_requested};
use reelsync_store::MetadataStore;

use crate::dataset::DatasetConfig;
use crate::detect::{ChangeDetector, FreshnessProbe};
use crate::extract::{ExtractError, Extractor, SourceOpener};
use crate::load::{BatchWriter, LoadError, load};
use crate::transform::transform;

/// Opens a writer for one dataset run.
///
/// The writer is dropped when the run ends, releasing its connection.
pub trait Destination {
    type Writer: BatchWriter;

    fn connect(&self) -> Result<Self::Writer, LoadError>;
}

/// Where a dataset run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CheckFreshness,
    Connecting,
    Extracting,
    Transforming,
    Loading,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CheckFreshness => "check",
            Self::Connecting => "connect",
            Self::Extracting => "extract",
            Self::Transforming => "transform",
            Self::Loading => "load",
        };
        f.write_str(s)
    }
}

impl Stage {
    fn of(err: &LoadError) -> Self {
        match err {
            LoadError::Upstream(ExtractError::Transform(_)) => Self::Transforming,
            LoadError::Upstream(_) => Self::Extracting,
            _ => Self::Loading,
        }
    }
}

/// Terminal state of one dataset run.
#[derive(Debug)]
pub enum DatasetOutcome {
    /// Remote file unchanged since the last sync
    Skipped,
    Loaded {
        rows: u64,
        batches: usize,
        /// Batches with no rows left after filtering
        skipped_batches: usize,
        /// Rows dropped for a null critical field
        dropped_rows: u64,
    },
    Failed {
        stage: Stage,
        error: anyhow::Error,
        /// Whether the source stream was opened (the table may have changed)
        started: bool,
    },
}

impl DatasetOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    fn failed(stage: Stage, error: anyhow::Error, started: bool) -> Self {
        Self::Failed {
            stage,
            error,
            started,
        }
    }
}

/// Results of a multi-dataset run.
#[derive(Debug, Default)]
pub struct Summary {
    /// `(table, outcome)` in run order
    pub outcomes: Vec<(String, DatasetOutcome)>,
    pub elapsed: Duration,
}

impl Summary {
    pub fn loaded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DatasetOutcome::Loaded { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, DatasetOutcome::Skipped))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_failed()).count()
    }

    pub fn total_rows(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                DatasetOutcome::Loaded { rows, .. } => *rows,
                _ => 0,
            })
            .sum()
    }

    /// Every dataset failed before its source stream was opened.
    ///
    /// The only case that warrants a failing exit status.
    pub fn none_started(&self) -> bool {
        !self.outcomes.is_empty()
            && self
                .outcomes
                .iter()
                .all(|(_, o)| matches!(o, DatasetOutcome::Failed { started: false, .. }))
    }
}

/// Wires the stages together for a sequence of datasets.
pub struct Pipeline<P, S, D> {
    detector: ChangeDetector<P>,
    extractor: Extractor<S>,
    destination: D,
    store: MetadataStore,
    force: bool,
    progress: SharedProgress,
}

impl<P, S, D> Pipeline<P, S, D>
where
    P: FreshnessProbe,
    S: SourceOpener,
    D: Destination,
{
    pub fn new(
        detector: ChangeDetector<P>,
        extractor: Extractor<S>,
        destination: D,
        store: MetadataStore,
    ) -> Self {
        Self {
            detector,
            extractor,
            destination,
            store,
            force: false,
            progress: Arc::new(ProgressContext::hidden()),
        }
    }

    /// Bypass change detection; the token is still recorded on success.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Run every dataset in order, isolating failures.
    ///
    /// After a shutdown request, remaining datasets are reported as failed
    /// without being started.
    pub fn run_all(&self, datasets: &[DatasetConfig]) -> Summary {
        let start = Instant::now();
        let mut outcomes = Vec::with_capacity(datasets.len());

        for cfg in datasets {
            let outcome = if is_shutdown_requested() {
                DatasetOutcome::failed(Stage::CheckFreshness, anyhow!("interrupted before start"), false)
            } else {
                self.run_dataset(cfg)
            };
            if let DatasetOutcome::Failed { stage, error, .. } = &outcome {
                log::error!("{}: failed during {stage}: {error:#}", cfg.table);
            }
            outcomes.push((cfg.table.clone(), outcome));
        }

        let summary = Summary {
            outcomes,
            elapsed: start.elapsed(),
        };
        log::info!(
            "Done in {:.1}s: {} loaded, {} skipped, {} failed, {} rows",
            summary.elapsed.as_secs_f64(),
            summary.loaded(),
            summary.skipped(),
            summary.failed(),
            fmt_num(summary.total_rows())
        );
        summary
    }

    /// Run one dataset through to a terminal state.
    pub fn run_dataset(&self, cfg: &DatasetConfig) -> DatasetOutcome {
        let pb = self.progress.dataset_line(&cfg.table);
        pb.set_message("checking for updates");

        // CHECK_FRESHNESS
        let probe_token = if self.force {
            log::info!("{}: forced, skipping change detection", cfg.table);
            None
        } else {
            let decision = self.detector.check(&cfg.filename);
            if !decision.should_download() {
                log::info!("{}: {} unchanged, skipping", cfg.table, cfg.filename);
                pb.finish_with_message("up to date");
                return DatasetOutcome::Skipped;
            }
            decision.remote_token().map(str::to_string)
        };

        // Writer lives until the end of this function on every path
        pb.set_message("connecting");
        let mut writer = match self.destination.connect() {
            Ok(w) => w,
            Err(e) => {
                pb.abandon_with_message("connection failed");
                let err = anyhow::Error::new(e).context("failed to connect to the database");
                return DatasetOutcome::failed(Stage::Connecting, err, false);
            }
        };

        // EXTRACTING → TRANSFORMING → LOADING, pulled by the loader
        let chunks = match self.extractor.read_chunks(&cfg.filename, &cfg.columns) {
            Ok(chunks) => chunks,
            Err(e) => {
                pb.abandon_with_message("download failed");
                let err = anyhow::Error::new(e).context(format!("failed to open {}", cfg.filename));
                return DatasetOutcome::failed(Stage::Extracting, err, false);
            }
        };
        if let Some(total) = chunks.total_bytes() {
            upgrade_to_bar(&pb, total);
        }
        log::info!(
            "{}: streaming {}{}",
            cfg.table,
            cfg.filename,
            chunks
                .total_bytes()
                .map(|n| format!(" ({} bytes)", fmt_num(n)))
                .unwrap_or_default()
        );

        let counter = chunks.counter();
        let stream_token = chunks.token().map(str::to_string);
        let mut batches = transform(chunks, cfg);
        let result = load(&mut writer, &mut batches, cfg, |stats| {
            pb.set_position(counter.load(Ordering::Relaxed));
            pb.set_message(format!("batch {} · rows {}", stats.batches, fmt_num(stats.rows)));
            log::debug!(
                "{}: batch {} loaded, {} rows so far",
                cfg.table,
                stats.batches,
                fmt_num(stats.rows)
            );
        });
        let transform_stats = batches.stats();
        let lines = batches.inner().lines_read();
        let compressed = batches.inner().bytes_read();
        drop(writer);

        let stats = match result {
            Ok(stats) => stats,
            Err(e) => {
                pb.abandon_with_message("failed");
                let stage = Stage::of(&e);
                let err = anyhow::Error::new(e).context(format!("{} sync aborted", cfg.filename));
                return DatasetOutcome::failed(stage, err, true);
            }
        };

        // PERSIST_METADATA; failure here only costs a re-download next run
        let token = stream_token.or(probe_token);
        if let Err(e) = self.store.save(&cfg.filename, token.as_deref()) {
            log::warn!("{}: could not record sync: {e:#}", cfg.table);
        }

        log::info!(
            "{}: loaded {} rows in {} batches ({} rows dropped, {} lines from {} bytes)",
            cfg.table,
            fmt_num(stats.rows),
            stats.batches,
            fmt_num(transform_stats.dropped_rows),
            fmt_num(lines),
            fmt_num(compressed)
        );
        pb.finish_with_message(format!("{} rows", fmt_num(stats.rows)));

        DatasetOutcome::Loaded {
            rows: stats.rows,
            batches: stats.batches,
            skipped_batches: transform_stats.skipped_batches,
            dropped_rows: transform_stats.dropped_rows,
        }
    }
}
