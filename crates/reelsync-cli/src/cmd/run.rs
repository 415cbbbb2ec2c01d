//! `reelsync run` - sync changed datasets into PostgreSQL

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use reelsync_core::{RetryPolicy, SharedProgress, fmt_num, is_shutdown_requested};
use reelsync_imdb::{
    ChangeDetector, DatasetOutcome, Extractor, HttpProbe, HttpSource, PgDestination, Pipeline,
    Summary,
};
use reelsync_store::MetadataStore;

use crate::config::{Config, redact_url};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Dataset to sync (repeatable; default: pipeline.datasets)
    #[arg(short, long = "dataset", value_name = "NAME")]
    pub datasets: Vec<String>,

    /// Reload even if the remote file is unchanged
    #[arg(long)]
    pub force: bool,

    /// Rows per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// PostgreSQL connection URL (default: [database] url or $DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,
}

pub fn run(args: RunArgs, config: &Config, progress: &SharedProgress) -> Result<ExitCode> {
    let datasets = config.select(&args.datasets)?;
    let batch_size = args.batch_size.unwrap_or(config.pipeline.batch_size);
    anyhow::ensure!(batch_size > 0, "batch size must be positive");

    let database_url = args
        .database_url
        .or_else(|| config.database.url.clone())
        .context("no database URL: pass --database-url, set DATABASE_URL, or [database] url")?;

    log::info!("Syncing {} dataset(s)", datasets.len());
    log::info!("  Source: {}", config.source.base_url);
    log::info!("  Database: {}", redact_url(&database_url));
    log::info!("  Batch size: {}", fmt_num(batch_size as u64));

    let store = MetadataStore::new(&config.pipeline.metadata_path);
    let policy = RetryPolicy::from_http_config();

    let detector = ChangeDetector::new(
        HttpProbe::new(policy),
        config.source.base_url.clone(),
        store.load(),
    );
    let extractor = Extractor::new(
        HttpSource::new(config.source.base_url.clone(), policy),
        batch_size,
    );
    let destination = PgDestination::new(
        database_url,
        Duration::from_secs(config.database.connect_timeout),
        Duration::from_secs(config.database.statement_timeout),
    );

    let pipeline = Pipeline::new(detector, extractor, destination, store)
        .force(args.force)
        .with_progress(progress.clone());
    let summary = pipeline.run_all(&datasets);

    print_summary(&summary);

    Ok(ExitCode::from(exit_status(&summary, is_shutdown_requested())))
}

/// Process exit status for a finished run.
///
/// 130 after SIGINT/SIGTERM, 1 when no dataset could be started, else 0.
fn exit_status(summary: &Summary, interrupted: bool) -> u8 {
    if interrupted {
        log::warn!("Interrupted");
        130
    } else if summary.none_started() {
        log::error!("No dataset could be started");
        1
    } else {
        0
    }
}

/// Per-dataset outcome table on stderr
fn print_summary(summary: &Summary) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Dataset").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Rows").fg(Color::Cyan),
            Cell::new("Detail").fg(Color::Cyan),
        ]);

    for (table_name, outcome) in &summary.outcomes {
        let (status, rows, detail) = describe(outcome);
        table.add_row(vec![
            Cell::new(table_name),
            status,
            Cell::new(rows),
            Cell::new(detail),
        ]);
    }

    eprintln!("\n{table}");
    eprintln!(
        "{} loaded, {} skipped, {} failed in {:.1}s",
        summary.loaded(),
        summary.skipped(),
        summary.failed(),
        summary.elapsed.as_secs_f64()
    );
}

fn describe(outcome: &DatasetOutcome) -> (Cell, String, String) {
    match outcome {
        DatasetOutcome::Skipped => (
            Cell::new("unchanged").fg(Color::DarkGrey),
            "-".to_string(),
            String::new(),
        ),
        DatasetOutcome::Loaded {
            rows,
            batches,
            skipped_batches,
            dropped_rows,
        } => (
            Cell::new("loaded").fg(Color::Green),
            fmt_num(*rows),
            format!(
                "{batches} batches, {skipped_batches} empty, {} rows dropped",
                fmt_num(*dropped_rows)
            ),
        ),
        DatasetOutcome::Failed {
            stage,
            error,
            started,
        } => {
            let note = if *started { "" } else { " (not started)" };
            (
                Cell::new("failed").fg(Color::Red),
                "-".to_string(),
                format!("{stage}{note}: {error:#}"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(outcomes: Vec<DatasetOutcome>) -> Summary {
        Summary {
            outcomes: outcomes
                .into_iter()
                .map(|o| ("movies".to_string(), o))
                .collect(),
            elapsed: Duration::ZERO,
        }
    }

    fn failed(started: bool) -> DatasetOutcome {
        DatasetOutcome::Failed {
            stage: reelsync_imdb::Stage::Loading,
            error: anyhow::anyhow!("interrupted"),
            started,
        }
    }

    #[test]
    fn interrupt_exits_130_even_after_a_started_dataset() {
        assert_eq!(exit_status(&summary(vec![failed(true)]), true), 130);
        assert_eq!(exit_status(&summary(vec![DatasetOutcome::Skipped]), true), 130);
    }

    #[test]
    fn nothing_started_exits_1() {
        assert_eq!(exit_status(&summary(vec![failed(false)]), false), 1);
    }

    #[test]
    fn partial_failure_exits_0() {
        assert_eq!(exit_status(&summary(vec![failed(true), DatasetOutcome::Skipped]), false), 0);
        assert_eq!(exit_status(&summary(Vec::new()), false), 0);
    }
}
