//! reelsync - keep a PostgreSQL copy of the IMDb datasets current
//!
//! Downloads the gzip TSV exports only when they changed, cleans them in
//! bounded batches, and bulk-loads them with COPY.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "reelsync")]
#[command(about = "Sync IMDb datasets into PostgreSQL")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./reelsync.toml or ~/.config/reelsync/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Read timeout in seconds for stall detection
    #[arg(long, global = true)]
    read_timeout: Option<u64>,

    /// Maximum attempts for freshness probes and opening downloads
    #[arg(long, global = true)]
    max_retries: Option<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Sync changed datasets into the database
    Run(cmd::run::RunArgs),
    /// Show the last recorded sync per dataset
    Status(cmd::status::StatusArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(reelsync_core::ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug, progress lines show activity
    //   non-TTY: info unless --debug, logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = if is_tty { !cli.debug } else { false };
    reelsync_core::init_logging(quiet, cli.debug, multi);

    let config = if let Some(path) = cli.config {
        Config::from_file(&path)?
    } else {
        Config::load()?
    };

    // Apply HTTP settings (config file defaults, CLI overrides)
    let http_config = reelsync_core::HttpConfig {
        read_timeout: Duration::from_secs(cli.read_timeout.unwrap_or(config.http.read_timeout)),
        probe_timeout: Duration::from_secs(config.http.probe_timeout),
        max_retries: cli.max_retries.unwrap_or(config.http.max_retries),
    };
    reelsync_core::set_http_config(http_config);

    match cli.command {
        Command::Run(args) => {
            if let Err(e) = reelsync_core::install_signal_handlers() {
                log::warn!("Could not install signal handlers: {e}");
            }
            cmd::run::run(args, &config, &progress)
        }
        Command::Status(args) => cmd::status::run(args, &config).map(|()| ExitCode::SUCCESS),
        Command::Config => {
            print_config(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_config(config: &Config) {
    use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    table.add_row(vec!["Source base URL", &config.source.base_url]);
    table.add_row(vec![
        "Database URL",
        &config
            .database
            .url
            .as_deref()
            .map(config::redact_url)
            .unwrap_or_else(|| "not set".to_string()),
    ]);
    table.add_row(vec![
        "Connect timeout",
        &format!("{}s", config.database.connect_timeout),
    ]);
    table.add_row(vec![
        "Statement timeout",
        &format!("{}s", config.database.statement_timeout),
    ]);
    table.add_row(vec![
        "Read timeout",
        &format!("{}s", config.http.read_timeout),
    ]);
    table.add_row(vec![
        "Probe timeout",
        &format!("{}s", config.http.probe_timeout),
    ]);
    table.add_row(vec!["Max retries", &config.http.max_retries.to_string()]);
    table.add_row(vec![
        "Batch size",
        &reelsync_core::fmt_num(config.pipeline.batch_size as u64),
    ]);
    table.add_row(vec![
        "Metadata file",
        &config.pipeline.metadata_path.display().to_string(),
    ]);
    table.add_row(vec!["Datasets", &config.pipeline.datasets.join(", ")]);

    eprintln!("\n{table}");
}
