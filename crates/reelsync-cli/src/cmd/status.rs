//! `reelsync status` - last recorded sync per dataset

use anyhow::Result;
use chrono::Utc;
use clap::Args;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use reelsync_store::{FreshnessRecord, MetadataStore};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only show these datasets (default: pipeline.datasets)
    #[arg(short, long = "dataset", value_name = "NAME")]
    pub datasets: Vec<String>,
}

pub fn run(args: StatusArgs, config: &Config) -> Result<()> {
    let datasets = config.select(&args.datasets)?;
    let store = MetadataStore::new(&config.pipeline.metadata_path);
    let records = store.load();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Dataset").fg(Color::Cyan),
            Cell::new("File").fg(Color::Cyan),
            Cell::new("Token").fg(Color::Cyan),
            Cell::new("Last sync").fg(Color::Cyan),
        ]);

    for cfg in &datasets {
        let (token, synced) = match records.get(&cfg.filename) {
            Some(record) => describe(record),
            None => ("-".to_string(), "never".to_string()),
        };
        table.add_row(vec![
            Cell::new(&cfg.table),
            Cell::new(&cfg.filename),
            Cell::new(token),
            Cell::new(synced),
        ]);
    }

    eprintln!("\nMetadata: {}", store.path().display());
    eprintln!("{table}");
    Ok(())
}

fn describe(record: &FreshnessRecord) -> (String, String) {
    let token = record.etag.clone().unwrap_or_else(|| "(none)".to_string());
    let synced = match record.synced_at {
        Some(at) => {
            let age = Utc::now().signed_duration_since(at);
            format!("{} ({} ago)", at.format("%Y-%m-%d %H:%M:%S UTC"), fmt_age(age))
        }
        // Recorded before timestamps were kept
        None => "unknown".to_string(),
    };
    (token, synced)
}

fn fmt_age(age: chrono::TimeDelta) -> String {
    if age.num_days() > 0 {
        format!("{}d", age.num_days())
    } else if age.num_hours() > 0 {
        format!("{}h", age.num_hours())
    } else {
        format!("{}m", age.num_minutes().max(0))
    }
}
