//! Freshness metadata: filename → last synced token, stored as JSON
//!
//! ```json
//! { "name.basics.tsv.gz": { "etag": "\"abc\"", "synced_at": "2026-01-01T00:00:00Z" } }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last observed state of one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessRecord {
    /// Opaque validator (`ETag` or `Last-Modified`) from the completed sync.
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

/// Whole metadata file, sorted by filename for stable diffs.
pub type FreshnessMap = BTreeMap<String, FreshnessRecord>;

/// JSON-file backed metadata store.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all records.
    ///
    /// Never fails: a missing file is an empty map, an unreadable or corrupt
    /// one is logged and treated as empty (forces a full re-sync).
    pub fn load(&self) -> FreshnessMap {
        match self.try_load() {
            Ok(Some(map)) => map,
            Ok(None) => FreshnessMap::new(),
            Err(e) => {
                log::warn!("Ignoring metadata at {}: {e:#}", self.path.display());
                FreshnessMap::new()
            }
        }
    }

    fn try_load(&self) -> Result<Option<FreshnessMap>> {
        let json = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", self.path.display()));
            }
        };
        let map = serde_json::from_str(&json).context("failed to parse metadata JSON")?;
        Ok(Some(map))
    }

    /// Record for one filename, if any.
    pub fn get(&self, filename: &str) -> Option<FreshnessRecord> {
        self.load().remove(filename)
    }

    /// Merge `token` for `filename` into the stored map and write it back.
    ///
    /// The parent directory is created if needed. The file is replaced via
    /// `<path>.tmp` + rename so a crash never leaves a truncated record.
    pub fn save(&self, filename: &str, token: Option<&str>) -> Result<()> {
        let mut map = self.load();
        map.insert(
            filename.to_string(),
            FreshnessRecord {
                etag: token.map(str::to_string),
                synced_at: Some(Utc::now()),
            },
        );
        self.write_all(&map)
    }

    fn write_all(&self, map: &FreshnessMap) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(map).context("failed to serialize metadata")?;
        let tmp = tmp_path(&self.path);
        std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move {} into place", tmp.display()))?;
        log::debug!("Wrote {} metadata record(s) to {}", map.len(), self.path.display());
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
