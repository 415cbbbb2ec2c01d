//! Dataset definitions: which source columns to keep, what to call them,
//! which rows to drop, and which fields to derive.
//!
//! Everything dataset-specific lives here; the transformer and loader only
//! read these definitions.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Result, bail};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};

/// Declared type of a source column, applied while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Text,
    /// Nullable 32-bit integer (years)
    Int,
    Bool,
}

impl ScalarType {
    pub fn arrow_type(self) -> DataType {
        match self {
            Self::Text => DataType::Utf8,
            Self::Int => DataType::Int32,
            Self::Bool => DataType::Boolean,
        }
    }
}

/// One retained source column and its destination name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Header name in the source file
    pub source: String,
    /// Column name in the destination table
    pub canonical: String,
    #[serde(rename = "type", default = "default_scalar")]
    pub scalar: ScalarType,
}

fn default_scalar() -> ScalarType {
    ScalarType::Text
}

impl ColumnSpec {
    pub fn new(source: &str, canonical: &str, scalar: ScalarType) -> Self {
        Self {
            source: source.to_string(),
            canonical: canonical.to_string(),
            scalar,
        }
    }
}

/// Field computed from other fields after renaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Derivation {
    /// `target = source IS NOT NULL`, then `source` is dropped.
    ///
    /// `source` names the source column, not its canonical name.
    PresenceFlag { source: String, target: String },
}

impl Derivation {
    fn source(&self) -> &str {
        match self {
            Self::PresenceFlag { source, .. } => source,
        }
    }

    fn target(&self) -> &str {
        match self {
            Self::PresenceFlag { target, .. } => target,
        }
    }
}

/// One source file → one destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Remote file name, e.g. `name.basics.tsv.gz`
    pub filename: String,
    /// Destination table; also the dataset's name on the command line
    pub table: String,
    /// Retained columns, in output order
    pub columns: Vec<ColumnSpec>,
    /// Source column holding the natural identifier
    pub primary_key: String,
    /// Source columns whose null value disqualifies a row
    #[serde(default)]
    pub critical: Vec<String>,
    #[serde(default)]
    pub derive: Vec<Derivation>,
}

impl DatasetConfig {
    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            bail!("dataset '{}': no columns configured", self.table);
        }

        let mut sources = HashSet::new();
        let mut canonicals = HashSet::new();
        for col in &self.columns {
            if !sources.insert(col.source.as_str()) {
                bail!("dataset '{}': duplicate source column '{}'", self.table, col.source);
            }
            if !canonicals.insert(col.canonical.as_str()) {
                bail!(
                    "dataset '{}': duplicate canonical column '{}'",
                    self.table,
                    col.canonical
                );
            }
        }

        if !sources.contains(self.primary_key.as_str()) {
            bail!(
                "dataset '{}': primary key '{}' is not a configured column",
                self.table,
                self.primary_key
            );
        }
        if self.derive.iter().any(|d| d.source() == self.primary_key) {
            bail!("dataset '{}': primary key cannot be derived away", self.table);
        }
        for field in &self.critical {
            if !sources.contains(field.as_str()) {
                bail!(
                    "dataset '{}': critical field '{field}' is not a configured column",
                    self.table
                );
            }
        }
        for d in &self.derive {
            if !sources.contains(d.source()) {
                bail!(
                    "dataset '{}': derivation source '{}' is not a configured column",
                    self.table,
                    d.source()
                );
            }
            if !canonicals.insert(d.target()) {
                bail!(
                    "dataset '{}': derived column '{}' collides with another column",
                    self.table,
                    d.target()
                );
            }
        }
        Ok(())
    }

    pub fn column(&self, source: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.source == source)
    }

    /// Canonical name of the primary key column.
    pub fn primary_key_column(&self) -> &str {
        self.column(&self.primary_key)
            .map_or(self.primary_key.as_str(), |c| c.canonical.as_str())
    }

    fn is_derivation_source(&self, source: &str) -> bool {
        self.derive.iter().any(|d| d.source() == source)
    }

    /// Schema of extracted batches: source names, declared types, all nullable.
    pub fn raw_schema(&self) -> SchemaRef {
        raw_schema(&self.columns)
    }

    /// Schema of transformed batches when every configured column is present.
    ///
    /// Retained columns in configured order (derivation sources removed),
    /// followed by derived columns.
    pub fn output_schema(&self) -> SchemaRef {
        let mut fields: Vec<Field> = self
            .columns
            .iter()
            .filter(|c| !self.is_derivation_source(&c.source))
            .map(|c| Field::new(&c.canonical, c.scalar.arrow_type(), true))
            .collect();
        for d in &self.derive {
            match d {
                Derivation::PresenceFlag { target, .. } => {
                    fields.push(Field::new(target, DataType::Boolean, false));
                }
            }
        }
        Arc::new(Schema::new(fields))
    }
}

/// Source names and declared types of `columns`, all nullable.
pub fn raw_schema(columns: &[ColumnSpec]) -> SchemaRef {
    let fields: Vec<Field> = columns
        .iter()
        .map(|c| Field::new(&c.source, c.scalar.arrow_type(), true))
        .collect();
    Arc::new(Schema::new(fields))
}

/// `base_url` + `/` + `filename`, tolerating a trailing slash on the base.
pub fn source_url(base_url: &str, filename: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), filename)
}

/// People: `name.basics.tsv.gz` → `actors`
pub fn actors() -> DatasetConfig {
    use ScalarType::{Int, Text};
    DatasetConfig {
        filename: "name.basics.tsv.gz".to_string(),
        table: "actors".to_string(),
        columns: vec![
            ColumnSpec::new("nconst", "nconst", Text),
            ColumnSpec::new("primaryName", "primary_name", Text),
            ColumnSpec::new("birthYear", "birth_year", Int),
            ColumnSpec::new("deathYear", "death_year", Int),
            ColumnSpec::new("primaryProfession", "primary_profession", Text),
        ],
        primary_key: "nconst".to_string(),
        critical: vec![
            "primaryName".to_string(),
            "birthYear".to_string(),
            "primaryProfession".to_string(),
        ],
        derive: vec![Derivation::PresenceFlag {
            source: "deathYear".to_string(),
            target: "is_dead".to_string(),
        }],
    }
}

/// Titles: `title.basics.tsv.gz` → `movies`
pub fn movies() -> DatasetConfig {
    use ScalarType::Text;
    DatasetConfig {
        filename: "title.basics.tsv.gz".to_string(),
        table: "movies".to_string(),
        columns: vec![
            ColumnSpec::new("tconst", "tconst", Text),
            ColumnSpec::new("primaryTitle", "primary_title", Text),
            ColumnSpec::new("originalTitle", "original_title", Text),
            ColumnSpec::new("genres", "genres", Text),
        ],
        primary_key: "tconst".to_string(),
        critical: vec![
            "primaryTitle".to_string(),
            "originalTitle".to_string(),
            "genres".to_string(),
        ],
        derive: Vec::new(),
    }
}

/// All built-in datasets, in default run order.
pub fn builtins() -> Vec<DatasetConfig> {
    vec![actors(), movies()]
}

/// Built-in dataset by table name.
pub fn builtin(name: &str) -> Option<DatasetConfig> {
    builtins().into_iter().find(|d| d.table == name)
}
