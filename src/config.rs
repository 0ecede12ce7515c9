//! Pipeline configuration file support
//!
//! Handles parsing of `compendium.toml` configuration files and
//! environment variable overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};
use crate::naming::{SourcePattern, is_valid_identifier};
use crate::silver::definition::{EntityDefinition, builtin_entities};
use crate::store::schema::SILVER_CATALOG_TABLES;

/// Default configuration filename
pub const CONFIG_FILENAME: &str = "compendium.toml";

/// Default Bronze database filename
pub const DEFAULT_BRONZE_FILENAME: &str = "bronze.duckdb";

/// Default Silver database filename
pub const DEFAULT_SILVER_FILENAME: &str = "silver.duckdb";

/// Store path that selects an in-memory database
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Environment variable for the Bronze store path
pub const ENV_BRONZE_PATH: &str = "COMPENDIUM_BRONZE_PATH";

/// Environment variable for the Silver store path
pub const ENV_SILVER_PATH: &str = "COMPENDIUM_SILVER_PATH";

/// Environment variable for the worker pool size
pub const ENV_WORKERS: &str = "COMPENDIUM_WORKERS";

/// Environment variable for the source root directory
pub const ENV_SOURCE_ROOT: &str = "COMPENDIUM_SOURCE_ROOT";

/// How source files are grouped into collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectionLayout {
    /// One collection per file, named after the file stem (default)
    #[default]
    PerFile,
    /// One collection per directory, named after the relative path
    PerDirectory,
}

impl std::str::FromStr for CollectionLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "per-file" | "file" => Ok(CollectionLayout::PerFile),
            "per-directory" | "directory" | "dir" => Ok(CollectionLayout::PerDirectory),
            _ => Err(format!(
                "Unknown collection layout: {}. Use 'per-file' or 'per-directory'.",
                s
            )),
        }
    }
}

/// Whether unchanged source files are re-imported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportDedup {
    /// Every run rewrites every document (default)
    #[default]
    None,
    /// Files whose path and hash were already imported are skipped
    ByContent,
}

/// Pipeline execution section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Worker pool size
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Overall run timeout in seconds (unbounded when absent)
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,

    /// Rebuild Silver even when its Bronze inputs are unchanged
    #[serde(default)]
    pub force_silver: bool,
}

fn default_workers() -> usize {
    4
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            run_timeout_secs: None,
            force_silver: false,
        }
    }
}

/// Document source section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSection {
    /// Root directory of the source tree
    #[serde(default = "default_source_root")]
    pub root: String,

    /// Glob pattern, relative to the root, selecting source files
    #[serde(default = "default_source_pattern")]
    pub pattern: String,

    /// Collection grouping
    #[serde(default)]
    pub layout: CollectionLayout,
}

fn default_source_root() -> String {
    "data".to_string()
}

fn default_source_pattern() -> String {
    "**/*.json".to_string()
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            root: default_source_root(),
            pattern: default_source_pattern(),
            layout: CollectionLayout::default(),
        }
    }
}

/// Natural-key declaration for a set of collections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRule {
    /// Collection name patterns the rule applies to
    pub collections: Vec<String>,

    /// Document fields forming the natural key
    pub fields: Vec<String>,
}

impl IdentityRule {
    pub fn applies_to(&self, collection: &str) -> bool {
        self.collections
            .iter()
            .any(|p| SourcePattern::new(p).matches(collection))
    }
}

/// Bronze store section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BronzeSection {
    /// Path to the Bronze DuckDB file, or `:memory:`
    #[serde(default = "default_bronze_path")]
    pub path: String,

    /// Import deduplication strategy
    #[serde(default)]
    pub dedup: ImportDedup,

    /// Natural-key rules; first match wins
    #[serde(default)]
    pub identity: Vec<IdentityRule>,
}

fn default_bronze_path() -> String {
    DEFAULT_BRONZE_FILENAME.to_string()
}

impl Default for BronzeSection {
    fn default() -> Self {
        Self {
            path: default_bronze_path(),
            dedup: ImportDedup::default(),
            identity: Vec::new(),
        }
    }
}

impl BronzeSection {
    /// The identity rule for a collection, if one is declared
    pub fn identity_for(&self, collection: &str) -> Option<&IdentityRule> {
        self.identity.iter().find(|rule| rule.applies_to(collection))
    }
}

/// Silver store section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilverSection {
    /// Path to the Silver DuckDB file, or `:memory:`
    #[serde(default = "default_silver_path")]
    pub path: String,

    /// Include the built-in entity kinds
    #[serde(default = "default_builtin_entities")]
    pub builtin_entities: bool,

    /// Additional entity kinds; a kind named like a built-in replaces it
    #[serde(default)]
    pub entities: Vec<EntityDefinition>,
}

fn default_silver_path() -> String {
    DEFAULT_SILVER_FILENAME.to_string()
}

fn default_builtin_entities() -> bool {
    true
}

impl Default for SilverSection {
    fn default() -> Self {
        Self {
            path: default_silver_path(),
            builtin_entities: default_builtin_entities(),
            entities: Vec::new(),
        }
    }
}

/// Main configuration structure
///
/// Represents the `compendium.toml` configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub source: SourceSection,

    #[serde(default)]
    pub bronze: BronzeSection,

    #[serde(default)]
    pub silver: SilverSection,
}

impl PipelineConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration with both stores in memory, as used by tests
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.bronze.path = IN_MEMORY_PATH.to_string();
        config.silver.path = IN_MEMORY_PATH.to_string();
        config
    }

    /// Load configuration from a file
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load(config_path: &Path) -> PipelineResult<Self> {
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .map_err(|e| PipelineError::Io(format!("Failed to read config: {}", e)))?;

            Self::parse(&content)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> PipelineResult<Self> {
        toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a file
    pub fn save(&self, config_path: &Path) -> PipelineResult<()> {
        let content = self.to_toml()?;

        std::fs::write(config_path, content)
            .map_err(|e| PipelineError::Io(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> PipelineResult<String> {
        toml::to_string_pretty(self).map_err(|e| {
            PipelineError::Serialization(format!("Failed to serialize config: {}", e))
        })
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var(ENV_BRONZE_PATH) {
            self.bronze.path = path;
        }

        if let Ok(path) = std::env::var(ENV_SILVER_PATH) {
            self.silver.path = path;
        }

        if let Ok(workers) = std::env::var(ENV_WORKERS)
            && let Ok(workers) = workers.parse()
        {
            self.pipeline.workers = workers;
        }

        if let Ok(root) = std::env::var(ENV_SOURCE_ROOT) {
            self.source.root = root;
        }
    }

    /// Resolve a store path against the directory holding the config file
    pub fn resolve_store_path(path: &str, base: &Path) -> Option<PathBuf> {
        if path == IN_MEMORY_PATH {
            None
        } else if Path::new(path).is_absolute() {
            Some(PathBuf::from(path))
        } else {
            Some(base.join(path))
        }
    }

    /// The effective entity definitions, built-ins first, in declaration order
    pub fn entity_definitions(&self) -> Vec<EntityDefinition> {
        let mut definitions = if self.silver.builtin_entities {
            builtin_entities()
        } else {
            Vec::new()
        };

        for custom in &self.silver.entities {
            if let Some(existing) = definitions.iter_mut().find(|d| d.kind == custom.kind) {
                *existing = custom.clone();
            } else {
                definitions.push(custom.clone());
            }
        }
        definitions
    }

    /// Check the configuration for values the pipeline cannot run with
    pub fn validate(&self) -> PipelineResult<()> {
        if self.pipeline.workers == 0 {
            return Err(PipelineError::Config(
                "pipeline.workers must be at least 1".to_string(),
            ));
        }

        for rule in &self.bronze.identity {
            if rule.collections.is_empty() || rule.fields.is_empty() {
                return Err(PipelineError::Config(
                    "identity rules need at least one collection and one field".to_string(),
                ));
            }
        }

        let mut kinds = HashSet::new();
        let mut tables = HashSet::new();
        for definition in self.entity_definitions() {
            definition.validate()?;
            if !kinds.insert(definition.kind.clone()) {
                return Err(PipelineError::Config(format!(
                    "Duplicate entity kind: {}",
                    definition.kind
                )));
            }
            for table in definition.table_names() {
                if !is_valid_identifier(&table) {
                    return Err(PipelineError::Config(format!(
                        "Invalid table name: {}",
                        table
                    )));
                }
                if SILVER_CATALOG_TABLES.contains(&table.as_str()) {
                    return Err(PipelineError::Config(format!(
                        "Table {} is reserved for the Silver catalog",
                        table
                    )));
                }
                if !tables.insert(table.clone()) {
                    return Err(PipelineError::Config(format!(
                        "Table {} is declared by more than one entity kind",
                        table
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Generate a sample configuration file content
pub fn sample_config() -> &'static str {
    r#"# Compendium ETL configuration

[pipeline]
# Number of collections / entity kinds processed in parallel
workers = 4

# Overall run timeout in seconds; units not started by then are abandoned
# run_timeout_secs = 600

# Rebuild Silver tables even when their Bronze inputs are unchanged
force_silver = false

[source]
# Root of the JSON source tree
root = "data"

# Files to ingest, relative to the root
pattern = "**/*.json"

# "per-file": one collection per file stem (spells/spells-phb.json -> spells_phb)
# "per-directory": one collection per directory
layout = "per-file"

[bronze]
# DuckDB file for the raw layer, or ":memory:"
path = "bronze.duckdb"

# "none" rewrites every document on each run;
# "by-content" skips files whose hash was already imported
dedup = "none"

# Natural keys: documents carrying all fields are keyed by them instead of
# their content hash
[[bronze.identity]]
collections = ["spells_*", "bestiary_*"]
fields = ["name", "source"]

[silver]
# DuckDB file for the normalized layer, or ":memory:"
path = "silver.duckdb"

# Include the built-in spell, creature, class and item kinds
builtin_entities = true

# Additional entity kinds
# [[silver.entities]]
# kind = "feat"
# table = "feats"
# sources = ["feats_phb", "feats_*"]
# fields = [{ name = "source", type = "string" }, { name = "prerequisite", type = "json" }]
# filterable = ["source"]
"#
}
