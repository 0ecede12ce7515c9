//! Compendium ETL - Bronze/Silver ingestion for tabletop-game reference data
//!
//! Provides:
//! - Document loading from a filesystem tree (or any `DocumentSource`)
//! - Schema inference and additive schema evolution for raw Bronze tables
//! - Normalization and deduplication into canonical Silver entity tables
//! - A run orchestrator with a structured run report

pub mod bronze;
pub mod config;
pub mod error;
pub mod inference;
pub mod naming;
pub mod pipeline;
pub mod silver;
pub mod source;
pub mod store;

// Re-export commonly used types
pub use bronze::{BronzeReader, BronzeRow, BronzeWriter, CollectionOutcome, content_key};
pub use config::{
    BronzeSection, CollectionLayout, IdentityRule, ImportDedup, PipelineConfig, SilverSection,
    SourceSection, sample_config,
};
pub use error::{PipelineError, PipelineResult};
pub use inference::{CollectionSchema, ColumnSpec, ColumnType, infer_schema, plan_migration};
pub use pipeline::report::{
    CollectionReport, EntityReport, IntegrityKind, IntegrityNote, RunReport, RunState, UnitStatus,
};
pub use pipeline::{Pipeline, RunContext};
pub use silver::SilverTransform;
pub use silver::definition::{EntityDefinition, builtin_entities};
pub use silver::index::{Indexer, Readiness};
pub use source::{DocumentSource, FileSystemSource, MemorySource, SourceDocument};
pub use store::{Layer, Store};
