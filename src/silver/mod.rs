//! Silver transform
//!
//! One unit of work per entity kind: read every contributing Bronze
//! collection, normalize, deduplicate, then rebuild the kind's table set.

pub mod dedupe;
pub mod definition;
pub mod index;
pub mod normalize;
pub mod writer;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::bronze::{BronzeReader, canonical_json};
use crate::error::PipelineResult;
use crate::pipeline::report::{EntityReport, IntegrityNote};
use crate::store::Store;
use dedupe::deduplicate;
use definition::EntityDefinition;
use normalize::{NormalizeStats, Normalizer};
use writer::SilverWriter;

/// Report and integrity notes of one entity kind
#[derive(Debug, Clone, Default)]
pub struct KindOutcome {
    pub report: EntityReport,
    pub notes: Vec<IntegrityNote>,
}

/// Transforms one entity kind from Bronze into Silver
pub struct SilverTransform<'a> {
    bronze: &'a Store,
    silver: &'a Store,
    force: bool,
}

impl<'a> SilverTransform<'a> {
    pub fn new(bronze: &'a Store, silver: &'a Store, force: bool) -> Self {
        Self {
            bronze,
            silver,
            force,
        }
    }

    pub fn run(
        &self,
        definition: &EntityDefinition,
        built_at: DateTime<Utc>,
    ) -> PipelineResult<KindOutcome> {
        let reader = BronzeReader::new(self.bronze);
        let normalizer = Normalizer::new(definition);
        let contributing = normalizer.contributing(&reader.collections()?);

        let mut inputs = Vec::with_capacity(contributing.len());
        for (collection, priority) in contributing {
            let Some(schema) = reader.schema(&collection)? else {
                continue;
            };
            let rows = reader.rows(&collection)?;
            inputs.push((collection, priority, schema, rows));
        }

        let source_hash = {
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_string(definition)?.as_bytes());
            for (collection, _, _, rows) in &inputs {
                hasher.update(collection.as_bytes());
                hasher.update([0u8]);
                for row in rows {
                    hasher.update(row.content_key.as_bytes());
                    for (column, value) in &row.values {
                        hasher.update(column.as_bytes());
                        hasher.update(canonical_json(value).as_bytes());
                    }
                    hasher.update([0u8]);
                }
            }
            format!("{:x}", hasher.finalize())
        };

        let writer = SilverWriter::new(self.silver);
        let mut outcome = KindOutcome::default();
        if !self.force
            && let Some(entities) = writer.reusable_build(definition, &source_hash)?
        {
            info!(kind = %definition.kind, entities, "Bronze inputs unchanged, keeping Silver tables");
            outcome.report.produced = entities;
            outcome.report.unchanged = true;
            return Ok(outcome);
        }

        let mut stats = NormalizeStats::default();
        let mut candidates = Vec::new();
        for (collection, priority, schema, rows) in &inputs {
            candidates.extend(normalizer.normalize_collection(
                collection, *priority, schema, rows, &mut stats,
            ));
        }
        let candidate_count = candidates.len();

        let dedup = deduplicate(definition, candidates);
        let rebuilt = writer.rebuild(definition, &dedup, &source_hash, built_at)?;

        if stats.skipped > 0 {
            warn!(kind = %definition.kind, skipped = stats.skipped, "Rows skipped during normalization");
        }

        outcome.report = EntityReport {
            candidates: stats.rows,
            produced: rebuilt.entities,
            deduplicated: candidate_count - dedup.entities.len(),
            skipped: stats.skipped,
            conflicts: dedup.conflicts,
            mapping_gaps: stats.mapping_gaps,
            coercion_warnings: stats.coercion_warnings,
            child_rows: rebuilt.child_rows,
            ..Default::default()
        };
        outcome.notes = dedup.notes;
        Ok(outcome)
    }
}
