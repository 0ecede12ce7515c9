//! Candidate deduplication
//!
//! Collapses candidates sharing a canonical key into one entity. Candidates
//! are sorted by source priority first, so the merge never depends on the
//! order in which collections were read.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::definition::EntityDefinition;
use super::normalize::{ChildRow, EntityCandidate, normalize_name};
use crate::bronze::canonical_json;
use crate::pipeline::report::{IntegrityKind, IntegrityNote};

/// One contribution to an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub source_collection: String,
    pub content_key: String,
    pub priority: usize,
}

/// A canonical, deduplicated entity
#[derive(Debug, Clone, PartialEq)]
pub struct SilverEntity {
    pub canonical_key: String,
    pub name: String,
    pub fields: BTreeMap<String, Value>,
    pub children: BTreeMap<String, Vec<ChildRow>>,
    /// Every candidate, highest priority first
    pub provenance: Vec<ProvenanceEntry>,
}

impl SilverEntity {
    /// Distinct contributing collections, highest priority first
    pub fn source_collections(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for entry in &self.provenance {
            if !seen.contains(&entry.source_collection.as_str()) {
                seen.push(entry.source_collection.as_str());
            }
        }
        seen
    }
}

/// Result of deduplicating one entity kind
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// Entities sorted by canonical key
    pub entities: Vec<SilverEntity>,
    /// Candidates folded into an entity that another candidate started
    pub deduplicated: usize,
    /// Fields on which contributing candidates disagreed
    pub conflicts: usize,
    pub notes: Vec<IntegrityNote>,
}

fn comparable(value: &Value) -> String {
    match value {
        Value::String(s) => normalize_name(s),
        other => canonical_json(other),
    }
}

fn sort_key(c: &EntityCandidate) -> (&str, usize, &str, &str) {
    (
        c.canonical_key.as_str(),
        c.priority,
        c.source_collection.as_str(),
        c.content_key.as_str(),
    )
}

/// Resolve candidates to one entity per canonical key.
///
/// For each field the first non-null value in priority order wins. A
/// disagreeing lower-priority value counts as a conflict and is noted.
pub fn deduplicate(definition: &EntityDefinition, mut candidates: Vec<EntityCandidate>) -> DedupOutcome {
    candidates.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

    let mut outcome = DedupOutcome::default();
    let mut start = 0;
    while start < candidates.len() {
        let key = &candidates[start].canonical_key;
        let end = candidates[start..]
            .iter()
            .position(|c| &c.canonical_key != key)
            .map(|offset| start + offset)
            .unwrap_or(candidates.len());

        let bucket = &candidates[start..end];
        outcome.deduplicated += bucket.len() - 1;
        let entity = merge(definition, bucket, &mut outcome);
        outcome.entities.push(entity);
        start = end;
    }

    debug!(
        kind = %definition.kind,
        entities = outcome.entities.len(),
        deduplicated = outcome.deduplicated,
        "Deduplicated candidates"
    );
    outcome
}

fn merge(definition: &EntityDefinition, bucket: &[EntityCandidate], outcome: &mut DedupOutcome) -> SilverEntity {
    let lead = &bucket[0];

    let mut fields = BTreeMap::new();
    for field in &definition.fields {
        let mut chosen: Option<(&EntityCandidate, &Value)> = None;
        let mut disagreeing = Vec::new();
        for candidate in bucket {
            let Some(value) = candidate.fields.get(&field.name).filter(|v| !v.is_null()) else {
                continue;
            };
            match chosen {
                None => chosen = Some((candidate, value)),
                Some((_, winner)) if comparable(winner) != comparable(value) => {
                    disagreeing.push(format!("{}={}", candidate.source_collection, canonical_json(value)));
                }
                Some(_) => {}
            }
        }

        if let Some((winner, value)) = chosen {
            if !disagreeing.is_empty() {
                outcome.conflicts += 1;
                outcome.notes.push(IntegrityNote {
                    kind: IntegrityKind::MergeConflict,
                    scope: definition.kind.clone(),
                    key: lead.canonical_key.clone(),
                    detail: format!(
                        "{}: {}={} wins over {}",
                        field.name,
                        winner.source_collection,
                        canonical_json(value),
                        disagreeing.join(", ")
                    ),
                });
            }
            fields.insert(field.name.clone(), value.clone());
        } else {
            fields.insert(field.name.clone(), Value::Null);
        }
    }

    let mut children = BTreeMap::new();
    for child in &definition.children {
        if let Some(rows) = bucket.iter().find_map(|c| c.children.get(&child.name)) {
            children.insert(child.name.clone(), rows.clone());
        }
    }

    SilverEntity {
        canonical_key: lead.canonical_key.clone(),
        name: lead.name.clone(),
        fields,
        children,
        provenance: bucket
            .iter()
            .map(|c| ProvenanceEntry {
                source_collection: c.source_collection.clone(),
                content_key: c.content_key.clone(),
                priority: c.priority,
            })
            .collect(),
    }
}
