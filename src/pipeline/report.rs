//! Structured run report
//!
//! Every run produces one [`RunReport`]: per-collection and per-entity-kind
//! counts plus the final run state. Record-level problems only ever show up
//! here.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;

/// Maximum number of messages kept per list
pub const MAX_RECORDED_MESSAGES: usize = 100;

/// Pipeline run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    #[default]
    Idle,
    Loading,
    BronzeWriting,
    SilverTransforming,
    Indexing,
    Complete,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Complete | RunState::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Loading) | (Idle, SilverTransforming) => true,
            (Loading, BronzeWriting) => true,
            (BronzeWriting, SilverTransforming) | (BronzeWriting, Complete) => true,
            (SilverTransforming, Indexing) => true,
            (Indexing, Complete) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Loading => "loading",
            RunState::BronzeWriting => "bronzeWriting",
            RunState::SilverTransforming => "silverTransforming",
            RunState::Indexing => "indexing",
            RunState::Complete => "complete",
            RunState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitStatus {
    #[default]
    Succeeded,
    Failed,
    /// The run halted or timed out before the unit started
    NotStarted,
}

/// Kind of integrity violation resolved by policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IntegrityKind {
    /// Two different documents share a content key within one collection
    ContentKeyCollision,
    /// Candidates for one canonical key disagree on a field
    MergeConflict,
}

/// An integrity violation and how it was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityNote {
    pub kind: IntegrityKind,
    /// Collection or entity kind
    pub scope: String,
    /// Content key or canonical key
    pub key: String,
    pub detail: String,
}

/// Counts for one Bronze collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionReport {
    pub status: UnitStatus,
    pub inserted: usize,
    pub updated: usize,
    /// Malformed documents
    pub skipped: usize,
    /// Documents collapsed onto an earlier one with the same content key
    pub duplicates: usize,
    pub files_unchanged: usize,
    pub columns_added: usize,
    pub columns_widened: usize,
    pub errors: Vec<String>,
}

/// Counts for one Silver entity kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityReport {
    pub status: UnitStatus,
    /// Bronze rows read from contributing collections
    pub candidates: usize,
    /// Entities written
    pub produced: usize,
    /// Candidates merged into another candidate's entity
    pub deduplicated: usize,
    /// Rows that could not be mapped
    pub skipped: usize,
    pub conflicts: usize,
    pub mapping_gaps: usize,
    pub coercion_warnings: usize,
    pub child_rows: usize,
    /// The rebuild was skipped because nothing changed
    pub unchanged: bool,
    pub errors: Vec<String>,
}

/// Summary of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Every Silver table and index is in place
    pub silver_ready: bool,
    pub failure: Option<String>,
    pub collections: BTreeMap<String, CollectionReport>,
    pub entities: BTreeMap<String, EntityReport>,
    pub integrity: Vec<IntegrityNote>,
    pub integrity_count: usize,
}

impl RunReport {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            state: RunState::Idle,
            started_at,
            finished_at: None,
            silver_ready: false,
            failure: None,
            collections: BTreeMap::new(),
            entities: BTreeMap::new(),
            integrity: Vec::new(),
            integrity_count: 0,
        }
    }

    /// Add an integrity note (limited to 100)
    pub fn add_integrity(&mut self, note: IntegrityNote) {
        self.integrity_count += 1;
        if self.integrity.len() < MAX_RECORDED_MESSAGES {
            self.integrity.push(note);
        }
    }

    pub fn collection_mut(&mut self, collection: &str) -> &mut CollectionReport {
        self.collections.entry(collection.to_string()).or_default()
    }

    pub fn entity_mut(&mut self, kind: &str) -> &mut EntityReport {
        self.entities.entry(kind.to_string()).or_default()
    }

    /// Record a unit failure for a collection
    pub fn fail_collection(&mut self, collection: &str, err: &PipelineError) {
        let report = self.collection_mut(collection);
        report.status = UnitStatus::Failed;
        push_capped(&mut report.errors, err.to_string());
    }

    /// Record a unit failure for an entity kind
    pub fn fail_entity(&mut self, kind: &str, err: &PipelineError) {
        let report = self.entity_mut(kind);
        report.status = UnitStatus::Failed;
        push_capped(&mut report.errors, err.to_string());
    }

    pub fn total_skipped(&self) -> usize {
        self.collections.values().map(|c| c.skipped).sum::<usize>()
            + self.entities.values().map(|e| e.skipped).sum::<usize>()
    }

    pub fn failed_units(&self) -> usize {
        self.collections
            .values()
            .filter(|c| c.status == UnitStatus::Failed)
            .count()
            + self
                .entities
                .values()
                .filter(|e| e.status == UnitStatus::Failed)
                .count()
    }

    /// One-line summary for logs and the CLI
    pub fn summary(&self) -> String {
        let inserted: usize = self.collections.values().map(|c| c.inserted).sum();
        let updated: usize = self.collections.values().map(|c| c.updated).sum();
        let produced: usize = self.entities.values().map(|e| e.produced).sum();
        format!(
            "run {} {}: {} collections ({} inserted, {} updated), {} entity kinds ({} entities), {} skipped, {} failed units",
            self.run_id,
            self.state,
            self.collections.len(),
            inserted,
            updated,
            self.entities.len(),
            produced,
            self.total_skipped(),
            self.failed_units()
        )
    }
}

pub(crate) fn push_capped(list: &mut Vec<String>, message: String) {
    if list.len() < MAX_RECORDED_MESSAGES {
        list.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use RunState::*;
        assert!(Idle.can_transition_to(Loading));
        assert!(Loading.can_transition_to(BronzeWriting));
        assert!(BronzeWriting.can_transition_to(SilverTransforming));
        assert!(SilverTransforming.can_transition_to(Indexing));
        assert!(Indexing.can_transition_to(Complete));
        assert!(Loading.can_transition_to(Failed));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Idle));
        assert!(!Loading.can_transition_to(Indexing));
    }

    #[test]
    fn test_integrity_notes_are_capped() {
        let mut report = RunReport::new(Uuid::new_v4(), Utc::now());
        for i in 0..150 {
            report.add_integrity(IntegrityNote {
                kind: IntegrityKind::MergeConflict,
                scope: "spell".into(),
                key: format!("spell {}", i),
                detail: "level".into(),
            });
        }
        assert_eq!(report.integrity.len(), MAX_RECORDED_MESSAGES);
        assert_eq!(report.integrity_count, 150);
    }

    #[test]
    fn test_report_serializes_camel_case() {
        let mut report = RunReport::new(Uuid::new_v4(), Utc::now());
        report.collection_mut("spells_phb").files_unchanged = 1;
        report.entity_mut("spell").mapping_gaps = 2;
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["collections"]["spells_phb"]["filesUnchanged"], 1);
        assert_eq!(json["entities"]["spell"]["mappingGaps"], 2);
        assert_eq!(json["silverReady"], false);

        let back: RunReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_failure_accounting() {
        let mut report = RunReport::new(Uuid::new_v4(), Utc::now());
        report.fail_collection("spells_phb", &PipelineError::Source("gone".into()));
        report.entity_mut("spell").skipped = 3;
        assert_eq!(report.failed_units(), 1);
        assert_eq!(report.total_skipped(), 3);
        assert!(report.summary().contains("1 failed units"));
    }
}
