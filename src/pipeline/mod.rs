//! Pipeline orchestration
//!
//! A run moves through `Idle → Loading → BronzeWriting → SilverTransforming →
//! Indexing → Complete`. Bronze collections and Silver entity kinds are units
//! of work executed on a bounded worker pool; each unit commits on its own.
//! Units share nothing but the [`RunContext`], whose report is the only
//! mutable aggregate.

pub mod report;

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::bronze::BronzeWriter;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::silver::SilverTransform;
use crate::silver::definition::EntityDefinition;
use crate::silver::index::{Indexer, Readiness};
use crate::source::DocumentSource;
use crate::store::schema::pipeline_run_sql;
use crate::store::{Layer, Store, timestamp_literal};
use report::{RunReport, RunState, UnitStatus, push_capped};

/// Failure reason recorded when the run deadline passes
pub const TIMEOUT_REASON: &str = "timeout";

/// State of one run, passed to every unit of work
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    deadline: Option<Instant>,
    halted: AtomicBool,
    state: Mutex<RunState>,
    report: Mutex<RunReport>,
}

impl RunContext {
    pub fn new(timeout: Option<Duration>) -> Self {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        Self {
            run_id,
            started_at,
            deadline: timeout.map(|t| Instant::now() + t),
            halted: AtomicBool::new(false),
            state: Mutex::new(RunState::Idle),
            report: Mutex::new(RunReport::new(run_id, started_at)),
        }
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move the run to `next`, rejecting moves the state machine does not allow
    pub fn transition(&self, next: RunState) -> PipelineResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !state.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(run_id = %self.run_id, from = %state.as_str(), to = %next, "Run state changed");
        *state = next;
        Ok(())
    }

    /// Stop starting new units after a run-fatal error
    pub fn halt(&self, reason: &str) {
        self.record(|report| {
            if report.failure.is_none() {
                report.failure = Some(reason.to_string());
            }
        });
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn timed_out(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Whether a unit that has not begun yet may still start
    pub fn should_start(&self) -> bool {
        !self.is_halted() && !self.timed_out()
    }

    /// Reason the run must stop before the next stage, if any
    fn stop_reason(&self) -> Option<String> {
        if self.is_halted() {
            let failure = self.with_report(|report| report.failure.clone());
            Some(failure.unwrap_or_else(|| "halted".to_string()))
        } else if self.timed_out() {
            Some(TIMEOUT_REASON.to_string())
        } else {
            None
        }
    }

    /// Apply an update to the shared report
    pub fn record<F: FnOnce(&mut RunReport)>(&self, update: F) {
        let mut report = self.report.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut report);
    }

    fn with_report<T, F: FnOnce(&RunReport) -> T>(&self, read: F) -> T {
        let report = self.report.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        read(&report)
    }

    /// Close the run and hand out its report
    pub fn finish(self, finished_at: DateTime<Utc>) -> RunReport {
        let state = self.state();
        let mut report = self
            .report
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        report.state = state;
        report.finished_at = Some(finished_at);
        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Full,
    BronzeOnly,
    SilverOnly,
}

/// Bronze/Silver pipeline over one pair of stores
pub struct Pipeline {
    config: PipelineConfig,
    definitions: Vec<EntityDefinition>,
    bronze: Store,
    silver: Store,
    pool: ThreadPool,
}

impl Pipeline {
    /// Validate the configuration, initialize both stores and build the worker pool
    pub fn new(config: PipelineConfig, bronze: Store, silver: Store) -> PipelineResult<Self> {
        config.validate()?;
        bronze.initialize(Layer::Bronze)?;
        silver.initialize(Layer::Silver)?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.pipeline.workers)
            .thread_name(|idx| format!("compendium-worker-{idx}"))
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build worker pool: {}", e)))?;

        Ok(Self {
            definitions: config.entity_definitions(),
            config,
            bronze,
            silver,
            pool,
        })
    }

    /// Open the stores named by the configuration, relative to `base`
    pub fn from_config(config: PipelineConfig, base: &Path) -> PipelineResult<Self> {
        let bronze = Store::from_config_path(&config.bronze.path, base)?;
        let silver = Store::from_config_path(&config.silver.path, base)?;
        Self::new(config, bronze, silver)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn definitions(&self) -> &[EntityDefinition] {
        &self.definitions
    }

    pub fn bronze(&self) -> &Store {
        &self.bronze
    }

    pub fn silver(&self) -> &Store {
        &self.silver
    }

    /// Ingest every collection of `source`, then rebuild and index Silver
    pub fn run(&self, source: &dyn DocumentSource) -> RunReport {
        self.execute(RunMode::Full, Some(source))
    }

    /// Ingest into Bronze only
    pub fn run_bronze(&self, source: &dyn DocumentSource) -> RunReport {
        self.execute(RunMode::BronzeOnly, Some(source))
    }

    /// Rebuild Silver from the current Bronze contents
    pub fn run_silver(&self) -> RunReport {
        self.execute(RunMode::SilverOnly, None)
    }

    /// Whether every Silver table and index is in place
    pub fn status(&self) -> PipelineResult<Readiness> {
        Indexer::verify(&self.silver, &self.definitions)
    }

    /// Report of the most recently finished run
    pub fn last_run(&self) -> PipelineResult<Option<RunReport>> {
        let rows = self.silver.query_json(pipeline_run_sql::SELECT_LATEST, &[])?;
        let Some(report) = rows
            .first()
            .and_then(|row| row.get("report"))
            .and_then(|v| v.as_str())
        else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(report)?))
    }

    fn execute(&self, mode: RunMode, source: Option<&dyn DocumentSource>) -> RunReport {
        let ctx = RunContext::new(self.config.pipeline.run_timeout_secs.map(Duration::from_secs));
        info!(run_id = %ctx.run_id, mode = ?mode, "Pipeline run started");

        if let Err(reason) = self.run_stages(&ctx, mode, source) {
            error!(run_id = %ctx.run_id, state = %ctx.state(), "Pipeline run failed: {}", reason);
            ctx.record(|report| {
                if report.failure.is_none() {
                    report.failure = Some(reason);
                }
            });
            if let Err(e) = ctx.transition(RunState::Failed) {
                warn!(run_id = %ctx.run_id, "{}", e);
            }
        }

        let report = ctx.finish(Utc::now());
        if let Err(e) = self.persist(&report) {
            warn!(run_id = %report.run_id, "Failed to record run report: {}", e);
        }
        info!("{}", report.summary());
        report
    }

    fn run_stages(
        &self,
        ctx: &RunContext,
        mode: RunMode,
        source: Option<&dyn DocumentSource>,
    ) -> Result<(), String> {
        if let Some(source) = source.filter(|_| mode != RunMode::SilverOnly) {
            ctx.transition(RunState::Loading).map_err(|e| e.to_string())?;
            let collections = source.list_collections().map_err(|e| e.to_string())?;
            info!(run_id = %ctx.run_id, collections = collections.len(), "Collections discovered");

            ctx.transition(RunState::BronzeWriting).map_err(|e| e.to_string())?;
            self.pool.install(|| {
                collections
                    .par_iter()
                    .for_each(|collection| self.ingest_collection(ctx, source, collection));
            });
            if let Some(reason) = ctx.stop_reason() {
                return Err(reason);
            }

            if mode == RunMode::BronzeOnly {
                return ctx.transition(RunState::Complete).map_err(|e| e.to_string());
            }
        }

        ctx.transition(RunState::SilverTransforming).map_err(|e| e.to_string())?;
        self.pool.install(|| {
            self.definitions
                .par_iter()
                .for_each(|definition| self.transform_kind(ctx, definition));
        });
        if let Some(reason) = ctx.stop_reason() {
            return Err(reason);
        }

        ctx.transition(RunState::Indexing).map_err(|e| e.to_string())?;
        let readiness = self.status().map_err(|e| e.to_string())?;
        if !readiness.ready {
            warn!(run_id = %ctx.run_id, missing = ?readiness.missing, "Silver schema incomplete");
        }
        ctx.record(|report| report.silver_ready = readiness.ready);

        ctx.transition(RunState::Complete).map_err(|e| e.to_string())
    }

    fn ingest_collection(&self, ctx: &RunContext, source: &dyn DocumentSource, collection: &str) {
        let span = info_span!("bronze", run_id = %ctx.run_id, collection = %collection);
        let _guard = span.enter();

        if !ctx.should_start() {
            debug!("Collection not started");
            ctx.record(|report| report.collection_mut(collection).status = UnitStatus::NotStarted);
            return;
        }

        let writer = BronzeWriter::new(&self.bronze, &self.config.bronze);
        let result = source
            .list_documents(collection)
            .and_then(|documents| writer.ingest(collection, &documents, ctx.started_at));

        match result {
            Ok(outcome) => {
                for skipped in &outcome.skipped {
                    warn!(path = %skipped.path, index = skipped.index, "Skipped record: {}", skipped.reason);
                }
                ctx.record(|report| {
                    let unit = report.collection_mut(collection);
                    unit.status = UnitStatus::Succeeded;
                    unit.inserted = outcome.inserted;
                    unit.updated = outcome.updated;
                    unit.skipped = outcome.skipped.len();
                    unit.duplicates = outcome.duplicates;
                    unit.files_unchanged = outcome.files_unchanged;
                    unit.columns_added = outcome.columns_added;
                    unit.columns_widened = outcome.columns_widened;
                    for skipped in &outcome.skipped {
                        push_capped(
                            &mut unit.errors,
                            format!("{}[{}]: {}", skipped.path, skipped.index, skipped.reason),
                        );
                    }
                    for note in outcome.integrity {
                        report.add_integrity(note);
                    }
                });
                info!(
                    inserted = outcome.inserted,
                    updated = outcome.updated,
                    skipped = outcome.skipped.len(),
                    "Collection ingested"
                );
            }
            Err(err) => {
                error!("Collection failed: {}", err);
                ctx.record(|report| report.fail_collection(collection, &err));
                if err.is_run_fatal() {
                    ctx.halt(&err.to_string());
                }
            }
        }
    }

    fn transform_kind(&self, ctx: &RunContext, definition: &EntityDefinition) {
        let span = info_span!("silver", run_id = %ctx.run_id, entity_kind = %definition.kind);
        let _guard = span.enter();

        if !ctx.should_start() {
            debug!("Entity kind not started");
            ctx.record(|report| report.entity_mut(&definition.kind).status = UnitStatus::NotStarted);
            return;
        }

        let transform =
            SilverTransform::new(&self.bronze, &self.silver, self.config.pipeline.force_silver);
        match transform.run(definition, Utc::now()) {
            Ok(outcome) => {
                ctx.record(|report| {
                    *report.entity_mut(&definition.kind) = outcome.report;
                    for note in outcome.notes {
                        report.add_integrity(note);
                    }
                });
            }
            Err(err) => {
                error!("Entity kind failed: {}", err);
                ctx.record(|report| report.fail_entity(&definition.kind, &err));
                if err.is_run_fatal() {
                    ctx.halt(&err.to_string());
                }
            }
        }
    }

    fn persist(&self, report: &RunReport) -> PipelineResult<()> {
        let finished_at = report.finished_at.unwrap_or_else(Utc::now);
        let conn = self.silver.session()?;
        conn.execute(
            pipeline_run_sql::INSERT,
            duckdb::params![
                report.run_id.to_string(),
                report.state.as_str(),
                timestamp_literal(&report.started_at),
                timestamp_literal(&finished_at),
                serde_json::to_string(report)?
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use serde_json::json;

    fn pipeline(config: PipelineConfig) -> Pipeline {
        Pipeline::new(config, Store::in_memory().unwrap(), Store::in_memory().unwrap()).unwrap()
    }

    #[test]
    fn test_run_context_transitions() {
        let ctx = RunContext::new(None);
        ctx.transition(RunState::Loading).unwrap();
        let err = ctx.transition(RunState::Indexing).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition { .. }));
        ctx.transition(RunState::Failed).unwrap();
        assert!(ctx.transition(RunState::Failed).is_err());
    }

    #[test]
    fn test_halt_keeps_first_reason() {
        let ctx = RunContext::new(None);
        assert!(ctx.should_start());
        ctx.halt("Storage unavailable: disk gone");
        ctx.halt("second");
        assert!(!ctx.should_start());
        assert_eq!(ctx.stop_reason().as_deref(), Some("Storage unavailable: disk gone"));
    }

    #[test]
    fn test_zero_timeout_is_expired() {
        let ctx = RunContext::new(Some(Duration::ZERO));
        assert!(ctx.timed_out());
        assert_eq!(ctx.stop_reason().as_deref(), Some(TIMEOUT_REASON));
    }

    #[test]
    fn test_full_run_completes() {
        let pipeline = pipeline(PipelineConfig::in_memory());
        let source = MemorySource::new()
            .with_collection("spells_phb", vec![json!({"name": "Fireball", "level": 3})]);

        let report = pipeline.run(&source);
        assert_eq!(report.state, RunState::Complete);
        assert!(report.silver_ready);
        assert_eq!(report.collections["spells_phb"].inserted, 1);
        assert_eq!(report.entities["spell"].produced, 1);
        assert_eq!(report.entities["creature"].produced, 0);
    }

    #[test]
    fn test_bronze_only_run_skips_silver() {
        let pipeline = pipeline(PipelineConfig::in_memory());
        let source = MemorySource::new().with_collection("spells_phb", vec![json!({"name": "Fireball"})]);

        let report = pipeline.run_bronze(&source);
        assert_eq!(report.state, RunState::Complete);
        assert!(report.entities.is_empty());
        assert!(!pipeline.silver().table_exists("spells").unwrap());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = PipelineConfig::in_memory();
        config.pipeline.workers = 0;
        let result = Pipeline::new(config, Store::in_memory().unwrap(), Store::in_memory().unwrap());
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_last_run_round_trips() {
        let pipeline = pipeline(PipelineConfig::in_memory());
        assert!(pipeline.last_run().unwrap().is_none());

        let report = pipeline.run_silver();
        let stored = pipeline.last_run().unwrap().unwrap();
        assert_eq!(stored.run_id, report.run_id);
        assert_eq!(stored.state, RunState::Complete);
    }
}
