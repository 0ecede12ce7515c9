//! Error taxonomy for the ingestion pipeline
//!
//! Only unit-level and run-level failures are errors. Per-record problems
//! (unparsable documents, mapping gaps, merge conflicts) are accumulated in the
//! run report and never surface through this type.

/// Error type for pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The Bronze or Silver backend cannot be reached
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A statement was rejected by the backend
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A stored column cannot hold the newly inferred type
    #[error(
        "Schema conflict in {collection}.{column}: stored as {stored}, inferred as {inferred}"
    )]
    SchemaConflict {
        collection: String,
        column: String,
        stored: String,
        inferred: String,
    },

    /// The document source could not be enumerated or read
    #[error("Source error: {0}")]
    Source(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Run state machine was asked for an illegal transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}

impl PipelineError {
    /// Whether this error prevents any further progress for the whole run.
    ///
    /// Storage-level failures halt the run; everything else fails only the
    /// unit of work that raised it.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::StorageUnavailable(_) | PipelineError::QueryFailed(_)
        )
    }
}

impl From<duckdb::Error> for PipelineError {
    fn from(err: duckdb::Error) -> Self {
        PipelineError::QueryFailed(err.to_string())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::StorageUnavailable("down".into()).is_run_fatal());
        assert!(PipelineError::QueryFailed("bad sql".into()).is_run_fatal());
        assert!(!PipelineError::Source("missing dir".into()).is_run_fatal());
        assert!(
            !PipelineError::SchemaConflict {
                collection: "spells_phb".into(),
                column: "ritual".into(),
                stored: "boolean".into(),
                inferred: "string".into(),
            }
            .is_run_fatal()
        );
    }

    #[test]
    fn test_schema_conflict_message() {
        let err = PipelineError::SchemaConflict {
            collection: "spells_phb".into(),
            column: "ritual".into(),
            stored: "boolean".into(),
            inferred: "string".into(),
        };
        assert_eq!(
            err.to_string(),
            "Schema conflict in spells_phb.ritual: stored as boolean, inferred as string"
        );
    }
}
