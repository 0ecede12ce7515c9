//! Catalog table definitions
//!
//! Both layers keep small bookkeeping tables next to the data tables. Catalog
//! tables carry no unique constraints: each unit replaces its own rows with a
//! delete followed by an insert inside its transaction.

/// Catalog version recorded in each store
pub const CATALOG_VERSION: i32 = 1;

/// Catalog DDL helper
pub struct CatalogSchema;

/// Tables the Silver catalog owns; entity kinds may not declare them
pub const SILVER_CATALOG_TABLES: [&str; 4] = [
    "_catalog_version",
    "entity_catalog",
    "_silver_builds",
    "_pipeline_runs",
];

impl CatalogSchema {
    /// Bronze bookkeeping tables
    pub fn bronze_tables_sql() -> &'static str {
        r#"
CREATE TABLE IF NOT EXISTS _catalog_version (
    version INTEGER NOT NULL,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

-- One row per Bronze collection table
CREATE TABLE IF NOT EXISTS _bronze_collections (
    collection VARCHAR NOT NULL,
    document_count BIGINT NOT NULL,
    updated_at TIMESTAMP NOT NULL
);

-- Stored schema of every collection table
CREATE TABLE IF NOT EXISTS _bronze_columns (
    collection VARCHAR NOT NULL,
    column_name VARCHAR NOT NULL,
    source_field VARCHAR NOT NULL,
    column_type VARCHAR NOT NULL,
    is_blob BOOLEAN NOT NULL
);

-- Source files seen by previous runs
CREATE TABLE IF NOT EXISTS _import_tracking (
    file_path VARCHAR NOT NULL,
    file_hash VARCHAR NOT NULL,
    collection VARCHAR NOT NULL,
    record_count BIGINT NOT NULL,
    status VARCHAR NOT NULL,
    error_message VARCHAR,
    updated_at TIMESTAMP NOT NULL
);
"#
    }

    /// Silver bookkeeping tables and the cross-kind entity catalog
    pub fn silver_tables_sql() -> &'static str {
        r#"
CREATE TABLE IF NOT EXISTS _catalog_version (
    version INTEGER NOT NULL,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS entity_catalog (
    entity_kind VARCHAR NOT NULL,
    canonical_key VARCHAR NOT NULL,
    name VARCHAR NOT NULL,
    entity_table VARCHAR NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entity_catalog_kind_key
    ON entity_catalog(entity_kind, canonical_key);

-- Last rebuild of each entity kind
CREATE TABLE IF NOT EXISTS _silver_builds (
    entity_kind VARCHAR NOT NULL,
    entity_table VARCHAR NOT NULL,
    source_hash VARCHAR NOT NULL,
    entity_count BIGINT NOT NULL,
    status VARCHAR NOT NULL,
    built_at TIMESTAMP NOT NULL
);

-- Finished run reports
CREATE TABLE IF NOT EXISTS _pipeline_runs (
    run_id VARCHAR NOT NULL,
    state VARCHAR NOT NULL,
    started_at TIMESTAMP NOT NULL,
    finished_at TIMESTAMP NOT NULL,
    report VARCHAR NOT NULL
);
"#
    }

    pub fn record_version_sql() -> &'static str {
        r#"
INSERT INTO _catalog_version (version)
SELECT $1 WHERE NOT EXISTS (SELECT 1 FROM _catalog_version WHERE version = $1)
"#
    }
}

/// SQL for the Bronze column catalog
pub mod bronze_catalog_sql {
    pub const SELECT_COLUMNS: &str = r#"
SELECT column_name, source_field, column_type, is_blob
FROM _bronze_columns
WHERE collection = $1
ORDER BY column_name
"#;

    pub const DELETE_COLUMNS: &str = "DELETE FROM _bronze_columns WHERE collection = $1";

    pub const INSERT_COLUMN: &str = r#"
INSERT INTO _bronze_columns (collection, column_name, source_field, column_type, is_blob)
VALUES ($1, $2, $3, $4, $5)
"#;

    pub const DELETE_COLLECTION: &str = "DELETE FROM _bronze_collections WHERE collection = $1";

    pub const INSERT_COLLECTION: &str = r#"
INSERT INTO _bronze_collections (collection, document_count, updated_at)
VALUES ($1, $2, CAST($3 AS TIMESTAMP))
"#;

    pub const SELECT_COLLECTIONS: &str =
        "SELECT collection, document_count FROM _bronze_collections ORDER BY collection";
}

/// SQL for import tracking
pub mod import_tracking_sql {
    pub const SELECT_IMPORTED: &str = r#"
SELECT file_hash FROM _import_tracking
WHERE file_path = $1 AND collection = $2 AND status = 'completed'
"#;

    pub const DELETE: &str = "DELETE FROM _import_tracking WHERE file_path = $1 AND collection = $2";

    pub const INSERT: &str = r#"
INSERT INTO _import_tracking
    (file_path, file_hash, collection, record_count, status, error_message, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, CAST($7 AS TIMESTAMP))
"#;
}

/// SQL for Silver build tracking
pub mod silver_build_sql {
    pub const SELECT: &str = r#"
SELECT source_hash, status, entity_count FROM _silver_builds WHERE entity_kind = $1
"#;

    pub const DELETE: &str = "DELETE FROM _silver_builds WHERE entity_kind = $1";

    pub const INSERT: &str = r#"
INSERT INTO _silver_builds (entity_kind, entity_table, source_hash, entity_count, status, built_at)
VALUES ($1, $2, $3, $4, $5, CAST($6 AS TIMESTAMP))
"#;
}

/// SQL for the cross-kind entity catalog
pub mod entity_catalog_sql {
    pub const DELETE_KIND: &str = "DELETE FROM entity_catalog WHERE entity_kind = $1";

    pub const INSERT: &str = r#"
INSERT INTO entity_catalog (entity_kind, canonical_key, name, entity_table)
VALUES ($1, $2, $3, $4)
"#;
}

/// SQL for run history
pub mod pipeline_run_sql {
    pub const INSERT: &str = r#"
INSERT INTO _pipeline_runs (run_id, state, started_at, finished_at, report)
VALUES ($1, $2, CAST($3 AS TIMESTAMP), CAST($4 AS TIMESTAMP), $5)
"#;

    pub const SELECT_LATEST: &str = r#"
SELECT report FROM _pipeline_runs
ORDER BY finished_at DESC, started_at DESC
LIMIT 1
"#;
}
