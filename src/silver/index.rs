//! Lookup indexes on Silver tables and the readiness check

use tracing::debug;

use super::definition::EntityDefinition;
use crate::error::PipelineResult;
use crate::naming::quote_ident;
use crate::store::{Store, table_exists};

/// Index on the cross-kind entity catalog, created with the catalog itself
pub const ENTITY_CATALOG_INDEX: &str = "idx_entity_catalog_kind_key";

/// One index of an entity kind's table set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    fn new(table: &str, column: &str, unique: bool) -> Self {
        Self {
            name: format!("idx_{}_{}", table, column),
            table: table.to_string(),
            columns: vec![column.to_string()],
            unique,
        }
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP INDEX IF EXISTS {}", quote_ident(&self.name))
    }

    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            quote_ident(&self.name),
            quote_ident(&self.table),
            columns.join(", ")
        )
    }
}

/// Result of checking that the Silver schema is in place
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    /// Missing tables and indexes
    pub missing: Vec<String>,
}

/// Builds and verifies Silver indexes
pub struct Indexer;

impl Indexer {
    /// Indexes supporting lookups by canonical key, parent key and filterable attributes
    pub fn indexes_for(definition: &EntityDefinition) -> Vec<IndexSpec> {
        let mut indexes = vec![IndexSpec::new(&definition.table, "canonical_key", true)];
        indexes.extend(
            definition
                .filterable
                .iter()
                .map(|field| IndexSpec::new(&definition.table, field, false)),
        );
        indexes.push(IndexSpec::new(&definition.provenance_table(), "parent_key", false));
        indexes.extend(
            definition
                .children
                .iter()
                .map(|child| IndexSpec::new(&child.table, "parent_key", false)),
        );
        indexes
    }

    /// Drop and recreate a kind's indexes on the caller's transaction
    pub fn build(conn: &duckdb::Connection, definition: &EntityDefinition) -> PipelineResult<usize> {
        let indexes = Self::indexes_for(definition);
        for index in &indexes {
            conn.execute_batch(&index.drop_sql())?;
            conn.execute_batch(&index.create_sql())?;
        }
        debug!(kind = %definition.kind, count = indexes.len(), "Built indexes");
        Ok(indexes.len())
    }

    /// Check that every table and index of the given kinds exists
    pub fn verify(store: &Store, definitions: &[EntityDefinition]) -> PipelineResult<Readiness> {
        let conn = store.session()?;
        let mut missing = Vec::new();

        if !table_exists(&conn, "entity_catalog")? {
            missing.push("table entity_catalog".to_string());
        } else if !index_exists(&conn, ENTITY_CATALOG_INDEX)? {
            missing.push(format!("index {}", ENTITY_CATALOG_INDEX));
        }

        for definition in definitions {
            for table in definition.table_names() {
                if !table_exists(&conn, &table)? {
                    missing.push(format!("table {}", table));
                }
            }
            for index in Self::indexes_for(definition) {
                if !index_exists(&conn, &index.name)? {
                    missing.push(format!("index {}", index.name));
                }
            }
        }

        Ok(Readiness {
            ready: missing.is_empty(),
            missing,
        })
    }
}

fn index_exists(conn: &duckdb::Connection, name: &str) -> PipelineResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM duckdb_indexes() WHERE index_name = $1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
