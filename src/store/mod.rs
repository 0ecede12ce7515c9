//! DuckDB-backed storage for the Bronze and Silver layers
//!
//! A [`Store`] owns one database. Units of work take an independent
//! connection with [`Store::session`] so that each commits its own
//! transaction; values are read back as JSON.

pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use schema::{CATALOG_VERSION, CatalogSchema};

/// Which layer a store holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Bronze,
    Silver,
}

impl Layer {
    fn catalog_sql(&self) -> &'static str {
        match self {
            Layer::Bronze => CatalogSchema::bronze_tables_sql(),
            Layer::Silver => CatalogSchema::silver_tables_sql(),
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Bronze => write!(f, "bronze"),
            Layer::Silver => write!(f, "silver"),
        }
    }
}

/// One DuckDB database
pub struct Store {
    /// Path to the database file (None for in-memory)
    db_path: Option<PathBuf>,
    /// Root connection; sessions are cloned from it
    connection: Mutex<duckdb::Connection>,
}

impl Store {
    /// Open or create a file-based store
    pub fn open(db_path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let connection = duckdb::Connection::open(&path).map_err(|e| {
            PipelineError::StorageUnavailable(format!(
                "Failed to open {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(Self {
            db_path: Some(path),
            connection: Mutex::new(connection),
        })
    }

    /// Create an in-memory store
    pub fn in_memory() -> PipelineResult<Self> {
        let connection = duckdb::Connection::open_in_memory().map_err(|e| {
            PipelineError::StorageUnavailable(format!("Failed to create in-memory store: {}", e))
        })?;

        Ok(Self {
            db_path: None,
            connection: Mutex::new(connection),
        })
    }

    /// Open the store a configured path points at (`:memory:` for in-memory)
    pub fn from_config_path(path: &str, base: &Path) -> PipelineResult<Self> {
        match PipelineConfig::resolve_store_path(path, base) {
            Some(path) => Self::open(path),
            None => Self::in_memory(),
        }
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path.is_none()
    }

    /// Create the catalog tables for a layer
    pub fn initialize(&self, layer: Layer) -> PipelineResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(layer.catalog_sql())
            .map_err(|e| PipelineError::StorageUnavailable(format!("{} catalog: {}", layer, e)))?;
        conn.execute(CatalogSchema::record_version_sql(), [CATALOG_VERSION])?;
        Ok(())
    }

    /// An independent connection to the same database
    pub fn session(&self) -> PipelineResult<duckdb::Connection> {
        self.lock()?
            .try_clone()
            .map_err(|e| PipelineError::StorageUnavailable(format!("Failed to open session: {}", e)))
    }

    /// Execute a batch of statements outside any unit transaction
    pub fn execute_batch(&self, sql: &str) -> PipelineResult<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    /// Run a query and return its rows as JSON objects
    pub fn query_json(
        &self,
        sql: &str,
        params: &[&dyn duckdb::ToSql],
    ) -> PipelineResult<Vec<Map<String, Value>>> {
        let conn = self.lock()?;
        query_rows(&conn, sql, params)
    }

    /// Whether a table exists in the main schema
    pub fn table_exists(&self, table: &str) -> PipelineResult<bool> {
        let conn = self.lock()?;
        table_exists(&conn, table)
    }

    fn lock(&self) -> PipelineResult<std::sync::MutexGuard<'_, duckdb::Connection>> {
        self.connection
            .lock()
            .map_err(|_| PipelineError::StorageUnavailable("lock poisoned".to_string()))
    }
}

/// Whether a table exists, checked on a specific connection
pub fn table_exists(conn: &duckdb::Connection, table: &str) -> PipelineResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = 'main' AND table_name = $1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Run a query on a specific connection and return its rows as JSON objects
pub fn query_rows(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[&dyn duckdb::ToSql],
) -> PipelineResult<Vec<Map<String, Value>>> {
    let mut stmt = conn.prepare(sql)?;
    let mut result_rows = stmt.query(params)?;

    // Column names are only known once the statement has run
    let column_count = result_rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
    let columns: Vec<String> = (0..column_count)
        .map(|i| {
            result_rows
                .as_ref()
                .and_then(|r| r.column_name(i).ok())
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("col{}", i))
        })
        .collect();

    let mut rows = Vec::new();
    while let Some(row) = result_rows.next()? {
        let mut map = Map::new();
        for (i, name) in columns.iter().enumerate() {
            let value = match row.get_ref(i) {
                Ok(value_ref) => value_ref_to_json(value_ref),
                Err(_) => Value::Null,
            };
            map.insert(name.clone(), value);
        }
        rows.push(map);
    }
    Ok(rows)
}

/// Convert a DuckDB value to JSON
pub fn value_ref_to_json(value: duckdb::types::ValueRef) -> Value {
    use duckdb::types::ValueRef;

    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::Number(i.into()),
        ValueRef::SmallInt(i) => Value::Number(i.into()),
        ValueRef::Int(i) => Value::Number(i.into()),
        ValueRef::BigInt(i) => Value::Number(i.into()),
        ValueRef::HugeInt(i) => match i64::try_from(i) {
            Ok(i) => Value::Number(i.into()),
            Err(_) => Value::String(i.to_string()),
        },
        ValueRef::UTinyInt(i) => Value::Number(i.into()),
        ValueRef::USmallInt(i) => Value::Number(i.into()),
        ValueRef::UInt(i) => Value::Number(i.into()),
        ValueRef::UBigInt(i) => Value::Number(i.into()),
        ValueRef::Float(f) => serde_json::Number::from_f64(f as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Double(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned().into(),
        ValueRef::Blob(bytes) => {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        ValueRef::Decimal(d) => Value::String(d.to_string()),
        other => Value::String(format!("{:?}", other)),
    }
}

/// Timestamp literal accepted by `CAST(... AS TIMESTAMP)`
pub fn timestamp_literal(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_store() {
        let store = Store::in_memory().unwrap();
        assert!(store.is_in_memory());
        assert!(store.db_path().is_none());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let store = Store::in_memory().unwrap();
        store.initialize(Layer::Bronze).unwrap();
        store.initialize(Layer::Bronze).unwrap();
        assert!(store.table_exists("_bronze_columns").unwrap());
        assert!(!store.table_exists("entity_catalog").unwrap());

        let rows = store
            .query_json("SELECT COUNT(*) AS n FROM _catalog_version", &[])
            .unwrap();
        assert_eq!(rows[0]["n"], Value::from(1));
    }

    #[test]
    fn test_sessions_share_database() {
        let store = Store::in_memory().unwrap();
        let session = store.session().unwrap();
        session
            .execute_batch("CREATE TABLE t (id BIGINT, label VARCHAR); INSERT INTO t VALUES (1, 'a')")
            .unwrap();

        let rows = store.query_json("SELECT id, label FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], Value::from(1));
        assert_eq!(rows[0]["label"], Value::from("a"));
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bronze.duckdb");
        let store = Store::from_config_path("bronze.duckdb", dir.path()).unwrap();
        store.initialize(Layer::Bronze).unwrap();
        assert_eq!(store.db_path(), Some(path.as_path()));
        assert!(path.exists());
    }

    #[test]
    fn test_timestamp_literal() {
        let at = DateTime::parse_from_rfc3339("2026-10-18T12:30:00.25Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(timestamp_literal(&at), "2026-10-18 12:30:00.250000");
    }
}
