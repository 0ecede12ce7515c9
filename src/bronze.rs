//! Raw store writer and reader
//!
//! Each collection lands in its own Bronze table whose columns follow the
//! inferred [`CollectionSchema`], plus three system columns:
//!
//! - `content_key`: idempotency identity of the document
//! - `source_path`: file the document came from
//! - `ingested_at`: time of the last write
//!
//! Re-ingesting a document with a known content key replaces its row.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use duckdb::types::Value as SqlValue;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::{BronzeSection, IdentityRule, ImportDedup};
use crate::error::{PipelineError, PipelineResult};
use crate::inference::{
    CollectionSchema, ColumnSpec, ColumnType, MigrationPlan, MigrationStep, SkippedRecord,
    admit_documents, infer_schema, plan_migration,
};
use crate::naming::quote_ident;
use crate::pipeline::report::{IntegrityKind, IntegrityNote};
use crate::source::SourceDocument;
use crate::store::schema::{bronze_catalog_sql, import_tracking_sql};
use crate::store::{Store, query_rows, table_exists, timestamp_literal};

/// Serialize JSON with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let fields: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

/// Content key of a document.
///
/// Documents carrying every field of a matching identity rule are keyed by
/// those fields; everything else is keyed by its canonical serialization.
pub fn content_key(object: &Map<String, Value>, identity: Option<&IdentityRule>) -> String {
    let mut hasher = Sha256::new();

    let natural: Option<Vec<&Value>> = identity.and_then(|rule| {
        rule.fields
            .iter()
            .map(|field| object.get(field).filter(|v| !v.is_null()))
            .collect()
    });

    match natural {
        Some(values) => {
            hasher.update(b"natural:");
            let values: Vec<Value> = values.into_iter().cloned().collect();
            hasher.update(canonical_json(&Value::Array(values)).as_bytes());
        }
        None => {
            hasher.update(b"content:");
            hasher.update(canonical_json(&Value::Object(object.clone())).as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

/// Result of ingesting one collection
#[derive(Debug, Clone, Default)]
pub struct CollectionOutcome {
    pub collection: String,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: Vec<SkippedRecord>,
    pub duplicates: usize,
    pub files_unchanged: usize,
    pub columns_added: usize,
    pub columns_widened: usize,
    pub integrity: Vec<IntegrityNote>,
}

struct PendingRow<'a> {
    content_key: String,
    source_path: &'a str,
    object: &'a Map<String, Value>,
}

/// Writes collections into the Bronze store
pub struct BronzeWriter<'a> {
    store: &'a Store,
    settings: &'a BronzeSection,
}

impl<'a> BronzeWriter<'a> {
    pub fn new(store: &'a Store, settings: &'a BronzeSection) -> Self {
        Self { store, settings }
    }

    /// Ingest one collection's documents in a single transaction.
    ///
    /// On failure nothing of this collection is committed and the touched
    /// source files are tracked as failed.
    pub fn ingest(
        &self,
        collection: &str,
        documents: &[SourceDocument],
        ingested_at: DateTime<Utc>,
    ) -> PipelineResult<CollectionOutcome> {
        match self.ingest_inner(collection, documents, ingested_at) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if let Err(track_err) =
                    self.track_failure(collection, documents, &err, ingested_at)
                {
                    warn!(collection, "Failed to record import failure: {}", track_err);
                }
                Err(err)
            }
        }
    }

    fn ingest_inner(
        &self,
        collection: &str,
        documents: &[SourceDocument],
        ingested_at: DateTime<Utc>,
    ) -> PipelineResult<CollectionOutcome> {
        let mut conn = self.store.session()?;
        let tx = conn.transaction()?;
        let mut outcome = CollectionOutcome {
            collection: collection.to_string(),
            ..Default::default()
        };

        let documents = self.drop_unchanged_files(&tx, collection, documents, &mut outcome)?;
        let (admitted, skipped) = admit_documents(&documents);
        for record in &skipped {
            warn!(collection, path = %record.path, index = record.index, "Skipping document: {}", record.reason);
        }
        outcome.skipped = skipped;

        let inferred = infer_schema(collection, admitted.iter().map(|(_, obj)| *obj));
        let stored = load_schema(&tx, collection)?;
        let plan = plan_migration(stored.as_ref(), &inferred)?;
        apply_migration(&tx, collection, stored.as_ref(), &plan)?;
        outcome.columns_added = if stored.is_some() { plan.added() } else { 0 };
        outcome.columns_widened = plan.widened();

        // Collapse duplicate keys; the later document wins
        let identity = self.settings.identity_for(collection);
        let mut rows: Vec<PendingRow> = Vec::with_capacity(admitted.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        for (doc, object) in &admitted {
            let key = content_key(object, identity);
            let row = PendingRow {
                content_key: key.clone(),
                source_path: &doc.path,
                object,
            };
            match positions.get(&key) {
                Some(&pos) => {
                    outcome.duplicates += 1;
                    if rows[pos].object != *object {
                        outcome.integrity.push(IntegrityNote {
                            kind: IntegrityKind::ContentKeyCollision,
                            scope: collection.to_string(),
                            key: key.clone(),
                            detail: format!(
                                "{} (document {}) replaces an earlier document with the same key",
                                doc.path, doc.index
                            ),
                        });
                    }
                    rows[pos] = row;
                }
                None => {
                    positions.insert(key, rows.len());
                    rows.push(row);
                }
            }
        }

        let table = quote_ident(collection);
        let existing: HashSet<String> = query_rows(
            &tx,
            &format!("SELECT content_key FROM {}", table),
            &[],
        )?
        .into_iter()
        .filter_map(|row| row.get("content_key").and_then(|v| v.as_str()).map(String::from))
        .collect();

        {
            let mut delete =
                tx.prepare(&format!("DELETE FROM {} WHERE content_key = $1", table))?;
            for row in rows.iter().filter(|r| existing.contains(&r.content_key)) {
                delete.execute([&row.content_key])?;
            }

            let column_list: Vec<String> = ["content_key", "source_path", "ingested_at"]
                .iter()
                .map(|c| c.to_string())
                .chain(plan.schema.columns.iter().map(|c| quote_ident(&c.name)))
                .collect();
            let placeholders: Vec<String> = std::iter::once("$1".to_string())
                .chain(std::iter::once("$2".to_string()))
                .chain(std::iter::once("CAST($3 AS TIMESTAMP)".to_string()))
                .chain((0..plan.schema.columns.len()).map(|i| format!("${}", i + 4)))
                .collect();
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                column_list.join(", "),
                placeholders.join(", ")
            ))?;

            let stamp = timestamp_literal(&ingested_at);
            for row in &rows {
                let mut values: Vec<SqlValue> = Vec::with_capacity(plan.schema.columns.len() + 3);
                values.push(SqlValue::Text(row.content_key.clone()));
                values.push(SqlValue::Text(row.source_path.to_string()));
                values.push(SqlValue::Text(stamp.clone()));
                for column in &plan.schema.columns {
                    values.push(to_sql_value(column, row.object.get(&column.source_field)));
                }
                insert.execute(duckdb::params_from_iter(values.iter()))?;

                if existing.contains(&row.content_key) {
                    outcome.updated += 1;
                } else {
                    outcome.inserted += 1;
                }
            }
        }

        let total: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| {
            r.get(0)
        })?;
        tx.execute(bronze_catalog_sql::DELETE_COLLECTION, [collection])?;
        tx.execute(
            bronze_catalog_sql::INSERT_COLLECTION,
            duckdb::params![collection, total, timestamp_literal(&ingested_at)],
        )?;

        self.track_files(&tx, collection, &documents, "completed", None, ingested_at)?;
        tx.commit()?;

        info!(
            collection,
            inserted = outcome.inserted,
            updated = outcome.updated,
            skipped = outcome.skipped.len(),
            "Bronze collection written"
        );
        Ok(outcome)
    }

    /// With content dedup on, drop documents of files already imported unchanged
    fn drop_unchanged_files(
        &self,
        conn: &duckdb::Connection,
        collection: &str,
        documents: &[SourceDocument],
        outcome: &mut CollectionOutcome,
    ) -> PipelineResult<Vec<SourceDocument>> {
        if self.settings.dedup == ImportDedup::None {
            return Ok(documents.to_vec());
        }

        let mut unchanged = BTreeSet::new();
        let files: BTreeMap<&str, &str> = documents
            .iter()
            .filter(|d| !d.file_hash.is_empty())
            .map(|d| (d.path.as_str(), d.file_hash.as_str()))
            .collect();
        for (path, hash) in files {
            let imported = query_rows(
                conn,
                import_tracking_sql::SELECT_IMPORTED,
                &[&path, &collection],
            )?;
            if imported
                .iter()
                .any(|row| row.get("file_hash").and_then(|v| v.as_str()) == Some(hash))
            {
                debug!(collection, path, "Source file unchanged, skipping");
                unchanged.insert(path);
            }
        }

        outcome.files_unchanged = unchanged.len();
        Ok(documents
            .iter()
            .filter(|d| !unchanged.contains(d.path.as_str()))
            .cloned()
            .collect())
    }

    fn track_files(
        &self,
        conn: &duckdb::Connection,
        collection: &str,
        documents: &[SourceDocument],
        status: &str,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> PipelineResult<()> {
        let mut files: BTreeMap<&str, (&str, i64)> = BTreeMap::new();
        for doc in documents.iter().filter(|d| !d.file_hash.is_empty()) {
            files.entry(doc.path.as_str()).or_insert((doc.file_hash.as_str(), 0)).1 += 1;
        }

        let stamp = timestamp_literal(&at);
        for (path, (hash, count)) in files {
            conn.execute(import_tracking_sql::DELETE, [path, collection])?;
            conn.execute(
                import_tracking_sql::INSERT,
                duckdb::params![path, hash, collection, count, status, error, stamp],
            )?;
        }
        Ok(())
    }

    fn track_failure(
        &self,
        collection: &str,
        documents: &[SourceDocument],
        err: &PipelineError,
        at: DateTime<Utc>,
    ) -> PipelineResult<()> {
        let mut conn = self.store.session()?;
        let tx = conn.transaction()?;
        let message = err.to_string();
        self.track_files(&tx, collection, documents, "failed", Some(&message), at)?;
        tx.commit()?;
        Ok(())
    }
}

/// Stored schema of a collection, if the collection has been written before
pub fn load_schema(
    conn: &duckdb::Connection,
    collection: &str,
) -> PipelineResult<Option<CollectionSchema>> {
    let rows = query_rows(conn, bronze_catalog_sql::SELECT_COLUMNS, &[&collection])?;
    if rows.is_empty() && !table_exists(conn, collection)? {
        return Ok(None);
    }

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let text = |key: &str| {
            row.get(key)
                .and_then(|v| v.as_str())
                .map(String::from)
                .ok_or_else(|| PipelineError::QueryFailed(format!("catalog row missing {}", key)))
        };
        let ty: ColumnType = text("column_type")?
            .parse()
            .map_err(PipelineError::QueryFailed)?;
        columns.push(ColumnSpec {
            name: text("column_name")?,
            source_field: text("source_field")?,
            ty,
            blob: row.get("is_blob").and_then(|v| v.as_bool()).unwrap_or(false),
            nulls_only: false,
        });
    }

    Ok(Some(CollectionSchema {
        collection: collection.to_string(),
        columns,
    }))
}

fn apply_migration(
    conn: &duckdb::Connection,
    collection: &str,
    stored: Option<&CollectionSchema>,
    plan: &MigrationPlan,
) -> PipelineResult<()> {
    let table = quote_ident(collection);

    if stored.is_none() {
        let mut ddl = vec![
            "content_key VARCHAR NOT NULL".to_string(),
            "source_path VARCHAR NOT NULL".to_string(),
            "ingested_at TIMESTAMP NOT NULL".to_string(),
        ];
        ddl.extend(
            plan.schema
                .columns
                .iter()
                .map(|c| format!("{} {}", quote_ident(&c.name), c.ty.sql_type())),
        );
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            table,
            ddl.join(", ")
        ))?;
    } else {
        for step in &plan.steps {
            match step {
                MigrationStep::AddColumn(column) => {
                    conn.execute_batch(&format!(
                        "ALTER TABLE {} ADD COLUMN {} {}",
                        table,
                        quote_ident(&column.name),
                        column.ty.sql_type()
                    ))?;
                }
                MigrationStep::AlterType { column, from, to } => {
                    conn.execute_batch(&format!(
                        "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                        table,
                        quote_ident(column),
                        to.sql_type()
                    ))
                    .map_err(|e| {
                        warn!(collection, column, "Backend refused widening: {}", e);
                        PipelineError::SchemaConflict {
                            collection: collection.to_string(),
                            column: column.clone(),
                            stored: from.to_string(),
                            inferred: to.to_string(),
                        }
                    })?;
                }
                MigrationStep::EncodeJson { column } => encode_json_values(conn, &table, column)?,
                MigrationStep::Relabel { .. } => {}
            }
        }
    }

    if plan.catalog_changed(stored) {
        conn.execute(bronze_catalog_sql::DELETE_COLUMNS, [collection])?;
        for column in &plan.schema.columns {
            conn.execute(
                bronze_catalog_sql::INSERT_COLUMN,
                duckdb::params![
                    collection,
                    column.name,
                    column.source_field,
                    column.ty.as_str(),
                    column.blob
                ],
            )?;
        }
    }
    Ok(())
}

/// Rewrite the plain strings of a column as JSON string literals
fn encode_json_values(conn: &duckdb::Connection, table: &str, column: &str) -> PipelineResult<()> {
    let column = quote_ident(column);
    let rows = query_rows(
        conn,
        &format!(
            "SELECT content_key, {} AS value FROM {} WHERE {} IS NOT NULL",
            column, table, column
        ),
        &[],
    )?;
    let mut update = conn.prepare(&format!(
        "UPDATE {} SET {} = $1 WHERE content_key = $2",
        table, column
    ))?;
    for row in rows {
        let (Some(Value::String(key)), Some(value)) = (row.get("content_key"), row.get("value"))
        else {
            continue;
        };
        update.execute(duckdb::params![canonical_json(value), key])?;
    }
    Ok(())
}

/// Convert a document value into the stored representation of a column.
///
/// A string column that also holds blobs stores every value as JSON text, so
/// strings that look like JSON read back unchanged.
fn to_sql_value(column: &ColumnSpec, value: Option<&Value>) -> SqlValue {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return SqlValue::Null;
    };

    match (column.ty, value) {
        (ColumnType::String, value) if column.blob => SqlValue::Text(canonical_json(value)),
        (ColumnType::Integer, Value::Number(n)) if n.is_i64() => {
            SqlValue::BigInt(n.as_i64().unwrap_or_default())
        }
        (ColumnType::Float, Value::Number(n)) => SqlValue::Double(n.as_f64().unwrap_or_default()),
        (ColumnType::Boolean, Value::Bool(b)) => SqlValue::Boolean(*b),
        (_, Value::String(s)) => SqlValue::Text(s.clone()),
        (_, other) => SqlValue::Text(canonical_json(other)),
    }
}

/// A Bronze row read back for transformation
#[derive(Debug, Clone, PartialEq)]
pub struct BronzeRow {
    pub collection: String,
    pub content_key: String,
    pub source_path: String,
    /// Microseconds since the Unix epoch
    pub ingested_at_us: i64,
    /// Column name to value; blob columns are parsed back into JSON
    pub values: BTreeMap<String, Value>,
}

/// Reads collections and their stored schemas
pub struct BronzeReader<'a> {
    store: &'a Store,
}

impl<'a> BronzeReader<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Collections written so far, sorted
    pub fn collections(&self) -> PipelineResult<Vec<String>> {
        let rows = self
            .store
            .query_json(bronze_catalog_sql::SELECT_COLLECTIONS, &[])?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.get("collection").and_then(|v| v.as_str()).map(String::from))
            .collect())
    }

    pub fn schema(&self, collection: &str) -> PipelineResult<Option<CollectionSchema>> {
        let conn = self.store.session()?;
        load_schema(&conn, collection)
    }

    /// All rows of a collection, ordered by content key
    pub fn rows(&self, collection: &str) -> PipelineResult<Vec<BronzeRow>> {
        let conn = self.store.session()?;
        let Some(schema) = load_schema(&conn, collection)? else {
            return Ok(Vec::new());
        };

        let mut select = vec![
            "content_key".to_string(),
            "source_path".to_string(),
            "epoch_us(ingested_at) AS ingested_at_us".to_string(),
        ];
        select.extend(schema.columns.iter().map(|c| quote_ident(&c.name)));
        let rows = query_rows(
            &conn,
            &format!(
                "SELECT {} FROM {} ORDER BY content_key",
                select.join(", "),
                quote_ident(collection)
            ),
            &[],
        )?;

        Ok(rows
            .into_iter()
            .map(|mut row| {
                let text = |v: Option<Value>| match v {
                    Some(Value::String(s)) => s,
                    _ => String::new(),
                };
                let content_key = text(row.remove("content_key"));
                let source_path = text(row.remove("source_path"));
                let ingested_at_us = row
                    .remove("ingested_at_us")
                    .and_then(|v| v.as_i64())
                    .unwrap_or_default();
                let values = schema
                    .columns
                    .iter()
                    .map(|column| {
                        let raw = row.remove(&column.name).unwrap_or(Value::Null);
                        (column.name.clone(), from_stored(column, raw))
                    })
                    .collect();
                BronzeRow {
                    collection: collection.to_string(),
                    content_key,
                    source_path,
                    ingested_at_us,
                    values,
                }
            })
            .collect())
    }
}

fn from_stored(column: &ColumnSpec, raw: Value) -> Value {
    match (&raw, column.ty, column.blob) {
        (Value::String(text), ColumnType::Json, _) => {
            serde_json::from_str(text).unwrap_or(raw)
        }
        (Value::String(text), ColumnType::String, true) => {
            serde_json::from_str(text).unwrap_or(raw)
        }
        _ => raw,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Layer;
    use serde_json::json;

    fn bronze_store() -> Store {
        let store = Store::in_memory().unwrap();
        store.initialize(Layer::Bronze).unwrap();
        store
    }

    fn docs(collection: &str, values: Vec<Value>) -> Vec<SourceDocument> {
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                SourceDocument::parsed(collection, "spells/spells-phb.json", i, v)
                    .with_file_hash("abc123")
            })
            .collect()
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": [1, {"z": 0, "y": 1}], "c": null}});
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"c":null,"d":[1,{"y":1,"z":0}]},"b":1}"#
        );
    }

    #[test]
    fn test_content_key_ignores_key_order() {
        let a = json!({"name": "Fireball", "level": 3});
        let b = json!({"level": 3, "name": "Fireball"});
        assert_eq!(
            content_key(a.as_object().unwrap(), None),
            content_key(b.as_object().unwrap(), None)
        );
    }

    #[test]
    fn test_natural_key() {
        let rule = IdentityRule {
            collections: vec!["spells_*".into()],
            fields: vec!["name".into(), "source".into()],
        };
        let a = json!({"name": "Fireball", "source": "PHB", "level": 3});
        let b = json!({"name": "Fireball", "source": "PHB", "level": 4});
        let c = json!({"name": "Fireball", "level": 3});
        let key_a = content_key(a.as_object().unwrap(), Some(&rule));
        assert_eq!(key_a, content_key(b.as_object().unwrap(), Some(&rule)));
        // Missing identity field falls back to the content hash
        assert_eq!(
            content_key(c.as_object().unwrap(), Some(&rule)),
            content_key(c.as_object().unwrap(), None)
        );
    }

    #[test]
    fn test_ingest_creates_table() {
        let store = bronze_store();
        let settings = BronzeSection::default();
        let writer = BronzeWriter::new(&store, &settings);

        let outcome = writer
            .ingest(
                "spells_phb",
                &docs("spells_phb", vec![json!({"name": "Fireball", "level": 3})]),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.updated, 0);

        let rows = BronzeReader::new(&store).rows("spells_phb").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values["name"], json!("Fireball"));
        assert_eq!(rows[0].values["level"], json!(3));
        assert_eq!(rows[0].source_path, "spells/spells-phb.json");
    }

    #[test]
    fn test_reingest_updates_in_place() {
        let store = bronze_store();
        let settings = BronzeSection::default();
        let writer = BronzeWriter::new(&store, &settings);
        let batch = docs("spells_phb", vec![json!({"name": "Fireball", "level": 3})]);

        let first = Utc::now();
        writer.ingest("spells_phb", &batch, first).unwrap();
        let later = first + chrono::Duration::seconds(5);
        let outcome = writer.ingest("spells_phb", &batch, later).unwrap();
        assert_eq!(outcome.inserted, 0);
        assert_eq!(outcome.updated, 1);

        let rows = BronzeReader::new(&store).rows("spells_phb").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ingested_at_us, later.timestamp_micros());
    }

    #[test]
    fn test_blob_columns_round_trip() {
        let store = bronze_store();
        let settings = BronzeSection::default();
        let writer = BronzeWriter::new(&store, &settings);
        let components = json!({"v": true, "m": "a pinch of sulfur"});

        writer
            .ingest(
                "spells_phb",
                &docs(
                    "spells_phb",
                    vec![json!({"name": "Fireball", "components": components.clone()})],
                ),
                Utc::now(),
            )
            .unwrap();

        let rows = BronzeReader::new(&store).rows("spells_phb").unwrap();
        assert_eq!(rows[0].values["components"], components);
    }

    #[test]
    fn test_duplicates_collapse_within_batch() {
        let store = bronze_store();
        let settings = BronzeSection {
            identity: vec![IdentityRule {
                collections: vec!["spells_*".into()],
                fields: vec!["name".into()],
            }],
            ..Default::default()
        };
        let writer = BronzeWriter::new(&store, &settings);

        let outcome = writer
            .ingest(
                "spells_phb",
                &docs(
                    "spells_phb",
                    vec![
                        json!({"name": "Fireball", "level": 3}),
                        json!({"name": "Fireball", "level": 3}),
                        json!({"name": "Fireball", "level": 4}),
                    ],
                ),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(outcome.integrity.len(), 1);

        let rows = BronzeReader::new(&store).rows("spells_phb").unwrap();
        assert_eq!(rows[0].values["level"], json!(4));
    }

    #[test]
    fn test_schema_grows_additively() {
        let store = bronze_store();
        let settings = BronzeSection::default();
        let writer = BronzeWriter::new(&store, &settings);

        writer
            .ingest(
                "spells_phb",
                &docs("spells_phb", vec![json!({"name": "Fireball", "range": 150})]),
                Utc::now(),
            )
            .unwrap();
        let outcome = writer
            .ingest(
                "spells_phb",
                &docs("spells_phb", vec![json!({"name": "Shield", "school": "A"})]),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(outcome.columns_added, 1);

        let schema = BronzeReader::new(&store).schema("spells_phb").unwrap().unwrap();
        let names: Vec<_> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["name", "range", "school"]);

        let rows = BronzeReader::new(&store).rows("spells_phb").unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_boolean_conflict_fails_unit_without_commit() {
        let store = bronze_store();
        let settings = BronzeSection::default();
        let writer = BronzeWriter::new(&store, &settings);

        writer
            .ingest(
                "spells_phb",
                &docs("spells_phb", vec![json!({"name": "Alarm", "ritual": true})]),
                Utc::now(),
            )
            .unwrap();
        let err = writer
            .ingest(
                "spells_phb",
                &docs("spells_phb", vec![json!({"name": "Wish", "ritual": "never"})]),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, PipelineError::SchemaConflict { .. }));
        assert!(!err.is_run_fatal());

        let rows = BronzeReader::new(&store).rows("spells_phb").unwrap();
        assert_eq!(rows.len(), 1);

        let tracked = store
            .query_json("SELECT status FROM _import_tracking", &[])
            .unwrap();
        assert_eq!(tracked[0]["status"], json!("failed"));
    }

    #[test]
    fn test_null_batch_keeps_stored_types() {
        let store = bronze_store();
        let settings = BronzeSection::default();
        let writer = BronzeWriter::new(&store, &settings);

        writer
            .ingest(
                "spells_phb",
                &docs(
                    "spells_phb",
                    vec![json!({"name": "Alarm", "ritual": true, "level": 1})],
                ),
                Utc::now(),
            )
            .unwrap();
        let outcome = writer
            .ingest(
                "spells_phb",
                &docs(
                    "spells_phb",
                    vec![json!({"name": "Wish", "ritual": null, "level": null})],
                ),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.columns_widened, 0);

        let schema = BronzeReader::new(&store).schema("spells_phb").unwrap().unwrap();
        assert_eq!(schema.column("ritual").unwrap().ty, ColumnType::Boolean);
        assert_eq!(schema.column("level").unwrap().ty, ColumnType::Integer);

        let rows = BronzeReader::new(&store).rows("spells_phb").unwrap();
        let wish = rows.iter().find(|r| r.values["name"] == json!("Wish")).unwrap();
        assert_eq!(wish.values["ritual"], Value::Null);
        assert_eq!(wish.values["level"], Value::Null);
    }

    #[test]
    fn test_mixed_column_keeps_json_looking_strings() {
        let store = bronze_store();
        let settings = BronzeSection::default();
        let writer = BronzeWriter::new(&store, &settings);

        writer
            .ingest(
                "spells_phb",
                &docs("spells_phb", vec![json!({"name": "Alarm", "range": "[1,2]"})]),
                Utc::now(),
            )
            .unwrap();
        writer
            .ingest(
                "spells_phb",
                &docs(
                    "spells_phb",
                    vec![
                        json!({"name": "Shield", "range": "{x}"}),
                        json!({"name": "Fireball", "range": {"type": "point", "amount": 150}}),
                    ],
                ),
                Utc::now(),
            )
            .unwrap();

        let rows = BronzeReader::new(&store).rows("spells_phb").unwrap();
        let range = |name: &str| {
            rows.iter()
                .find(|r| r.values["name"] == json!(name))
                .map(|r| r.values["range"].clone())
                .unwrap()
        };
        assert_eq!(range("Alarm"), json!("[1,2]"));
        assert_eq!(range("Shield"), json!("{x}"));
        assert_eq!(range("Fireball"), json!({"type": "point", "amount": 150}));
    }

    #[test]
    fn test_by_content_dedup_skips_unchanged_files() {
        let store = bronze_store();
        let settings = BronzeSection {
            dedup: ImportDedup::ByContent,
            ..Default::default()
        };
        let writer = BronzeWriter::new(&store, &settings);
        let batch = docs("spells_phb", vec![json!({"name": "Fireball"})]);

        writer.ingest("spells_phb", &batch, Utc::now()).unwrap();
        let outcome = writer.ingest("spells_phb", &batch, Utc::now()).unwrap();
        assert_eq!(outcome.files_unchanged, 1);
        assert_eq!(outcome.updated, 0);
        assert_eq!(outcome.inserted, 0);
    }

    #[test]
    fn test_malformed_documents_are_skipped() {
        let store = bronze_store();
        let settings = BronzeSection::default();
        let writer = BronzeWriter::new(&store, &settings);
        let mut batch = docs("spells_phb", vec![json!({"name": "Fireball"}), json!("loose")]);
        batch.push(SourceDocument::malformed("spells_phb", "broken.json", 0, "eof"));

        let outcome = writer.ingest("spells_phb", &batch, Utc::now()).unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.skipped.len(), 2);
    }
}
