//! Silver table set rebuild
//!
//! A kind's entity, child and provenance tables are dropped and recreated
//! inside one transaction together with their indexes, the kind's
//! entity-catalog rows and its build record. Readers see either the previous
//! table set or the new one.

use chrono::{DateTime, Utc};
use duckdb::types::Value as SqlValue;
use serde_json::Value;
use tracing::info;

use super::dedupe::DedupOutcome;
use super::definition::EntityDefinition;
use super::index::Indexer;
use crate::bronze::canonical_json;
use crate::error::PipelineResult;
use crate::inference::ColumnType;
use crate::naming::quote_ident;
use crate::store::schema::{entity_catalog_sql, silver_build_sql};
use crate::store::{Store, query_rows, table_exists, timestamp_literal};

/// Counts from one rebuild
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub entities: usize,
    pub child_rows: usize,
}

/// Writes entity kinds into the Silver store
pub struct SilverWriter<'a> {
    store: &'a Store,
}

impl<'a> SilverWriter<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Entity count of the last build if it can be reused for `source_hash`
    pub fn reusable_build(
        &self,
        definition: &EntityDefinition,
        source_hash: &str,
    ) -> PipelineResult<Option<usize>> {
        let conn = self.store.session()?;
        let rows = query_rows(&conn, silver_build_sql::SELECT, &[&definition.kind])?;
        let Some(build) = rows.first() else {
            return Ok(None);
        };

        let same_hash = build.get("source_hash").and_then(|v| v.as_str()) == Some(source_hash);
        let completed = build.get("status").and_then(|v| v.as_str()) == Some("completed");
        if !same_hash || !completed {
            return Ok(None);
        }
        for table in definition.table_names() {
            if !table_exists(&conn, &table)? {
                return Ok(None);
            }
        }

        Ok(build
            .get("entity_count")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize))
    }

    /// Replace the kind's table set with the deduplicated entities
    pub fn rebuild(
        &self,
        definition: &EntityDefinition,
        outcome: &DedupOutcome,
        source_hash: &str,
        built_at: DateTime<Utc>,
    ) -> PipelineResult<RebuildStats> {
        let mut conn = self.store.session()?;
        let tx = conn.transaction()?;

        create_tables(&tx, definition)?;
        Indexer::build(&tx, definition)?;
        let stats = insert_entities(&tx, definition, outcome)?;

        tx.execute(entity_catalog_sql::DELETE_KIND, [&definition.kind])?;
        {
            let mut insert = tx.prepare(entity_catalog_sql::INSERT)?;
            for entity in &outcome.entities {
                insert.execute(duckdb::params![
                    definition.kind,
                    entity.canonical_key,
                    entity.name,
                    definition.table
                ])?;
            }
        }

        tx.execute(silver_build_sql::DELETE, [&definition.kind])?;
        tx.execute(
            silver_build_sql::INSERT,
            duckdb::params![
                definition.kind,
                definition.table,
                source_hash,
                stats.entities as i64,
                "completed",
                timestamp_literal(&built_at)
            ],
        )?;

        tx.commit()?;
        info!(
            kind = %definition.kind,
            entities = stats.entities,
            child_rows = stats.child_rows,
            "Silver table set rebuilt"
        );
        Ok(stats)
    }
}

fn create_tables(conn: &duckdb::Connection, definition: &EntityDefinition) -> PipelineResult<()> {
    let mut ddl = Vec::new();
    for table in definition.table_names().iter().rev() {
        ddl.push(format!("DROP TABLE IF EXISTS {};", quote_ident(table)));
    }

    let mut columns = vec![
        "canonical_key VARCHAR NOT NULL".to_string(),
        "name VARCHAR NOT NULL".to_string(),
    ];
    columns.extend(
        definition
            .fields
            .iter()
            .map(|f| format!("{} {}", quote_ident(&f.name), f.ty.sql_type())),
    );
    columns.push("provenance VARCHAR NOT NULL".to_string());
    ddl.push(format!(
        "CREATE TABLE {} ({});",
        quote_ident(&definition.table),
        columns.join(", ")
    ));

    ddl.push(format!(
        "CREATE TABLE {} (parent_key VARCHAR NOT NULL, source_collection VARCHAR NOT NULL, content_key VARCHAR NOT NULL, priority INTEGER NOT NULL);",
        quote_ident(&definition.provenance_table())
    ));

    for child in &definition.children {
        let mut columns = vec![
            "parent_key VARCHAR NOT NULL".to_string(),
            "ordinal INTEGER NOT NULL".to_string(),
        ];
        columns.extend(
            child
                .columns
                .iter()
                .map(|c| format!("{} {}", quote_ident(&c.name), c.ty.sql_type())),
        );
        ddl.push(format!(
            "CREATE TABLE {} ({});",
            quote_ident(&child.table),
            columns.join(", ")
        ));
    }

    conn.execute_batch(&ddl.join("\n"))?;
    Ok(())
}

fn insert_entities(
    conn: &duckdb::Connection,
    definition: &EntityDefinition,
    outcome: &DedupOutcome,
) -> PipelineResult<RebuildStats> {
    let mut stats = RebuildStats::default();

    let placeholders = |n: usize| {
        (1..=n)
            .map(|i| format!("${}", i))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut entity_insert = conn.prepare(&format!(
        "INSERT INTO {} VALUES ({})",
        quote_ident(&definition.table),
        placeholders(definition.fields.len() + 3)
    ))?;
    let mut provenance_insert = conn.prepare(&format!(
        "INSERT INTO {} VALUES ($1, $2, $3, $4)",
        quote_ident(&definition.provenance_table())
    ))?;
    let mut child_inserts = definition
        .children
        .iter()
        .map(|child| {
            conn.prepare(&format!(
                "INSERT INTO {} VALUES ({})",
                quote_ident(&child.table),
                placeholders(child.columns.len() + 2)
            ))
        })
        .collect::<Result<Vec<_>, _>>()?;

    for entity in &outcome.entities {
        let mut values = Vec::with_capacity(definition.fields.len() + 3);
        values.push(SqlValue::Text(entity.canonical_key.clone()));
        values.push(SqlValue::Text(entity.name.clone()));
        for field in &definition.fields {
            let value = entity.fields.get(&field.name).unwrap_or(&Value::Null);
            values.push(silver_value(field.ty, value));
        }
        values.push(SqlValue::Text(serde_json::to_string(&entity.source_collections())?));
        entity_insert.execute(duckdb::params_from_iter(values.iter()))?;
        stats.entities += 1;

        for entry in &entity.provenance {
            provenance_insert.execute(duckdb::params![
                entity.canonical_key,
                entry.source_collection,
                entry.content_key,
                entry.priority as i64
            ])?;
        }

        for (child, insert) in definition.children.iter().zip(child_inserts.iter_mut()) {
            let Some(rows) = entity.children.get(&child.name) else {
                continue;
            };
            for (ordinal, row) in rows.iter().enumerate() {
                let mut values = Vec::with_capacity(child.columns.len() + 2);
                values.push(SqlValue::Text(entity.canonical_key.clone()));
                values.push(SqlValue::Int(ordinal as i32));
                for (column, value) in child.columns.iter().zip(row.values.iter()) {
                    values.push(silver_value(column.ty, value));
                }
                insert.execute(duckdb::params_from_iter(values.iter()))?;
                stats.child_rows += 1;
            }
        }
    }

    Ok(stats)
}

/// Stored representation of an already coerced value
fn silver_value(ty: ColumnType, value: &Value) -> SqlValue {
    match (ty, value) {
        (_, Value::Null) => SqlValue::Null,
        (ColumnType::Integer, Value::Number(n)) if n.is_i64() => {
            SqlValue::BigInt(n.as_i64().unwrap_or_default())
        }
        (ColumnType::Float, Value::Number(n)) => SqlValue::Double(n.as_f64().unwrap_or_default()),
        (ColumnType::Boolean, Value::Bool(b)) => SqlValue::Boolean(*b),
        (ColumnType::Json, other) => SqlValue::Text(canonical_json(other)),
        (_, Value::String(s)) => SqlValue::Text(s.clone()),
        (_, other) => SqlValue::Text(canonical_json(other)),
    }
}
