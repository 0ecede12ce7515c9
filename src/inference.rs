//! Schema inference for Bronze collections
//!
//! Derives a flat [`CollectionSchema`] from a batch of JSON objects and plans
//! additive migrations against a previously stored schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

use crate::error::{PipelineError, PipelineResult};
use crate::naming::sanitize_identifier;
use crate::source::{DocumentBody, SourceDocument};

/// Inferred column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    String,
    /// Array or object, stored as serialized JSON
    Json,
}

impl ColumnType {
    /// Narrowest type for a single value; `None` for JSON null
    pub fn of_value(value: &Value) -> Option<ColumnType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Boolean),
            Value::Number(n) if n.is_i64() => Some(ColumnType::Integer),
            Value::Number(_) => Some(ColumnType::Float),
            Value::String(_) => Some(ColumnType::String),
            Value::Array(_) | Value::Object(_) => Some(ColumnType::Json),
        }
    }

    /// Narrowest type accepting both `self` and `other`
    pub fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Integer, Float) | (Float, Integer) => Float,
            _ => String,
        }
    }

    /// Backend column type
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Integer => "BIGINT",
            ColumnType::Float => "DOUBLE",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::String | ColumnType::Json => "VARCHAR",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::String => "string",
            ColumnType::Json => "json",
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ColumnType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "integer" | "int" | "bigint" => Ok(ColumnType::Integer),
            "float" | "double" | "number" => Ok(ColumnType::Float),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            "string" | "text" | "varchar" => Ok(ColumnType::String),
            "json" | "blob" => Ok(ColumnType::Json),
            _ => Err(format!("Unknown column type: {}", s)),
        }
    }
}

/// One column of a collection table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Sanitised column name
    pub name: String,
    /// Top-level document key the column is filled from
    pub source_field: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    /// Whether arrays/objects were observed in this column
    pub blob: bool,
    /// Only nulls were observed, so `ty` is a placeholder
    #[serde(skip)]
    pub nulls_only: bool,
}

/// Flat schema of one Bronze collection, columns sorted by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub collection: String,
    pub columns: Vec<ColumnSpec>,
}

impl CollectionSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn by_source_field(&self, field: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.source_field == field)
    }

    fn sort(&mut self) {
        self.columns.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// A document rejected before inference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub path: String,
    pub index: usize,
    pub reason: String,
}

/// Split a batch into JSON objects and skipped records, preserving batch order
pub fn admit_documents(
    docs: &[SourceDocument],
) -> (Vec<(&SourceDocument, &Map<String, Value>)>, Vec<SkippedRecord>) {
    let mut admitted = Vec::with_capacity(docs.len());
    let mut skipped = Vec::new();

    for doc in docs {
        match &doc.body {
            DocumentBody::Parsed(Value::Object(map)) => admitted.push((doc, map)),
            DocumentBody::Parsed(other) => skipped.push(SkippedRecord {
                path: doc.path.clone(),
                index: doc.index,
                reason: format!("expected a JSON object, found {}", json_kind(other)),
            }),
            DocumentBody::Malformed(reason) => skipped.push(SkippedRecord {
                path: doc.path.clone(),
                index: doc.index,
                reason: reason.clone(),
            }),
        }
    }

    (admitted, skipped)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Default)]
struct Observed {
    ty: Option<ColumnType>,
    blob: bool,
}

/// Infer the schema of a batch of objects.
///
/// Every key seen in any object gets a column. Nulls constrain nothing, so a
/// column that only ever held null is a string column flagged `nulls_only`.
pub fn infer_schema<'a, I>(collection: &str, objects: I) -> CollectionSchema
where
    I: IntoIterator<Item = &'a Map<String, Value>>,
{
    let mut observed: BTreeMap<&'a str, Observed> = BTreeMap::new();

    for object in objects {
        for (key, value) in object {
            let entry = observed.entry(key.as_str()).or_default();
            if value.is_array() || value.is_object() {
                entry.blob = true;
            }
            if let Some(ty) = ColumnType::of_value(value) {
                entry.ty = Some(match entry.ty {
                    Some(current) => current.widen(ty),
                    None => ty,
                });
            }
        }
    }

    let mut used = HashSet::new();
    let mut columns = Vec::with_capacity(observed.len());
    for (key, seen) in observed {
        let name = unique_name(&sanitize_identifier(key), &used);
        used.insert(name.clone());
        columns.push(ColumnSpec {
            name,
            source_field: key.to_string(),
            ty: seen.ty.unwrap_or(ColumnType::String),
            blob: seen.blob,
            nulls_only: seen.ty.is_none(),
        });
    }

    let mut schema = CollectionSchema {
        collection: collection.to_string(),
        columns,
    };
    schema.sort();
    schema
}

fn unique_name(base: &str, used: &HashSet<String>) -> String {
    if !used.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}_{}", base, n))
        .find(|candidate| !used.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// One change applied to a stored table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStep {
    AddColumn(ColumnSpec),
    /// Re-encode a string column's values as JSON text once it also holds blobs
    EncodeJson { column: String },
    /// In-place `ALTER COLUMN ... TYPE`
    AlterType {
        column: String,
        from: ColumnType,
        to: ColumnType,
    },
    /// Catalog-only change; the physical column already fits
    Relabel {
        column: String,
        from: ColumnType,
        to: ColumnType,
    },
}

/// Result of reconciling an inferred schema with the stored one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Schema the table has after the steps are applied
    pub schema: CollectionSchema,
    pub steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn added(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, MigrationStep::AddColumn(_)))
            .count()
    }

    pub fn widened(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    MigrationStep::AlterType { .. } | MigrationStep::Relabel { .. }
                )
            })
            .count()
    }

    /// Whether the catalog needs rewriting even without DDL
    pub fn catalog_changed(&self, stored: Option<&CollectionSchema>) -> bool {
        stored != Some(&self.schema)
    }
}

/// Plan the additive migration from `stored` to a schema that holds `inferred`.
///
/// Stored columns are never dropped and keep their names. A stored column may
/// widen `integer -> float`, `integer -> string`, `float -> string` in place,
/// or be relabelled `json -> string`. Anything else is a schema conflict.
/// Columns that only held nulls in this batch never change a stored type.
pub fn plan_migration(
    stored: Option<&CollectionSchema>,
    inferred: &CollectionSchema,
) -> PipelineResult<MigrationPlan> {
    let Some(stored) = stored else {
        let mut schema = inferred.clone();
        for column in &mut schema.columns {
            column.nulls_only = false;
        }
        return Ok(MigrationPlan {
            steps: schema
                .columns
                .iter()
                .cloned()
                .map(MigrationStep::AddColumn)
                .collect(),
            schema,
        });
    };

    let mut schema = stored.clone();
    let mut steps = Vec::new();
    let mut used: HashSet<String> = stored.columns.iter().map(|c| c.name.clone()).collect();

    for column in &inferred.columns {
        let Some(pos) = schema
            .columns
            .iter()
            .position(|c| c.source_field == column.source_field)
        else {
            let name = unique_name(&column.name, &used);
            used.insert(name.clone());
            let added = ColumnSpec {
                name,
                nulls_only: false,
                ..column.clone()
            };
            schema.columns.push(added.clone());
            steps.push(MigrationStep::AddColumn(added));
            continue;
        };

        if column.nulls_only {
            continue;
        }

        let existing = &mut schema.columns[pos];
        if column.blob && !existing.blob && existing.ty == ColumnType::String {
            steps.push(MigrationStep::EncodeJson {
                column: existing.name.clone(),
            });
        }
        existing.blob |= column.blob;
        let target = existing.ty.widen(column.ty);
        if target == existing.ty {
            continue;
        }

        let conflict = || PipelineError::SchemaConflict {
            collection: stored.collection.clone(),
            column: existing_name(stored, &column.source_field),
            stored: stored_type(stored, &column.source_field),
            inferred: column.ty.to_string(),
        };

        let step = match (existing.ty, target) {
            (ColumnType::Integer, ColumnType::Float)
            | (ColumnType::Integer, ColumnType::String)
            | (ColumnType::Float, ColumnType::String) => MigrationStep::AlterType {
                column: existing.name.clone(),
                from: existing.ty,
                to: target,
            },
            (ColumnType::Json, ColumnType::String) => MigrationStep::Relabel {
                column: existing.name.clone(),
                from: existing.ty,
                to: target,
            },
            _ => return Err(conflict()),
        };
        existing.ty = target;
        steps.push(step);
    }

    schema.sort();
    Ok(MigrationPlan { schema, steps })
}

fn existing_name(schema: &CollectionSchema, source_field: &str) -> String {
    schema
        .by_source_field(source_field)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| source_field.to_string())
}

fn stored_type(schema: &CollectionSchema, source_field: &str) -> String {
    schema
        .by_source_field(source_field)
        .map(|c| c.ty.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn objects(values: Vec<Value>) -> Vec<Map<String, Value>> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn infer(values: Vec<Value>) -> CollectionSchema {
        let objs = objects(values);
        infer_schema("spells_phb", objs.iter())
    }

    #[test]
    fn test_widening_order() {
        use ColumnType::*;
        assert_eq!(Integer.widen(Integer), Integer);
        assert_eq!(Integer.widen(Float), Float);
        assert_eq!(Float.widen(String), String);
        assert_eq!(Boolean.widen(Integer), String);
        assert_eq!(Json.widen(Json), Json);
        assert_eq!(Json.widen(Integer), String);
    }

    #[test]
    fn test_schema_is_superset_of_all_fields() {
        let schema = infer(vec![
            json!({"name": "Fireball", "level": 3}),
            json!({"name": "Wish", "ritual": false}),
            json!({"name": "Shield", "components": {"v": true}}),
        ]);
        let names: Vec<_> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["components", "level", "name", "ritual"]);
        let components = schema.column("components").unwrap();
        assert_eq!(components.ty, ColumnType::Json);
        assert!(components.blob);
    }

    #[test]
    fn test_mixed_values_widen_to_string() {
        let schema = infer(vec![json!({"level": 3}), json!({"level": "three"})]);
        assert_eq!(schema.column("level").unwrap().ty, ColumnType::String);

        let schema = infer(vec![json!({"level": 3}), json!({"level": 3.5})]);
        assert_eq!(schema.column("level").unwrap().ty, ColumnType::Float);
    }

    #[test]
    fn test_booleans_must_be_strict() {
        let schema = infer(vec![json!({"ritual": true}), json!({"ritual": 1})]);
        assert_eq!(schema.column("ritual").unwrap().ty, ColumnType::String);
    }

    #[test]
    fn test_null_constrains_nothing() {
        let schema = infer(vec![
            json!({"level": null, "school": null}),
            json!({"level": 2, "school": null}),
        ]);
        assert_eq!(schema.column("level").unwrap().ty, ColumnType::Integer);
        assert!(!schema.column("level").unwrap().nulls_only);
        let school = schema.column("school").unwrap();
        assert_eq!(school.ty, ColumnType::String);
        assert!(school.nulls_only);
    }

    #[test]
    fn test_huge_integer_is_float() {
        let schema = infer(vec![json!({"xp": u64::MAX})]);
        assert_eq!(schema.column("xp").unwrap().ty, ColumnType::Float);
    }

    #[test]
    fn test_scalar_blob_collision() {
        let schema = infer(vec![json!({"range": 30}), json!({"range": {"type": "point"}})]);
        let range = schema.column("range").unwrap();
        assert_eq!(range.ty, ColumnType::String);
        assert!(range.blob);
    }

    #[test]
    fn test_sanitised_name_collisions() {
        let schema = infer(vec![json!({"Level": 1, "level": 2, "desc": "x"})]);
        assert_eq!(schema.by_source_field("Level").unwrap().name, "level");
        assert_eq!(schema.by_source_field("level").unwrap().name, "level_2");
        assert_eq!(schema.by_source_field("desc").unwrap().name, "c_desc");
    }

    #[test]
    fn test_admit_documents() {
        let docs = vec![
            SourceDocument::parsed("spells_phb", "a.json", 0, json!({"name": "Fireball"})),
            SourceDocument::parsed("spells_phb", "a.json", 1, json!([1, 2])),
            SourceDocument::malformed("spells_phb", "b.json", 0, "expected value at line 1"),
        ];
        let (admitted, skipped) = admit_documents(&docs);
        assert_eq!(admitted.len(), 1);
        assert_eq!(skipped.len(), 2);
        assert_eq!(skipped[1].path, "b.json");
    }

    #[test]
    fn test_plan_new_table() {
        let inferred = infer(vec![json!({"name": "Fireball", "level": 3})]);
        let plan = plan_migration(None, &inferred).unwrap();
        assert_eq!(plan.added(), 2);
        assert_eq!(plan.schema, inferred);
    }

    #[test]
    fn test_plan_adds_and_keeps_columns() {
        let stored = infer(vec![json!({"name": "Fireball", "range": 150})]);
        let inferred = infer(vec![json!({"name": "Fireball", "school": "V"})]);
        let plan = plan_migration(Some(&stored), &inferred).unwrap();
        assert_eq!(plan.added(), 1);
        assert!(plan.schema.column("range").is_some());
        assert!(plan.schema.column("school").is_some());
    }

    #[test]
    fn test_plan_widens_in_place() {
        let stored = infer(vec![json!({"level": 3})]);
        let inferred = infer(vec![json!({"level": "three"})]);
        let plan = plan_migration(Some(&stored), &inferred).unwrap();
        assert_eq!(
            plan.steps,
            vec![MigrationStep::AlterType {
                column: "level".into(),
                from: ColumnType::Integer,
                to: ColumnType::String,
            }]
        );
    }

    #[test]
    fn test_plan_narrower_inference_keeps_stored_type() {
        let stored = infer(vec![json!({"level": "three"})]);
        let inferred = infer(vec![json!({"level": 3})]);
        let plan = plan_migration(Some(&stored), &inferred).unwrap();
        assert!(plan.steps.is_empty());
        assert_eq!(plan.schema.column("level").unwrap().ty, ColumnType::String);
    }

    #[test]
    fn test_plan_boolean_conflict() {
        let stored = infer(vec![json!({"ritual": true})]);
        let inferred = infer(vec![json!({"ritual": "sometimes"})]);
        let err = plan_migration(Some(&stored), &inferred).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaConflict { ref column, .. } if column == "ritual"));
    }

    #[test]
    fn test_plan_all_null_batch_keeps_stored_types() {
        let stored = infer(vec![json!({"ritual": true, "level": 1, "range": 1.5})]);
        let inferred = infer(vec![json!({"ritual": null, "level": null, "range": null})]);
        let plan = plan_migration(Some(&stored), &inferred).unwrap();
        assert!(plan.steps.is_empty());
        assert!(!plan.catalog_changed(Some(&stored)));
        assert_eq!(plan.schema.column("ritual").unwrap().ty, ColumnType::Boolean);
        assert_eq!(plan.schema.column("level").unwrap().ty, ColumnType::Integer);
        assert_eq!(plan.schema.column("range").unwrap().ty, ColumnType::Float);
    }

    #[test]
    fn test_plan_new_all_null_column_is_settled() {
        let stored = infer(vec![json!({"name": "Alarm"})]);
        let inferred = infer(vec![json!({"name": "Wish", "school": null})]);
        let plan = plan_migration(Some(&stored), &inferred).unwrap();
        let school = plan.schema.column("school").unwrap();
        assert_eq!(school.ty, ColumnType::String);
        assert!(!school.nulls_only);

        let fresh = plan_migration(None, &inferred).unwrap();
        assert!(fresh.schema.columns.iter().all(|c| !c.nulls_only));
    }

    #[test]
    fn test_plan_string_column_gaining_blobs_is_reencoded() {
        let stored = infer(vec![json!({"range": "self"})]);
        let inferred = infer(vec![json!({"range": {"type": "point", "amount": 30}})]);
        let plan = plan_migration(Some(&stored), &inferred).unwrap();
        assert_eq!(
            plan.steps,
            vec![MigrationStep::EncodeJson {
                column: "range".into()
            }]
        );
        assert_eq!(plan.widened(), 0);
        let range = plan.schema.column("range").unwrap();
        assert_eq!(range.ty, ColumnType::String);
        assert!(range.blob);
    }

    #[test]
    fn test_plan_new_field_avoids_stored_names() {
        let stored = infer(vec![json!({"level": 1})]);
        let inferred = infer(vec![json!({"Level": 1, "level": 2})]);
        let plan = plan_migration(Some(&stored), &inferred).unwrap();
        assert_eq!(plan.schema.by_source_field("level").unwrap().name, "level");
        assert_eq!(plan.schema.by_source_field("Level").unwrap().name, "level_2");
    }
}
