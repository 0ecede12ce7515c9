//! Bronze row normalization
//!
//! Maps the heterogeneous Bronze columns of every contributing collection onto
//! an entity kind's canonical fields, coerces them to their declared types and
//! decomposes nested values into child rows.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use super::definition::{ChildDefinition, EntityDefinition, KEY_SOURCE, VALUE_SOURCE};
use crate::bronze::{BronzeRow, canonical_json};
use crate::inference::{CollectionSchema, ColumnType};

/// One decomposed child row, values in the child's column order
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRow {
    pub values: Vec<Value>,
}

/// One Bronze row mapped onto an entity kind
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCandidate {
    pub canonical_key: String,
    pub name: String,
    pub source_collection: String,
    /// Position of the collection's pattern in the source list; lower wins
    pub priority: usize,
    pub content_key: String,
    /// Declared fields, coerced; absent values are null
    pub fields: BTreeMap<String, Value>,
    /// Child name to decomposed rows
    pub children: BTreeMap<String, Vec<ChildRow>>,
}

/// Record-level tallies of a normalization pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizeStats {
    pub rows: usize,
    pub skipped: usize,
    pub mapping_gaps: usize,
    pub coercion_warnings: usize,
}

/// Normalize a free-text name into its comparison form
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Coerce a value to a declared type; `None` when it cannot be represented
pub fn coerce(ty: ColumnType, value: &Value) -> Option<Value> {
    if value.is_null() {
        return Some(Value::Null);
    }

    match ty {
        ColumnType::Integer => match value {
            Value::Number(n) if n.is_i64() => Some(value.clone()),
            Value::Number(n) => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
                .map(|f| Value::from(f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok().map(Value::from),
            _ => None,
        },
        ColumnType::Float => match value {
            Value::Number(n) => n.as_f64().map(Value::from),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::from),
            _ => None,
        },
        ColumnType::Boolean => match value {
            Value::Bool(_) => Some(value.clone()),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        },
        ColumnType::String => match value {
            Value::String(_) => Some(value.clone()),
            Value::Number(_) | Value::Bool(_) => Some(Value::String(value.to_string())),
            other => Some(Value::String(canonical_json(other))),
        },
        ColumnType::Json => Some(value.clone()),
    }
}

/// Resolves canonical fields to Bronze columns for one collection
struct ColumnMap {
    /// Canonical field to Bronze column; `None` marks a mapping gap
    columns: BTreeMap<String, Option<String>>,
}

impl ColumnMap {
    fn new(definition: &EntityDefinition, collection: &str, schema: &CollectionSchema) -> Self {
        let explicit = definition.mapping_for(collection);
        let mut columns = BTreeMap::new();

        for canonical in definition.canonical_fields() {
            let mapped_from = explicit
                .iter()
                .find(|(_, target)| target.as_str() == canonical)
                .map(|(source, _)| source.as_str());

            let column = match mapped_from {
                Some(source) => schema.by_source_field(source).map(|c| c.name.clone()),
                None => schema
                    .by_source_field(canonical)
                    .or_else(|| schema.column(canonical))
                    .map(|c| c.name.clone()),
            };
            // An identity fallback that finds nothing is simply absent, not a gap
            if column.is_some() || mapped_from.is_some() {
                columns.insert(canonical.to_string(), column);
            }
        }
        Self { columns }
    }

    fn gaps(&self) -> usize {
        self.columns.values().filter(|c| c.is_none()).count()
    }

    fn value<'r>(&self, row: &'r BronzeRow, canonical: &str) -> &'r Value {
        const NULL: &Value = &Value::Null;
        self.columns
            .get(canonical)
            .and_then(|c| c.as_ref())
            .and_then(|column| row.values.get(column))
            .unwrap_or(NULL)
    }
}

/// Maps Bronze rows of one entity kind to candidates
pub struct Normalizer<'a> {
    definition: &'a EntityDefinition,
}

impl<'a> Normalizer<'a> {
    pub fn new(definition: &'a EntityDefinition) -> Self {
        Self { definition }
    }

    /// Contributing collections with their priority, highest priority first
    pub fn contributing(&self, collections: &[String]) -> Vec<(String, usize)> {
        let mut contributing: Vec<(String, usize)> = collections
            .iter()
            .filter_map(|c| self.definition.priority_of(c).map(|p| (c.clone(), p)))
            .collect();
        contributing.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        contributing
    }

    /// Normalize every row of one collection.
    ///
    /// Rows that cannot be mapped are skipped and counted, never fatal.
    pub fn normalize_collection(
        &self,
        collection: &str,
        priority: usize,
        schema: &CollectionSchema,
        rows: &[BronzeRow],
        stats: &mut NormalizeStats,
    ) -> Vec<EntityCandidate> {
        let columns = ColumnMap::new(self.definition, collection, schema);
        if columns.gaps() > 0 {
            warn!(
                kind = %self.definition.kind,
                collection,
                gaps = columns.gaps(),
                "Mapped source fields missing from Bronze"
            );
        }

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            stats.rows += 1;
            stats.mapping_gaps += columns.gaps();
            match self.normalize_row(collection, priority, row, &columns, stats) {
                Ok(candidate) => candidates.push(candidate),
                Err(reason) => {
                    stats.skipped += 1;
                    warn!(
                        kind = %self.definition.kind,
                        collection,
                        content_key = %row.content_key,
                        "Skipping row: {}",
                        reason
                    );
                }
            }
        }
        candidates
    }

    fn normalize_row(
        &self,
        collection: &str,
        priority: usize,
        row: &BronzeRow,
        columns: &ColumnMap,
        stats: &mut NormalizeStats,
    ) -> Result<EntityCandidate, String> {
        let definition = self.definition;

        let name = match coerce(ColumnType::String, columns.value(row, &definition.name_field)) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            _ => return Err(format!("missing {}", definition.name_field)),
        };

        let mut fields = BTreeMap::new();
        for field in &definition.fields {
            let raw = columns.value(row, &field.name);
            let value = coerce(field.ty, raw)
                .ok_or_else(|| format!("{} cannot be read as {}", field.name, field.ty))?;
            fields.insert(field.name.clone(), value);
        }

        let mut canonical_key = normalize_name(&name);
        if let Some(disambiguator) = &definition.disambiguator
            && let Some(value) = fields.get(disambiguator).filter(|v| !v.is_null())
        {
            let text = match value {
                Value::String(s) => s.clone(),
                other => canonical_json(other),
            };
            canonical_key = format!("{}::{}", canonical_key, normalize_name(&text));
        }

        let mut children = BTreeMap::new();
        for child in &definition.children {
            let rows = decompose(child, columns.value(row, &child.field), &mut stats.coercion_warnings);
            if !rows.is_empty() {
                children.insert(child.name.clone(), rows);
            }
        }

        debug!(collection, key = %canonical_key, "Normalized row");
        Ok(EntityCandidate {
            canonical_key,
            name,
            source_collection: collection.to_string(),
            priority,
            content_key: row.content_key.clone(),
            fields,
            children,
        })
    }
}

/// Decompose a nested value into child rows
pub fn decompose(child: &ChildDefinition, value: &Value, warnings: &mut usize) -> Vec<ChildRow> {
    let value = match child.path.as_deref() {
        Some(path) if !path.is_empty() => value.pointer(path).unwrap_or(&Value::Null),
        _ => value,
    };

    let elements: Vec<(Option<&str>, &Value)> = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().map(|item| (None, item)).collect(),
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().map(|(k, v)| (Some(k.as_str()), v)).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        }
        scalar => vec![(None, scalar)],
    };

    let has_value_column = child.columns.iter().any(|c| c.source_key() == VALUE_SOURCE);
    elements
        .into_iter()
        .map(|(key, element)| {
            let values = child
                .columns
                .iter()
                .enumerate()
                .map(|(i, column)| {
                    let raw = match column.source_key() {
                        KEY_SOURCE => key.map(|k| Value::String(k.to_string())).unwrap_or(Value::Null),
                        VALUE_SOURCE => element.clone(),
                        source => match element {
                            Value::Object(fields) => fields.get(source).cloned().unwrap_or(Value::Null),
                            // A bare scalar fills the first column when there is no $value column
                            scalar if i == 0 && !has_value_column && !scalar.is_array() => scalar.clone(),
                            _ => Value::Null,
                        },
                    };
                    coerce(column.ty, &raw).unwrap_or_else(|| {
                        *warnings += 1;
                        Value::Null
                    })
                })
                .collect();
            ChildRow { values }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::infer_schema;
    use crate::silver::definition::builtin_entities;
    use serde_json::{Map, json};

    fn definition(kind: &str) -> EntityDefinition {
        builtin_entities().into_iter().find(|d| d.kind == kind).unwrap()
    }

    fn bronze(collection: &str, docs: Vec<Value>) -> (CollectionSchema, Vec<BronzeRow>) {
        let objects: Vec<Map<String, Value>> =
            docs.iter().map(|d| d.as_object().cloned().unwrap()).collect();
        let schema = infer_schema(collection, objects.iter());
        let rows = objects
            .iter()
            .enumerate()
            .map(|(i, object)| BronzeRow {
                collection: collection.to_string(),
                content_key: format!("key{}", i),
                source_path: "test.json".into(),
                ingested_at_us: 0,
                values: schema
                    .columns
                    .iter()
                    .map(|c| (c.name.clone(), object.get(&c.source_field).cloned().unwrap_or(Value::Null)))
                    .collect(),
            })
            .collect();
        (schema, rows)
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Melf's   Acid\tArrow "), "melf's acid arrow");
    }

    #[test]
    fn test_coerce() {
        assert_eq!(coerce(ColumnType::Integer, &json!("3")), Some(json!(3)));
        assert_eq!(coerce(ColumnType::Integer, &json!(3.0)), Some(json!(3)));
        assert_eq!(coerce(ColumnType::Integer, &json!("three")), None);
        assert_eq!(coerce(ColumnType::Float, &json!(2)), Some(json!(2.0)));
        assert_eq!(coerce(ColumnType::Boolean, &json!("TRUE")), Some(json!(true)));
        assert_eq!(coerce(ColumnType::Boolean, &json!(1)), None);
        assert_eq!(coerce(ColumnType::String, &json!(true)), Some(json!("true")));
        assert_eq!(coerce(ColumnType::String, &json!({"b": 1, "a": 2})), Some(json!(r#"{"a":2,"b":1}"#)));
        assert_eq!(coerce(ColumnType::Json, &json!([1])), Some(json!([1])));
        assert_eq!(coerce(ColumnType::Integer, &Value::Null), Some(Value::Null));
    }

    #[test]
    fn test_explicit_mapping_and_children() {
        let spell = definition("spell");
        let (schema, rows) = bronze(
            "spells_phb",
            vec![json!({
                "name": "Fireball",
                "source": "PHB",
                "level": 3,
                "school": "V",
                "time": [{"number": 1, "unit": "action"}],
                "entries": ["A bright streak flashes..."],
                "components": {"v": true, "s": true, "m": "a tiny ball of bat guano"},
                "classes": {"fromClassList": [{"name": "Wizard", "source": "PHB"}, {"name": "Sorcerer", "source": "PHB"}]}
            })],
        );

        let mut stats = NormalizeStats::default();
        let candidates = Normalizer::new(&spell).normalize_collection("spells_phb", 0, &schema, &rows, &mut stats);
        assert_eq!(candidates.len(), 1);
        let fireball = &candidates[0];
        assert_eq!(fireball.canonical_key, "fireball");
        assert_eq!(fireball.fields["casting_time"], json!([{"number": 1, "unit": "action"}]));
        assert_eq!(fireball.fields["level"], json!(3));

        let components = &fireball.children["components"];
        assert_eq!(components.len(), 3);
        assert_eq!(components[0].values, vec![json!("m"), json!("a tiny ball of bat guano")]);
        assert_eq!(components[1].values, vec![json!("s"), json!("true")]);

        let classes = &fireball.children["classes"];
        assert_eq!(classes[1].values, vec![json!("Sorcerer"), json!("PHB")]);
        assert_eq!(stats.mapping_gaps, 0);
    }

    #[test]
    fn test_mapping_gaps_counted_per_record() {
        let spell = definition("spell");
        let (schema, rows) = bronze(
            "spells_aag",
            vec![json!({"name": "Fireball", "level": 3}), json!({"name": "Shield", "level": 1})],
        );
        let mut stats = NormalizeStats::default();
        let candidates = Normalizer::new(&spell).normalize_collection("spells_aag", 2, &schema, &rows, &mut stats);
        assert_eq!(candidates.len(), 2);
        // "time" and "entries" are mapped but absent
        assert_eq!(stats.mapping_gaps, 4);
        assert_eq!(candidates[0].fields["casting_time"], Value::Null);
    }

    #[test]
    fn test_uncoercible_field_skips_row() {
        let spell = definition("spell");
        let (schema, rows) = bronze(
            "spells_phb",
            vec![json!({"name": "Fireball", "level": "three"}), json!({"name": "Shield", "level": 1}), json!({"level": 2})],
        );
        let mut stats = NormalizeStats::default();
        let candidates = Normalizer::new(&spell).normalize_collection("spells_phb", 0, &schema, &rows, &mut stats);
        assert_eq!(candidates.len(), 1);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.rows, 3);
    }

    #[test]
    fn test_disambiguator_in_key() {
        let class = definition("class");
        let (schema, rows) = bronze(
            "class_fighter",
            vec![json!({"name": "Fighter", "source": "PHB"}), json!({"name": "Fighter"})],
        );
        let mut stats = NormalizeStats::default();
        let candidates = Normalizer::new(&class).normalize_collection("class_fighter", 0, &schema, &rows, &mut stats);
        assert_eq!(candidates[0].canonical_key, "fighter::phb");
        assert_eq!(candidates[1].canonical_key, "fighter");
    }

    #[test]
    fn test_scalar_elements_fill_first_column() {
        let class = definition("class");
        let child = &class.children[0];
        let mut warnings = 0;
        let rows = decompose(
            child,
            &json!(["Second Wind|Fighter||1", {"classFeature": "Fighting Style|Fighter||1", "gainSubclassFeature": "yes"}]),
            &mut warnings,
        );
        assert_eq!(rows[0].values, vec![json!("Second Wind|Fighter||1"), Value::Null]);
        assert_eq!(rows[1].values[0], json!("Fighting Style|Fighter||1"));
        assert_eq!(rows[1].values[1], Value::Null);
        assert_eq!(warnings, 1);
    }

    #[test]
    fn test_contributing_order() {
        let spell = definition("spell");
        let collections = vec!["spells_aag".to_string(), "items".to_string(), "spells_phb".to_string(), "spells_abc".to_string()];
        assert_eq!(
            Normalizer::new(&spell).contributing(&collections),
            vec![("spells_phb".to_string(), 0), ("spells_aag".to_string(), 2), ("spells_abc".to_string(), 2)]
        );
    }
}
