//! Entity kind definitions
//!
//! An [`EntityDefinition`] describes one hand-designed Silver table set: the
//! entity table, its child tables, which Bronze collections contribute (in
//! priority order) and how their columns map onto canonical fields.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::inference::ColumnType;
use crate::naming::{SourcePattern, is_valid_identifier};

/// Child column source that takes the object key of the element
pub const KEY_SOURCE: &str = "$key";

/// Child column source that takes the element itself
pub const VALUE_SOURCE: &str = "$value";

/// Column names every entity table reserves
pub const ENTITY_SYSTEM_COLUMNS: [&str; 3] = ["canonical_key", "name", "provenance"];

/// Column names every child table reserves
pub const CHILD_SYSTEM_COLUMNS: [&str; 2] = ["parent_key", "ordinal"];

/// A typed canonical field of an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type", default = "default_field_type")]
    pub ty: ColumnType,
}

fn default_field_type() -> ColumnType {
    ColumnType::String
}

/// One column of a child table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildColumn {
    pub name: String,
    /// Key inside each element, or `$key` / `$value`; defaults to the column name
    #[serde(default)]
    pub source: Option<String>,
    #[serde(rename = "type", default = "default_field_type")]
    pub ty: ColumnType,
}

impl ChildColumn {
    pub fn source_key(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

/// A repeating sub-structure decomposed into its own table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildDefinition {
    /// Logical name, used in reports
    pub name: String,
    pub table: String,
    /// Canonical field holding the nested value
    pub field: String,
    /// JSON pointer into the field's value
    #[serde(default)]
    pub path: Option<String>,
    pub columns: Vec<ChildColumn>,
}

/// One entity kind and its Silver table set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub kind: String,
    pub table: String,
    /// Contributing collection patterns, highest priority first
    pub sources: Vec<String>,
    /// Canonical field holding the entity's name
    #[serde(default = "default_name_field")]
    pub name_field: String,
    /// Field that tells apart distinct entities sharing a name
    #[serde(default)]
    pub disambiguator: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub children: Vec<ChildDefinition>,
    /// Collection pattern to (source field to canonical field)
    #[serde(default)]
    pub mappings: BTreeMap<String, BTreeMap<String, String>>,
    /// Fields that get a lookup index
    #[serde(default)]
    pub filterable: Vec<String>,
}

fn default_name_field() -> String {
    "name".to_string()
}

impl EntityDefinition {
    pub fn provenance_table(&self) -> String {
        format!("{}_provenance", self.table)
    }

    /// Every table of this kind's table set
    pub fn table_names(&self) -> Vec<String> {
        let mut tables = vec![self.table.clone(), self.provenance_table()];
        tables.extend(self.children.iter().map(|c| c.table.clone()));
        tables
    }

    /// Priority of a collection, `None` if it does not contribute
    pub fn priority_of(&self, collection: &str) -> Option<usize> {
        crate::naming::priority_rank(&self.sources, collection)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Canonical fields read from Bronze: name, declared fields, child fields
    pub fn canonical_fields(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        std::iter::once(self.name_field.as_str())
            .chain(self.fields.iter().map(|f| f.name.as_str()))
            .chain(self.children.iter().map(|c| c.field.as_str()))
            .filter(|f| seen.insert(*f))
            .collect()
    }

    /// Effective source-field mapping for a collection.
    ///
    /// Wildcard patterns apply first so an exact collection name overrides them.
    pub fn mapping_for(&self, collection: &str) -> BTreeMap<String, String> {
        let mut matching: Vec<(&String, &BTreeMap<String, String>)> = self
            .mappings
            .iter()
            .filter(|(pattern, _)| SourcePattern::new(pattern).matches(collection))
            .collect();
        matching.sort_by_key(|(pattern, _)| *pattern == collection);

        let mut mapping = BTreeMap::new();
        for (_, fields) in matching {
            for (source, canonical) in fields {
                mapping.insert(source.clone(), canonical.clone());
            }
        }
        mapping
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let invalid = |what: &str, name: &str| {
            PipelineError::Config(format!("Entity kind {}: invalid {} '{}'", self.kind, what, name))
        };

        if !is_valid_identifier(&self.kind) {
            return Err(invalid("kind", &self.kind));
        }
        if !is_valid_identifier(&self.table) {
            return Err(invalid("table", &self.table));
        }
        if self.sources.is_empty() {
            return Err(invalid("source list", ""));
        }
        if self.name_field.is_empty() {
            return Err(invalid("name field", ""));
        }

        let mut fields = HashSet::new();
        for field in &self.fields {
            if !is_valid_identifier(&field.name) || ENTITY_SYSTEM_COLUMNS.contains(&field.name.as_str())
            {
                return Err(invalid("field", &field.name));
            }
            if !fields.insert(field.name.as_str()) {
                return Err(invalid("duplicate field", &field.name));
            }
        }

        if let Some(disambiguator) = &self.disambiguator
            && !fields.contains(disambiguator.as_str())
        {
            return Err(invalid("disambiguator", disambiguator));
        }
        for attribute in &self.filterable {
            if !fields.contains(attribute.as_str()) {
                return Err(invalid("filterable attribute", attribute));
            }
        }

        let mut children = HashSet::new();
        for child in &self.children {
            if !children.insert(child.name.as_str()) {
                return Err(invalid("duplicate child", &child.name));
            }
            if !is_valid_identifier(&child.table) {
                return Err(invalid("child table", &child.table));
            }
            if child.field.is_empty() {
                return Err(invalid("child field", &child.name));
            }
            if let Some(path) = &child.path
                && !path.is_empty()
                && !path.starts_with('/')
            {
                return Err(invalid("child path", path));
            }
            if child.columns.is_empty() {
                return Err(invalid("child column list", &child.name));
            }
            let mut columns = HashSet::new();
            for column in &child.columns {
                if !is_valid_identifier(&column.name)
                    || CHILD_SYSTEM_COLUMNS.contains(&column.name.as_str())
                    || !columns.insert(column.name.as_str())
                {
                    return Err(invalid("child column", &column.name));
                }
            }
        }

        Ok(())
    }
}

fn field(name: &str, ty: ColumnType) -> FieldDefinition {
    FieldDefinition {
        name: name.to_string(),
        ty,
    }
}

fn column(name: &str, source: Option<&str>, ty: ColumnType) -> ChildColumn {
    ChildColumn {
        name: name.to_string(),
        source: source.map(String::from),
        ty,
    }
}

fn mapping(pattern: &str, pairs: &[(&str, &str)]) -> BTreeMap<String, BTreeMap<String, String>> {
    let fields = pairs
        .iter()
        .map(|(source, canonical)| (source.to_string(), canonical.to_string()))
        .collect();
    BTreeMap::from([(pattern.to_string(), fields)])
}

/// Built-in entity kinds for 5etools-style reference data
pub fn builtin_entities() -> Vec<EntityDefinition> {
    use ColumnType::*;

    vec![
        EntityDefinition {
            kind: "spell".into(),
            table: "spells".into(),
            sources: vec!["spells_phb".into(), "spells_xphb".into(), "spells_*".into()],
            name_field: default_name_field(),
            disambiguator: None,
            fields: vec![
                field("source", String),
                field("level", Integer),
                field("school", String),
                field("casting_time", Json),
                field("range", Json),
                field("duration", Json),
                field("description", Json),
            ],
            children: vec![
                ChildDefinition {
                    name: "components".into(),
                    table: "spell_components".into(),
                    field: "components".into(),
                    path: None,
                    columns: vec![
                        column("component", Some(KEY_SOURCE), String),
                        column("detail", Some(VALUE_SOURCE), String),
                    ],
                },
                ChildDefinition {
                    name: "classes".into(),
                    table: "spell_classes".into(),
                    field: "classes".into(),
                    path: Some("/fromClassList".into()),
                    columns: vec![
                        column("class_name", Some("name"), String),
                        column("class_source", Some("source"), String),
                    ],
                },
            ],
            mappings: mapping("spells_*", &[("time", "casting_time"), ("entries", "description")]),
            filterable: vec!["level".into(), "school".into(), "source".into()],
        },
        EntityDefinition {
            kind: "creature".into(),
            table: "creatures".into(),
            sources: vec!["bestiary_mm".into(), "bestiary_mpmm".into(), "bestiary_*".into()],
            name_field: default_name_field(),
            disambiguator: None,
            fields: vec![
                field("source", String),
                field("size", Json),
                field("creature_type", Json),
                field("alignment", Json),
                field("armor_class", Json),
                field("hit_points", Json),
                field("challenge_rating", String),
            ],
            children: vec![
                ChildDefinition {
                    name: "traits".into(),
                    table: "creature_traits".into(),
                    field: "trait".into(),
                    path: None,
                    columns: vec![
                        column("trait_name", Some("name"), String),
                        column("description", Some("entries"), Json),
                    ],
                },
                ChildDefinition {
                    name: "actions".into(),
                    table: "creature_actions".into(),
                    field: "action".into(),
                    path: None,
                    columns: vec![
                        column("action_name", Some("name"), String),
                        column("description", Some("entries"), Json),
                    ],
                },
            ],
            mappings: mapping(
                "bestiary_*",
                &[
                    ("type", "creature_type"),
                    ("ac", "armor_class"),
                    ("hp", "hit_points"),
                    ("cr", "challenge_rating"),
                ],
            ),
            filterable: vec!["challenge_rating".into(), "source".into()],
        },
        EntityDefinition {
            kind: "class".into(),
            table: "classes".into(),
            sources: vec!["class_*".into()],
            name_field: default_name_field(),
            disambiguator: Some("source".into()),
            fields: vec![
                field("source", String),
                field("hit_die", Json),
                field("proficiency", Json),
                field("spellcasting_ability", String),
            ],
            children: vec![ChildDefinition {
                name: "features".into(),
                table: "class_features".into(),
                field: "classFeatures".into(),
                path: None,
                columns: vec![
                    column("feature", Some("classFeature"), String),
                    column("grants_subclass_feature", Some("gainSubclassFeature"), Boolean),
                ],
            }],
            mappings: mapping(
                "class_*",
                &[("hd", "hit_die"), ("spellcastingAbility", "spellcasting_ability")],
            ),
            filterable: vec!["source".into()],
        },
        EntityDefinition {
            kind: "item".into(),
            table: "items".into(),
            sources: vec!["items_base".into(), "items*".into()],
            name_field: default_name_field(),
            disambiguator: None,
            fields: vec![
                field("source", String),
                field("item_type", String),
                field("rarity", String),
                field("weight", Float),
                field("value", Float),
            ],
            children: vec![ChildDefinition {
                name: "properties".into(),
                table: "item_properties".into(),
                field: "property".into(),
                path: None,
                columns: vec![column("property", Some(VALUE_SOURCE), String)],
            }],
            mappings: mapping("items*", &[("type", "item_type")]),
            filterable: vec!["rarity".into(), "item_type".into(), "source".into()],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spell() -> EntityDefinition {
        builtin_entities().into_iter().find(|d| d.kind == "spell").unwrap()
    }

    #[test]
    fn test_builtins_validate() {
        for definition in builtin_entities() {
            definition.validate().unwrap();
        }
    }

    #[test]
    fn test_priority_order() {
        let spell = spell();
        assert_eq!(spell.priority_of("spells_phb"), Some(0));
        assert_eq!(spell.priority_of("spells_xphb"), Some(1));
        assert_eq!(spell.priority_of("spells_aag"), Some(2));
        assert_eq!(spell.priority_of("bestiary_mm"), None);
    }

    #[test]
    fn test_table_names() {
        assert_eq!(
            spell().table_names(),
            vec!["spells", "spells_provenance", "spell_components", "spell_classes"]
        );
    }

    #[test]
    fn test_mapping_exact_overrides_wildcard() {
        let mut spell = spell();
        spell.mappings.insert(
            "spells_aag".into(),
            BTreeMap::from([("time".to_string(), "duration".to_string())]),
        );
        assert_eq!(spell.mapping_for("spells_aag")["time"], "duration");
        assert_eq!(spell.mapping_for("spells_phb")["time"], "casting_time");
        assert!(spell.mapping_for("items").is_empty());
    }

    #[test]
    fn test_validate_rejects_unknown_filterable() {
        let mut spell = spell();
        spell.filterable.push("components".into());
        assert!(matches!(spell.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_reserved_field() {
        let mut spell = spell();
        spell.fields.push(field("provenance", ColumnType::String));
        assert!(spell.validate().is_err());
    }

    #[test]
    fn test_definition_from_toml() {
        let definition: EntityDefinition = toml::from_str(
            r#"
kind = "feat"
table = "feats"
sources = ["feats_*"]
fields = [{ name = "source" }, { name = "prerequisite", type = "json" }]
filterable = ["source"]

[[children]]
name = "abilities"
table = "feat_abilities"
field = "ability"
columns = [{ name = "ability", source = "$key" }, { name = "bonus", source = "$value", type = "integer" }]

[mappings."feats_*"]
prereq = "prerequisite"
"#,
        )
        .unwrap();
        definition.validate().unwrap();
        assert_eq!(definition.name_field, "name");
        assert_eq!(definition.fields[0].ty, ColumnType::String);
        assert_eq!(definition.children[0].columns[1].ty, ColumnType::Integer);
        assert_eq!(definition.mapping_for("feats_phb")["prereq"], "prerequisite");
    }
}
