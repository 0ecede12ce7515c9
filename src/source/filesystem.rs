//! Filesystem document source

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{DocumentSource, SourceDocument};
use crate::config::{CollectionLayout, SourceSection};
use crate::error::{PipelineError, PipelineResult};
use crate::naming::sanitize_identifier;

/// Collection name for files directly under the root in per-directory layout
pub const ROOT_COLLECTION: &str = "main";

/// Reads JSON and JSONL documents from a directory tree
#[derive(Debug, Clone)]
pub struct FileSystemSource {
    root: PathBuf,
    pattern: String,
    layout: CollectionLayout,
}

impl FileSystemSource {
    pub fn new(root: impl Into<PathBuf>, pattern: &str, layout: CollectionLayout) -> Self {
        Self {
            root: root.into(),
            pattern: pattern.to_string(),
            layout,
        }
    }

    /// Source described by a `[source]` config section, relative roots resolved against `base`
    pub fn from_config(section: &SourceSection, base: &Path) -> Self {
        let root = Path::new(&section.root);
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            base.join(root)
        };
        Self::new(root, &section.pattern, section.layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files matching the pattern, sorted by path
    fn discover(&self) -> PipelineResult<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Err(PipelineError::Source(format!(
                "Source root {} is not a directory",
                self.root.display()
            )));
        }

        let full_pattern = format!("{}/{}", self.root.display(), self.pattern);
        let entries = glob::glob(&full_pattern)
            .map_err(|e| PipelineError::Source(format!("{}: {}", self.pattern, e)))?;

        let mut files = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(_) => {}
                Err(e) => warn!("Error accessing path: {}", e),
            }
        }
        files.sort();
        Ok(files)
    }

    fn collection_of(&self, path: &Path) -> String {
        match self.layout {
            CollectionLayout::PerFile => {
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
                sanitize_identifier(stem)
            }
            CollectionLayout::PerDirectory => {
                let relative = path
                    .parent()
                    .and_then(|p| p.strip_prefix(&self.root).ok())
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_default();
                if relative.is_empty() {
                    ROOT_COLLECTION.to_string()
                } else {
                    sanitize_identifier(&relative)
                }
            }
        }
    }

    fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    fn read_file(&self, collection: &str, path: &Path) -> Vec<SourceDocument> {
        let shown = self.display_path(path);
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %shown, "Unreadable source file: {}", e);
                return vec![SourceDocument::malformed(
                    collection,
                    &shown,
                    0,
                    &format!("unreadable file: {}", e),
                )];
            }
        };
        let hash = format!("{:x}", Sha256::digest(&bytes));
        let content = String::from_utf8_lossy(&bytes);

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        let docs = if extension == "jsonl" || extension == "ndjson" {
            parse_lines(collection, &shown, &content)
        } else {
            parse_document(collection, &shown, &content)
        };

        debug!(path = %shown, documents = docs.len(), "Read source file");
        docs.into_iter()
            .map(|doc| doc.with_file_hash(hash.clone()))
            .collect()
    }
}

impl DocumentSource for FileSystemSource {
    fn list_collections(&self) -> PipelineResult<Vec<String>> {
        let names: BTreeSet<String> = self
            .discover()?
            .iter()
            .map(|path| self.collection_of(path))
            .collect();
        Ok(names.into_iter().collect())
    }

    fn list_documents(&self, collection: &str) -> PipelineResult<Vec<SourceDocument>> {
        let mut docs = Vec::new();
        for path in self.discover()? {
            if self.collection_of(&path) == collection {
                docs.extend(self.read_file(collection, &path));
            }
        }
        Ok(docs)
    }
}

/// Split a parsed file into its documents.
///
/// Arrays yield their elements. An object whose non-metadata keys all hold
/// arrays is an envelope and yields the elements of its first array. Anything
/// else is a single document.
pub fn unwrap_envelope(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => {
            let first = map.keys().find(|k| !k.starts_with('_')).cloned();
            let is_envelope = first.is_some()
                && map
                    .iter()
                    .filter(|(k, _)| !k.starts_with('_'))
                    .all(|(_, v)| v.is_array());
            match first {
                Some(key) if is_envelope => match map.remove(&key) {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                },
                _ => vec![Value::Object(map)],
            }
        }
        other => vec![other],
    }
}

fn parse_document(collection: &str, path: &str, content: &str) -> Vec<SourceDocument> {
    match serde_json::from_str::<Value>(content) {
        Ok(value) => unwrap_envelope(value)
            .into_iter()
            .enumerate()
            .map(|(index, doc)| SourceDocument::parsed(collection, path, index, doc))
            .collect(),
        Err(e) => {
            warn!(path, "Unparsable JSON file: {}", e);
            vec![SourceDocument::malformed(collection, path, 0, &e.to_string())]
        }
    }
}

fn parse_lines(collection: &str, path: &str, content: &str) -> Vec<SourceDocument> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| match serde_json::from_str::<Value>(line.trim()) {
            Ok(value) => SourceDocument::parsed(collection, path, index, value),
            Err(e) => SourceDocument::malformed(
                collection,
                path,
                index,
                &format!("line {}: {}", index + 1, e),
            ),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::DocumentBody;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(dir: &Path, relative: &str, content: &str) {
        let path = dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_unwrap_envelope() {
        assert_eq!(unwrap_envelope(json!([{"a": 1}, {"a": 2}])).len(), 2);
        assert_eq!(
            unwrap_envelope(json!({"_meta": {"v": 1}, "spell": [{"a": 1}, {"a": 2}, {"a": 3}]}))
                .len(),
            3
        );
        let single = unwrap_envelope(json!({"name": "Fireball", "classes": ["wizard"]}));
        assert_eq!(single, vec![json!({"name": "Fireball", "classes": ["wizard"]})]);
        assert_eq!(unwrap_envelope(json!({})), vec![json!({})]);
    }

    #[test]
    fn test_per_file_collections() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "spells/spells-phb.json", r#"[{"name": "Fireball"}]"#);
        write(dir.path(), "spells/spells-aag.json", r#"[{"name": "Fireball"}]"#);
        write(dir.path(), "items.json", r#"{"item": [{"name": "Rope"}]}"#);

        let source = FileSystemSource::new(dir.path(), "**/*.json", CollectionLayout::PerFile);
        assert_eq!(
            source.list_collections().unwrap(),
            vec!["items", "spells_aag", "spells_phb"]
        );

        let docs = source.list_documents("spells_phb").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "spells/spells-phb.json");
        assert_eq!(docs[0].file_hash.len(), 64);
    }

    #[test]
    fn test_per_directory_collections() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "bestiary/mm.json", r#"[{"name": "Goblin"}]"#);
        write(dir.path(), "bestiary/vgm.json", r#"[{"name": "Kenku"}]"#);
        write(dir.path(), "loose.json", r#"{"name": "Orphan"}"#);

        let source =
            FileSystemSource::new(dir.path(), "**/*.json", CollectionLayout::PerDirectory);
        assert_eq!(source.list_collections().unwrap(), vec!["bestiary", "main"]);
        assert_eq!(source.list_documents("bestiary").unwrap().len(), 2);
    }

    #[test]
    fn test_unparsable_file_is_one_malformed_document() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "spells_phb.json", r#"{"name": "Fireball", "#);

        let source = FileSystemSource::new(dir.path(), "*.json", CollectionLayout::PerFile);
        let docs = source.list_documents("spells_phb").unwrap();
        assert_eq!(docs.len(), 1);
        assert!(matches!(docs[0].body, DocumentBody::Malformed(_)));
    }

    #[test]
    fn test_jsonl_lines() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "feats.jsonl",
            "{\"name\": \"Alert\"}\n\nnot json\n{\"name\": \"Lucky\"}\n",
        );

        let source = FileSystemSource::new(dir.path(), "*.jsonl", CollectionLayout::PerFile);
        let docs = source.list_documents("feats").unwrap();
        assert_eq!(docs.len(), 3);
        assert!(matches!(docs[1].body, DocumentBody::Malformed(_)));
        assert_eq!(docs[2].index, 3);
    }

    #[test]
    fn test_missing_root_is_source_error() {
        let source = FileSystemSource::new("/nonexistent/compendium", "*.json", CollectionLayout::PerFile);
        assert!(matches!(source.list_collections(), Err(PipelineError::Source(_))));
    }
}
