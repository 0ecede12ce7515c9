//! In-memory document source

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{DocumentBody, DocumentSource, SourceDocument};
use crate::error::PipelineResult;

/// Documents held in memory, keyed by collection
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    collections: BTreeMap<String, Vec<SourceDocument>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add parsed documents to a collection
    pub fn with_collection(mut self, collection: &str, documents: Vec<Value>) -> Self {
        self.collections.entry(collection.to_string()).or_default();
        for document in documents {
            self.push(collection, |path, index| {
                SourceDocument::parsed(collection, path, index, document)
            });
        }
        self
    }

    /// Add a document that failed to parse
    pub fn with_malformed(mut self, collection: &str, reason: &str) -> Self {
        self.push(collection, |path, index| {
            SourceDocument::malformed(collection, path, index, reason)
        });
        self
    }

    /// Replace a collection's documents
    pub fn set_collection(&mut self, collection: &str, documents: Vec<Value>) {
        self.collections.insert(collection.to_string(), Vec::new());
        for document in documents {
            self.push(collection, |path, index| {
                SourceDocument::parsed(collection, path, index, document)
            });
        }
    }

    fn push<F>(&mut self, collection: &str, make: F)
    where
        F: FnOnce(&str, usize) -> SourceDocument,
    {
        let path = format!("memory://{}", collection);
        let docs = self.collections.entry(collection.to_string()).or_default();
        let doc = make(&path, docs.len());
        docs.push(doc);
    }

    fn collection_hash(docs: &[SourceDocument]) -> String {
        let mut hasher = Sha256::new();
        for doc in docs {
            match &doc.body {
                DocumentBody::Parsed(value) => hasher.update(value.to_string().as_bytes()),
                DocumentBody::Malformed(reason) => hasher.update(reason.as_bytes()),
            }
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}

impl DocumentSource for MemorySource {
    fn list_collections(&self) -> PipelineResult<Vec<String>> {
        Ok(self.collections.keys().cloned().collect())
    }

    fn list_documents(&self, collection: &str) -> PipelineResult<Vec<SourceDocument>> {
        let docs = self.collections.get(collection).cloned().unwrap_or_default();
        let hash = Self::collection_hash(&docs);
        Ok(docs
            .into_iter()
            .map(|doc| doc.with_file_hash(hash.clone()))
            .collect())
    }
}
