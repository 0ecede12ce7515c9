//! Document sources
//!
//! The pipeline consumes documents through the [`DocumentSource`] enumeration
//! interface. [`FileSystemSource`] walks a JSON tree on disk and
//! [`MemorySource`] serves documents held in memory.

mod filesystem;
mod memory;

pub use filesystem::{FileSystemSource, unwrap_envelope};
pub use memory::MemorySource;

use serde_json::Value;

use crate::error::PipelineResult;

/// Body of a source document as read
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentBody {
    Parsed(Value),
    /// The document could not be parsed; holds the reason
    Malformed(String),
}

/// One document as found in a source
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub collection: String,
    /// Originating file path (or pseudo-path for non-file sources)
    pub path: String,
    /// Position of the document within its file
    pub index: usize,
    /// SHA-256 of the originating file
    pub file_hash: String,
    pub body: DocumentBody,
}

impl SourceDocument {
    pub fn parsed(collection: &str, path: &str, index: usize, value: Value) -> Self {
        Self {
            collection: collection.to_string(),
            path: path.to_string(),
            index,
            file_hash: String::new(),
            body: DocumentBody::Parsed(value),
        }
    }

    pub fn malformed(collection: &str, path: &str, index: usize, reason: &str) -> Self {
        Self {
            collection: collection.to_string(),
            path: path.to_string(),
            index,
            file_hash: String::new(),
            body: DocumentBody::Malformed(reason.to_string()),
        }
    }

    pub fn with_file_hash(mut self, hash: impl Into<String>) -> Self {
        self.file_hash = hash.into();
        self
    }
}

/// Enumeration interface over raw JSON documents grouped by collection
pub trait DocumentSource: Send + Sync {
    /// Collection names, sorted
    fn list_collections(&self) -> PipelineResult<Vec<String>>;

    /// Documents of one collection, in file then position order
    fn list_documents(&self, collection: &str) -> PipelineResult<Vec<SourceDocument>>;
}
