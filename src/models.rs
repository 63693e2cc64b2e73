//! Core data models that flow through the ingestion pipeline.
//!
//! A run turns [`SourceFile`]s into [`RawDocument`]s (one or more per file),
//! splits those into [`Chunk`]s and hands the chunks to a collection store.
//! Per-file failures travel alongside as [`IngestionError`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// String metadata attached to documents and chunks.
///
/// A `BTreeMap` keeps serialized metadata stable across runs.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key holding the absolute source path of a document or chunk.
pub const SOURCE_KEY: &str = "source";

/// A candidate file found under the source root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceFile {
    /// Absolute path; the identity of the file.
    pub path: PathBuf,
    /// Extension including the leading dot (e.g. `".pdf"`).
    pub extension: String,
}

impl SourceFile {
    pub fn new(path: PathBuf, extension: impl Into<String>) -> Self {
        Self {
            path,
            extension: extension.into(),
        }
    }

    /// The path as stored in chunk metadata.
    pub fn source_key(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

/// Text extracted from one source file. A file may yield several of these
/// (one per PDF page, one per CSV record).
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub source_path: String,
    pub text: String,
    pub metadata: Metadata,
}

impl RawDocument {
    /// Build a document for `path`, seeding metadata with the source key.
    pub fn new(path: &Path, text: impl Into<String>) -> Self {
        let source_path = path.to_string_lossy().into_owned();
        let mut metadata = Metadata::new();
        metadata.insert(SOURCE_KEY.to_string(), source_path.clone());
        Self {
            source_path,
            text: text.into(),
            metadata,
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A bounded slice of a document's text: the unit that gets embedded.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub source_path: String,
    pub metadata: Metadata,
    /// Position of this chunk within its source, contiguous from 0.
    pub sequence_index: usize,
    /// SHA-256 of `text`, hex encoded.
    pub hash: String,
}

/// A named, persisted set of chunk + embedding records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collection {
    pub name: String,
    pub database_name: String,
    /// Derived from persisted chunk metadata at reconciliation time.
    pub known_source_paths: BTreeSet<String>,
}

/// A per-file failure. Reported in the run summary, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionError {
    pub source_path: String,
    pub cause: String,
}

impl IngestionError {
    pub fn new(path: &Path, cause: impl Into<String>) -> Self {
        Self {
            source_path: path.to_string_lossy().into_owned(),
            cause: cause.into(),
        }
    }
}

impl fmt::Display for IngestionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: error: {}", self.source_path, self.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_document_carries_source_metadata() {
        let doc = RawDocument::new(Path::new("/data/a.txt"), "hello").with_metadata("page", "1");
        assert_eq!(doc.source_path, "/data/a.txt");
        assert_eq!(doc.metadata.get(SOURCE_KEY).map(String::as_str), Some("/data/a.txt"));
        assert_eq!(doc.metadata.get("page").map(String::as_str), Some("1"));
    }

    #[test]
    fn ingestion_error_display_matches_summary_format() {
        let err = IngestionError::new(Path::new("/data/b.txt"), "invalid UTF-8");
        assert_eq!(err.to_string(), "/data/b.txt: error: invalid UTF-8");
    }
}
