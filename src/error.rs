//! Error taxonomy for the ingestion pipeline.
//!
//! Per-file problems are [`ParseError`]s and never abort a run; the
//! orchestrator records them as [`IngestionError`](crate::models::IngestionError)s.
//! [`ConfigError`] and [`IngestError`] are fatal.

use std::path::PathBuf;

use thiserror::Error;

/// Invalid configuration. Detected before any parallel work starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("chunk size must be > 0")]
    ZeroChunkSize,

    #[error("chunk overlap ({overlap}) must be smaller than chunk size ({size})")]
    OverlapTooLarge { overlap: usize, size: usize },

    #[error("unknown embedding provider '{0}'. Must be local, openai, or ollama")]
    UnknownProvider(String),

    #[error("unknown device '{0}'. Must be cpu or cuda")]
    UnknownDevice(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("source directory does not exist: {0}")]
    MissingSourceDirectory(PathBuf),
}

/// Failure to turn one file into documents.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("file is not valid UTF-8 text: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),

    #[error("CSV parsing failed: {0}")]
    Csv(#[from] csv::Error),

    #[error("HTML conversion failed: {0}")]
    Html(String),

    #[error("no parser registered for extension '{0}'")]
    NotSupported(String),
}

/// Fatal failure of an ingestion run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("discovery failed under {root}: {source}")]
    Discovery {
        root: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("vector store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),

    /// Nothing from this run reached the collection.
    #[error("failed to persist {chunks} chunks from {} sources: {source:#}", .unpersisted.len())]
    Persist {
        chunks: usize,
        /// Sources whose chunks were computed but not written.
        unpersisted: Vec<String>,
        #[source]
        source: anyhow::Error,
    },

    /// The chunks were written but the index snapshot was not refreshed.
    #[error("wrote {chunks} chunks from {} sources but failed to refresh the index snapshot: {source:#}", .sources.len())]
    Snapshot {
        chunks: usize,
        /// Sources now in the collection but missing from the snapshot.
        sources: Vec<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("worker pool failed: {0}")]
    WorkerPool(String),

    #[error("invalid ingestion state transition {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_error_names_both_values() {
        let err = ConfigError::OverlapTooLarge {
            overlap: 100,
            size: 50,
        };
        assert_eq!(
            err.to_string(),
            "chunk overlap (100) must be smaller than chunk size (50)"
        );
    }

    #[test]
    fn persist_error_counts_sources() {
        let err = IngestError::Persist {
            chunks: 4,
            unpersisted: vec!["/a.txt".into(), "/b.txt".into()],
            source: anyhow::anyhow!("disk full"),
        };
        assert_eq!(
            err.to_string(),
            "failed to persist 4 chunks from 2 sources: disk full"
        );
    }

    #[test]
    fn snapshot_error_says_chunks_were_written() {
        let err = IngestError::Snapshot {
            chunks: 3,
            sources: vec!["/a.txt".into()],
            source: anyhow::anyhow!("read-only index"),
        };
        assert_eq!(
            err.to_string(),
            "wrote 3 chunks from 1 sources but failed to refresh the index snapshot: read-only index"
        );
    }
}
