//! Run configuration.
//!
//! [`Config`] is built once at startup from three layers and then passed by
//! reference. Precedence: CLI flag > environment variable > config file >
//! built-in default. The CLI and env layers arrive together as
//! [`ConfigOverrides`] (clap resolves flag-over-env); the file layer is an
//! optional TOML document parsed into [`FileConfig`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::layout;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;
pub const DEFAULT_EMBEDDINGS_MODEL: &str = "all-minilm-l6-v2";
/// Upper bound on parse workers regardless of host parallelism.
pub const MAX_WORKERS: usize = 8;

#[derive(Debug, Clone)]
pub struct Config {
    /// Workspace root holding `source_documents/` and `db/`.
    pub root: PathBuf,
    pub database_name: String,
    pub collection_name: String,
    pub source_directory: PathBuf,
    pub persist_directory: PathBuf,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub loader: LoaderConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda,
}

impl std::str::FromStr for Device {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda),
            other => Err(ConfigError::UnknownDevice(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// `local`, `openai` or `ollama`.
    pub provider: String,
    pub model: String,
    pub dims: Option<usize>,
    pub batch_size: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
    /// Base URL for the ollama provider.
    pub url: Option<String>,
    pub device: Device,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            model: DEFAULT_EMBEDDINGS_MODEL.to_string(),
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
            device: Device::Cpu,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub max_workers: usize,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_workers: default_workers(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

/// `min(8, available parallelism)`, never below one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_WORKERS)
}

// ============ File layer ============

/// Optional TOML configuration file. Every key is optional.
///
/// ```toml
/// [chunking]
/// chunk_size = 1000
/// chunk_overlap = 100
///
/// [embedding]
/// provider = "local"
/// model = "all-minilm-l6-v2"
///
/// [loader]
/// max_workers = 4
/// exclude_globs = ["**/drafts/**"]
/// ```
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub root: Option<PathBuf>,
    pub collection: Option<String>,
    pub source_directory: Option<PathBuf>,
    pub persist_directory: Option<PathBuf>,
    #[serde(default)]
    pub chunking: FileChunking,
    #[serde(default)]
    pub embedding: FileEmbedding,
    #[serde(default)]
    pub loader: FileLoader,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FileChunking {
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FileEmbedding {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub dims: Option<usize>,
    pub batch_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub url: Option<String>,
    pub device: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FileLoader {
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: Option<bool>,
}

pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

// ============ CLI/env layer ============

/// Values given on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub root: Option<PathBuf>,
    pub database_name: Option<String>,
    pub collection: Option<String>,
    pub source_directory: Option<PathBuf>,
    pub persist_directory: Option<PathBuf>,
    pub embeddings_provider: Option<String>,
    pub embeddings_model: Option<String>,
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    pub max_workers: Option<usize>,
    pub gpu: Option<bool>,
}

impl Config {
    /// Resolve all layers into a validated configuration.
    ///
    /// When `overrides.database_name` is set the source and persist
    /// directories default to the standard layout under `root`; otherwise
    /// they come from the overrides/file (the interactive path). Either way
    /// the database name is the persist directory's last component.
    pub fn resolve(overrides: ConfigOverrides, file: FileConfig) -> Result<Self, ConfigError> {
        let root = overrides
            .root
            .or(file.root.clone())
            .unwrap_or_else(|| PathBuf::from("."));

        let (source_directory, persist_directory) = match &overrides.database_name {
            Some(db) => (
                overrides
                    .source_directory
                    .unwrap_or_else(|| layout::source_dir(&root, db)),
                overrides
                    .persist_directory
                    .unwrap_or_else(|| layout::persist_dir(&root, db)),
            ),
            None => (
                overrides
                    .source_directory
                    .or(file.source_directory.clone())
                    .unwrap_or_else(|| root.join(layout::SOURCE_DOCUMENTS)),
                overrides
                    .persist_directory
                    .or(file.persist_directory.clone())
                    .unwrap_or_else(|| root.join(layout::DB)),
            ),
        };

        // The store addresses a database by its persist directory name.
        let database_name = database_name_for(&persist_directory)?;
        let collection_name = overrides
            .collection
            .or(file.collection)
            .or(overrides.database_name)
            .unwrap_or_else(|| database_name.clone());

        let chunking = ChunkingConfig {
            chunk_size: overrides
                .chunk_size
                .or(file.chunking.chunk_size)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            chunk_overlap: overrides
                .chunk_overlap
                .or(file.chunking.chunk_overlap)
                .unwrap_or(DEFAULT_CHUNK_OVERLAP),
        };

        let defaults = EmbeddingConfig::default();
        let device = match overrides.gpu {
            Some(true) => Device::Cuda,
            Some(false) => Device::Cpu,
            None => match file.embedding.device.as_deref() {
                Some(d) => d.parse()?,
                None => defaults.device,
            },
        };
        let embedding = EmbeddingConfig {
            provider: overrides
                .embeddings_provider
                .or(file.embedding.provider)
                .unwrap_or(defaults.provider),
            model: overrides
                .embeddings_model
                .or(file.embedding.model)
                .unwrap_or(defaults.model),
            dims: file.embedding.dims,
            batch_size: file.embedding.batch_size.unwrap_or(defaults.batch_size),
            max_retries: file.embedding.max_retries.unwrap_or(defaults.max_retries),
            timeout_secs: file.embedding.timeout_secs.unwrap_or(defaults.timeout_secs),
            url: file.embedding.url,
            device,
        };

        let loader = LoaderConfig {
            max_workers: overrides
                .max_workers
                .or(file.loader.max_workers)
                .map(|n| n.clamp(1, default_workers()))
                .unwrap_or_else(default_workers),
            exclude_globs: file.loader.exclude_globs,
            follow_symlinks: file.loader.follow_symlinks.unwrap_or(false),
        };

        let config = Config {
            root,
            database_name,
            collection_name,
            source_directory,
            persist_directory,
            chunking,
            embedding,
            loader,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that must hold before any work starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_chunking(&self.chunking)?;

        match self.embedding.provider.as_str() {
            "local" | "openai" | "ollama" => {}
            other => return Err(ConfigError::UnknownProvider(other.to_string())),
        }
        if self.embedding.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "embedding.batch_size",
                reason: "must be > 0".to_string(),
            });
        }
        if self.embedding.dims == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "embedding.dims",
                reason: "must be > 0".to_string(),
            });
        }
        if self.collection_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "collection",
                reason: "must not be empty".to_string(),
            });
        }
        for pattern in &self.loader.exclude_globs {
            if let Err(e) = globset::Glob::new(pattern) {
                return Err(ConfigError::InvalidValue {
                    key: "loader.exclude_globs",
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Directory that holds every database directory (parent of `persist_directory`).
    pub fn persist_root(&self) -> PathBuf {
        self.persist_directory
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

pub fn validate_chunking(chunking: &ChunkingConfig) -> Result<(), ConfigError> {
    if chunking.chunk_size == 0 {
        return Err(ConfigError::ZeroChunkSize);
    }
    if chunking.chunk_overlap >= chunking.chunk_size {
        return Err(ConfigError::OverlapTooLarge {
            overlap: chunking.chunk_overlap,
            size: chunking.chunk_size,
        });
    }
    Ok(())
}

fn database_name_for(persist_directory: &Path) -> Result<String, ConfigError> {
    persist_directory
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "persist_directory",
            reason: format!("cannot derive a database name from {}", persist_directory.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_db(db: &str) -> ConfigOverrides {
        ConfigOverrides {
            root: Some(PathBuf::from("/work")),
            database_name: Some(db.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_follow_layout() {
        let cfg = Config::resolve(with_db("papers"), FileConfig::default()).unwrap();
        assert_eq!(cfg.source_directory, PathBuf::from("/work/source_documents/papers"));
        assert_eq!(cfg.persist_directory, PathBuf::from("/work/db/papers"));
        assert_eq!(cfg.collection_name, "papers");
        assert_eq!(cfg.chunking, ChunkingConfig::default());
        assert_eq!(cfg.embedding.provider, "local");
        assert_eq!(cfg.persist_root(), PathBuf::from("/work/db"));
        assert!(cfg.loader.max_workers >= 1 && cfg.loader.max_workers <= MAX_WORKERS);
    }

    #[test]
    fn cli_beats_file_beats_default() {
        let file: FileConfig = toml::from_str(
            r#"
            collection = "from-file"
            [chunking]
            chunk_size = 500
            chunk_overlap = 50
            "#,
        )
        .unwrap();
        let mut overrides = with_db("papers");
        overrides.chunk_overlap = Some(20);
        let cfg = Config::resolve(overrides, file).unwrap();
        assert_eq!(cfg.chunking.chunk_size, 500);
        assert_eq!(cfg.chunking.chunk_overlap, 20);
        assert_eq!(cfg.collection_name, "from-file");
    }

    #[test]
    fn overlap_not_smaller_than_size_is_rejected() {
        let mut overrides = with_db("papers");
        overrides.chunk_size = Some(100);
        overrides.chunk_overlap = Some(100);
        let err = Config::resolve(overrides, FileConfig::default()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::OverlapTooLarge {
                overlap: 100,
                size: 100
            }
        );
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let mut overrides = with_db("papers");
        overrides.embeddings_provider = Some("magic".to_string());
        let err = Config::resolve(overrides, FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider(p) if p == "magic"));
    }

    #[test]
    fn database_name_derived_from_persist_directory() {
        let overrides = ConfigOverrides {
            persist_directory: Some(PathBuf::from("/work/db/notes")),
            source_directory: Some(PathBuf::from("/work/source_documents/notes")),
            ..Default::default()
        };
        let cfg = Config::resolve(overrides, FileConfig::default()).unwrap();
        assert_eq!(cfg.database_name, "notes");
        assert_eq!(cfg.collection_name, "notes");
    }

    #[test]
    fn explicit_persist_directory_names_the_database() {
        let mut overrides = with_db("papers");
        overrides.persist_directory = Some(PathBuf::from("/elsewhere/vectors"));
        let cfg = Config::resolve(overrides, FileConfig::default()).unwrap();
        assert_eq!(cfg.database_name, "vectors");
        assert_eq!(cfg.collection_name, "papers");
        assert_eq!(cfg.persist_root(), PathBuf::from("/elsewhere"));
    }

    #[test]
    fn gpu_flag_selects_cuda() {
        let mut overrides = with_db("papers");
        overrides.gpu = Some(true);
        let cfg = Config::resolve(overrides, FileConfig::default()).unwrap();
        assert_eq!(cfg.embedding.device, Device::Cuda);
    }

    #[test]
    fn unknown_file_keys_fail_to_parse() {
        let parsed: Result<FileConfig, _> = toml::from_str("[chunking]\nmax_tokens = 3\n");
        assert!(parsed.is_err());
    }
}
