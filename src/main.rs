//! # docvault CLI
//!
//! Ingests a directory of documents into a persistent vector collection.
//!
//! ## Usage
//!
//! ```bash
//! docvault papers                 # ingest <root>/source_documents/papers
//! docvault papers --dry-run       # discover, load and split only
//! docvault                        # interactive directory menu
//! ```
//!
//! The first run against a database creates the collection; later runs
//! append only files that are not in it yet.
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success (possibly with per-file failures), or quit from the main menu |
//! | 1 | Quit from a sub-menu, or a fatal error |
//! | 2 | Invalid command line |

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use docvault::config::{self, Config, ConfigOverrides, FileConfig};
use docvault::embedding;
use docvault::error::{ConfigError, IngestError};
use docvault::ingest::{Ingestor, RunOptions};
use docvault::layout;
use docvault::loader::LoaderRegistry;
use docvault::progress::ProgressMode;
use docvault::prompt::{self, PromptOutcome};
use docvault::store::sqlite::SqliteCollectionStore;

/// docvault: ingest documents into a local vector collection.
///
/// Most options can also be given through the environment (shown in
/// brackets) or a `.env` file in the working directory. Precedence:
/// flag > environment > `--config` file > default.
///
/// With a DATABASE the directories are `<root>/source_documents/<DATABASE>`
/// and `<root>/db/<DATABASE>` unless `--source-dir`/`--persist-dir` are
/// given. `INGEST_SOURCE_DIRECTORY` and `INGEST_PERSIST_DIRECTORY` only
/// feed the menu's "current directory" choice.
#[derive(Parser, Debug)]
#[command(name = "docvault", version, about)]
struct Cli {
    /// Database to ingest. Without it an interactive menu picks the directories.
    database: Option<String>,

    /// Collection name inside the database (defaults to the database name).
    #[arg(long, env = "INGEST_COLLECTION")]
    collection: Option<String>,

    /// Workspace root holding `source_documents/` and `db/`.
    #[arg(long, env = "INGEST_ROOT")]
    root: Option<PathBuf>,

    /// Source directory. Overrides `<root>/source_documents/<DATABASE>`.
    #[arg(long = "source-dir")]
    source_dir: Option<PathBuf>,

    /// Persist directory. Overrides `<root>/db/<DATABASE>`.
    #[arg(long = "persist-dir")]
    persist_dir: Option<PathBuf>,

    /// local, openai or ollama.
    #[arg(long, env = "INGEST_EMBEDDINGS_PROVIDER")]
    embeddings_provider: Option<String>,

    #[arg(long, env = "INGEST_EMBEDDINGS_MODEL")]
    embeddings_model: Option<String>,

    #[arg(long, env = "INGEST_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    #[arg(long, env = "INGEST_OVERLAP")]
    chunk_overlap: Option<usize>,

    /// Parse workers (capped at min(8, available parallelism)).
    #[arg(long, env = "INGEST_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Run embeddings on the GPU when the provider supports it.
    #[arg(long, env = "GPU_IS_ENABLED", value_parser = parse_enabled)]
    gpu: bool,

    /// Optional TOML configuration file.
    #[arg(long, env = "INGEST_CONFIG")]
    config: Option<PathBuf>,

    /// Progress on stderr. Defaults to human when stderr is a terminal.
    #[arg(long, value_enum)]
    progress: Option<ProgressMode>,

    /// Discover, load and split, but write nothing.
    #[arg(long)]
    dry_run: bool,

    /// Log filter (e.g. `info`, `docvault=debug`). Falls back to RUST_LOG, then `warn`.
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn overrides(&self, root: PathBuf) -> ConfigOverrides {
        ConfigOverrides {
            root: Some(root),
            database_name: self.database.clone(),
            collection: self.collection.clone(),
            source_directory: self.source_dir.clone(),
            persist_directory: self.persist_dir.clone(),
            embeddings_provider: self.embeddings_provider.clone(),
            embeddings_model: self.embeddings_model.clone(),
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            max_workers: self.max_workers,
            gpu: self.gpu.then_some(true),
        }
    }
}

/// `GPU_IS_ENABLED` turns the GPU on only when it reads `true`; any other
/// value means off.
fn parse_enabled(value: &str) -> Result<bool, std::convert::Infallible> {
    Ok(value.trim().eq_ignore_ascii_case("true"))
}

fn init_logging(level: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // Values from .env feed clap's `env` lookups; the real environment wins.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<IngestError>() {
                Some(IngestError::Persist { unpersisted, .. }) => {
                    eprintln!("error: {:#}", err);
                    eprintln!("not persisted (re-run to retry):");
                    for source in unpersisted {
                        eprintln!("- {}", source);
                    }
                }
                Some(IngestError::Snapshot { sources, .. }) => {
                    eprintln!("error: {:#}", err);
                    eprintln!("stored but missing from the index snapshot (re-run to rebuild it):");
                    for source in sources {
                        eprintln!("- {}", source);
                    }
                }
                _ => eprintln!("error: {:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let file = match &cli.config {
        Some(path) => config::load_file_config(path)?,
        None => FileConfig::default(),
    };
    let root = cli
        .root
        .clone()
        .or_else(|| file.root.clone())
        .unwrap_or_else(|| PathBuf::from("."));
    let mut overrides = cli.overrides(root.clone());

    if cli.database.is_none() {
        if !atty::is(atty::Stream::Stdin) {
            anyhow::bail!("no database given and stdin is not a terminal");
        }
        // The last menu selection, recorded in .env, is the "current" pair.
        let current = (
            cli.source_dir
                .clone()
                .or_else(|| env_path(layout::ENV_SOURCE_DIRECTORY))
                .or_else(|| file.source_directory.clone())
                .unwrap_or_else(|| root.join(layout::SOURCE_DOCUMENTS)),
            cli.persist_dir
                .clone()
                .or_else(|| env_path(layout::ENV_PERSIST_DIRECTORY))
                .or_else(|| file.persist_directory.clone())
                .unwrap_or_else(|| root.join(layout::DB)),
        );
        match prompt::choose_directories(&root, Path::new(".env"), current)? {
            PromptOutcome::Selected { source, persist } => {
                overrides.source_directory = Some(source);
                overrides.persist_directory = Some(persist);
            }
            PromptOutcome::Quit => return Ok(ExitCode::SUCCESS),
            PromptOutcome::Abort => return Ok(ExitCode::from(1)),
        }
    }

    let config = Config::resolve(overrides, file)?;
    ensure_dirs(&config, cli.dry_run)?;
    tracing::debug!(?config, "configuration resolved");

    let registry = LoaderRegistry::default();
    let embedder = embedding::create_provider(&config.embedding)?;
    let store = SqliteCollectionStore::new(config.persist_root(), config.embedding.batch_size);
    let progress = cli
        .progress
        .unwrap_or_else(ProgressMode::default_for_tty)
        .reporter();

    let mut ingestor = Ingestor::new(
        &config,
        &registry,
        &store,
        embedder.as_ref(),
        progress.as_ref(),
    );
    let result = ingestor
        .run(RunOptions {
            dry_run: cli.dry_run,
        })
        .await;
    store.close().await;

    print!("{}", result?.render());
    Ok(ExitCode::SUCCESS)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Create the source and persist directories. A dry run creates nothing,
/// so the source directory must already exist.
fn ensure_dirs(config: &Config, dry_run: bool) -> anyhow::Result<()> {
    if dry_run {
        if !config.source_directory.is_dir() {
            return Err(ConfigError::MissingSourceDirectory(config.source_directory.clone()).into());
        }
        return Ok(());
    }
    for dir in [&config.source_directory, &config.persist_directory] {
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", dir.display(), e))?;
    }
    Ok(())
}
