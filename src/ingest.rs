//! Ingestion pipeline orchestration.
//!
//! [`Ingestor`] drives one run through a validated state machine:
//!
//! ```text
//! Idle → Discovering → Loading → Splitting → ReconcilingTarget → Persisting → Done
//!            │            │          │
//!            └────────────┴──────────┴──→ Done   (nothing new / dry run)
//! any non-terminal state ──→ Failed             (fatal error)
//! ```
//!
//! `Discovering` first reconciles against the target collection: when the
//! database holds a valid persisted index the collection is opened and its
//! known sources become the discovery ignore-set (append mode); otherwise
//! everything under the source directory is new (create mode). An append
//! target whose index snapshot lags its stored chunks (a previous run
//! failed after writing) gets its snapshot rewritten here. Per-file parse
//! failures are collected into the summary and never fail the run.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::chunk::ChunkSplitter;
use crate::config::Config;
use crate::discovery::FileDiscovery;
use crate::embedding::EmbeddingFunction;
use crate::error::IngestError;
use crate::loader::LoaderRegistry;
use crate::models::{Chunk, IngestionError};
use crate::parallel::ParallelLoader;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::reconcile::DeltaReconciler;
use crate::store::{CollectionHandle, CollectionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestState {
    Idle,
    Discovering,
    Loading,
    Splitting,
    ReconcilingTarget,
    Persisting,
    Done,
    Failed,
}

impl IngestState {
    pub fn name(self) -> &'static str {
        match self {
            IngestState::Idle => "idle",
            IngestState::Discovering => "discovering",
            IngestState::Loading => "loading",
            IngestState::Splitting => "splitting",
            IngestState::ReconcilingTarget => "reconciling-target",
            IngestState::Persisting => "persisting",
            IngestState::Done => "done",
            IngestState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IngestState::Done | IngestState::Failed)
    }

    fn can_transition_to(self, next: IngestState) -> bool {
        use IngestState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Discovering)
            | (Discovering, Loading)
            | (Discovering, Done)
            | (Loading, Splitting)
            | (Loading, Done)
            | (Splitting, ReconcilingTarget)
            | (Splitting, Done)
            | (ReconcilingTarget, Persisting)
            | (Persisting, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether the run builds a new collection or appends to an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetMode {
    Create,
    Append,
}

impl fmt::Display for TargetMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetMode::Create => "create",
            TargetMode::Append => "append",
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Stop after splitting; nothing is written to the store.
    pub dry_run: bool,
}

/// Outcome of a run that reached `Done`.
#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub database: String,
    pub collection: String,
    pub mode: TargetMode,
    pub dry_run: bool,
    pub files_discovered: usize,
    pub documents_loaded: usize,
    pub chunks_split: usize,
    pub chunks_written: usize,
    /// A stale index snapshot from an earlier run was rewritten.
    pub snapshot_refreshed: bool,
    pub errors: Vec<IngestionError>,
    /// Every state the run passed through, starting at `Idle`.
    pub states: Vec<IngestState>,
}

impl IngestSummary {
    /// Multi-line report for stdout, ending in `ok` or `ok (with N failures)`.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let dry = if self.dry_run { ", dry-run" } else { "" };
        out.push_str(&format!(
            "ingest {}/{} ({}{})\n",
            self.database, self.collection, self.mode, dry
        ));
        out.push_str(&format!("  files discovered: {}\n", self.files_discovered));
        out.push_str(&format!("  documents loaded: {}\n", self.documents_loaded));
        if self.dry_run {
            out.push_str(&format!("  chunks: {} (not written)\n", self.chunks_split));
        } else {
            out.push_str(&format!("  chunks written: {}\n", self.chunks_written));
        }
        if self.snapshot_refreshed {
            out.push_str("  index snapshot refreshed\n");
        }
        for err in &self.errors {
            out.push_str(&format!("- {}\n", err));
        }
        if self.errors.is_empty() {
            out.push_str("ok\n");
        } else {
            out.push_str(&format!("ok (with {} failures)\n", self.errors.len()));
        }
        out
    }
}

enum Target {
    Create,
    Append(CollectionHandle),
}

/// One ingestion run over a configured database.
pub struct Ingestor<'a> {
    config: &'a Config,
    registry: &'a LoaderRegistry,
    store: &'a dyn CollectionStore,
    embedder: &'a dyn EmbeddingFunction,
    progress: &'a dyn ProgressReporter,
    state: IngestState,
    history: Vec<IngestState>,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        config: &'a Config,
        registry: &'a LoaderRegistry,
        store: &'a dyn CollectionStore,
        embedder: &'a dyn EmbeddingFunction,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            embedder,
            progress,
            state: IngestState::Idle,
            history: vec![IngestState::Idle],
        }
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    pub fn history(&self) -> &[IngestState] {
        &self.history
    }

    /// Execute the run. On error the ingestor is left in `Failed`.
    pub async fn run(&mut self, options: RunOptions) -> Result<IngestSummary, IngestError> {
        match self.execute(options).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                if !self.state.is_terminal() {
                    self.state = IngestState::Failed;
                    self.history.push(IngestState::Failed);
                }
                tracing::debug!(error = %err, state = %self.state, "ingestion failed");
                Err(err)
            }
        }
    }

    fn transition(&mut self, next: IngestState) -> Result<(), IngestError> {
        if !self.state.can_transition_to(next) {
            return Err(IngestError::InvalidTransition {
                from: self.state.name(),
                to: next.name(),
            });
        }
        tracing::info!(from = %self.state, to = %next, "ingestion state");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    fn finish(&mut self, mut summary: IngestSummary) -> Result<IngestSummary, IngestError> {
        self.transition(IngestState::Done)?;
        summary.states = self.history.clone();
        Ok(summary)
    }

    async fn execute(&mut self, options: RunOptions) -> Result<IngestSummary, IngestError> {
        let config = self.config;
        let database = config.database_name.as_str();
        let collection = config.collection_name.as_str();
        // Fail before any parallel work on a bad chunking configuration.
        let splitter = ChunkSplitter::from_config(&config.chunking)?;

        self.transition(IngestState::Discovering)?;
        self.progress.report(ProgressEvent::Discovering {
            database: database.to_string(),
        });

        let mut snapshot_refreshed = false;
        let (mode, handle, known) = if self
            .store
            .exists(database)
            .await
            .map_err(IngestError::StoreUnavailable)?
        {
            let handle = self
                .store
                .open(database, collection, self.embedder)
                .await
                .map_err(IngestError::StoreUnavailable)?;
            let existing = DeltaReconciler::new(self.store)
                .load_collection(&handle)
                .await
                .map_err(IngestError::StoreUnavailable)?;
            tracing::info!(
                collection = %existing.name,
                known_sources = existing.known_source_paths.len(),
                "appending to existing collection"
            );
            let known: HashSet<String> = existing.known_source_paths.into_iter().collect();
            if !options.dry_run {
                snapshot_refreshed = self.refresh_stale_snapshot(&handle).await?;
            }
            (TargetMode::Append, Some(handle), known)
        } else {
            if config.persist_directory.exists() {
                tracing::warn!(
                    dir = %config.persist_directory.display(),
                    "no complete collection found, creating a new one"
                );
            }
            (TargetMode::Create, None, HashSet::new())
        };

        let discovery = FileDiscovery::new(
            self.registry,
            &config.loader.exclude_globs,
            config.loader.follow_symlinks,
        )
        .map_err(|source| IngestError::Discovery {
            root: config.source_directory.clone(),
            source,
        })?;
        let files = discovery
            .discover(&config.source_directory, &known)
            .map_err(|source| IngestError::Discovery {
                root: config.source_directory.clone(),
                source,
            })?;

        let mut summary = IngestSummary {
            database: database.to_string(),
            collection: collection.to_string(),
            mode,
            dry_run: options.dry_run,
            files_discovered: files.len(),
            documents_loaded: 0,
            chunks_split: 0,
            chunks_written: 0,
            snapshot_refreshed,
            errors: Vec::new(),
            states: Vec::new(),
        };

        if files.is_empty() {
            tracing::info!("no new documents to ingest");
            return self.finish(summary);
        }

        self.transition(IngestState::Loading)?;
        let report = ParallelLoader::new(self.registry, config.loader.max_workers, self.progress)
            .load(files)
            .await?;
        summary.documents_loaded = report.documents.len();
        summary.errors = report.errors;
        if report.documents.is_empty() {
            tracing::warn!("no documents could be loaded");
            return self.finish(summary);
        }

        self.transition(IngestState::Splitting)?;
        self.progress.report(ProgressEvent::Splitting {
            documents: report.documents.len() as u64,
        });
        let chunks = splitter.split(&report.documents);
        drop(report.documents);
        summary.chunks_split = chunks.len();
        tracing::info!(chunks = chunks.len(), "documents split");
        if chunks.is_empty() || options.dry_run {
            return self.finish(summary);
        }

        self.transition(IngestState::ReconcilingTarget)?;
        let target = match handle {
            Some(handle) => Target::Append(handle),
            None => Target::Create,
        };

        self.transition(IngestState::Persisting)?;
        self.progress.report(ProgressEvent::Persisting {
            chunks: chunks.len() as u64,
        });
        summary.chunks_written = self.persist(target, &chunks).await?;

        self.finish(summary)
    }

    /// Rewrite the index snapshot when it does not cover every stored chunk.
    async fn refresh_stale_snapshot(&self, handle: &CollectionHandle) -> Result<bool, IngestError> {
        let stale = self
            .store
            .snapshot_is_stale(handle)
            .await
            .map_err(IngestError::StoreUnavailable)?;
        if !stale {
            return Ok(false);
        }
        tracing::warn!(
            collection = %handle.collection,
            "index snapshot is behind the stored chunks, rewriting it"
        );
        self.store
            .persist(handle)
            .await
            .map_err(IngestError::StoreUnavailable)?;
        Ok(true)
    }

    /// Write `chunks`, then snapshot the collection. The two steps fail
    /// with different errors: [`IngestError::Persist`] means nothing was
    /// written, [`IngestError::Snapshot`] means the chunks are stored.
    async fn persist(&self, target: Target, chunks: &[Chunk]) -> Result<usize, IngestError> {
        let config = self.config;
        let not_written = |source| IngestError::Persist {
            chunks: chunks.len(),
            unpersisted: distinct_sources(chunks),
            source,
        };
        let (handle, written) = match target {
            Target::Append(handle) => {
                let added = self
                    .store
                    .add_chunks(&handle, chunks, self.embedder)
                    .await
                    .map_err(not_written)?;
                (handle, added)
            }
            Target::Create => {
                let handle = self
                    .store
                    .create_from_chunks(
                        &config.database_name,
                        &config.collection_name,
                        chunks,
                        self.embedder,
                    )
                    .await
                    .map_err(not_written)?;
                (handle, chunks.len())
            }
        };

        self.store
            .persist(&handle)
            .await
            .map_err(|source| IngestError::Snapshot {
                chunks: written,
                sources: distinct_sources(chunks),
                source,
            })?;
        Ok(written)
    }
}

fn distinct_sources(chunks: &[Chunk]) -> Vec<String> {
    chunks
        .iter()
        .map(|c| c.source_path.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOverrides, FileConfig};
    use crate::progress::NoProgress;
    use crate::store::memory::MemoryCollectionStore;
    use crate::store::testing::FakeEmbedder;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use IngestState::*;

    fn workspace() -> (TempDir, Config) {
        let tmp = TempDir::new().unwrap();
        let overrides = ConfigOverrides {
            root: Some(tmp.path().to_path_buf()),
            database_name: Some("papers".to_string()),
            ..Default::default()
        };
        let config = Config::resolve(overrides, FileConfig::default()).unwrap();
        fs::create_dir_all(&config.source_directory).unwrap();
        (tmp, config)
    }

    fn prose(chars: usize) -> String {
        let sentence = "Rust makes systems programming approachable and safe. ";
        sentence.chars().cycle().take(chars).collect()
    }

    fn write(dir: &Path, name: &str, bytes: &[u8]) {
        fs::write(dir.join(name), bytes).unwrap();
    }

    async fn run(
        config: &Config,
        store: &MemoryCollectionStore,
        options: RunOptions,
    ) -> (Result<IngestSummary, IngestError>, Vec<IngestState>) {
        let registry = LoaderRegistry::default();
        let embedder = FakeEmbedder::new(4);
        let mut ingestor = Ingestor::new(config, &registry, store, &embedder, &NoProgress);
        let result = ingestor.run(options).await;
        (result, ingestor.history().to_vec())
    }

    #[tokio::test]
    async fn one_good_one_corrupt_file() {
        let (_tmp, config) = workspace();
        write(&config.source_directory, "a.txt", prose(1500).as_bytes());
        write(&config.source_directory, "b.txt", &[0xff, 0xfe, 0xfd, 0x00]);
        let store = MemoryCollectionStore::new();

        let (result, history) = run(&config, &store, RunOptions::default()).await;
        let summary = result.unwrap();

        assert_eq!(summary.mode, TargetMode::Create);
        assert_eq!(summary.files_discovered, 2);
        assert_eq!(summary.documents_loaded, 1);
        assert!(summary.chunks_written >= 2);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].source_path.ends_with("b.txt"));
        assert_eq!(
            history,
            vec![Idle, Discovering, Loading, Splitting, ReconcilingTarget, Persisting, Done]
        );
        assert_eq!(summary.states, history);
        assert_eq!(store.chunk_count("papers", "papers"), summary.chunks_written);
        assert!(store.exists("papers").await.unwrap());
        assert!(summary.render().ends_with("ok (with 1 failures)\n"));
    }

    #[tokio::test]
    async fn second_append_run_is_a_no_op() {
        let (_tmp, config) = workspace();
        write(&config.source_directory, "a.txt", prose(1500).as_bytes());
        let store = MemoryCollectionStore::new();

        let (first, _) = run(&config, &store, RunOptions::default()).await;
        let written = first.unwrap().chunks_written;
        let writes = store.write_calls();

        let (second, history) = run(&config, &store, RunOptions::default()).await;
        let second = second.unwrap();
        assert_eq!(second.mode, TargetMode::Append);
        assert_eq!(second.files_discovered, 0);
        assert_eq!(second.chunks_written, 0);
        assert_eq!(history, vec![Idle, Discovering, Done]);
        assert_eq!(store.write_calls(), writes);
        assert_eq!(store.chunk_count("papers", "papers"), written);
    }

    #[tokio::test]
    async fn append_only_processes_new_files() {
        let (_tmp, config) = workspace();
        write(&config.source_directory, "a.txt", b"first file");
        let store = MemoryCollectionStore::new();
        run(&config, &store, RunOptions::default()).await.0.unwrap();

        write(&config.source_directory, "c.md", b"second file");
        let summary = run(&config, &store, RunOptions::default()).await.0.unwrap();
        assert_eq!(summary.mode, TargetMode::Append);
        assert_eq!(summary.files_discovered, 1);
        assert_eq!(summary.chunks_written, 1);
        assert_eq!(store.chunk_count("papers", "papers"), 2);
    }

    #[tokio::test]
    async fn empty_source_terminates_without_writes() {
        let (_tmp, config) = workspace();
        let store = MemoryCollectionStore::new();

        let (result, history) = run(&config, &store, RunOptions::default()).await;
        let summary = result.unwrap();
        assert_eq!(history, vec![Idle, Discovering, Done]);
        assert_eq!(summary.files_discovered, 0);
        assert_eq!(store.write_calls(), 0);
        assert!(summary.render().ends_with("ok\n"));
    }

    #[tokio::test]
    async fn all_files_failing_ends_after_loading() {
        let (_tmp, config) = workspace();
        write(&config.source_directory, "bad.txt", &[0xc3, 0x28]);
        let store = MemoryCollectionStore::new();

        let (result, history) = run(&config, &store, RunOptions::default()).await;
        let summary = result.unwrap();
        assert_eq!(history, vec![Idle, Discovering, Loading, Done]);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(store.write_calls(), 0);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let (_tmp, config) = workspace();
        write(&config.source_directory, "a.txt", prose(2500).as_bytes());
        let store = MemoryCollectionStore::new();

        let (result, history) = run(&config, &store, RunOptions { dry_run: true }).await;
        let summary = result.unwrap();
        assert_eq!(history, vec![Idle, Discovering, Loading, Splitting, Done]);
        assert!(summary.chunks_split >= 3);
        assert_eq!(summary.chunks_written, 0);
        assert_eq!(store.write_calls(), 0);
        assert!(summary.render().contains("(not written)"));
    }

    #[tokio::test]
    async fn store_failure_reports_unpersisted_sources() {
        let (_tmp, config) = workspace();
        write(&config.source_directory, "a.txt", b"alpha");
        write(&config.source_directory, "b.md", b"beta");
        let store = MemoryCollectionStore::new();
        store.fail_writes(true);

        let (result, history) = run(&config, &store, RunOptions::default()).await;
        match result {
            Err(IngestError::Persist {
                chunks,
                unpersisted,
                ..
            }) => {
                assert_eq!(chunks, 2);
                assert_eq!(unpersisted.len(), 2);
                assert!(unpersisted[0].ends_with("a.txt"));
                assert!(unpersisted[1].ends_with("b.md"));
            }
            other => panic!("expected persist error, got {:?}", other),
        }
        assert_eq!(history.last(), Some(&Failed));
    }

    #[tokio::test]
    async fn snapshot_failure_is_reported_and_repaired_next_run() {
        let (_tmp, config) = workspace();
        write(&config.source_directory, "a.txt", b"alpha");
        let store = MemoryCollectionStore::new();
        run(&config, &store, RunOptions::default()).await.0.unwrap();

        write(&config.source_directory, "b.md", b"beta");
        store.fail_persist(true);
        let (result, history) = run(&config, &store, RunOptions::default()).await;
        match result {
            Err(IngestError::Snapshot { chunks, sources, .. }) => {
                assert_eq!(chunks, 1);
                assert_eq!(sources.len(), 1);
                assert!(sources[0].ends_with("b.md"));
            }
            other => panic!("expected snapshot error, got {:?}", other),
        }
        assert_eq!(history.last(), Some(&Failed));
        // The append itself went through.
        assert_eq!(store.chunk_count("papers", "papers"), 2);

        store.fail_persist(false);
        let handle = CollectionHandle::new("papers", "papers");
        assert!(store.snapshot_is_stale(&handle).await.unwrap());
        let (result, history) = run(&config, &store, RunOptions::default()).await;
        let summary = result.unwrap();
        assert_eq!(summary.files_discovered, 0);
        assert!(summary.snapshot_refreshed);
        assert!(summary.render().contains("index snapshot refreshed"));
        assert_eq!(history, vec![Idle, Discovering, Done]);
        assert!(!store.snapshot_is_stale(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn dry_run_leaves_stale_snapshot_alone() {
        let (_tmp, config) = workspace();
        write(&config.source_directory, "a.txt", b"alpha");
        let store = MemoryCollectionStore::new();
        run(&config, &store, RunOptions::default()).await.0.unwrap();
        write(&config.source_directory, "b.md", b"beta");
        store.fail_persist(true);
        assert!(run(&config, &store, RunOptions::default()).await.0.is_err());
        store.fail_persist(false);

        let writes = store.write_calls();
        let summary = run(&config, &store, RunOptions { dry_run: true })
            .await
            .0
            .unwrap();
        assert!(!summary.snapshot_refreshed);
        assert_eq!(store.write_calls(), writes);
    }

    #[tokio::test]
    async fn missing_source_directory_fails() {
        let (_tmp, config) = workspace();
        fs::remove_dir(&config.source_directory).unwrap();
        let store = MemoryCollectionStore::new();

        let (result, history) = run(&config, &store, RunOptions::default()).await;
        assert!(matches!(result, Err(IngestError::Discovery { .. })));
        assert_eq!(history, vec![Idle, Discovering, Failed]);
    }

    #[test]
    fn transitions_are_validated() {
        assert!(Idle.can_transition_to(Discovering));
        assert!(Discovering.can_transition_to(Done));
        assert!(!Idle.can_transition_to(Loading));
        assert!(!Discovering.can_transition_to(Persisting));
        assert!(!Done.can_transition_to(Failed));
        assert!(Persisting.can_transition_to(Failed));
    }
}
