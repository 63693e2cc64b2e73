//! Bounded parallel parsing of discovered files.
//!
//! Every file is parsed on tokio's blocking pool, with at most `workers`
//! parses in flight (a [`Semaphore`] gates the pool). Each task yields a
//! tagged [`LoadOutcome`]; a failing or panicking parser becomes an
//! [`IngestionError`] for that file only. Outcomes are consumed from a
//! [`JoinSet`] in completion order, so progress is reported as files finish.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{IngestError, ParseError};
use crate::loader::{DocumentParser, LoaderRegistry};
use crate::models::{IngestionError, RawDocument, SourceFile};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Result of parsing one file.
#[derive(Debug)]
pub enum LoadOutcome {
    Success {
        path: PathBuf,
        documents: Vec<RawDocument>,
    },
    Failure(IngestionError),
}

/// Documents and per-file errors gathered from one batch.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Documents grouped by file; within a file they keep parser order.
    pub documents: Vec<RawDocument>,
    pub errors: Vec<IngestionError>,
    /// Files that parsed successfully (possibly into zero documents).
    pub files_loaded: usize,
}

pub struct ParallelLoader<'a> {
    registry: &'a LoaderRegistry,
    workers: usize,
    progress: &'a dyn ProgressReporter,
}

impl<'a> ParallelLoader<'a> {
    pub fn new(
        registry: &'a LoaderRegistry,
        workers: usize,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            registry,
            workers: workers.max(1),
            progress,
        }
    }

    /// Parse `files` in parallel.
    ///
    /// Per-file failures never abort the batch. The only error is a broken
    /// worker pool, which cannot be attributed to a file.
    pub async fn load(&self, files: Vec<SourceFile>) -> Result<LoadReport, IngestError> {
        let mut report = LoadReport::default();
        if files.is_empty() {
            return Ok(report);
        }

        let total = files.len() as u64;
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks: JoinSet<LoadOutcome> = JoinSet::new();

        let mut processed = 0u64;
        for file in files {
            let Some(parser) = self.registry.capability_for(&file.extension) else {
                report.errors.push(IngestionError::new(
                    &file.path,
                    ParseError::NotSupported(file.extension.clone()).to_string(),
                ));
                processed += 1;
                self.progress.report(ProgressEvent::Loading {
                    n: processed,
                    total,
                });
                continue;
            };
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return LoadOutcome::Failure(IngestionError::new(&file.path, e.to_string())),
                };
                run_parser(parser, file.path).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| IngestError::WorkerPool(e.to_string()))?;
            processed += 1;
            match outcome {
                LoadOutcome::Success { path, documents } => {
                    tracing::info!(source = %path.display(), documents = documents.len(), "loaded");
                    report.files_loaded += 1;
                    report.documents.extend(documents);
                }
                LoadOutcome::Failure(err) => {
                    tracing::warn!(source = %err.source_path, cause = %err.cause, "failed to load");
                    report.errors.push(err);
                }
            }
            self.progress.report(ProgressEvent::Loading {
                n: processed,
                total,
            });
        }

        Ok(report)
    }
}

/// Run one parse on the blocking pool; panics become a failure for `path`.
async fn run_parser(parser: Arc<dyn DocumentParser>, path: PathBuf) -> LoadOutcome {
    let task_path = path.clone();
    let joined = tokio::task::spawn_blocking(move || {
        let result = parser.parse(&task_path);
        (task_path, result)
    })
    .await;

    match joined {
        Ok((path, Ok(documents))) => LoadOutcome::Success { path, documents },
        Ok((path, Err(e))) => LoadOutcome::Failure(IngestionError::new(&path, e.to_string())),
        Err(e) if e.is_panic() => {
            LoadOutcome::Failure(IngestionError::new(&path, "parser panicked"))
        }
        Err(e) => LoadOutcome::Failure(IngestionError::new(&path, e.to_string())),
    }
}
