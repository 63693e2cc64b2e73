//! Delta reconciliation against a persisted collection.
//!
//! The set of already-ingested sources is rebuilt on every run from the
//! `source` key of the collection's stored chunk metadata. There is no
//! separate manifest to keep in sync.
//!
//! A database directory whose persisted index holds too few artifact files
//! is treated as absent, so the orchestrator creates the collection afresh
//! instead of appending to a partial one.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};

use crate::models::{Collection, SOURCE_KEY};
use crate::store::{CollectionHandle, CollectionStore};

/// A database needs strictly more index artifacts than this to count as valid.
pub const MIN_INDEX_ARTIFACTS: usize = 3;
/// Subdirectory of a database directory holding persisted index artifacts.
pub const INDEX_DIR: &str = "index";
/// SQLite file inside a database directory.
pub const DATABASE_FILE: &str = "collections.sqlite";

/// `.bin` and `.json` files directly inside `index_dir`.
pub fn count_index_artifacts(index_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(index_dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| {
            matches!(
                e.path().extension().and_then(|x| x.to_str()),
                Some("bin") | Some("json")
            )
        })
        .count()
}

/// Whether `database_dir` holds a structurally complete persisted store.
pub fn collection_is_valid(database_dir: &Path) -> bool {
    if !database_dir.join(DATABASE_FILE).is_file() {
        return false;
    }
    let artifacts = count_index_artifacts(&database_dir.join(INDEX_DIR));
    if artifacts <= MIN_INDEX_ARTIFACTS {
        tracing::debug!(
            dir = %database_dir.display(),
            artifacts,
            "index incomplete, treating database as absent"
        );
        return false;
    }
    true
}

pub struct DeltaReconciler<'a> {
    store: &'a dyn CollectionStore,
}

impl<'a> DeltaReconciler<'a> {
    pub fn new(store: &'a dyn CollectionStore) -> Self {
        Self { store }
    }

    /// The collection behind `handle` with its ingested source paths.
    pub async fn load_collection(&self, handle: &CollectionHandle) -> Result<Collection> {
        let metadata = self
            .store
            .get_all_metadata(handle)
            .await
            .with_context(|| format!("Failed to read metadata of collection '{}'", handle.collection))?;

        let known_source_paths = metadata
            .into_iter()
            .filter_map(|mut m| m.remove(SOURCE_KEY))
            .collect();

        Ok(Collection {
            name: handle.collection.clone(),
            database_name: handle.database.clone(),
            known_source_paths,
        })
    }

    /// Distinct source paths already represented in the collection.
    pub async fn known_sources(&self, handle: &CollectionHandle) -> Result<HashSet<String>> {
        let collection = self.load_collection(handle).await?;
        Ok(collection.known_source_paths.into_iter().collect())
    }
}
