//! Collection storage abstraction.
//!
//! The [`CollectionStore`] trait is everything the ingestion pipeline needs
//! from a vector store: check whether a database holds a usable collection,
//! open it, read back chunk metadata, and write new chunks. Stores embed
//! chunk text through the [`EmbeddingFunction`] they are handed; the
//! pipeline never computes vectors itself.
//!
//! Backends:
//! - [`sqlite::SqliteCollectionStore`]: persistent, one SQLite file per database.
//! - [`memory::MemoryCollectionStore`]: in-process, for tests.
//!
//! Implementations must be `Send + Sync`; the orchestrator is the only caller
//! and never calls a store concurrently.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::embedding::EmbeddingFunction;
use crate::models::{Chunk, Metadata};

/// An opened collection inside a database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionHandle {
    pub database: String,
    pub collection: String,
}

impl CollectionHandle {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }
}

/// Abstract vector store.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`exists`](CollectionStore::exists) | Database holds a structurally valid persisted index |
/// | [`open`](CollectionStore::open) | Open (or lazily create) a named collection |
/// | [`get_all_metadata`](CollectionStore::get_all_metadata) | Metadata of every stored chunk |
/// | [`add_chunks`](CollectionStore::add_chunks) | Embed and append chunks |
/// | [`create_from_chunks`](CollectionStore::create_from_chunks) | Fresh collection from chunks |
/// | [`persist`](CollectionStore::persist) | Flush the collection's index artifacts |
/// | [`snapshot_is_stale`](CollectionStore::snapshot_is_stale) | Index artifacts lag the stored chunks |
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// `true` only when `database` holds a complete persisted index.
    /// A partial or corrupt database reports `false`.
    async fn exists(&self, database: &str) -> Result<bool>;

    async fn open(
        &self,
        database: &str,
        collection: &str,
        embedder: &dyn EmbeddingFunction,
    ) -> Result<CollectionHandle>;

    async fn get_all_metadata(&self, handle: &CollectionHandle) -> Result<Vec<Metadata>>;

    /// Embed `chunks` and append them. Returns the number of records written.
    async fn add_chunks(
        &self,
        handle: &CollectionHandle,
        chunks: &[Chunk],
        embedder: &dyn EmbeddingFunction,
    ) -> Result<usize>;

    /// Replace any collection with the same name by one holding `chunks`.
    async fn create_from_chunks(
        &self,
        database: &str,
        collection: &str,
        chunks: &[Chunk],
        embedder: &dyn EmbeddingFunction,
    ) -> Result<CollectionHandle>;

    async fn persist(&self, handle: &CollectionHandle) -> Result<()>;

    /// `true` when the last [`persist`](CollectionStore::persist) of this
    /// collection does not cover every stored chunk.
    async fn snapshot_is_stale(&self, handle: &CollectionHandle) -> Result<bool>;
}

/// Embed `chunks` in batches of at most `batch_size` texts.
///
/// Fails when the embedder returns a vector count or width that does not
/// match the input.
pub async fn embed_chunks(
    embedder: &dyn EmbeddingFunction,
    chunks: &[Chunk],
    batch_size: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(chunks.len());
    for batch in chunks.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let embedded = embedder.embed(&texts).await?;
        if embedded.len() != texts.len() {
            anyhow::bail!(
                "embedder returned {} vectors for {} texts",
                embedded.len(),
                texts.len()
            );
        }
        if let Some(bad) = embedded.iter().find(|v| v.len() != embedder.dims()) {
            anyhow::bail!(
                "embedder returned a {}-dimensional vector, expected {}",
                bad.len(),
                embedder.dims()
            );
        }
        vectors.extend(embedded);
    }
    Ok(vectors)
}
