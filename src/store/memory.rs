//! In-memory [`CollectionStore`] for tests.
//!
//! Databases live in a `HashMap` behind `std::sync::RwLock`. A database only
//! reports [`exists`](CollectionStore::exists) after a successful
//! [`persist`](CollectionStore::persist), mirroring the on-disk backend where
//! an unpersisted index is incomplete.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::EmbeddingFunction;
use crate::models::{Chunk, Metadata};

use super::{embed_chunks, CollectionHandle, CollectionStore};

struct StoredChunk {
    chunk: Chunk,
    _vector: Vec<f32>,
}

#[derive(Default)]
struct StoredCollection {
    dims: usize,
    records: Vec<StoredChunk>,
    /// Record count at the last persist.
    snapshot_len: Option<usize>,
}

#[derive(Default)]
struct Database {
    collections: HashMap<String, StoredCollection>,
    persisted: bool,
}

/// In-memory store with write counters and failure injection.
pub struct MemoryCollectionStore {
    databases: RwLock<HashMap<String, Database>>,
    batch_size: usize,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
    fail_persist: AtomicBool,
}

impl MemoryCollectionStore {
    pub fn new() -> Self {
        Self {
            databases: RwLock::new(HashMap::new()),
            batch_size: 64,
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            fail_persist: AtomicBool::new(false),
        }
    }

    /// Make every later write fail as if the store had gone away.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make only `persist` fail; chunk writes still succeed.
    pub fn fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// Number of `add_chunks` / `create_from_chunks` / `persist` calls.
    pub fn write_calls(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Chunks stored in `collection`, or 0 when it does not exist.
    pub fn chunk_count(&self, database: &str, collection: &str) -> usize {
        self.databases
            .read()
            .ok()
            .and_then(|dbs| {
                dbs.get(database)
                    .and_then(|db| db.collections.get(collection))
                    .map(|c| c.records.len())
            })
            .unwrap_or(0)
    }

    fn begin_write(&self) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("memory store is unavailable");
        }
        Ok(())
    }

    fn write_lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Database>>> {
        self.databases
            .write()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }
}

impl Default for MemoryCollectionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn stored(chunks: &[Chunk], vectors: Vec<Vec<f32>>) -> impl Iterator<Item = StoredChunk> + '_ {
    chunks
        .iter()
        .cloned()
        .zip(vectors)
        .map(|(chunk, vector)| StoredChunk {
            chunk,
            _vector: vector,
        })
}

#[async_trait]
impl CollectionStore for MemoryCollectionStore {
    async fn exists(&self, database: &str) -> Result<bool> {
        let dbs = self
            .databases
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(dbs.get(database).is_some_and(|db| db.persisted))
    }

    async fn open(
        &self,
        database: &str,
        collection: &str,
        embedder: &dyn EmbeddingFunction,
    ) -> Result<CollectionHandle> {
        let mut dbs = self.write_lock()?;
        let coll = dbs
            .entry(database.to_string())
            .or_default()
            .collections
            .entry(collection.to_string())
            .or_insert_with(|| StoredCollection {
                dims: embedder.dims(),
                records: Vec::new(),
                snapshot_len: None,
            });
        if coll.dims != embedder.dims() {
            bail!(
                "collection '{}' stores {}-dimensional vectors but the embedder produces {}",
                collection,
                coll.dims,
                embedder.dims()
            );
        }
        Ok(CollectionHandle::new(database, collection))
    }

    async fn get_all_metadata(&self, handle: &CollectionHandle) -> Result<Vec<Metadata>> {
        let dbs = self
            .databases
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        let coll = dbs
            .get(&handle.database)
            .and_then(|db| db.collections.get(&handle.collection))
            .ok_or_else(|| anyhow!("collection '{}' not found", handle.collection))?;
        Ok(coll.records.iter().map(|r| r.chunk.metadata.clone()).collect())
    }

    async fn add_chunks(
        &self,
        handle: &CollectionHandle,
        chunks: &[Chunk],
        embedder: &dyn EmbeddingFunction,
    ) -> Result<usize> {
        self.begin_write()?;
        let vectors = embed_chunks(embedder, chunks, self.batch_size).await?;

        let mut dbs = self.write_lock()?;
        let coll = dbs
            .get_mut(&handle.database)
            .and_then(|db| db.collections.get_mut(&handle.collection))
            .ok_or_else(|| anyhow!("collection '{}' not found", handle.collection))?;
        coll.records.extend(stored(chunks, vectors));
        Ok(chunks.len())
    }

    async fn create_from_chunks(
        &self,
        database: &str,
        collection: &str,
        chunks: &[Chunk],
        embedder: &dyn EmbeddingFunction,
    ) -> Result<CollectionHandle> {
        self.begin_write()?;
        let vectors = embed_chunks(embedder, chunks, self.batch_size).await?;

        let mut dbs = self.write_lock()?;
        let db = dbs.entry(database.to_string()).or_default();
        db.collections.insert(
            collection.to_string(),
            StoredCollection {
                dims: embedder.dims(),
                records: stored(chunks, vectors).collect(),
                snapshot_len: None,
            },
        );
        Ok(CollectionHandle::new(database, collection))
    }

    async fn persist(&self, handle: &CollectionHandle) -> Result<()> {
        self.begin_write()?;
        if self.fail_persist.load(Ordering::SeqCst) {
            bail!("index snapshot could not be written");
        }
        let mut dbs = self.write_lock()?;
        let db = dbs
            .get_mut(&handle.database)
            .ok_or_else(|| anyhow!("database '{}' not found", handle.database))?;
        let coll = db
            .collections
            .get_mut(&handle.collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", handle.collection))?;
        coll.snapshot_len = Some(coll.records.len());
        db.persisted = true;
        Ok(())
    }

    async fn snapshot_is_stale(&self, handle: &CollectionHandle) -> Result<bool> {
        let dbs = self
            .databases
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        let coll = dbs
            .get(&handle.database)
            .and_then(|db| db.collections.get(&handle.collection))
            .ok_or_else(|| anyhow!("collection '{}' not found", handle.collection))?;
        Ok(coll.snapshot_len != Some(coll.records.len()))
    }
}
