//! SQLite-backed [`CollectionStore`].
//!
//! Each database is a directory under the persist root:
//!
//! ```text
//! <persist_root>/<database>/
//!   collections.sqlite        collections, chunks, embeddings tables (WAL)
//!   index/<name>.header.json  written by persist()
//!   index/<name>.ids.json
//!   index/<name>.metadata.json
//!   index/<name>.vectors.bin  little-endian f32, one row per chunk
//! ```
//!
//! The SQLite file is the source of truth; the index snapshot is what makes
//! a database count as complete (see [`collection_is_valid`]).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::embedding::{vec_to_blob, EmbeddingFunction};
use crate::models::{Chunk, Metadata};
use crate::reconcile::{collection_is_valid, DATABASE_FILE, INDEX_DIR};

use super::{embed_chunks, CollectionHandle, CollectionStore};

pub struct SqliteCollectionStore {
    persist_root: PathBuf,
    batch_size: usize,
    pools: Mutex<HashMap<String, SqlitePool>>,
}

impl SqliteCollectionStore {
    /// `persist_root` is the directory holding one subdirectory per database.
    pub fn new(persist_root: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            persist_root: persist_root.into(),
            batch_size: batch_size.max(1),
            pools: Mutex::new(HashMap::new()),
        }
    }

    pub fn database_dir(&self, database: &str) -> PathBuf {
        self.persist_root.join(database)
    }

    async fn pool(&self, database: &str) -> Result<SqlitePool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(database) {
            return Ok(pool.clone());
        }
        let pool = connect(&self.database_dir(database).join(DATABASE_FILE)).await?;
        run_migrations(&pool).await?;
        pools.insert(database.to_string(), pool.clone());
        Ok(pool)
    }

    /// Close every open pool. Later calls reopen on demand.
    pub async fn close(&self) {
        let mut pools = self.pools.lock().await;
        for (_, pool) in pools.drain() {
            pool.close().await;
        }
    }
}

async fn connect(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open {}", db_path.display()))?;

    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            collection_id TEXT NOT NULL,
            source TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            FOREIGN KEY (collection_id) REFERENCES collections(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            chunk_id TEXT PRIMARY KEY,
            collection_id TEXT NOT NULL,
            dims INTEGER NOT NULL,
            vector BLOB NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_collection ON chunks(collection_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(collection_id, source)")
        .execute(pool)
        .await?;

    Ok(())
}

/// `(id, dims)` of the named collection.
async fn find_collection(pool: &SqlitePool, name: &str) -> Result<Option<(String, usize)>> {
    let row = sqlx::query("SELECT id, dims FROM collections WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| {
        let dims: i64 = r.get("dims");
        (r.get("id"), dims as usize)
    }))
}

fn elements_json(count: i64) -> String {
    serde_json::json!({ "elements": count }).to_string()
}

async fn insert_chunks(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    collection_id: &str,
    chunks: &[Chunk],
    vectors: &[Vec<f32>],
) -> Result<()> {
    for (chunk, vector) in chunks.iter().zip(vectors) {
        let chunk_id = Uuid::new_v4().to_string();
        let metadata_json = serde_json::to_string(&chunk.metadata)?;

        sqlx::query(
            "INSERT INTO chunks (id, collection_id, source, chunk_index, text, hash, metadata_json) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&chunk_id)
        .bind(collection_id)
        .bind(&chunk.source_path)
        .bind(chunk.sequence_index as i64)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .bind(&metadata_json)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            "INSERT INTO embeddings (chunk_id, collection_id, dims, vector) VALUES (?, ?, ?, ?)",
        )
        .bind(&chunk_id)
        .bind(collection_id)
        .bind(vector.len() as i64)
        .bind(vec_to_blob(vector))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn refresh_element_count(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    collection_id: &str,
) -> Result<()> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE collection_id = ?")
        .bind(collection_id)
        .fetch_one(&mut **tx)
        .await?;
    sqlx::query("UPDATE collections SET metadata_json = ?, updated_at = ? WHERE id = ?")
        .bind(elements_json(count))
        .bind(chrono::Utc::now().timestamp())
        .bind(collection_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl CollectionStore for SqliteCollectionStore {
    async fn exists(&self, database: &str) -> Result<bool> {
        Ok(collection_is_valid(&self.database_dir(database)))
    }

    async fn open(
        &self,
        database: &str,
        collection: &str,
        embedder: &dyn EmbeddingFunction,
    ) -> Result<CollectionHandle> {
        let pool = self.pool(database).await?;

        match find_collection(&pool, collection).await? {
            Some((_, dims)) if dims != embedder.dims() => bail!(
                "collection '{}' stores {}-dimensional vectors but model '{}' produces {}",
                collection,
                dims,
                embedder.model_name(),
                embedder.dims()
            ),
            Some(_) => {}
            None => {
                let now = chrono::Utc::now().timestamp();
                sqlx::query(
                    "INSERT INTO collections (id, name, model, dims, metadata_json, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(collection)
                .bind(embedder.model_name())
                .bind(embedder.dims() as i64)
                .bind(elements_json(0))
                .bind(now)
                .bind(now)
                .execute(&pool)
                .await?;
            }
        }

        Ok(CollectionHandle::new(database, collection))
    }

    async fn get_all_metadata(&self, handle: &CollectionHandle) -> Result<Vec<Metadata>> {
        let pool = self.pool(&handle.database).await?;
        let rows = sqlx::query(
            r#"
            SELECT c.metadata_json FROM chunks c
            JOIN collections k ON k.id = c.collection_id
            WHERE k.name = ?
            ORDER BY c.source ASC, c.chunk_index ASC
            "#,
        )
        .bind(&handle.collection)
        .fetch_all(&pool)
        .await?;

        rows.iter()
            .map(|row| {
                let json: String = row.get("metadata_json");
                serde_json::from_str::<Metadata>(&json)
                    .with_context(|| format!("Corrupt chunk metadata in '{}'", handle.collection))
            })
            .collect()
    }

    async fn add_chunks(
        &self,
        handle: &CollectionHandle,
        chunks: &[Chunk],
        embedder: &dyn EmbeddingFunction,
    ) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let pool = self.pool(&handle.database).await?;
        let Some((collection_id, _)) = find_collection(&pool, &handle.collection).await? else {
            bail!("collection '{}' not found", handle.collection);
        };

        let vectors = embed_chunks(embedder, chunks, self.batch_size).await?;

        let mut tx = pool.begin().await?;
        insert_chunks(&mut tx, &collection_id, chunks, &vectors).await?;
        refresh_element_count(&mut tx, &collection_id).await?;
        tx.commit().await?;

        tracing::debug!(collection = %handle.collection, added = chunks.len(), "chunks appended");
        Ok(chunks.len())
    }

    async fn create_from_chunks(
        &self,
        database: &str,
        collection: &str,
        chunks: &[Chunk],
        embedder: &dyn EmbeddingFunction,
    ) -> Result<CollectionHandle> {
        let vectors = embed_chunks(embedder, chunks, self.batch_size).await?;
        let pool = self.pool(database).await?;
        let mut tx = pool.begin().await?;

        // Drop any same-named collection, including leftovers of a partial run.
        sqlx::query(
            "DELETE FROM embeddings WHERE collection_id IN (SELECT id FROM collections WHERE name = ?)",
        )
        .bind(collection)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM chunks WHERE collection_id IN (SELECT id FROM collections WHERE name = ?)",
        )
        .bind(collection)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(collection)
            .execute(&mut *tx)
            .await?;

        let collection_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO collections (id, name, model, dims, metadata_json, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&collection_id)
        .bind(collection)
        .bind(embedder.model_name())
        .bind(embedder.dims() as i64)
        .bind(elements_json(chunks.len() as i64))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        insert_chunks(&mut tx, &collection_id, chunks, &vectors).await?;
        tx.commit().await?;

        tracing::debug!(%collection, chunks = chunks.len(), "collection created");
        Ok(CollectionHandle::new(database, collection))
    }

    async fn persist(&self, handle: &CollectionHandle) -> Result<()> {
        let pool = self.pool(&handle.database).await?;
        let meta = sqlx::query("SELECT id, model, dims FROM collections WHERE name = ?")
            .bind(&handle.collection)
            .fetch_optional(&pool)
            .await?;
        let Some(meta) = meta else {
            bail!("collection '{}' not found", handle.collection);
        };
        let collection_id: String = meta.get("id");
        let model: String = meta.get("model");
        let dims: i64 = meta.get("dims");

        let rows = sqlx::query(
            r#"
            SELECT c.id, c.metadata_json, e.vector FROM chunks c
            JOIN embeddings e ON e.chunk_id = c.id
            WHERE c.collection_id = ?
            ORDER BY c.rowid ASC
            "#,
        )
        .bind(&collection_id)
        .fetch_all(&pool)
        .await?;

        let mut ids = Vec::with_capacity(rows.len());
        let mut metadata = Vec::with_capacity(rows.len());
        let mut vectors: Vec<u8> = Vec::with_capacity(rows.len() * dims as usize * 4);
        for row in &rows {
            ids.push(row.get::<String, _>("id"));
            let json: String = row.get("metadata_json");
            metadata.push(serde_json::from_str::<serde_json::Value>(&json)?);
            vectors.extend_from_slice(&row.get::<Vec<u8>, _>("vector"));
        }

        let header = serde_json::json!({
            "collection": handle.collection,
            "model": model,
            "dims": dims,
            "elements": rows.len(),
            "persisted_at": chrono::Utc::now().to_rfc3339(),
        });

        let index_dir = self.database_dir(&handle.database).join(INDEX_DIR);
        std::fs::create_dir_all(&index_dir)
            .with_context(|| format!("Failed to create {}", index_dir.display()))?;
        let name = &handle.collection;
        write_artifact(&index_dir, &format!("{}.header.json", name), serde_json::to_vec_pretty(&header)?)?;
        write_artifact(&index_dir, &format!("{}.ids.json", name), serde_json::to_vec(&ids)?)?;
        write_artifact(&index_dir, &format!("{}.metadata.json", name), serde_json::to_vec(&metadata)?)?;
        write_artifact(&index_dir, &format!("{}.vectors.bin", name), vectors)?;

        tracing::info!(collection = %name, elements = rows.len(), "collection persisted");
        Ok(())
    }

    async fn snapshot_is_stale(&self, handle: &CollectionHandle) -> Result<bool> {
        let header_path = self
            .database_dir(&handle.database)
            .join(INDEX_DIR)
            .join(format!("{}.header.json", handle.collection));
        let snapshot_elements = match std::fs::read(&header_path) {
            Ok(bytes) => serde_json::from_slice::<serde_json::Value>(&bytes)
                .ok()
                .and_then(|header| header.get("elements").and_then(|e| e.as_i64())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", header_path.display()))
            }
        };

        let pool = self.pool(&handle.database).await?;
        let stored: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks c JOIN collections k ON k.id = c.collection_id WHERE k.name = ?",
        )
        .bind(&handle.collection)
        .fetch_one(&pool)
        .await?;

        Ok(snapshot_elements != Some(stored))
    }
}

/// Write through a temporary file so a crash never leaves a torn artifact.
fn write_artifact(dir: &Path, file_name: &str, bytes: Vec<u8>) -> Result<()> {
    let path = dir.join(file_name);
    let tmp = dir.join(format!("{}.tmp", file_name));
    std::fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::blob_to_vec;
    use crate::models::{RawDocument, SOURCE_KEY};
    use crate::reconcile::count_index_artifacts;
    use crate::store::testing::FakeEmbedder;
    use tempfile::TempDir;

    fn chunks_for(source: &str, n: usize) -> Vec<Chunk> {
        let doc = RawDocument::new(Path::new(source), "").with_metadata("format", "text");
        (0..n)
            .map(|i| Chunk {
                text: format!("text of {} number {}", source, i),
                source_path: doc.source_path.clone(),
                metadata: doc.metadata.clone(),
                sequence_index: i,
                hash: format!("h{}", i),
            })
            .collect()
    }

    #[tokio::test]
    async fn create_persist_then_exists() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteCollectionStore::new(tmp.path(), 2);
        let embedder = FakeEmbedder::new(3);

        assert!(!store.exists("papers").await.unwrap());
        let handle = store
            .create_from_chunks("papers", "papers", &chunks_for("/a.txt", 3), &embedder)
            .await
            .unwrap();
        // Database file alone is not enough.
        assert!(!store.exists("papers").await.unwrap());

        store.persist(&handle).await.unwrap();
        assert!(store.exists("papers").await.unwrap());

        let index = tmp.path().join("papers").join(INDEX_DIR);
        assert_eq!(count_index_artifacts(&index), 4);
        let blob = std::fs::read(index.join("papers.vectors.bin")).unwrap();
        assert_eq!(blob_to_vec(&blob).len(), 3 * 3);
        let header: serde_json::Value =
            serde_json::from_slice(&std::fs::read(index.join("papers.header.json")).unwrap())
                .unwrap();
        assert_eq!(header["elements"], 3);
        assert_eq!(header["model"], "fake");
        store.close().await;
    }

    #[tokio::test]
    async fn append_is_visible_in_metadata() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteCollectionStore::new(tmp.path(), 8);
        let embedder = FakeEmbedder::new(3);

        let handle = store
            .create_from_chunks("db", "docs", &chunks_for("/a.txt", 2), &embedder)
            .await
            .unwrap();
        let reopened = store.open("db", "docs", &embedder).await.unwrap();
        assert_eq!(reopened, handle);
        let added = store
            .add_chunks(&reopened, &chunks_for("/b.txt", 1), &embedder)
            .await
            .unwrap();
        assert_eq!(added, 1);

        let metadata = store.get_all_metadata(&handle).await.unwrap();
        assert_eq!(metadata.len(), 3);
        assert_eq!(metadata[0].get(SOURCE_KEY).map(String::as_str), Some("/a.txt"));
        assert_eq!(metadata[2].get(SOURCE_KEY).map(String::as_str), Some("/b.txt"));
        assert_eq!(metadata[2].get("format").map(String::as_str), Some("text"));
        store.close().await;
    }

    #[tokio::test]
    async fn create_replaces_same_named_collection() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteCollectionStore::new(tmp.path(), 8);
        let embedder = FakeEmbedder::new(3);

        store
            .create_from_chunks("db", "docs", &chunks_for("/old.txt", 4), &embedder)
            .await
            .unwrap();
        let handle = store
            .create_from_chunks("db", "docs", &chunks_for("/new.txt", 1), &embedder)
            .await
            .unwrap();

        let metadata = store.get_all_metadata(&handle).await.unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].get(SOURCE_KEY).map(String::as_str), Some("/new.txt"));
        store.close().await;
    }

    #[tokio::test]
    async fn snapshot_staleness_tracks_appends() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteCollectionStore::new(tmp.path(), 8);
        let embedder = FakeEmbedder::new(3);

        let handle = store
            .create_from_chunks("db", "docs", &chunks_for("/a.txt", 2), &embedder)
            .await
            .unwrap();
        assert!(store.snapshot_is_stale(&handle).await.unwrap());
        store.persist(&handle).await.unwrap();
        assert!(!store.snapshot_is_stale(&handle).await.unwrap());

        // A directory at the temp path makes the header write fail.
        let blocker = tmp.path().join("db").join(INDEX_DIR).join("docs.header.json.tmp");
        std::fs::create_dir_all(&blocker).unwrap();
        store
            .add_chunks(&handle, &chunks_for("/b.txt", 1), &embedder)
            .await
            .unwrap();
        assert!(store.persist(&handle).await.is_err());
        assert!(store.snapshot_is_stale(&handle).await.unwrap());

        std::fs::remove_dir(&blocker).unwrap();
        store.persist(&handle).await.unwrap();
        assert!(!store.snapshot_is_stale(&handle).await.unwrap());
        store.close().await;
    }

    #[tokio::test]
    async fn open_rejects_dimension_mismatch() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteCollectionStore::new(tmp.path(), 8);
        store.open("db", "docs", &FakeEmbedder::new(3)).await.unwrap();
        let err = store
            .open("db", "docs", &FakeEmbedder::new(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("3-dimensional"));
        store.close().await;
    }

    #[tokio::test]
    async fn add_to_missing_collection_fails() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteCollectionStore::new(tmp.path(), 8);
        let handle = CollectionHandle::new("db", "nope");
        assert!(store
            .add_chunks(&handle, &chunks_for("/a.txt", 1), &FakeEmbedder::new(3))
            .await
            .is_err());
        store.close().await;
    }
}
