//! SQLite-backed [`VectorStore`].
//!
//! One database file (`index.sqlite`) inside the index directory. Vectors are
//! stored as little-endian `f32` BLOBs next to the chunk text; search loads
//! all vectors and ranks them by cosine similarity in Rust. Which sources own
//! a chunk lives in `chunk_sources`, one row per `(chunk_id, source)`.
//!
//! Each write runs in a single transaction, so a failing batch never leaves
//! half its rows behind.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};

use crate::embedding::{blob_to_vec, cosine_similarity, embed_query, vec_to_blob, Embedder};
use crate::filter::IndexedSources;
use crate::models::{Chunk, SearchMatch};

use super::{distinct_chunks, validate_batch, StoreError, VectorStore};

pub const INDEX_FILE: &str = "index.sqlite";

pub struct SqliteVectorStore {
    pool: SqlitePool,
    embedder: Arc<dyn Embedder>,
    max_batch_size: usize,
}

impl SqliteVectorStore {
    /// Opens (creating the directory and database file if needed) the index
    /// under `dir`. Tables are only created by the first successful
    /// [`create`](VectorStore::create).
    pub async fn open(
        dir: &Path,
        embedder: Arc<dyn Embedder>,
        max_batch_size: usize,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(INDEX_FILE);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            embedder,
            max_batch_size,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn table_exists(&self) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Embeds each distinct id of `batch` once.
    async fn embed_batch<'a>(
        &self,
        batch: &'a [Chunk],
    ) -> Result<Vec<(&'a Chunk, Vec<f32>)>, StoreError> {
        let distinct = distinct_chunks(batch);
        let texts: Vec<String> = distinct.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .embedder
            .embed(&texts)
            .await
            .map_err(StoreError::embedding)?;
        if vectors.len() != distinct.len() {
            return Err(StoreError::Embedding(format!(
                "expected {} vectors, got {}",
                distinct.len(),
                vectors.len()
            )));
        }
        Ok(distinct.into_iter().zip(vectors).collect())
    }
}

async fn create_schema(tx: &mut Transaction<'_, Sqlite>) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_sources (
            chunk_id TEXT NOT NULL REFERENCES chunks(id),
            source TEXT NOT NULL,
            modified_at INTEGER NOT NULL,
            PRIMARY KEY (chunk_id, source)
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_sources_source ON chunk_sources(source)")
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Inserts new chunk rows (an existing id keeps its row) and links every
/// chunk of `batch` to its source.
async fn insert_rows(
    tx: &mut Transaction<'_, Sqlite>,
    batch: &[Chunk],
    embedded: &[(&Chunk, Vec<f32>)],
) -> Result<(), StoreError> {
    for (chunk, vector) in embedded {
        let metadata_json = serde_json::to_string(&chunk.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO chunks (id, text, metadata_json, embedding)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.text)
        .bind(metadata_json)
        .bind(vec_to_blob(vector))
        .execute(&mut **tx)
        .await?;
    }
    for chunk in batch {
        sqlx::query(
            r#"
            INSERT INTO chunk_sources (chunk_id, source, modified_at)
            VALUES (?, ?, ?)
            ON CONFLICT(chunk_id, source) DO UPDATE SET modified_at = excluded.modified_at
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.source)
        .bind(chunk.modified_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn exists(&self) -> Result<bool, StoreError> {
        if !self.table_exists().await? {
            return Ok(false);
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn create(&self, batch: &[Chunk]) -> Result<(), StoreError> {
        validate_batch(batch, self.max_batch_size)?;
        let embedded = self.embed_batch(batch).await?;

        let mut tx = self.pool.begin().await?;
        create_schema(&mut tx).await?;
        insert_rows(&mut tx, batch, &embedded).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert(&self, batch: &[Chunk]) -> Result<(), StoreError> {
        if !self.table_exists().await? {
            return Err(StoreError::NotInitialized);
        }
        validate_batch(batch, self.max_batch_size)?;
        let embedded = self.embed_batch(batch).await?;

        let mut tx = self.pool.begin().await?;
        insert_rows(&mut tx, batch, &embedded).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchMatch>, StoreError> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }
        let query_vec = embed_query(self.embedder.as_ref(), query)
            .await
            .map_err(StoreError::embedding)?;

        let rows = sqlx::query(
            r#"
            SELECT c.id, c.text, c.metadata_json, c.embedding,
                   (SELECT MIN(s.source) FROM chunk_sources s WHERE s.chunk_id = c.id) AS source
            FROM chunks c
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.get("embedding");
            let metadata_json: String = row.get("metadata_json");
            let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)?;
            matches.push(SearchMatch {
                id: row.get("id"),
                source: row.get::<Option<String>, _>("source").unwrap_or_default(),
                text: row.get("text"),
                score: cosine_similarity(&query_vec, &blob_to_vec(&blob)) as f64,
                metadata,
            });
        }

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(k);
        Ok(matches)
    }

    async fn indexed_sources(&self) -> Result<IndexedSources, StoreError> {
        if !self.table_exists().await? {
            return Ok(IndexedSources::new());
        }
        let rows = sqlx::query(
            "SELECT source, MAX(modified_at) AS modified_at FROM chunk_sources GROUP BY source",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(IndexedSources::from_pairs(
            rows.iter()
                .map(|row| (row.get::<String, _>("source"), row.get::<i64, _>("modified_at"))),
        ))
    }

    async fn delete_source(&self, source: &str) -> Result<u64, StoreError> {
        if !self.table_exists().await? {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let unlinked = sqlx::query("DELETE FROM chunk_sources WHERE source = ?")
            .bind(source)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query(
            r#"
            DELETE FROM chunks
            WHERE NOT EXISTS (SELECT 1 FROM chunk_sources s WHERE s.chunk_id = chunks.id)
            "#,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(unlinked)
    }
}
