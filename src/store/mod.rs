//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is everything the ingestion pipeline and the
//! retrieval workflows need from an index: bootstrap, batched upsert,
//! similarity search, and the `(source, modified_at)` snapshot used for
//! change detection.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`sqlite::SqliteVectorStore`] | persisted index under a client's `db/` directory |
//! | [`memory::InMemoryVectorStore`] | tests and throwaway runs |
//!
//! Every batch passes through [`validate_batch`] before anything is written,
//! so an invalid batch never leaves a partial write behind.
//!
//! A chunk row is keyed by its content hash and may belong to several
//! sources. Ownership is tracked per `(chunk id, source)` link: change
//! detection reads the links, and a chunk row is dropped only once its last
//! link is gone.

pub mod memory;
pub mod sqlite;

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::filter::IndexedSources;
use crate::models::{Chunk, SearchMatch};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The batch was rejected before any write happened.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),
    #[error("index does not exist yet; create it with a first batch")]
    NotInitialized,
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl StoreError {
    pub fn embedding(err: anyhow::Error) -> Self {
        StoreError::Embedding(format!("{:#}", err))
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Largest batch accepted by [`create`](VectorStore::create) and
    /// [`upsert`](VectorStore::upsert).
    fn max_batch_size(&self) -> usize;

    /// Whether an index with at least one chunk is present.
    async fn exists(&self) -> Result<bool, StoreError>;

    /// Bootstrap the index from its first batch. Nothing is persisted if the
    /// batch is rejected, so the caller may retry with the next one.
    async fn create(&self, batch: &[Chunk]) -> Result<(), StoreError>;

    /// Insert chunks keyed by id and link each to its source. Requires an
    /// existing index.
    async fn upsert(&self, batch: &[Chunk]) -> Result<(), StoreError>;

    /// Top `k` chunks by similarity to `query`, best first.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchMatch>, StoreError>;

    async fn indexed_sources(&self) -> Result<IndexedSources, StoreError>;

    /// Unlink every chunk from `source`, dropping chunks no other source
    /// still links to. Returns the number of links removed.
    async fn delete_source(&self, source: &str) -> Result<u64, StoreError>;
}

/// Checks a batch against the store's limits. Rejects empty batches,
/// oversized batches, blank chunk text and repeated `(id, source)` pairs.
pub fn validate_batch(batch: &[Chunk], max_batch_size: usize) -> Result<(), StoreError> {
    if batch.is_empty() {
        return Err(StoreError::InvalidBatch("empty batch".to_string()));
    }
    if batch.len() > max_batch_size {
        return Err(StoreError::InvalidBatch(format!(
            "batch of {} exceeds max batch size {}",
            batch.len(),
            max_batch_size
        )));
    }
    let mut seen = HashSet::with_capacity(batch.len());
    for chunk in batch {
        if chunk.text.trim().is_empty() {
            return Err(StoreError::InvalidBatch(format!(
                "chunk {} from {} has no text",
                chunk.id, chunk.source
            )));
        }
        if !seen.insert((chunk.id.as_str(), chunk.source.as_str())) {
            return Err(StoreError::InvalidBatch(format!(
                "duplicate chunk id {} for {}",
                chunk.id, chunk.source
            )));
        }
    }
    Ok(())
}

/// First chunk of every distinct id in `batch`; only these need embedding.
pub fn distinct_chunks(batch: &[Chunk]) -> Vec<&Chunk> {
    let mut seen = HashSet::with_capacity(batch.len());
    batch
        .iter()
        .filter(|chunk| seen.insert(chunk.id.as_str()))
        .collect()
}
