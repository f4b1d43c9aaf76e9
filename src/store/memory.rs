//! In-memory [`VectorStore`] for tests and throwaway runs.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`; each stored chunk keeps the
//! sources that link to it. Search is brute-force cosine similarity. Every successful write is recorded in [`InMemoryVectorStore::writes`]
//! so tests can assert on batching.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::{cosine_similarity, embed_query, Embedder, HashEmbedder};
use crate::filter::IndexedSources;
use crate::models::{Chunk, SearchMatch};

use super::{distinct_chunks, validate_batch, StoreError, VectorStore};

/// Kind of a recorded write call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Create,
    Upsert,
}

struct StoredChunk {
    chunk: Chunk,
    vector: Vec<f32>,
    /// Linked sources and their modification times.
    owners: BTreeMap<String, i64>,
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub struct InMemoryVectorStore {
    embedder: Arc<dyn Embedder>,
    max_batch_size: usize,
    chunks: RwLock<HashMap<String, StoredChunk>>,
    initialized: RwLock<bool>,
    writes: RwLock<Vec<(WriteKind, usize)>>,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn Embedder>, max_batch_size: usize) -> Self {
        Self {
            embedder,
            max_batch_size,
            chunks: RwLock::new(HashMap::new()),
            initialized: RwLock::new(false),
            writes: RwLock::new(Vec::new()),
        }
    }

    /// Store with a 512-dimension [`HashEmbedder`].
    pub fn with_batch_size(max_batch_size: usize) -> Self {
        Self::new(Arc::new(HashEmbedder::new(512)), max_batch_size)
    }

    /// Successful write calls in order, with their batch sizes.
    pub fn writes(&self) -> Vec<(WriteKind, usize)> {
        read_lock(&self.writes).clone()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.chunks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read_lock(&self.chunks).keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn write(&self, batch: &[Chunk], kind: WriteKind) -> Result<(), StoreError> {
        validate_batch(batch, self.max_batch_size)?;
        let distinct = distinct_chunks(batch);
        let texts: Vec<String> = distinct.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .embedder
            .embed(&texts)
            .await
            .map_err(StoreError::embedding)?;

        let mut chunks = write_lock(&self.chunks);
        for (chunk, vector) in distinct.into_iter().zip(vectors) {
            chunks.entry(chunk.id.clone()).or_insert_with(|| StoredChunk {
                chunk: chunk.clone(),
                vector,
                owners: BTreeMap::new(),
            });
        }
        for chunk in batch {
            if let Some(stored) = chunks.get_mut(&chunk.id) {
                stored.owners.insert(chunk.source.clone(), chunk.modified_at);
            }
        }
        *write_lock(&self.initialized) = true;
        write_lock(&self.writes).push((kind, batch.len()));
        Ok(())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn exists(&self) -> Result<bool, StoreError> {
        Ok(*read_lock(&self.initialized) && !self.is_empty())
    }

    async fn create(&self, batch: &[Chunk]) -> Result<(), StoreError> {
        self.write(batch, WriteKind::Create).await
    }

    async fn upsert(&self, batch: &[Chunk]) -> Result<(), StoreError> {
        if !*read_lock(&self.initialized) {
            return Err(StoreError::NotInitialized);
        }
        self.write(batch, WriteKind::Upsert).await
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<SearchMatch>, StoreError> {
        let query_vec = embed_query(self.embedder.as_ref(), query)
            .await
            .map_err(StoreError::embedding)?;

        let chunks = read_lock(&self.chunks);
        let mut matches: Vec<SearchMatch> = chunks
            .values()
            .map(|sc| SearchMatch {
                id: sc.chunk.id.clone(),
                source: sc.owners.keys().next().cloned().unwrap_or_default(),
                text: sc.chunk.text.clone(),
                score: cosine_similarity(&query_vec, &sc.vector) as f64,
                metadata: sc.chunk.metadata.clone(),
            })
            .collect();
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
        let chunks = read_lock(&self.chunks);
        Ok(IndexedSources::from_pairs(chunks.values().flat_map(|sc| {
            sc.owners
                .iter()
                .map(|(source, modified_at)| (source.clone(), *modified_at))
        })))
    }

    async fn delete_source(&self, source: &str) -> Result<u64, StoreError> {
        let mut chunks = write_lock(&self.chunks);
        let mut unlinked = 0u64;
        chunks.retain(|_, sc| {
            if sc.owners.remove(source).is_some() {
                unlinked += 1;
            }
            !sc.owners.is_empty()
        });
        Ok(unlinked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_unit;
    use crate::models::DocumentUnit;

    fn chunks_of(source: &str, text: &str, modified_at: i64) -> Vec<Chunk> {
        chunk_unit(&DocumentUnit::new(source, text, modified_at), 500, 50)
    }

    #[tokio::test]
    async fn upsert_before_create_fails() {
        let store = InMemoryVectorStore::with_batch_size(10);
        let err = store
            .upsert(&chunks_of("a.txt", "hello", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotInitialized));
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn rejected_create_leaves_no_index() {
        let store = InMemoryVectorStore::with_batch_size(1);
        let mut batch = chunks_of("a.txt", "one", 1);
        batch.extend(chunks_of("b.txt", "two", 1));
        assert!(store.create(&batch).await.is_err());
        assert!(!store.exists().await.unwrap());
        assert!(store.writes().is_empty());
    }

    #[tokio::test]
    async fn search_ranks_by_similarity() {
        let store = InMemoryVectorStore::with_batch_size(10);
        let mut batch = chunks_of("pw.md", "reset your password from the login page", 1);
        batch.extend(chunks_of("bill.md", "invoices are sent monthly", 1));
        store.create(&batch).await.unwrap();

        let hits = store.search("password reset", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].source, "pw.md");
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn delete_source_and_snapshot() {
        let store = InMemoryVectorStore::with_batch_size(10);
        let mut batch = chunks_of("a.txt", "alpha text", 5);
        batch.extend(chunks_of("b.txt", "beta text", 7));
        store.create(&batch).await.unwrap();

        let snap = store.indexed_sources().await.unwrap();
        assert_eq!(snap.len(), 2);

        assert_eq!(store.delete_source("a.txt").await.unwrap(), 1);
        let snap = store.indexed_sources().await.unwrap();
        assert_eq!(snap.len(), 1);
    }

    #[tokio::test]
    async fn chunk_shared_by_two_sources_keeps_both_links() {
        let store = InMemoryVectorStore::with_batch_size(10);
        store.create(&chunks_of("a.txt", "shared footer", 1)).await.unwrap();
        store.upsert(&chunks_of("b.txt", "shared footer", 2)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.indexed_sources().await.unwrap().len(), 2);

        assert_eq!(store.delete_source("a.txt").await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        let hits = store.search("shared footer", 1).await.unwrap();
        assert_eq!(hits[0].source, "b.txt");

        store.delete_source("b.txt").await.unwrap();
        assert!(store.is_empty());
    }
}
