//! Ingestion pipeline orchestration.
//!
//! Coordinates a full ingest run for one client:
//! discover → change detection → parallel load → normalize → chunk →
//! dedupe → batched write.
//!
//! Files whose modification time matches the index are skipped before any
//! loading happens. A file that fails to load is logged with its path and
//! counted; it never aborts the run. A batch the store rejects is logged and
//! skipped; the next batch is still written.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chunk::chunk_unit;
use crate::config::{Config, IngestConfig};
use crate::embedding::create_embedder;
use crate::extract::ExtractError;
use crate::filter::{modified_millis, Freshness};
use crate::loader::{relative_source, LoadError, LoaderMapping};
use crate::models::{Chunk, DocumentUnit};
use crate::progress::{IngestProgressEvent, IngestProgressReporter};
use crate::store::sqlite::SqliteVectorStore;
use crate::store::{StoreError, VectorStore};

/// Counters for one ingest run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Files with a supported extension.
    pub discovered: usize,
    /// Files ignored because no loader handles their extension.
    pub unsupported: usize,
    /// Supported files skipped because the index already has them.
    pub unchanged: usize,
    pub loaded: usize,
    pub failed: usize,
    /// Previously indexed sources whose old chunks were replaced.
    pub replaced: usize,
    pub units: usize,
    pub chunks: usize,
    /// Whether this run bootstrapped a new index.
    pub created: bool,
    pub batches_written: usize,
    pub batches_failed: usize,
    pub chunks_written: usize,
}

/// Supported files under a root, sorted, plus the count of everything else.
#[derive(Debug, Default)]
pub struct Discovery {
    pub files: Vec<PathBuf>,
    pub unsupported: usize,
}

pub fn discover(root: &Path, mapping: &LoaderMapping) -> Result<Discovery> {
    if !root.exists() {
        bail!("Source directory does not exist: {}", root.display());
    }
    let supported = mapping.globset()?;

    let mut discovery = Discovery::default();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative_source(root, entry.path());
        if supported.is_match(&rel) {
            discovery.files.push(entry.into_path());
        } else {
            discovery.unsupported += 1;
        }
    }
    discovery.files.sort();
    Ok(discovery)
}

/// Runs the pipeline over `root` into `store`.
pub async fn ingest_dir(
    store: &dyn VectorStore,
    root: &Path,
    mapping: &LoaderMapping,
    settings: &IngestConfig,
    client: &str,
    progress: &dyn IngestProgressReporter,
) -> Result<IngestReport> {
    progress.report(IngestProgressEvent::Discovering {
        client: client.to_string(),
    });
    let discovery = discover(root, mapping)?;
    let mut report = IngestReport {
        discovered: discovery.files.len(),
        unsupported: discovery.unsupported,
        ..Default::default()
    };

    let indexed = store.indexed_sources().await?;
    let mut candidates = Vec::new();
    let mut changed: HashSet<String> = HashSet::new();
    for path in discovery.files {
        let source = relative_source(root, &path);
        let modified_at = match modified_millis(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot stat file, skipping");
                report.failed += 1;
                continue;
            }
        };
        match indexed.classify(&source, modified_at) {
            Freshness::Unchanged => report.unchanged += 1,
            Freshness::Changed => {
                changed.insert(source);
                candidates.push(path);
            }
            Freshness::New => candidates.push(path),
        }
    }
    debug!(
        candidates = candidates.len(),
        unchanged = report.unchanged,
        "change detection done"
    );

    let (mut units, loaded_sources) =
        load_all(root, mapping, candidates, settings.effective_workers(), client, progress, &mut report)
            .await;
    if units.is_empty() && changed.is_empty() {
        info!(client, "No new documents to load");
        return Ok(report);
    }

    // Units arrive in completion order; sort for deterministic chunk order.
    units.sort_by(|a, b| a.source.cmp(&b.source));
    report.units = units.len();

    let chunks = chunk_and_dedupe(&units, settings.chunk_size, settings.chunk_overlap);
    report.chunks = chunks.len();
    info!(
        client,
        units = report.units,
        chunks = report.chunks,
        chunk_size = settings.chunk_size,
        "Split documents into chunks"
    );

    let mut replaced: Vec<&String> = changed.intersection(&loaded_sources).collect();
    replaced.sort();
    for source in replaced {
        let removed = store.delete_source(source).await?;
        debug!(source = %source, removed, "Replaced changed source");
        report.replaced += 1;
    }

    write_batches(store, &chunks, client, progress, &mut report).await?;
    info!(
        client,
        written = report.chunks_written,
        batches = report.batches_written,
        failed_batches = report.batches_failed,
        "Ingest complete"
    );
    Ok(report)
}

/// Loads every candidate with at most `workers` files in flight. Returns the
/// units and the set of sources that loaded successfully.
async fn load_all(
    root: &Path,
    mapping: &LoaderMapping,
    candidates: Vec<PathBuf>,
    workers: usize,
    client: &str,
    progress: &dyn IngestProgressReporter,
    report: &mut IngestReport,
) -> (Vec<DocumentUnit>, HashSet<String>) {
    let total = candidates.len() as u64;
    let mapping = Arc::new(mapping.clone());
    let root = Arc::new(root.to_path_buf());

    let mut results = stream::iter(candidates.into_iter().map(|path| {
        let mapping = mapping.clone();
        let root = root.clone();
        async move {
            let task_path = path.clone();
            let task_root = root.clone();
            let result =
                tokio::task::spawn_blocking(move || mapping.load_file(&task_root, &task_path))
                    .await
                    .unwrap_or_else(|join_err| {
                        Err(LoadError {
                            path: path.clone(),
                            source: ExtractError::Io(std::io::Error::other(format!(
                                "loader crashed: {}",
                                join_err
                            ))),
                        })
                    });
            (relative_source(&root, &path), result)
        }
    }))
    .buffer_unordered(workers.max(1));

    let mut units = Vec::new();
    let mut loaded = HashSet::new();
    let mut n = 0u64;
    while let Some((source, result)) = results.next().await {
        n += 1;
        match result {
            Ok(file_units) => {
                report.loaded += 1;
                loaded.insert(source);
                units.extend(file_units);
            }
            Err(e) => {
                warn!(path = %e.path.display(), error = %e.source, "Failed to load document, skipping");
                report.failed += 1;
            }
        }
        progress.report(IngestProgressEvent::Loading {
            client: client.to_string(),
            n,
            total,
        });
    }
    (units, loaded)
}

/// Chunks every unit (metadata lists are flattened on the way) and drops
/// chunks a source repeats, keeping the first occurrence. Text shared by
/// different sources is kept once per source so each one links to it.
pub fn chunk_and_dedupe(units: &[DocumentUnit], chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    let mut seen = HashSet::new();
    units
        .iter()
        .flat_map(|unit| chunk_unit(unit, chunk_size, chunk_overlap))
        .filter(|chunk| seen.insert((chunk.source.clone(), chunk.id.clone())))
        .collect()
}

/// Splits `chunks` into batches of at most `store.max_batch_size()` and
/// writes them in order.
///
/// Without an existing index the first batches go through `create` until
/// one succeeds; the rest are upserted. Rejected batches are logged and
/// skipped.
pub async fn write_batches(
    store: &dyn VectorStore,
    chunks: &[Chunk],
    client: &str,
    progress: &dyn IngestProgressReporter,
    report: &mut IngestReport,
) -> Result<()> {
    if chunks.is_empty() {
        return Ok(());
    }
    let total = chunks.len() as u64;
    let mut batches = chunks.chunks(store.max_batch_size().max(1)).enumerate();
    let mut written = 0u64;

    let mut ready = store.exists().await?;
    if !ready {
        info!(client, "Creating new vector index");
        for (i, batch) in batches.by_ref() {
            match store.create(batch).await {
                Ok(()) => {
                    ready = true;
                    report.created = true;
                    record_batch(batch, &mut written, report);
                    break;
                }
                Err(StoreError::InvalidBatch(reason)) => {
                    warn!(batch = i, size = batch.len(), %reason, "First batch rejected, trying next");
                    report.batches_failed += 1;
                }
                Err(e) => return Err(e).context("Failed to create vector index"),
            }
            progress.report(IngestProgressEvent::Writing {
                client: client.to_string(),
                n: written,
                total,
            });
        }
        if !ready {
            warn!(client, "No valid batch; index was not created");
            return Ok(());
        }
    } else {
        info!(client, "Appending to existing vector index");
    }

    for (i, batch) in batches {
        match store.upsert(batch).await {
            Ok(()) => record_batch(batch, &mut written, report),
            Err(StoreError::InvalidBatch(reason)) => {
                warn!(batch = i, size = batch.len(), %reason, "Batch rejected, skipping");
                report.batches_failed += 1;
            }
            Err(e) => return Err(e).context("Failed to write batch"),
        }
        progress.report(IngestProgressEvent::Writing {
            client: client.to_string(),
            n: written,
            total,
        });
    }
    Ok(())
}

fn record_batch(batch: &[Chunk], written: &mut u64, report: &mut IngestReport) {
    *written += batch.len() as u64;
    report.batches_written += 1;
    report.chunks_written += batch.len();
}

/// `proto ingest <client> [--reset]`.
pub async fn run_ingest(
    config: &Config,
    client: &str,
    reset: bool,
    progress: &dyn IngestProgressReporter,
) -> Result<IngestReport> {
    let store_path = config.store_path(client);
    if reset && store_path.exists() {
        info!(path = %store_path.display(), "Resetting vector index");
        std::fs::remove_dir_all(&store_path)
            .with_context(|| format!("Failed to remove {}", store_path.display()))?;
    }

    let store = open_store(config, client).await?;
    let source_dir = config.source_dir(client);
    info!(client, source = %source_dir.display(), "Loading documents");

    let result = ingest_dir(
        &store,
        &source_dir,
        &LoaderMapping::with_defaults(),
        &config.ingest,
        client,
        progress,
    )
    .await;
    store.close().await;
    result
}

/// Opens the persisted index of `client` with the configured embedder.
pub async fn open_store(config: &Config, client: &str) -> Result<SqliteVectorStore> {
    let embedder = create_embedder(&config.embedding)?;
    let store_path = config.store_path(client);
    SqliteVectorStore::open(&store_path, Arc::from(embedder), config.store.max_batch_size)
        .await
        .with_context(|| format!("Failed to open vector index at {}", store_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::store::memory::{InMemoryVectorStore, WriteKind};
    use tempfile::TempDir;

    fn settings() -> IngestConfig {
        IngestConfig {
            workers: 2,
            ..Default::default()
        }
    }

    fn corpus() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("guides")).unwrap();
        std::fs::write(root.join("a.txt"), "Alpha document about domains.").unwrap();
        std::fs::write(root.join("guides/b.md"), "# Mail\nConfigure your mailbox.").unwrap();
        std::fs::write(root.join("C.TXT"), "Upper case extension.").unwrap();
        std::fs::write(root.join("logo.png"), [0u8, 1, 2]).unwrap();
        std::fs::write(root.join("notes.rtf"), "{\\rtf1}").unwrap();
        tmp
    }

    fn chunk(text: &str) -> Chunk {
        chunk_unit(&DocumentUnit::new("x.txt", text, 0), 500, 50).remove(0)
    }

    #[test]
    fn discover_counts_supported_and_unsupported() {
        let tmp = corpus();
        let d = discover(tmp.path(), &LoaderMapping::with_defaults()).unwrap();
        assert_eq!(d.files.len(), 3);
        assert_eq!(d.unsupported, 2);
    }

    #[test]
    fn discover_missing_root_is_error() {
        assert!(discover(Path::new("/definitely/not/here"), &LoaderMapping::with_defaults()).is_err());
    }

    #[tokio::test]
    async fn batches_respect_limit() {
        let store = InMemoryVectorStore::with_batch_size(3);
        let chunks: Vec<Chunk> = (0..10).map(|i| chunk(&format!("text {}", i))).collect();
        let mut report = IngestReport::default();
        write_batches(&store, &chunks, "t", &NoProgress, &mut report)
            .await
            .unwrap();

        let writes = store.writes();
        assert_eq!(writes.len(), 4);
        assert_eq!(writes[0], (WriteKind::Create, 3));
        assert!(writes[1..].iter().all(|(k, n)| *k == WriteKind::Upsert && *n <= 3));
        assert_eq!(report.chunks_written, 10);
        assert!(report.created);
    }

    #[tokio::test]
    async fn rejected_first_batch_retries_create() {
        let store = InMemoryVectorStore::with_batch_size(2);
        let mut bad = chunk("bad");
        bad.text = " ".to_string();
        let chunks = vec![bad, chunk("one"), chunk("two"), chunk("three")];
        let mut report = IngestReport::default();
        write_batches(&store, &chunks, "t", &NoProgress, &mut report)
            .await
            .unwrap();

        assert_eq!(report.batches_failed, 1);
        assert_eq!(
            store.writes(),
            vec![(WriteKind::Create, 2)]
        );
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn reingest_unchanged_writes_nothing() {
        let tmp = corpus();
        let store = InMemoryVectorStore::with_batch_size(100);
        let mapping = LoaderMapping::with_defaults();

        let first = ingest_dir(&store, tmp.path(), &mapping, &settings(), "t", &NoProgress)
            .await
            .unwrap();
        assert_eq!(first.loaded, 3);
        assert!(first.created);
        let writes_after_first = store.writes().len();
        let ids = store.ids();

        let second = ingest_dir(&store, tmp.path(), &mapping, &settings(), "t", &NoProgress)
            .await
            .unwrap();
        assert_eq!(second.unchanged, 3);
        assert_eq!(second.chunks_written, 0);
        assert_eq!(store.writes().len(), writes_after_first);
        assert_eq!(store.ids(), ids);
    }

    #[tokio::test]
    async fn changed_source_is_replaced() {
        let tmp = corpus();
        let store = InMemoryVectorStore::with_batch_size(100);
        let mapping = LoaderMapping::with_defaults();
        ingest_dir(&store, tmp.path(), &mapping, &settings(), "t", &NoProgress)
            .await
            .unwrap();

        let path = tmp.path().join("a.txt");
        std::fs::write(&path, "Completely rewritten alpha content.").unwrap();
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let report = ingest_dir(&store, tmp.path(), &mapping, &settings(), "t", &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(report.loaded, 1);
        assert_eq!(report.unchanged, 2);

        let hits = store.search("rewritten alpha", 10).await.unwrap();
        let alpha: Vec<_> = hits.iter().filter(|m| m.source == "a.txt").collect();
        assert_eq!(alpha.len(), 1);
        assert!(alpha[0].text.contains("rewritten"));
    }

    #[tokio::test]
    async fn broken_file_does_not_abort_run() {
        let tmp = corpus();
        std::fs::write(tmp.path().join("broken.pdf"), b"not really a pdf").unwrap();
        let store = InMemoryVectorStore::with_batch_size(100);
        let report = ingest_dir(
            &store,
            tmp.path(),
            &LoaderMapping::with_defaults(),
            &settings(),
            "t",
            &NoProgress,
        )
        .await
        .unwrap();
        assert_eq!(report.discovered, 4);
        assert_eq!(report.failed, 1);
        assert_eq!(report.loaded, 3);
        assert!(store.exists().await.unwrap());
    }

    #[test]
    fn repeated_text_is_kept_once_per_source() {
        let units = vec![
            DocumentUnit::new("a.txt", "same words", 0),
            DocumentUnit::new("a.txt", "same words", 0),
            DocumentUnit::new("b.txt", "same words", 0),
        ];
        let chunks = chunk_and_dedupe(&units, 500, 50);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].source, "a.txt");
        assert_eq!(chunks[1].source, "b.txt");
        assert_eq!(chunks[0].id, chunks[1].id);
    }

    fn small_windows() -> IngestConfig {
        IngestConfig {
            workers: 2,
            chunk_size: 20,
            chunk_overlap: 0,
            ..Default::default()
        }
    }

    fn touch_later(path: &Path) {
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(later)
            .unwrap();
    }

    #[tokio::test]
    async fn identical_files_stay_unchanged_across_runs() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "identical body").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "identical body").unwrap();
        let store = InMemoryVectorStore::with_batch_size(100);
        let mapping = LoaderMapping::with_defaults();

        let first = ingest_dir(&store, tmp.path(), &mapping, &settings(), "t", &NoProgress)
            .await
            .unwrap();
        assert_eq!(first.loaded, 2);
        assert_eq!(store.len(), 1);

        for _ in 0..3 {
            let again = ingest_dir(&store, tmp.path(), &mapping, &settings(), "t", &NoProgress)
                .await
                .unwrap();
            assert_eq!(again.unchanged, 2);
            assert_eq!(again.loaded, 0);
            assert_eq!(again.chunks_written, 0);
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn replacing_one_source_keeps_shared_chunks_of_another() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.txt");
        std::fs::write(&a, "alpha intro line\nshared footer text").unwrap();
        std::fs::write(tmp.path().join("b.txt"), "bravo intro line\nshared footer text").unwrap();
        let store = InMemoryVectorStore::with_batch_size(100);
        let mapping = LoaderMapping::with_defaults();

        ingest_dir(&store, tmp.path(), &mapping, &small_windows(), "t", &NoProgress)
            .await
            .unwrap();
        let footer = crate::chunk::content_hash("shared footer text");
        assert_eq!(store.len(), 3);
        assert!(store.ids().contains(&footer));

        std::fs::write(&a, "alpha was rewritten").unwrap();
        touch_later(&a);
        let report = ingest_dir(&store, tmp.path(), &mapping, &small_windows(), "t", &NoProgress)
            .await
            .unwrap();
        assert_eq!(report.replaced, 1);
        assert_eq!(report.unchanged, 1);

        assert!(store.ids().contains(&footer));
        assert!(!store.ids().contains(&crate::chunk::content_hash("alpha intro line")));
        let hits = store.search("shared footer text", 1).await.unwrap();
        assert_eq!(hits[0].id, footer);
        assert_eq!(hits[0].source, "b.txt");

        let settled = ingest_dir(&store, tmp.path(), &mapping, &small_windows(), "t", &NoProgress)
            .await
            .unwrap();
        assert_eq!(settled.unchanged, 2);
        assert_eq!(settled.chunks_written, 0);
    }
}
