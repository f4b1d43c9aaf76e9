//! Key-value storage for task records.
//!
//! Both backends replace whole records; no field is ever mutated in place.
//! [`TaskStore::take`] is the exactly-once primitive behind read-then-delete:
//! when two callers race on the same id, at most one of them gets the record.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::TaskRecord;

use super::TaskError;

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace the record under `record.task_id`.
    async fn put(&self, record: &TaskRecord) -> Result<(), TaskError>;
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError>;
    /// Remove and return the record in one step.
    async fn take(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError>;
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    records: Mutex<HashMap<String, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, TaskRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn put(&self, record: &TaskRecord) -> Result<(), TaskError> {
        self.records()
            .insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        Ok(self.records().get(task_id).cloned())
    }

    async fn take(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        Ok(self.records().remove(task_id))
    }
}

/// One `<task_id>.json` file per record.
///
/// Writes go to a temporary file that is renamed over the target, so readers
/// see either the old or the new record. `take` renames the file to a unique
/// claim name before reading it; only one rename of a given file can succeed.
pub struct FileTaskStore {
    dir: PathBuf,
}

impl FileTaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, TaskError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, task_id: &str) -> Result<PathBuf, TaskError> {
        let valid = !task_id.is_empty()
            && task_id.len() <= 64
            && task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(TaskError::InvalidId(task_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", task_id)))
    }

    async fn read_record(path: &Path) -> Result<Option<TaskRecord>, TaskError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn put(&self, record: &TaskRecord) -> Result<(), TaskError> {
        let path = self.record_path(&record.task_id)?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", record.task_id, Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, serde_json::to_vec(record)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        let path = self.record_path(task_id)?;
        Self::read_record(&path).await
    }

    async fn take(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        let path = self.record_path(task_id)?;
        let claim = self
            .dir
            .join(format!(".{}.{}.claim", task_id, Uuid::new_v4().simple()));
        match tokio::fs::rename(&path, &claim).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let record = Self::read_record(&claim).await;
        tokio::fs::remove_file(&claim).await?;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_store_put_get_take() {
        let tmp = TempDir::new().unwrap();
        let store = FileTaskStore::new(tmp.path()).unwrap();
        let rec = TaskRecord::pending("abc123", "2024-05-01T10:00:00+00:00");

        store.put(&rec).await.unwrap();
        assert!(tmp.path().join("abc123.json").is_file());
        assert_eq!(store.get("abc123").await.unwrap(), Some(rec.clone()));

        assert_eq!(store.take("abc123").await.unwrap(), Some(rec));
        assert_eq!(store.take("abc123").await.unwrap(), None);
        assert_eq!(store.get("abc123").await.unwrap(), None);
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn file_store_writes_flat_json() {
        let tmp = TempDir::new().unwrap();
        let store = FileTaskStore::new(tmp.path()).unwrap();
        let rec = TaskRecord::pending("t1", "2024-05-01T10:00:00+00:00")
            .completed(serde_json::json!({"answer": "42"}));
        store.put(&rec).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(tmp.path().join("t1.json")).unwrap()).unwrap();
        assert_eq!(raw["done"], serde_json::json!(true));
        assert_eq!(raw["answer"], serde_json::json!("42"));
    }

    #[tokio::test]
    async fn file_store_rejects_path_like_ids() {
        let tmp = TempDir::new().unwrap();
        let store = FileTaskStore::new(tmp.path()).unwrap();
        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(TaskError::InvalidId(_))
        ));
        assert!(matches!(store.get("").await, Err(TaskError::InvalidId(_))));
    }

    #[tokio::test]
    async fn concurrent_take_has_one_winner() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(FileTaskStore::new(tmp.path()).unwrap());
        store
            .put(&TaskRecord::pending("race", "t").completed(serde_json::json!({})))
            .await
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.take("race").await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn memory_store_take_removes() {
        let store = InMemoryTaskStore::new();
        store.put(&TaskRecord::pending("m1", "t")).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.take("m1").await.unwrap().is_some());
        assert!(store.is_empty());
        assert!(store.take("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_survives_a_panicking_holder() {
        let store = Arc::new(InMemoryTaskStore::new());
        store.put(&TaskRecord::pending("p1", "t")).await.unwrap();

        let poisoner = store.clone();
        let joined = std::thread::spawn(move || {
            let _guard = poisoner.records();
            panic!("holder died");
        })
        .join();
        assert!(joined.is_err());
        assert!(store.records.is_poisoned());

        store.put(&TaskRecord::pending("p2", "t")).await.unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.take("p1").await.unwrap().is_some());
    }
}
