//! Asynchronous task tracking.
//!
//! A task is created when an async step is accepted, completed once by the
//! deferred execution, and deleted by the first status read that observes
//! it done:
//!
//! ```text
//! create() ──▶ pending ──complete()──▶ done ──get_status()──▶ (deleted)
//!                 │                                    │
//!                 └── get_status() → Pending           └── get_status() → NotFound
//! ```
//!
//! There is no expiry. A task whose execution died before `complete` stays
//! pending; its `started` timestamp is the only signal.

pub mod store;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::TaskRecord;

use self::store::{FileTaskStore, InMemoryTaskStore, TaskStore};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no such task: {0}")]
    Missing(String),
    #[error("invalid task id: {0:?}")]
    InvalidId(String),
    #[error("task store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt task record: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Result of a status read.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Pending(TaskRecord),
    /// The record has been deleted as part of this read.
    Done(TaskRecord),
    NotFound,
}

#[derive(Clone)]
pub struct TaskRegistry {
    store: Arc<dyn TaskStore>,
}

impl TaskRegistry {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryTaskStore::new()))
    }

    /// Registry persisting one JSON file per task under `dir`.
    pub fn file_backed(dir: &Path) -> Result<Self, TaskError> {
        Ok(Self::new(Arc::new(FileTaskStore::new(dir)?)))
    }

    /// Persists a fresh pending record and returns it.
    pub async fn create(&self) -> Result<TaskRecord, TaskError> {
        let record = TaskRecord::pending(
            Uuid::new_v4().simple().to_string(),
            Utc::now().to_rfc3339(),
        );
        self.store.put(&record).await?;
        debug!(task_id = %record.task_id, "Task created");
        Ok(record)
    }

    /// Replaces the pending record with its completed form.
    ///
    /// Completing a task that does not exist is a bug in the caller; it is
    /// logged and returned as [`TaskError::Missing`], and no record is
    /// created.
    pub async fn complete(&self, task_id: &str, payload: Value) -> Result<TaskRecord, TaskError> {
        let Some(current) = self.store.get(task_id).await? else {
            error!(task_id, "complete() called for a task that does not exist");
            return Err(TaskError::Missing(task_id.to_string()));
        };
        let done = current.completed(payload);
        self.store.put(&done).await?;
        debug!(task_id, failed = done.error().is_some(), "Task completed");
        Ok(done)
    }

    /// Reads a task. A done record is removed by the same call, so it is
    /// returned at most once.
    pub async fn get_status(&self, task_id: &str) -> Result<TaskStatus, TaskError> {
        let record = match self.store.get(task_id).await {
            Ok(Some(record)) => record,
            Ok(None) | Err(TaskError::InvalidId(_)) => return Ok(TaskStatus::NotFound),
            Err(e) => return Err(e),
        };
        if !record.done {
            return Ok(TaskStatus::Pending(record));
        }
        match self.store.take(task_id).await? {
            Some(record) => Ok(TaskStatus::Done(record)),
            None => Ok(TaskStatus::NotFound),
        }
    }
}
