//! Core data models used throughout the harness.
//!
//! These types represent the document units, chunks, search matches and task
//! records that flow through the ingestion pipeline and the dispatcher.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A metadata value attached to a [`DocumentUnit`].
///
/// Loaders may produce list values (link lists, tags); the pipeline flattens
/// them to whitespace-joined text before anything reaches the vector store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Text(String),
    List(Vec<String>),
}

impl MetadataValue {
    /// Collapse the value into a single string.
    pub fn flatten(&self) -> String {
        match self {
            MetadataValue::Text(s) => s.clone(),
            MetadataValue::List(items) => items.join(" "),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<Vec<String>> for MetadataValue {
    fn from(value: Vec<String>) -> Self {
        MetadataValue::List(value)
    }
}

/// Normalized text produced by a loader from one source file.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentUnit {
    /// Path relative to the source root. Stable identity key.
    pub source: String,
    pub text: String,
    /// File modification time in milliseconds since the Unix epoch.
    pub modified_at: i64,
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl DocumentUnit {
    pub fn new(source: impl Into<String>, text: impl Into<String>, modified_at: i64) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
            modified_at,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A bounded-size segment of a document unit, the unit of storage in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// SHA-256 of `text`, hex encoded. Identical text always yields the same id.
    pub id: String,
    pub source: String,
    pub modified_at: i64,
    pub text: String,
    /// Flat string metadata inherited from the unit plus positional info.
    pub metadata: BTreeMap<String, String>,
}

/// A ranked result of a similarity search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub id: String,
    pub source: String,
    pub text: String,
    pub score: f64,
    pub metadata: BTreeMap<String, String>,
}

/// Keys owned by the task record itself; result payloads cannot override them.
const RESERVED_TASK_KEYS: [&str; 3] = ["done", "task_id", "started"];

/// Persisted state of an asynchronous task.
///
/// Serialized as a flat JSON object: `{done, task_id, started, ...result}`.
/// Result fields are only present once `done` is true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub done: bool,
    pub task_id: String,
    /// Creation time, RFC 3339.
    pub started: String,
    #[serde(flatten)]
    pub result: Map<String, Value>,
}

impl TaskRecord {
    pub fn pending(task_id: impl Into<String>, started: impl Into<String>) -> Self {
        Self {
            done: false,
            task_id: task_id.into(),
            started: started.into(),
            result: Map::new(),
        }
    }

    /// Returns the completed form of this record carrying `payload`.
    ///
    /// Object payloads are merged field by field; anything else is stored
    /// under a `result` key.
    pub fn completed(&self, payload: Value) -> Self {
        let mut result = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        for key in RESERVED_TASK_KEYS {
            result.remove(key);
        }
        Self {
            done: true,
            task_id: self.task_id.clone(),
            started: self.started.clone(),
            result,
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.result.get("error").and_then(|v| v.as_str())
    }
}
