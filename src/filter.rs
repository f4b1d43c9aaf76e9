//! Modification-time change detection.
//!
//! Before loading, the pipeline asks the vector store which sources it has
//! already indexed and when each was last modified. A candidate whose current
//! modification time equals the indexed value is skipped; this keeps re-runs
//! over an unchanged corpus free of embedding cost.

use std::collections::HashMap;

/// How a candidate file relates to what is already indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Never indexed.
    New,
    /// Indexed, but the file has been modified since. Its old chunks must be
    /// replaced.
    Changed,
    /// Indexed with the same modification time. Skip.
    Unchanged,
}

/// Snapshot of `(source, modified_at)` pairs currently in the index.
#[derive(Debug, Clone, Default)]
pub struct IndexedSources {
    entries: HashMap<String, i64>,
}

impl IndexedSources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from store rows. When a source appears more than once, the most
    /// recent modification time wins.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, i64)>,
    {
        let mut entries: HashMap<String, i64> = HashMap::new();
        for (source, modified_at) in pairs {
            entries
                .entry(source)
                .and_modify(|m| *m = (*m).max(modified_at))
                .or_insert(modified_at);
        }
        Self { entries }
    }

    pub fn classify(&self, source: &str, modified_at: i64) -> Freshness {
        match self.entries.get(source) {
            None => Freshness::New,
            Some(&indexed) if indexed == modified_at => Freshness::Unchanged,
            Some(_) => Freshness::Changed,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Modification time of `path` in milliseconds since the Unix epoch.
pub fn modified_millis(path: &std::path::Path) -> std::io::Result<i64> {
    let modified = std::fs::metadata(path)?
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    Ok(modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default())
}
