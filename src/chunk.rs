//! Overlapping window text chunker.
//!
//! Splits a [`DocumentUnit`] into [`Chunk`]s of at most `chunk_size`
//! characters, each starting up to `chunk_overlap` characters before the end
//! of the previous one. Windows prefer to end on a line break, then on any
//! whitespace, as long as that keeps at least half a window; otherwise the
//! text is cut hard at `chunk_size`.
//!
//! Each chunk id is the SHA-256 of its text, so the same text always lands in
//! the same slot of the vector index no matter which run produced it.
//!
//! # Example
//!
//! ```rust
//! use proto_harness::chunk::chunk_unit;
//! use proto_harness::models::DocumentUnit;
//!
//! let unit = DocumentUnit::new("notes.txt", "Hello world.", 0);
//! let chunks = chunk_unit(&unit, 500, 50);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].metadata["chunk_index"], "0");
//! ```

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::models::{Chunk, DocumentUnit};

/// Split a unit into chunks. Empty or whitespace-only text yields no chunks.
pub fn chunk_unit(unit: &DocumentUnit, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    split_windows(&unit.text, chunk_size, chunk_overlap)
        .into_iter()
        .enumerate()
        .map(|(index, (start, text))| {
            let mut metadata: BTreeMap<String, String> = unit
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.flatten()))
                .collect();
            metadata.insert("chunk_index".to_string(), index.to_string());
            metadata.insert("chunk_start".to_string(), start.to_string());

            Chunk {
                id: content_hash(&text),
                source: unit.source.clone(),
                modified_at: unit.modified_at,
                text,
                metadata,
            }
        })
        .collect()
}

/// Hex SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Returns `(char offset, trimmed text)` for every non-empty window.
pub fn split_windows(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<(usize, String)> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let n = chars.len();
    let mut windows = Vec::new();
    if n == 0 || chunk_size == 0 {
        return windows;
    }

    let byte_at = |i: usize| if i < n { chars[i].0 } else { text.len() };

    let mut start = 0usize;
    loop {
        let hard_end = (start + chunk_size).min(n);
        let end = if hard_end < n {
            soft_break(&chars, start, hard_end, chunk_size).unwrap_or(hard_end)
        } else {
            n
        };

        let piece = text[byte_at(start)..byte_at(end)].trim();
        if !piece.is_empty() {
            windows.push((start, piece.to_string()));
        }
        if end >= n {
            break;
        }

        let back = end.saturating_sub(chunk_overlap);
        start = if back > start {
            word_start(&chars, back, end)
        } else {
            end
        };
    }

    windows
}

/// Last break position in the second half of `[start, hard_end)`, preferring
/// line breaks. The returned index is exclusive (just past the whitespace).
fn soft_break(
    chars: &[(usize, char)],
    start: usize,
    hard_end: usize,
    chunk_size: usize,
) -> Option<usize> {
    let floor = start + chunk_size / 2;
    if floor >= hard_end {
        return None;
    }
    let range = floor..hard_end;
    range
        .clone()
        .rev()
        .find(|&i| chars[i].1 == '\n')
        .or_else(|| range.rev().find(|&i| chars[i].1.is_whitespace()))
        .map(|i| i + 1)
}

/// Moves an overlap start forward to the next word boundary before `end`.
fn word_start(chars: &[(usize, char)], from: usize, end: usize) -> usize {
    if from == 0 || chars[from - 1].1.is_whitespace() {
        return from;
    }
    (from..end)
        .find(|&i| chars[i].1.is_whitespace())
        .map(|i| i + 1)
        .filter(|&i| i < end)
        .unwrap_or(from)
}
