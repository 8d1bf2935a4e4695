use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DownloadError;

/// One contiguous byte range of the target file, assigned to one part.
///
/// Half-open semantics: the part owns `[start, end)`; `current` is the next
/// unwritten offset, so `start <= current <= end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub start: u64,
    pub current: u64,
    pub end: u64,
}

impl Chunk {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            current: start,
            end,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn received(&self) -> u64 {
        self.current - self.start
    }

    pub fn remaining(&self) -> u64 {
        self.end - self.current
    }

    pub fn is_complete(&self) -> bool {
        self.current == self.end
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.current && self.current <= self.end
    }
}

/// Outcome of a redistribution: `[mid, end)` was carved off `victim` and
/// handed to the freshly indexed `new_index`.
#[derive(Debug, Clone, Copy)]
pub struct Steal {
    pub victim: usize,
    pub new_index: usize,
    pub mid: u64,
    pub end: u64,
}

/// Mapping from stable part index to chunk.
///
/// Invariant: the union of all chunk ranges covers `[0, file_length)` with no
/// gap and no overlap, at all times. Redistribution only moves the boundary
/// between a shrunken chunk and the new tail chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkSet {
    chunks: BTreeMap<usize, Chunk>,
    next_index: usize,
}

impl ChunkSet {
    /// Partition `[0, file_length)` into `parts` contiguous ranges.
    ///
    /// Every part gets `file_length / parts` bytes; the last part absorbs the
    /// remainder. `parts == 1` degenerates to a plain sequential download.
    pub fn split(file_length: u64, parts: usize) -> Self {
        let parts = parts.max(1);
        let base = file_length / parts as u64;

        let mut chunks = BTreeMap::new();
        for i in 0..parts {
            let start = i as u64 * base;
            let end = if i == parts - 1 {
                file_length
            } else {
                (i as u64 + 1) * base
            };
            chunks.insert(i, Chunk::new(start, end));
        }

        Self {
            chunks,
            next_index: parts,
        }
    }

    /// Rebuild a set from persisted parts, validating the partition.
    pub fn from_parts(
        parts: Vec<(usize, Chunk)>,
        file_length: u64,
    ) -> Result<Self, DownloadError> {
        let mut chunks = BTreeMap::new();
        for (index, chunk) in parts {
            if !chunk.is_valid() {
                return Err(DownloadError::CorruptState(format!(
                    "part {index} cursor out of range: {chunk:?}"
                )));
            }
            if chunks.insert(index, chunk).is_some() {
                return Err(DownloadError::CorruptState(format!(
                    "duplicate part index {index}"
                )));
            }
        }

        let set = Self {
            next_index: chunks.keys().max().map_or(0, |max| max + 1),
            chunks,
        };
        if !set.covers_exactly(file_length) {
            return Err(DownloadError::CorruptState(
                "chunk ranges do not partition the file".into(),
            ));
        }
        Ok(set)
    }

    pub fn get(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Chunk)> {
        self.chunks.iter().map(|(i, c)| (*i, c))
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Advance a part's cursor after `n` bytes were written at `current`.
    pub fn advance(&mut self, index: usize, n: u64) {
        if let Some(chunk) = self.chunks.get_mut(&index) {
            debug_assert!(chunk.current + n <= chunk.end);
            chunk.current = (chunk.current + n).min(chunk.end);
        }
    }

    pub fn total_received(&self) -> u64 {
        self.chunks.values().map(Chunk::received).sum()
    }

    pub fn total_length(&self) -> u64 {
        self.chunks.values().map(Chunk::len).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.values().all(Chunk::is_complete)
    }

    /// Carve the tail half off the chunk with the largest remaining range.
    ///
    /// Returns `None` when no chunk has at least `2 * min_bytes` left, which
    /// keeps finished connections from thrashing on tiny remainders.
    pub fn steal(&mut self, min_bytes: u64) -> Option<Steal> {
        let min_bytes = min_bytes.max(1);
        let victim = self
            .chunks
            .iter()
            .max_by_key(|(_, c)| c.remaining())
            .map(|(i, _)| *i)?;

        let chunk = self.chunks.get_mut(&victim)?;
        let remaining = chunk.remaining();
        if remaining < min_bytes.saturating_mul(2) {
            return None;
        }

        let mid = chunk.current + remaining / 2;
        let end = chunk.end;
        chunk.end = mid;

        let new_index = self.next_index;
        self.next_index += 1;
        self.chunks.insert(new_index, Chunk::new(mid, end));

        Some(Steal {
            victim,
            new_index,
            mid,
            end,
        })
    }

    /// Whether the chunk ranges cover `[0, file_length)` exactly once.
    pub fn covers_exactly(&self, file_length: u64) -> bool {
        let mut ranges: Vec<(u64, u64)> = self.chunks.values().map(|c| (c.start, c.end)).collect();
        ranges.sort_unstable();

        let mut cursor = 0u64;
        for (start, end) in ranges {
            if start != cursor || end < start {
                return false;
            }
            cursor = end;
        }
        cursor == file_length
    }
}
