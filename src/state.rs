use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::chunk::{Chunk, ChunkSet};
use crate::error::DownloadError;

/// Serialized progress cursor for one part.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartRecord {
    pub index: usize,
    pub start: u64,
    pub current: u64,
    pub end: u64,
}

/// Durable snapshot of a run: total length plus every part's cursors.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DownloadState {
    pub file_length: u64,
    pub parts: Vec<PartRecord>,
}

impl DownloadState {
    pub fn from_chunks(chunks: &ChunkSet, file_length: u64) -> Self {
        Self {
            file_length,
            parts: chunks
                .iter()
                .map(|(index, c)| PartRecord {
                    index,
                    start: c.start,
                    current: c.current,
                    end: c.end,
                })
                .collect(),
        }
    }

    /// Rebuild the chunk collection, validating against the expected length.
    pub fn into_chunks(self, expected_length: u64) -> Result<ChunkSet, DownloadError> {
        if self.file_length != expected_length {
            return Err(DownloadError::CorruptState(format!(
                "stored length {} disagrees with remote length {}",
                self.file_length, expected_length
            )));
        }
        ChunkSet::from_parts(
            self.parts
                .into_iter()
                .map(|p| {
                    (
                        p.index,
                        Chunk {
                            start: p.start,
                            current: p.current,
                            end: p.end,
                        },
                    )
                })
                .collect(),
            expected_length,
        )
    }

    pub fn total_received(&self) -> u64 {
        self.parts.iter().map(|p| p.current - p.start).sum()
    }
}

/// The persisted state ledger: one JSON sibling per in-flight output file.
///
/// Updated after every successful positional write, so on a crash it only
/// ever records bytes that are actually on disk. Deleted once the download
/// completes.
#[derive(Debug, Clone)]
pub struct StateLedger {
    path: PathBuf,
}

impl StateLedger {
    /// Ledger path for an in-flight `.part` file: `<name>.part.json`.
    pub fn for_output(part_path: &Path) -> Self {
        let mut os: OsString = part_path.as_os_str().to_os_string();
        os.push(".json");
        Self {
            path: PathBuf::from(os),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Existence probe, used to decide whether resume is on offer.
    pub fn available(&self) -> bool {
        self.path.exists()
    }

    pub async fn save(&self, state: &DownloadState) -> Result<(), DownloadError> {
        let content = serde_json::to_string(state)?;
        fs::write(&self.path, content).await?;
        Ok(())
    }

    /// Load and validate a ledger for resuming.
    pub async fn load(&self, expected_length: u64) -> Result<ChunkSet, DownloadError> {
        let content = fs::read_to_string(&self.path).await.map_err(|e| {
            DownloadError::CorruptState(format!("cannot read {}: {e}", self.path.display()))
        })?;
        let state: DownloadState = serde_json::from_str(&content)
            .map_err(|e| DownloadError::CorruptState(format!("malformed ledger: {e}")))?;
        state.into_chunks(expected_length)
    }

    pub async fn remove(&self) -> Result<(), DownloadError> {
        if self.available() {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}
