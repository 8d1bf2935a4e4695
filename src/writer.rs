use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

use crate::error::DownloadError;

/// Offset-addressed writer over one preallocated output file.
///
/// Concurrent callers on disjoint ranges never corrupt each other: the file
/// handle is locked only for the duration of one seek-and-write, and where to
/// write is decided entirely outside the lock.
pub struct FileWriter {
    file: Mutex<File>,
    written: AtomicU64,
}

impl FileWriter {
    /// Open (or create) the output file and grow it to `len` if needed.
    ///
    /// An existing larger-or-equal file is left alone so a resumed run keeps
    /// the bytes already on disk.
    pub async fn prepare(path: &Path, len: u64) -> Result<Self, DownloadError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(path)
            .await?;
        if file.metadata().await?.len() < len {
            file.set_len(len).await?;
        }
        Ok(Self {
            file: Mutex::new(file),
            written: AtomicU64::new(0),
        })
    }

    /// Write `buf` at `offset`, independent of any other writer's position.
    pub async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize, DownloadError> {
        {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(buf).await?;
        }
        self.written.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(buf.len())
    }

    /// Bytes written through this writer during this run.
    pub fn total_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub async fn sync(&self) -> Result<(), DownloadError> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}
