//! Per-file handle management.
//!
//! A [`FileHandle`] wraps one open file exposed to a remote peer. Every
//! operation takes the handle's mutex for its full duration, so read, write,
//! stat, and close on the same handle never interleave their OS-level I/O.
//! Handles opened on the same underlying path by different sessions share
//! nothing; those races resolve at the OS level, last writer wins.

use crate::error::{Error, Result};
use crate::vfs::FileAttributes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Open disposition selected from the peer's requested flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only.
    Read,
    /// Read and write without truncation; preserves existing content for
    /// partial overwrites.
    ReadWrite,
    /// Create (parents included), truncating any existing content.
    CreateTruncate,
    /// Append; writes always land at end-of-file regardless of offset.
    Append,
}

/// One open file, serialized behind a single lock.
pub struct FileHandle {
    path: PathBuf,
    mode: OpenMode,
    file: Mutex<File>,
}

impl FileHandle {
    pub(crate) fn new(path: PathBuf, mode: OpenMode, file: File) -> Self {
        Self {
            path,
            mode,
            file: Mutex::new(file),
        }
    }

    /// Real path backing this handle.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mode the handle was opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Seek to `offset` and write all of `data`, then flush to stable
    /// storage before reporting success.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::from_io(e, &self.path.display().to_string()))?;
        file.write_all(data)
            .await
            .map_err(|e| Error::from_io(e, &self.path.display().to_string()))?;
        file.flush()
            .await
            .map_err(|e| Error::from_io(e, &self.path.display().to_string()))?;
        file.sync_data()
            .await
            .map_err(|e| Error::from_io(e, &self.path.display().to_string()))?;

        Ok(())
    }

    /// Seek to `offset` and read up to `len` bytes.
    ///
    /// Returns fewer bytes at end-of-file; an empty result past the end is
    /// success, not an error. Callers translate empty reads into their
    /// protocol's EOF signal.
    pub async fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let mut file = self.file.lock().await;

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::from_io(e, &self.path.display().to_string()))?;

        let mut buf = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .await
                .map_err(|e| Error::from_io(e, &self.path.display().to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);

        Ok(buf)
    }

    /// Metadata of the underlying file resource.
    pub async fn stat(&self) -> Result<FileAttributes> {
        let file = self.file.lock().await;
        let meta = file
            .metadata()
            .await
            .map_err(|e| Error::from_io(e, &self.path.display().to_string()))?;
        Ok(FileAttributes::from_metadata(&meta))
    }

    /// Flush buffered writes before the handle is released.
    ///
    /// The file descriptor itself is released when the handle is dropped;
    /// a second close on the same handle is outside the contract.
    pub async fn close(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush()
            .await
            .map_err(|e| Error::from_io(e, &self.path.display().to_string()))?;
        debug!(path = %self.path.display(), "handle closed");
        Ok(())
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn open_rw(dir: &TempDir, name: &str) -> FileHandle {
        let path = dir.path().join(name);
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .unwrap();
        FileHandle::new(path, OpenMode::CreateTruncate, file)
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let handle = open_rw(&dir, "round.bin").await;

        handle.write_at(0, b"hello").await.unwrap();
        let back = handle.read_at(0, 5).await.unwrap();
        assert_eq!(back, b"hello");
    }

    #[tokio::test]
    async fn offset_write_and_short_read() {
        let dir = TempDir::new().unwrap();
        let handle = open_rw(&dir, "offset.bin").await;

        handle.write_at(0, b"0123456789").await.unwrap();
        handle.write_at(4, b"XY").await.unwrap();

        let back = handle.read_at(0, 64).await.unwrap();
        assert_eq!(back, b"0123XY6789");

        // Reading past the end yields empty, not an error.
        let past = handle.read_at(100, 8).await.unwrap();
        assert!(past.is_empty());
    }

    #[tokio::test]
    async fn stat_reflects_written_size() {
        let dir = TempDir::new().unwrap();
        let handle = open_rw(&dir, "sized.bin").await;

        handle.write_at(0, b"hello").await.unwrap();
        let attrs = handle.stat().await.unwrap();
        assert_eq!(attrs.size, 5);
    }

    #[tokio::test]
    async fn concurrent_writers_on_one_handle_do_not_interleave() {
        let dir = TempDir::new().unwrap();
        let handle = Arc::new(open_rw(&dir, "contended.bin").await);

        let mut tasks = Vec::new();
        for i in 0u8..8 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                // Each task owns a disjoint 128-byte region.
                let block = vec![i; 128];
                handle.write_at(u64::from(i) * 128, &block).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let back = handle.read_at(0, 8 * 128).await.unwrap();
        assert_eq!(back.len(), 8 * 128);
        for (i, chunk) in back.chunks(128).enumerate() {
            assert!(chunk.iter().all(|b| *b == i as u8), "region {i} corrupted");
        }
    }
}
