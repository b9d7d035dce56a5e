//! Local filesystem adapter (secondary/driven adapter)
//!
//! Implements [`SyncSource`] and [`SyncDestination`] on a directory using
//! `tokio::fs`. Entry paths are slash-separated and relative to that
//! directory.
//!
//! ## Design Decisions
//!
//! - **Atomic writes**: content is streamed into a hidden temp file next to
//!   the target and renamed into place only after the chunk stream closed
//!   cleanly. A cancelled write removes the temp file.
//! - **Rooted paths**: `..` components are rejected, so an entry can never
//!   address anything outside the root.
//! - **Non-recursive removal**: `rm_dir` only removes empty directories; the
//!   applier deletes children first.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use treesync_core::config::{TransferConfig, DEFAULT_CHUNK_SIZE};
use treesync_core::domain::SnapshotEntry;
use treesync_core::ports::{FileStream, PathKind, SyncDestination, SyncSource};

use crate::SyncError;

/// Chunks buffered between a reading task and its consumer
const STREAM_CHANNEL_CAPACITY: usize = 4;

/// Adapter that bridges the sync ports to a local directory tree
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
    chunk_size: usize,
}

impl LocalFileSystem {
    /// Create a new `LocalFileSystem` rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    #[must_use]
    pub fn from_config(root: impl Into<PathBuf>, config: &TransferConfig) -> Self {
        Self::new(root).with_chunk_size(config.chunk_size)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an entry path onto the filesystem below the root
    ///
    /// # Errors
    /// Returns [`SyncError::InvalidPath`] for paths containing `..`.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SyncError> {
        let mut resolved = self.root.clone();
        for component in path.split('/') {
            match component {
                "" | "." => {}
                ".." => return Err(SyncError::InvalidPath(path.to_string())),
                name => resolved.push(name),
            }
        }
        Ok(resolved)
    }

    async fn ensure_parent(target: &Path) -> Result<(), SyncError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::from_io(parent, e))?;
        }
        Ok(())
    }
}

/// Hidden sibling of `target` that receives content before the rename
fn temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.treesync-tmp"))
}

/// Writes `chunks` into `file` until the stream closes
///
/// Cancellation is checked before every chunk and once more after the last
/// one, so a stream closed because of an upstream failure is never taken
/// for a complete file.
async fn write_chunks(
    cancel: &CancellationToken,
    file: &mut tokio::fs::File,
    chunks: &mut mpsc::Receiver<Vec<u8>>,
) -> Result<u64, SyncError> {
    let mut written = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            chunk = chunks.recv() => match chunk {
                Some(bytes) => {
                    file.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                }
                None => break,
            },
        }
    }

    file.flush().await?;
    file.sync_all().await?;

    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    Ok(written)
}

/// Streams `path` in `chunk_size` pieces
async fn read_chunks(
    cancel: &CancellationToken,
    path: &Path,
    chunk_size: usize,
    chunks: &mpsc::Sender<Vec<u8>>,
) -> Result<(), SyncError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SyncError::from_io(path, e))?;

    loop {
        let mut buf = vec![0u8; chunk_size];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        buf.truncate(n);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            sent = chunks.send(buf) => {
                if sent.is_err() {
                    return Err(SyncError::Cancelled);
                }
            }
        }
    }
}

impl SyncSource for LocalFileSystem {
    fn stream_file(&self, cancel: &CancellationToken, entry: &SnapshotEntry) -> FileStream {
        let (chunks_tx, chunks_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = cancel.clone();
        let chunk_size = self.chunk_size;
        let entry_path = entry.path.clone();
        let resolved = self.resolve(&entry.path);

        tokio::spawn(async move {
            let result = match resolved {
                Ok(path) => read_chunks(&cancel, &path, chunk_size, &chunks_tx).await,
                Err(e) => Err(e),
            };
            drop(chunks_tx);
            if let Err(e) = &result {
                debug!(path = %entry_path, error = %e, "Local read stopped");
            }
            let _ = done_tx.send(result.map_err(anyhow::Error::from));
        });

        FileStream {
            chunks: chunks_rx,
            done: done_rx,
        }
    }
}

#[async_trait::async_trait]
impl SyncDestination for LocalFileSystem {
    #[instrument(skip(self))]
    async fn mk_dir(&self, path: &str) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| SyncError::from_io(&target, e))?;
        debug!("directory created");
        Ok(())
    }

    #[instrument(skip(self, cancel, chunks))]
    async fn mk_file(
        &self,
        cancel: &CancellationToken,
        path: &str,
        mut chunks: mpsc::Receiver<Vec<u8>>,
    ) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        Self::ensure_parent(&target).await?;

        let tmp_path = temp_path(&target);
        debug!(?tmp_path, "writing to temporary file");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| SyncError::from_io(&tmp_path, e))?;

        let written = write_chunks(cancel, &mut file, &mut chunks).await;
        drop(file);

        match written {
            Ok(bytes) => {
                tokio::fs::rename(&tmp_path, &target)
                    .await
                    .map_err(|e| SyncError::from_io(&target, e))?;
                debug!(bytes, "write complete");
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&tmp_path).await {
                    warn!(?tmp_path, error = %cleanup, "Failed to remove temporary file");
                }
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self))]
    async fn rm_dir(&self, path: &str) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::remove_dir(&target)
            .await
            .map_err(|e| SyncError::from_io(&target, e))?;
        debug!("directory removed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn rm_file(&self, path: &str) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::remove_file(&target)
            .await
            .map_err(|e| SyncError::from_io(&target, e))?;
        debug!("file removed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mv_dir(&self, from: &str, to: &str) -> anyhow::Result<()> {
        self.mv_file(from, to).await
    }

    #[instrument(skip(self))]
    async fn mv_file(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        Self::ensure_parent(&target).await?;
        tokio::fs::rename(&source, &target)
            .await
            .map_err(|e| SyncError::from_io(&source, e))?;
        debug!("renamed");
        Ok(())
    }

    async fn lookup(&self, path: &str) -> anyhow::Result<Option<PathKind>> {
        let target = self.resolve(path)?;
        match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) if meta.is_dir() => Ok(Some(PathKind::Folder)),
            Ok(_) => Ok(Some(PathKind::File)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::from_io(&target, e).into()),
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================
