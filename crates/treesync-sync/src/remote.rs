//! `SyncSource` over the remote descriptor-based file API
//!
//! Opens the file read-only, reads fixed-size chunks until the remote
//! returns an empty buffer, and always closes the descriptor.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use treesync_core::config::{TransferConfig, DEFAULT_CHUNK_SIZE};
use treesync_core::domain::entry::join_path;
use treesync_core::domain::SnapshotEntry;
use treesync_core::ports::{FileDescriptor, FileStream, OpenMode, RemoteFileIo, SyncSource};

use crate::SyncError;

/// Chunks buffered between the reading task and its consumer
const STREAM_CHANNEL_CAPACITY: usize = 4;

/// Streams remote file content for the applier
pub struct RemoteFileSource {
    io: Arc<dyn RemoteFileIo>,
    /// Remote folder the walked tree is rooted at
    root: String,
    chunk_size: usize,
}

impl RemoteFileSource {
    pub fn new(io: Arc<dyn RemoteFileIo>, root: impl Into<String>) -> Self {
        Self {
            io,
            root: root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn from_config(
        io: Arc<dyn RemoteFileIo>,
        root: impl Into<String>,
        config: &TransferConfig,
    ) -> Self {
        Self::new(io, root).with_chunk_size(config.chunk_size)
    }

    /// Remote path of an entry path relative to the root
    fn remote_path(&self, path: &str) -> String {
        path.split('/')
            .filter(|c| !c.is_empty())
            .fold(self.root.clone(), |acc, c| join_path(&acc, c))
    }
}

async fn read_remote(
    io: &dyn RemoteFileIo,
    cancel: &CancellationToken,
    fd: FileDescriptor,
    chunk_size: usize,
    chunks: &mpsc::Sender<Vec<u8>>,
) -> anyhow::Result<()> {
    loop {
        let data = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled.into()),
            data = io.read(fd, chunk_size) => data?,
        };
        if data.is_empty() {
            return Ok(());
        }
        if chunks.send(data).await.is_err() {
            return Err(SyncError::Cancelled.into());
        }
    }
}

impl SyncSource for RemoteFileSource {
    fn stream_file(&self, cancel: &CancellationToken, entry: &SnapshotEntry) -> FileStream {
        let (chunks_tx, chunks_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();
        let io = Arc::clone(&self.io);
        let cancel = cancel.clone();
        let chunk_size = self.chunk_size;
        let path = self.remote_path(&entry.path);

        tokio::spawn(async move {
            let result = match io.open(&path, OpenMode::Read).await {
                Ok(fd) => {
                    let read = read_remote(io.as_ref(), &cancel, fd, chunk_size, &chunks_tx).await;
                    if let Err(e) = io.close(fd).await {
                        warn!(path = %path, error = %e, "Failed to close remote file");
                    }
                    read
                }
                Err(e) => Err(e),
            };
            drop(chunks_tx);

            let result = result.map_err(|e| {
                anyhow::Error::from(SyncError::Source {
                    path: path.clone(),
                    message: format!("{e:#}"),
                })
            });
            debug!(path = %path, ok = result.is_ok(), "Remote read finished");
            let _ = done_tx.send(result);
        });

        FileStream {
            chunks: chunks_rx,
            done: done_rx,
        }
    }
}
