//! Sync source and destination ports
//!
//! The one-way applier reads file payloads from a [`SyncSource`] and replays
//! mutations onto a [`SyncDestination`]. Paths are the slash-separated,
//! root-relative paths stored on snapshot entries; each adapter maps them
//! onto its own namespace.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::domain::SnapshotEntry;

/// A file's content as a chunk stream plus a completion signal
///
/// The producer sends `Ok(())` on `done` after the last chunk, or `Err` as
/// soon as reading fails. A dropped `done` sender counts as a failure.
pub struct FileStream {
    pub chunks: mpsc::Receiver<Vec<u8>>,
    pub done: oneshot::Receiver<anyhow::Result<()>>,
}

/// What a destination path currently holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Folder,
}

impl PathKind {
    #[must_use]
    pub fn of(entry: &SnapshotEntry) -> Self {
        if entry.is_folder {
            PathKind::Folder
        } else {
            PathKind::File
        }
    }
}

/// Port trait for reading file content during a sync
pub trait SyncSource: Send + Sync {
    /// Starts streaming the content of `entry`
    ///
    /// Reading happens on a spawned task; must be called within a tokio
    /// runtime.
    fn stream_file(&self, cancel: &CancellationToken, entry: &SnapshotEntry) -> FileStream;
}

/// Port trait for the file system a sync writes to
#[async_trait::async_trait]
pub trait SyncDestination: Send + Sync {
    /// Creates a directory (parents included)
    async fn mk_dir(&self, path: &str) -> anyhow::Result<()>;

    /// Writes a file from a chunk stream, replacing any existing file
    ///
    /// The file must only become visible once `chunks` closes cleanly. If
    /// `cancel` fires first, nothing is left behind.
    async fn mk_file(
        &self,
        cancel: &CancellationToken,
        path: &str,
        chunks: mpsc::Receiver<Vec<u8>>,
    ) -> anyhow::Result<()>;

    /// Removes a directory
    async fn rm_dir(&self, path: &str) -> anyhow::Result<()>;

    /// Removes a file
    async fn rm_file(&self, path: &str) -> anyhow::Result<()>;

    /// Moves a directory
    async fn mv_dir(&self, from: &str, to: &str) -> anyhow::Result<()>;

    /// Moves a file
    async fn mv_file(&self, from: &str, to: &str) -> anyhow::Result<()>;

    /// Kind of whatever exists at `path`, `None` if nothing does
    ///
    /// Used after a failed step to tell "already applied" apart from a
    /// real failure when a diff is replayed.
    async fn lookup(&self, path: &str) -> anyhow::Result<Option<PathKind>>;
}
