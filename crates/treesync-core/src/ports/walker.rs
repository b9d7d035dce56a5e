//! Tree walker port
//!
//! A walker traverses one file-system root and emits [`SnapshotEntry`]
//! values on a bounded channel. It knows nothing about versioning or
//! diffing; the consumer on the other end (normally the snapshot store's
//! ingest task) persists what it receives.
//!
//! ## Channel contract
//!
//! - The walker is the only sender on `entries_out` and drops it on every
//!   exit path, which is how the consumer learns the walk is over.
//! - `err_in` carries the consumer's outcome. The consumer sends `Err` the
//!   moment it stops accepting entries, or `Ok(count)` after the entry
//!   channel closed cleanly.
//! - The walker watches `err_in` while emitting and aborts early when the
//!   consumer fails. Before returning it waits for the consumer's outcome,
//!   so a successful walk means every entry was accepted.
//! - Folders are emitted before their descendants.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::domain::{FsName, SnapshotEntry};

/// What the entry consumer reports back: entries stored, or why it stopped
pub type IngestOutcome = anyhow::Result<u64>;

/// Port trait for file-system traversal
#[async_trait::async_trait]
pub trait TreeWalker: Send + Sync {
    /// Walks `root` and emits one entry per file and folder
    ///
    /// Returns the number of entries the consumer stored.
    ///
    /// # Errors
    /// Traversal errors, the consumer's failure (wrapped), or cancellation.
    async fn walk(
        &self,
        cancel: &CancellationToken,
        fs_name: &FsName,
        root: &str,
        entries_out: mpsc::Sender<SnapshotEntry>,
        err_in: oneshot::Receiver<IngestOutcome>,
    ) -> anyhow::Result<u64>;
}
