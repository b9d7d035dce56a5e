//! Snapshot store ports (driven/secondary ports)
//!
//! The store owns every persisted entry and flag. Orchestration code reaches
//! them only through these traits.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific.
//! - Diffing is split into its own [`DiffReader`] trait so the sync half of
//!   the tracker can be exercised against a canned mutation list.
//! - `ingest` is synchronous: it only opens the channel pair and spawns the
//!   consumer task, so it must be called from within a tokio runtime.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::domain::{FsName, Mutation, SnapshotEntry, TrackingState, Version};
use crate::ports::walker::IngestOutcome;

/// One completed refresh cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRecord {
    pub diff_id: String,
    pub fs_name: FsName,
    pub timestamp: DateTime<Utc>,
}

/// Port trait for the versioned snapshot store
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Opens a bounded channel pair and spawns a consumer that stores every
    /// received entry as [`Version::New`]
    ///
    /// The consumer reports exactly once on the returned receiver: `Err` on
    /// the first insert failure (after which it stops receiving), or
    /// `Ok(count)` once the entry channel is closed.
    fn ingest(
        &self,
        fs_name: &FsName,
        capacity: usize,
    ) -> (mpsc::Sender<SnapshotEntry>, oneshot::Receiver<IngestOutcome>);

    /// Atomically replaces Previous with New, leaving New empty
    async fn rotate(&self, fs_name: &FsName) -> anyhow::Result<()>;

    /// Deletes New without touching Previous
    async fn clear_new(&self, fs_name: &FsName) -> anyhow::Result<()>;

    /// Lists one generation, ordered by path
    async fn snapshot(
        &self,
        fs_name: &FsName,
        version: Version,
    ) -> anyhow::Result<Vec<SnapshotEntry>>;

    /// Returns the tracking flags (all `false` for an unknown file system)
    async fn tracking_state(&self, fs_name: &FsName) -> anyhow::Result<TrackingState>;

    /// Sets the changed flag
    ///
    /// Setting it to `true` marks a refresh as complete: the pending rotation
    /// marker is cleared and the cycle is recorded in the refresh history.
    async fn set_changed(&self, fs_name: &FsName, changed: bool) -> anyhow::Result<()>;

    /// Atomically sets `sync_in_progress` if it is clear
    ///
    /// Returns `false` when another refresh or sync holds the lock.
    async fn try_acquire(&self, fs_name: &FsName) -> anyhow::Result<bool>;

    /// Clears `sync_in_progress`
    async fn release(&self, fs_name: &FsName) -> anyhow::Result<()>;

    /// Most recent refresh cycles, newest first
    async fn refresh_history(
        &self,
        fs_name: &FsName,
        limit: u32,
    ) -> anyhow::Result<Vec<RefreshRecord>>;
}

/// Port trait for mutation classification
#[async_trait::async_trait]
pub trait DiffReader: Send + Sync {
    /// Classifies the differences between Previous and New
    ///
    /// Results are grouped by kind; no other order is guaranteed.
    async fn diff(&self, fs_name: &FsName) -> anyhow::Result<Vec<Mutation>>;
}
