//! Tracker - refresh and sync cycles for one tracked file system
//!
//! The tracker alternates between two states kept in the snapshot store:
//!
//! - **Stable** (`changed = false`): the destination mirrors Previous. A
//!   refresh rotates (New becomes Previous) and walks into a fresh New.
//! - **Changed** (`changed = true`): a diff is outstanding. A refresh only
//!   clears New and walks again, so Previous keeps describing what the
//!   destination holds.
//!
//! A sync applies the diff and returns to Stable. Both cycles hold the
//! per-file-system lock and always release it.
//!
//! ## Crash safety
//!
//! `rotate` leaves a `rotation_pending` marker that only a completed refresh
//! clears, and the tracker refuses to rotate while it is set. A refresh that
//! dies between rotating and finishing is therefore retried with
//! `clear_new`, never with a second rotation.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use treesync_core::config::StoreConfig;
use treesync_core::domain::FsName;
use treesync_core::ports::{DiffReader, SnapshotStore, TreeWalker};

use crate::applier::{ApplyReport, OneWayApplier};
use crate::SyncError;

/// Outcome of a refresh cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshReport {
    pub fs_name: FsName,
    /// Whether the snapshot window slid forward
    pub rotated: bool,
    /// Entries stored for the New generation
    pub entries: u64,
}

/// Outcome of a sync cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub fs_name: FsName,
    /// Mutations in the applied diff (0 when nothing was pending)
    pub mutations: usize,
    pub applied: ApplyReport,
}

/// Drives refresh / sync cycles of one tracked file system
pub struct Tracker {
    fs_name: FsName,
    root: String,
    walker: Arc<dyn TreeWalker>,
    store: Arc<dyn SnapshotStore>,
    diff: Arc<dyn DiffReader>,
    channel_capacity: usize,
}

impl Tracker {
    pub fn new(
        fs_name: FsName,
        root: impl Into<String>,
        walker: Arc<dyn TreeWalker>,
        store: Arc<dyn SnapshotStore>,
        diff: Arc<dyn DiffReader>,
    ) -> Self {
        Self {
            fs_name,
            root: root.into(),
            walker,
            store,
            diff,
            channel_capacity: StoreConfig::default().effective_channel_capacity(),
        }
    }

    /// Sets the walker → store channel capacity (0 is raised to 1)
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_store_config(self, config: &StoreConfig) -> Self {
        self.with_channel_capacity(config.effective_channel_capacity())
    }

    pub fn fs_name(&self) -> &FsName {
        &self.fs_name
    }

    /// Walks the root into the New generation
    ///
    /// # Errors
    /// [`SyncError::Busy`] if another cycle holds the lock; otherwise the
    /// first failing step. Flags are left as they were on failure.
    #[instrument(skip(self, cancel), fields(fs_name = %self.fs_name))]
    pub async fn refresh(&self, cancel: &CancellationToken) -> anyhow::Result<RefreshReport> {
        self.acquire().await?;
        let result = self.refresh_locked(cancel).await;
        self.finish(result).await
    }

    /// Applies the outstanding diff, if any, and marks the file system clean
    ///
    /// # Errors
    /// [`SyncError::Busy`] if another cycle holds the lock; otherwise the
    /// first failing step. A failed apply keeps `changed` set so the same
    /// diff is retried.
    #[instrument(skip(self, cancel, applier), fields(fs_name = %self.fs_name))]
    pub async fn sync(
        &self,
        cancel: &CancellationToken,
        applier: &OneWayApplier,
    ) -> anyhow::Result<SyncReport> {
        self.acquire().await?;
        let result = self.sync_locked(cancel, applier).await;
        self.finish(result).await
    }

    async fn refresh_locked(&self, cancel: &CancellationToken) -> anyhow::Result<RefreshReport> {
        let state = self
            .store
            .tracking_state(&self.fs_name)
            .await
            .context("Failed to read tracking state")?;

        let rotated = state.can_rotate();
        if rotated {
            self.store
                .rotate(&self.fs_name)
                .await
                .context("Failed to rotate snapshot generations")?;
        } else {
            self.store
                .clear_new(&self.fs_name)
                .await
                .context("Failed to clear New generation")?;
        }

        let (entries_out, err_in) = self.store.ingest(&self.fs_name, self.channel_capacity);
        let entries = self
            .walker
            .walk(cancel, &self.fs_name, &self.root, entries_out, err_in)
            .await
            .with_context(|| format!("Failed to walk {}", self.root))?;

        self.store
            .set_changed(&self.fs_name, true)
            .await
            .context("Failed to record completed refresh")?;

        info!(rotated, entries, "Refresh complete");
        Ok(RefreshReport {
            fs_name: self.fs_name.clone(),
            rotated,
            entries,
        })
    }

    async fn sync_locked(
        &self,
        cancel: &CancellationToken,
        applier: &OneWayApplier,
    ) -> anyhow::Result<SyncReport> {
        let state = self
            .store
            .tracking_state(&self.fs_name)
            .await
            .context("Failed to read tracking state")?;

        if !state.changed {
            info!("Nothing to sync");
            return Ok(SyncReport {
                fs_name: self.fs_name.clone(),
                mutations: 0,
                applied: ApplyReport::default(),
            });
        }

        let mutations = self
            .diff
            .diff(&self.fs_name)
            .await
            .context("Failed to compute diff")?;
        let applied = applier
            .apply(cancel, &mutations)
            .await
            .context("Failed to apply diff")?;

        self.store
            .set_changed(&self.fs_name, false)
            .await
            .context("Failed to clear changed flag")?;

        info!(mutations = mutations.len(), "Sync complete");
        Ok(SyncReport {
            fs_name: self.fs_name.clone(),
            mutations: mutations.len(),
            applied,
        })
    }

    async fn acquire(&self) -> anyhow::Result<()> {
        let acquired = self
            .store
            .try_acquire(&self.fs_name)
            .await
            .context("Failed to take the file-system lock")?;
        if !acquired {
            return Err(SyncError::Busy(self.fs_name.to_string()).into());
        }
        Ok(())
    }

    /// Releases the lock, keeping the cycle's error if there was one
    async fn finish<T>(&self, result: anyhow::Result<T>) -> anyhow::Result<T> {
        let released = self.store.release(&self.fs_name).await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.context("Failed to release the file-system lock")),
            (Err(e), released) => {
                if let Err(release_err) = released {
                    warn!(error = %release_err, "Failed to release lock after failed cycle");
                }
                warn!(error = %format!("{e:#}"), "Cycle failed");
                Err(e)
            }
        }
    }
}
