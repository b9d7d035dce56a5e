//! treesync Sync - Walking, tracking and one-way replay
//!
//! Provides:
//! - Tree walkers for local directories and remote listings
//! - The tracker that drives refresh and sync cycles over a snapshot store
//! - A one-way applier that replays mutations onto a destination
//!
//! ## Modules
//!
//! - [`walker`] - `TreeWalker` implementations (local, remote)
//! - [`tracker`] - Refresh / sync state machine per tracked file system
//! - [`applier`] - Ordered mutation replay with streamed file transfers
//! - [`filesystem`] - Local filesystem adapter (atomic writes, chunked reads)
//! - [`remote`] - `SyncSource` over the remote descriptor-based file API

pub mod applier;
pub mod filesystem;
pub mod remote;
pub mod tracker;
pub mod walker;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use applier::{ApplyReport, OneWayApplier};
pub use filesystem::LocalFileSystem;
pub use remote::RemoteFileSource;
pub use tracker::{RefreshReport, SyncReport, Tracker};
pub use walker::{LocalWalker, RemoteWalker};

/// Errors that can occur during walking and synchronization
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred during file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Insufficient filesystem permissions
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    /// The specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// A domain-level error propagated from treesync-core
    #[error("Domain error: {0}")]
    DomainError(#[from] treesync_core::domain::DomainError),

    /// The operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// The entry consumer stopped accepting entries
    #[error("Entry consumer failed: {0}")]
    ConsumerFailed(String),

    /// A walked entry's parent folder was not emitted before it
    #[error("Entry {entry_id} at {path} has no emitted parent folder")]
    OrphanEntry { entry_id: String, path: String },

    /// Another refresh or sync of the same file system holds the lock
    #[error("File system {0} is busy with another refresh or sync")]
    Busy(String),

    /// An entry path cannot be mapped onto the adapter's namespace
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A Modified mutation names a folder
    #[error("Modified mutation for entry {entry_id} at {path} refers to a folder")]
    ModifiedFolder { entry_id: String, path: String },

    /// The remote listing failed
    #[error("Remote listing failed: {0}")]
    Listing(String),

    /// Reading file content from the sync source failed
    #[error("Source failed for {path}: {message}")]
    Source { path: String, message: String },

    /// A destination operation failed
    #[error("Destination {operation} failed for {path}: {message}")]
    Destination {
        operation: &'static str,
        path: String,
        message: String,
    },
}

impl SyncError {
    /// Maps an I/O error on `path` to the most specific variant
    pub(crate) fn from_io(path: &Path, e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => SyncError::PathNotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => SyncError::PermissionDenied(path.to_path_buf()),
            _ => SyncError::IoError(e),
        }
    }
}
