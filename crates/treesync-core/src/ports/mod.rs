//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the orchestration code
//! depends on, but whose implementations live in adapter crates or in the
//! external collaborators (remote wire client, mount layer).
//!
//! ## Ports Overview
//!
//! - [`TreeWalker`] - Produces a stream of snapshot entries for a root
//! - [`SnapshotStore`] - Two-generation entry persistence and tracking flags
//! - [`DiffReader`] - Mutation classification between generations
//! - [`SyncSource`] / [`SyncDestination`] - Replay targets for the applier
//! - [`RemoteLister`] / [`RemoteFileIo`] - Remote storage collaborator boundary

pub mod remote;
pub mod snapshot_store;
pub mod sync;
pub mod walker;

pub use remote::{
    FileDescriptor, FolderRef, ListOptions, OpenMode, RemoteFileIo, RemoteItem, RemoteLister,
};
pub use snapshot_store::{DiffReader, RefreshRecord, SnapshotStore};
pub use sync::{FileStream, PathKind, SyncDestination, SyncSource};
pub use walker::{IngestOutcome, TreeWalker};
