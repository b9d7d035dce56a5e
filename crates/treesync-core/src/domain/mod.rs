//! Domain entities
//!
//! This module contains the core domain types for treesync:
//! - Validated identifiers (`FsName`, `EntryId`)
//! - Snapshot entries and the two-valued generation tag
//! - Classified mutations between generations
//! - Per-file-system tracking state
//! - Domain-specific error types

pub mod entry;
pub mod errors;
pub mod mutation;
pub mod newtypes;
pub mod tracking;

pub use entry::{SnapshotEntry, Version};
pub use errors::DomainError;
pub use mutation::{Mutation, MutationKind};
pub use newtypes::{EntryId, FsName};
pub use tracking::TrackingState;
