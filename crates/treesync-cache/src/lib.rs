//! treesync Cache - Versioned snapshot persistence
//!
//! SQLite-based store for:
//! - Two generations (Previous / New) of snapshot entries per file system
//! - Per-file-system tracking flags and the refresh lock
//! - Refresh-cycle bookkeeping
//! - Mutation classification between the two generations
//!
//! ## Architecture
//!
//! This crate implements the `SnapshotStore` and `DiffReader` ports from
//! `treesync-core` using SQLite as the storage backend. It is a driven
//! (secondary) adapter in the hexagonal architecture.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with guarded, versioned migrations
//! - [`SqliteSnapshotStore`] - `SnapshotStore` + `DiffReader` implementation
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use treesync_cache::{DatabasePool, SqliteSnapshotStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/treesync/treesync.db")).await?;
//! let store = SqliteSnapshotStore::new(pool.pool().clone());
//! // Use store as SnapshotStore / DiffReader...
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod store;

pub use pool::DatabasePool;
pub use store::SqliteSnapshotStore;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A previous run crashed while applying a migration
    #[error("Migration {0} is still marked 'in progress'; the schema may be half-applied")]
    MigrationInProgress(i64),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An entry could not be stored during ingest
    #[error("Ingest of {fs_name} failed at entry {entry_id}: {message}")]
    IngestFailed {
        fs_name: String,
        entry_id: String,
        message: String,
    },
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}

impl From<treesync_core::domain::DomainError> for CacheError {
    fn from(e: treesync_core::domain::DomainError) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}
