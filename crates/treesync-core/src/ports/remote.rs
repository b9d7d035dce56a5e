//! Remote storage port (external collaborator boundary)
//!
//! The remote wire client (authentication, HTTP, API error mapping) lives
//! outside this workspace. These traits describe the two things treesync
//! needs from it: one recursive folder listing, and descriptor-based file
//! I/O for streaming content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which folder a listing starts from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderRef {
    Id(u64),
    Path(String),
}

/// Flags of the remote listing call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Include the whole subtree, not just direct children
    pub recursive: bool,
    /// Include items the remote marks as deleted
    pub show_deleted: bool,
    /// Only list folders
    pub no_files: bool,
    /// Leave out folders shared with the account
    pub no_shares: bool,
}

impl ListOptions {
    /// Full recursive listing of files and folders
    #[must_use]
    pub fn recursive_tree() -> Self {
        Self {
            recursive: true,
            ..Self::default()
        }
    }
}

/// One node of the tree returned by [`RemoteLister::list_folder`]
///
/// `id` is a folder ID when `is_folder` is set and a file ID otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: u64,
    pub is_folder: bool,
    pub is_deleted: bool,
    /// File this item atomically replaced, if any
    pub deleted_file_id: Option<u64>,
    pub name: String,
    pub parent_folder_id: Option<u64>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub size: u64,
    /// Remote content hash (0 for folders)
    pub hash: u64,
    /// Children (folders only)
    pub contents: Vec<RemoteItem>,
}

/// Lists remote folders
#[async_trait::async_trait]
pub trait RemoteLister: Send + Sync {
    /// Lists `folder`, returning it as the root of an in-memory tree
    async fn list_folder(
        &self,
        folder: &FolderRef,
        options: ListOptions,
    ) -> anyhow::Result<RemoteItem>;
}

/// Descriptor of an open remote file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileDescriptor(pub u64);

/// How a remote file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create or truncate, then write
    Write,
}

/// Descriptor-based remote file I/O
#[async_trait::async_trait]
pub trait RemoteFileIo: Send + Sync {
    async fn open(&self, path: &str, mode: OpenMode) -> anyhow::Result<FileDescriptor>;

    /// Reads up to `count` bytes; an empty buffer means end of file
    async fn read(&self, fd: FileDescriptor, count: usize) -> anyhow::Result<Vec<u8>>;

    /// Writes `data`, returning the number of bytes accepted
    async fn write(&self, fd: FileDescriptor, data: &[u8]) -> anyhow::Result<usize>;

    async fn close(&self, fd: FileDescriptor) -> anyhow::Result<()>;
}
