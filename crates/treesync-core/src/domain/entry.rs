//! Snapshot entries and generation tags
//!
//! A [`SnapshotEntry`] is one file or folder observed during a walk. Entries
//! are persisted under one of two [`Version`] tags; the set of entries for one
//! file system under one tag is a snapshot.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{EntryId, FsName};

// ============================================================================
// Version
// ============================================================================

/// Generation tag attached to every stored entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Version {
    /// The generation the destination was last synchronized to
    Previous,
    /// The most recent walk
    New,
}

impl Version {
    /// Storage tag for this version
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Version::Previous => "P",
            Version::New => "N",
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Version::Previous => write!(f, "Previous"),
            Version::New => write!(f, "New"),
        }
    }
}

impl FromStr for Version {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P" => Ok(Version::Previous),
            "N" => Ok(Version::New),
            other => Err(DomainError::UnknownVersion(other.to_string())),
        }
    }
}

// ============================================================================
// SnapshotEntry
// ============================================================================

/// One file or folder observed during a walk
///
/// Identity is `entry_id` (within `fs_name`); `path` is the slash-separated
/// location relative to the walked root, kept so the applier does not have
/// to rebuild it from parent links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Tracked file system this entry belongs to
    pub fs_name: FsName,
    /// Stable identifier within `fs_name`
    pub entry_id: EntryId,
    /// Whether this entry is a folder
    pub is_folder: bool,
    /// Whether the source reported this entry as deleted
    pub is_deleted: bool,
    /// Entry atomically replaced by this one (overwrite), if any
    pub deleted_entry_id: Option<EntryId>,
    /// File or folder name
    pub name: String,
    /// Parent folder (`None` for the walk root)
    pub parent_entry_id: Option<EntryId>,
    /// Location relative to the walk root, `/` for the root itself
    pub path: String,
    /// Creation timestamp
    pub created: DateTime<Utc>,
    /// Last modification timestamp
    pub modified: DateTime<Utc>,
    /// Size in bytes (0 for folders)
    pub size: u64,
    /// Content hash (empty for folders)
    pub hash: String,
}

impl SnapshotEntry {
    /// Creates a folder entry; the name is the last component of `path`
    pub fn folder(
        fs_name: FsName,
        entry_id: EntryId,
        parent_entry_id: Option<EntryId>,
        path: impl Into<String>,
    ) -> Self {
        let path = path.into();
        Self {
            fs_name,
            entry_id,
            is_folder: true,
            is_deleted: false,
            deleted_entry_id: None,
            name: name_from_path(&path),
            parent_entry_id,
            path,
            created: DateTime::<Utc>::default(),
            modified: DateTime::<Utc>::default(),
            size: 0,
            hash: String::new(),
        }
    }

    /// Creates a file entry; the name is the last component of `path`
    pub fn file(
        fs_name: FsName,
        entry_id: EntryId,
        parent_entry_id: Option<EntryId>,
        path: impl Into<String>,
        size: u64,
        hash: impl Into<String>,
    ) -> Self {
        let path = path.into();
        Self {
            fs_name,
            entry_id,
            is_folder: false,
            is_deleted: false,
            deleted_entry_id: None,
            name: name_from_path(&path),
            parent_entry_id,
            path,
            created: DateTime::<Utc>::default(),
            modified: DateTime::<Utc>::default(),
            size,
            hash: hash.into(),
        }
    }

    /// Sets the creation and modification timestamps
    #[must_use]
    pub fn with_times(mut self, created: DateTime<Utc>, modified: DateTime<Utc>) -> Self {
        self.created = created;
        self.modified = modified;
        self
    }

    /// Overrides the entry name (the walk root keeps its on-disk name)
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of path components below the root (root is 0)
    #[must_use]
    pub fn depth(&self) -> usize {
        path_depth(&self.path)
    }

    /// Returns true if this entry is the walk root
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.depth() == 0
    }
}

/// Joins a child name onto a slash-separated parent path
#[must_use]
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() || parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

/// Number of non-empty components in a slash-separated path
#[must_use]
pub fn path_depth(path: &str) -> usize {
    path.split('/').filter(|c| !c.is_empty()).count()
}

fn name_from_path(path: &str) -> String {
    path.rsplit('/')
        .find(|c| !c.is_empty())
        .unwrap_or("/")
        .to_string()
}
