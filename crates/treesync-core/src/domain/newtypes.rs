//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the two identifiers every snapshot row is
//! keyed by. Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Maximum length of a tracked file-system name
const MAX_FS_NAME_LEN: usize = 128;

// ============================================================================
// FsName
// ============================================================================

/// Name of a tracked file system (e.g. `"local"`, `"cloud"`)
///
/// Every persisted entry and tracking flag is scoped by this name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FsName(String);

impl FsName {
    /// Create a new FsName
    ///
    /// # Errors
    /// Returns error if the name is empty, too long, or contains
    /// whitespace or control characters
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if name.is_empty() {
            return Err(DomainError::InvalidFsName(
                "File system name cannot be empty".to_string(),
            ));
        }
        if name.len() > MAX_FS_NAME_LEN {
            return Err(DomainError::InvalidFsName(format!(
                "File system name exceeds {MAX_FS_NAME_LEN} bytes: {name}"
            )));
        }
        if name.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(DomainError::InvalidFsName(format!(
                "File system name contains whitespace or control characters: {name:?}"
            )));
        }
        Ok(Self(name))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FsName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FsName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for FsName {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<FsName> for String {
    fn from(name: FsName) -> Self {
        name.0
    }
}

// ============================================================================
// EntryId
// ============================================================================

/// Stable identifier of a file or folder within one file system
///
/// Locally this is the inode number; remotely the provider's folder or file
/// ID, prefixed with `d` or `f` because the two ID spaces overlap. IDs are
/// only unique within a single tracked file system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntryId(String);

impl EntryId {
    /// Create a new EntryId
    ///
    /// # Errors
    /// Returns error if the ID is empty or contains whitespace
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DomainError::InvalidEntryId(
                "Entry ID cannot be empty".to_string(),
            ));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(DomainError::InvalidEntryId(format!(
                "Entry ID contains whitespace: {id:?}"
            )));
        }
        Ok(Self(id))
    }

    /// ID of a local entry, derived from its inode number
    #[must_use]
    pub fn from_inode(inode: u64) -> Self {
        Self(inode.to_string())
    }

    /// ID of a remote folder
    #[must_use]
    pub fn remote_folder(folder_id: u64) -> Self {
        Self(format!("d{folder_id}"))
    }

    /// ID of a remote file
    #[must_use]
    pub fn remote_file(file_id: u64) -> Self {
        Self(format!("f{file_id}"))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EntryId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<EntryId> for String {
    fn from(id: EntryId) -> Self {
        id.0
    }
}
