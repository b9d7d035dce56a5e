//! Classified differences between two generations
//!
//! A [`Mutation`] carries the entry records the diff engine returned for one
//! `entry_id`. The record count depends on the kind and is checked by
//! [`Mutation::validate`] before anything acts on it.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::entry::SnapshotEntry;
use super::errors::DomainError;

/// Kind of change between the Previous and New generations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    /// Present only in New
    Created,
    /// Present only in Previous
    Deleted,
    /// Present in both with a different content hash
    Modified,
    /// Present in both at a different location (parent or name)
    Moved,
}

impl MutationKind {
    /// All kinds, in the order the diff engine queries them
    pub const ALL: [MutationKind; 4] = [
        MutationKind::Created,
        MutationKind::Deleted,
        MutationKind::Modified,
        MutationKind::Moved,
    ];

    /// Storage tag for this kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            MutationKind::Created => "created",
            MutationKind::Deleted => "deleted",
            MutationKind::Modified => "modified",
            MutationKind::Moved => "moved",
        }
    }

    /// Number of entry records a mutation of this kind carries
    #[must_use]
    pub const fn expected_records(self) -> usize {
        match self {
            MutationKind::Created | MutationKind::Deleted => 1,
            MutationKind::Modified | MutationKind::Moved => 2,
        }
    }
}

impl Display for MutationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Created => write!(f, "Created"),
            MutationKind::Deleted => write!(f, "Deleted"),
            MutationKind::Modified => write!(f, "Modified"),
            MutationKind::Moved => write!(f, "Moved"),
        }
    }
}

impl FromStr for MutationKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(MutationKind::Created),
            "deleted" => Ok(MutationKind::Deleted),
            "modified" => Ok(MutationKind::Modified),
            "moved" => Ok(MutationKind::Moved),
            other => Err(DomainError::UnknownMutationKind(other.to_string())),
        }
    }
}

/// A classified difference for one entry
///
/// `entries` holds the New record for `Created`, the Previous record for
/// `Deleted`, and Previous then New for `Modified` and `Moved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub kind: MutationKind,
    pub entries: Vec<SnapshotEntry>,
}

impl Mutation {
    pub fn created(new: SnapshotEntry) -> Self {
        Self {
            kind: MutationKind::Created,
            entries: vec![new],
        }
    }

    pub fn deleted(previous: SnapshotEntry) -> Self {
        Self {
            kind: MutationKind::Deleted,
            entries: vec![previous],
        }
    }

    pub fn modified(previous: SnapshotEntry, new: SnapshotEntry) -> Self {
        Self {
            kind: MutationKind::Modified,
            entries: vec![previous, new],
        }
    }

    pub fn moved(previous: SnapshotEntry, new: SnapshotEntry) -> Self {
        Self {
            kind: MutationKind::Moved,
            entries: vec![previous, new],
        }
    }

    /// Checks that the number of entry records matches the kind
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidCardinality`] on a mismatch
    pub fn validate(&self) -> Result<(), DomainError> {
        let expected = self.kind.expected_records();
        if self.entries.len() != expected {
            return Err(DomainError::InvalidCardinality {
                kind: self.kind.to_string(),
                expected,
                actual: self.entries.len(),
            });
        }
        Ok(())
    }

    /// The Previous record (`Deleted`, `Modified`, `Moved`)
    #[must_use]
    pub fn previous(&self) -> Option<&SnapshotEntry> {
        match self.kind {
            MutationKind::Created => None,
            _ => self.entries.first(),
        }
    }

    /// The New record (`Created`, `Modified`, `Moved`)
    #[must_use]
    pub fn new_entry(&self) -> Option<&SnapshotEntry> {
        match self.kind {
            MutationKind::Created => self.entries.first(),
            MutationKind::Deleted => None,
            MutationKind::Modified | MutationKind::Moved => self.entries.get(1),
        }
    }

    /// The record identifying this mutation in logs and errors
    #[must_use]
    pub fn subject(&self) -> Option<&SnapshotEntry> {
        self.new_entry().or_else(|| self.previous())
    }
}
