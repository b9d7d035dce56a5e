//! Domain error types
//!
//! This module defines error types specific to domain operations:
//! identifier validation, tag parsing and mutation shape checks.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid tracked file-system name
    #[error("Invalid file system name: {0}")]
    InvalidFsName(String),

    /// Invalid entry identifier
    #[error("Invalid entry ID: {0}")]
    InvalidEntryId(String),

    /// A stored generation tag is not one of the known versions
    #[error("Unknown snapshot version tag: {0}")]
    UnknownVersion(String),

    /// A stored mutation kind tag is not one of the known kinds
    #[error("Unknown mutation kind: {0}")]
    UnknownMutationKind(String),

    /// A mutation carries the wrong number of entry records for its kind
    #[error("{kind} mutation expects {expected} entry record(s), got {actual}")]
    InvalidCardinality {
        /// The mutation kind
        kind: String,
        /// Number of records the kind requires
        expected: usize,
        /// Number of records actually present
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidFsName(String::new());
        assert_eq!(err.to_string(), "Invalid file system name: ");

        let err = DomainError::UnknownMutationKind("renamed".to_string());
        assert_eq!(err.to_string(), "Unknown mutation kind: renamed");

        let err = DomainError::InvalidCardinality {
            kind: "Moved".to_string(),
            expected: 2,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "Moved mutation expects 2 entry record(s), got 1"
        );
    }

    #[test]
    fn test_error_equality() {
        let err1 = DomainError::InvalidEntryId("a".to_string());
        let err2 = DomainError::InvalidEntryId("a".to_string());
        let err3 = DomainError::InvalidEntryId("b".to_string());

        assert_eq!(err1, err2);
        assert_ne!(err1, err3);
    }
}
