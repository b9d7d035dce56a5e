//! Per-file-system tracking state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::FsName;

/// Flags the tracker keeps for one tracked file system
///
/// A file system that was never refreshed reports all flags `false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingState {
    pub fs_name: FsName,
    /// A refresh populated New and no sync has consumed the diff yet
    pub changed: bool,
    /// A refresh or sync of this file system currently holds the lock
    pub sync_in_progress: bool,
    /// A rotation committed but the refresh that issued it has not finished
    pub rotation_pending: bool,
    /// When the last successful refresh finished
    pub last_refresh: Option<DateTime<Utc>>,
}

impl TrackingState {
    /// State of a file system the store has no row for
    #[must_use]
    pub fn untracked(fs_name: FsName) -> Self {
        Self {
            fs_name,
            changed: false,
            sync_in_progress: false,
            rotation_pending: false,
            last_refresh: None,
        }
    }

    /// Whether the next refresh may slide the snapshot window forward
    ///
    /// Rotation is only allowed when no diff is outstanding and no earlier
    /// rotation is waiting for its refresh to complete.
    #[must_use]
    pub fn can_rotate(&self) -> bool {
        !self.changed && !self.rotation_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untracked_can_rotate() {
        let state = TrackingState::untracked(FsName::new("local").unwrap());
        assert!(!state.changed);
        assert!(state.can_rotate());
    }

    #[test]
    fn test_changed_or_pending_blocks_rotation() {
        let mut state = TrackingState::untracked(FsName::new("local").unwrap());
        state.changed = true;
        assert!(!state.can_rotate());

        state.changed = false;
        state.rotation_pending = true;
        assert!(!state.can_rotate());
    }
}
