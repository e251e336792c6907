//! Change-tracking states shared by objects and properties.
//!
//! ```text
//! Detached -> Added -> Unchanged <-> Modified
//!                \__________\___________\____-> Deleted
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a tracked entity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryState {
    /// Not associated with any manager or stored row.
    #[default]
    Detached,
    /// Associated with a manager but not yet persisted.
    Added,
    /// Persisted and in sync with the store as of the recorded slice.
    Unchanged,
    /// Persisted previously, holds an unsaved value change.
    Modified,
    /// Marked for removal on the next commit.
    Deleted,
}

impl EntryState {
    /// `true` for states that hold changes a commit must push.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Deleted)
    }

    /// `true` once the entity has been attached to a manager.
    pub fn is_connected(self) -> bool {
        !matches!(self, Self::Detached)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Detached => "detached",
            Self::Added => "added",
            Self::Unchanged => "unchanged",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_detached() {
        assert_eq!(EntryState::default(), EntryState::Detached);
        assert!(!EntryState::Detached.is_connected());
    }

    #[test]
    fn pending_states() {
        assert!(EntryState::Added.is_pending());
        assert!(EntryState::Modified.is_pending());
        assert!(EntryState::Deleted.is_pending());
        assert!(!EntryState::Unchanged.is_pending());
        assert!(!EntryState::Detached.is_pending());
    }
}
