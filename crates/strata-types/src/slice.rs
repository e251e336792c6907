use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::SliceId;

/// An immutable node in the version tree.
///
/// Root slices have no parent. A slice never changes after creation; the
/// set of ancestors reachable through `parent` defines its lineage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slice {
    pub id: SliceId,
    pub parent: Option<SliceId>,
}

impl Slice {
    /// A root slice (no parent).
    pub const fn root(id: SliceId) -> Self {
        Self { id, parent: None }
    }

    /// A slice under `parent`.
    pub const fn child(id: SliceId, parent: SliceId) -> Self {
        Self {
            id,
            parent: Some(parent),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(parent) => write!(f, "{parent} -> {}", self.id),
            None => write!(f, "root -> {}", self.id),
        }
    }
}
