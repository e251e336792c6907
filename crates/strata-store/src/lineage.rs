//! Materialized ancestor closure of the slice tree.
//!
//! [`LineageIndex`] keeps, for every slice, the full set of its
//! ancestors-or-self. The set is computed once when the slice is added, from
//! the parent's set plus the slice itself, so answering "is A visible from
//! S" never walks parent pointers.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use strata_types::{DataRow, Slice, SliceId};

use crate::error::{StoreError, StoreResult};

#[derive(Clone, Debug, Default)]
pub struct LineageIndex {
    closure: HashMap<SliceId, BTreeSet<SliceId>>,
}

impl LineageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the closure from parent pointers.
    ///
    /// Slices are processed in ascending id order, so every parent is seen
    /// before its children.
    pub fn rebuild(slices: &[Slice]) -> StoreResult<Self> {
        let mut sorted = slices.to_vec();
        sorted.sort_by_key(|s| s.id);
        let mut index = Self::new();
        for slice in sorted {
            index.insert(slice.id, slice.parent)?;
        }
        Ok(index)
    }

    /// Record `slice` under `parent`.
    ///
    /// Fails with `UnknownSlice` if the parent has not been recorded.
    /// Re-inserting an existing slice is a no-op.
    pub fn insert(&mut self, slice: SliceId, parent: Option<SliceId>) -> StoreResult<()> {
        if self.closure.contains_key(&slice) {
            return Ok(());
        }
        let mut lineage = match parent {
            Some(parent) => self
                .closure
                .get(&parent)
                .cloned()
                .ok_or(StoreError::UnknownSlice(parent))?,
            None => BTreeSet::new(),
        };
        lineage.insert(slice);
        debug!(slice = %slice, depth = lineage.len(), "recorded slice lineage");
        self.closure.insert(slice, lineage);
        Ok(())
    }

    /// Ancestors-or-self of `slice`, or `None` if the slice is unknown.
    pub fn lineage(&self, slice: SliceId) -> Option<&BTreeSet<SliceId>> {
        self.closure.get(&slice)
    }

    /// Ancestors-or-self of `slice`, nearest first. Empty if unknown.
    pub fn descending(&self, slice: SliceId) -> Vec<SliceId> {
        self.closure
            .get(&slice)
            .map(|set| set.iter().rev().copied().collect())
            .unwrap_or_default()
    }

    /// `true` if `ancestor` is `slice` itself or one of its ancestors.
    pub fn contains(&self, slice: SliceId, ancestor: SliceId) -> bool {
        self.closure
            .get(&slice)
            .is_some_and(|set| set.contains(&ancestor))
    }

    /// Pick the write visible from `slice` among `writes`.
    ///
    /// Only writes whose originating slice lies in the lineage are
    /// candidates. The greatest originating slice wins; ties inside one
    /// slice go to the later write.
    pub fn resolve<'a, I>(&self, slice: SliceId, writes: I) -> Option<&'a DataRow>
    where
        I: IntoIterator<Item = &'a DataRow>,
    {
        let lineage = self.closure.get(&slice)?;
        writes
            .into_iter()
            .filter(|row| lineage.contains(&row.slice))
            .max_by_key(|row| (row.slice, row.seq))
    }

    /// Forget `slice`. Only valid for a leaf: other slices' closures are
    /// left untouched.
    pub fn remove(&mut self, slice: SliceId) -> bool {
        self.closure.remove(&slice).is_some()
    }

    pub fn len(&self) -> usize {
        self.closure.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closure.is_empty()
    }

    pub fn clear(&mut self) {
        self.closure.clear();
    }
}
