use std::collections::BTreeMap;

use tracing::debug;

use strata_types::{AttributeKey, DataRow, ObjectKey, ObjectRow, Slice, SliceId, Value};

use crate::error::{StoreError, StoreResult};
use crate::lineage::LineageIndex;
use crate::traits::Backend;

/// In-memory backend.
///
/// Intended for tests and embedding. Every table lives in an ordinary
/// collection; the lineage closure is held by a [`LineageIndex`]. While a
/// transaction is open each mutation records how to undo itself, so `begin`
/// and `commit` cost nothing and `rollback` costs only what was changed.
#[derive(Default)]
pub struct InMemoryBackend {
    tables: Tables,
    journal: Option<Vec<Undo>>,
}

#[derive(Debug, Default)]
struct Tables {
    objects: BTreeMap<ObjectKey, ObjectRow>,
    slices: BTreeMap<SliceId, Slice>,
    lineage: LineageIndex,
    data: Vec<DataRow>,
    staging: Vec<DataRow>,
    last_slice: u64,
    last_seq: u64,
}

/// Inverse of one mutation made inside a transaction.
enum Undo {
    ObjectInserted(ObjectKey),
    ObjectDeleted {
        row: ObjectRow,
        data: Vec<DataRow>,
        staging: Vec<DataRow>,
    },
    SliceInserted {
        id: SliceId,
        previous_last: u64,
    },
    Staged {
        previous_seq: u64,
    },
    Flushed {
        moved: usize,
    },
    Reset(Box<Tables>),
}

impl Undo {
    fn apply(self, tables: &mut Tables) {
        match self {
            Undo::ObjectInserted(key) => {
                tables.objects.remove(&key);
            }
            Undo::ObjectDeleted { row, data, staging } => {
                tables.objects.insert(row.key, row);
                tables.data = data;
                tables.staging = staging;
            }
            Undo::SliceInserted { id, previous_last } => {
                tables.slices.remove(&id);
                tables.lineage.remove(id);
                tables.last_slice = previous_last;
            }
            Undo::Staged { previous_seq } => {
                tables.staging.pop();
                tables.last_seq = previous_seq;
            }
            Undo::Flushed { moved } => {
                let mut restored = tables.data.split_off(tables.data.len() - moved);
                restored.append(&mut tables.staging);
                tables.staging = restored;
            }
            Undo::Reset(previous) => *tables = *previous,
        }
    }
}

impl InMemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows in the permanent `Data` table.
    pub fn data_len(&self) -> usize {
        self.tables.data.len()
    }

    /// Number of object rows.
    pub fn object_count(&self) -> usize {
        self.tables.objects.len()
    }

    fn record(&mut self, undo: Undo) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(undo);
        }
    }
}

impl Backend for InMemoryBackend {
    fn begin(&mut self) -> StoreResult<()> {
        if self.journal.is_some() {
            return Err(StoreError::TransactionActive);
        }
        self.journal = Some(Vec::new());
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        self.journal
            .take()
            .map(|_| ())
            .ok_or(StoreError::NoTransaction)
    }

    fn rollback(&mut self) -> StoreResult<()> {
        let journal = self.journal.take().ok_or(StoreError::NoTransaction)?;
        let undone = journal.len();
        for undo in journal.into_iter().rev() {
            undo.apply(&mut self.tables);
        }
        debug!(undone, "rolled back in-memory transaction");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }

    fn insert_object(&mut self, row: &ObjectRow) -> StoreResult<()> {
        if self.tables.objects.contains_key(&row.key) {
            return Err(StoreError::DuplicateObject(row.key));
        }
        self.tables.objects.insert(row.key, row.clone());
        self.record(Undo::ObjectInserted(row.key));
        Ok(())
    }

    fn select_object(&self, key: ObjectKey) -> StoreResult<Option<ObjectRow>> {
        Ok(self.tables.objects.get(&key).cloned())
    }

    fn select_objects_by_type(&self, type_name: &str) -> StoreResult<Vec<ObjectRow>> {
        Ok(self
            .tables
            .objects
            .values()
            .filter(|row| row.type_name == type_name)
            .cloned()
            .collect())
    }

    fn delete_object(&mut self, key: ObjectKey) -> StoreResult<bool> {
        let Some(row) = self.tables.objects.remove(&key) else {
            return Ok(false);
        };
        if self.journal.is_some() {
            let undo = Undo::ObjectDeleted {
                row,
                data: self.tables.data.clone(),
                staging: self.tables.staging.clone(),
            };
            self.record(undo);
        }
        self.tables.data.retain(|row| row.object != key);
        self.tables.staging.retain(|row| row.object != key);
        Ok(true)
    }

    fn max_object_key(&self) -> StoreResult<Option<ObjectKey>> {
        Ok(self.tables.objects.keys().next_back().copied())
    }

    fn insert_slice(&mut self, parent: Option<SliceId>) -> StoreResult<Slice> {
        if let Some(parent) = parent {
            if !self.tables.slices.contains_key(&parent) {
                return Err(StoreError::UnknownSlice(parent));
            }
        }
        let previous_last = self.tables.last_slice;
        let id = SliceId::new(previous_last + 1);
        self.tables.lineage.insert(id, parent)?;
        self.tables.last_slice = id.get();
        let slice = Slice { id, parent };
        self.tables.slices.insert(id, slice);
        self.record(Undo::SliceInserted { id, previous_last });
        Ok(slice)
    }

    fn select_slice(&self, id: SliceId) -> StoreResult<Option<Slice>> {
        Ok(self.tables.slices.get(&id).copied())
    }

    fn select_slices(&self) -> StoreResult<Vec<Slice>> {
        Ok(self.tables.slices.values().copied().collect())
    }

    fn lineage(&self, slice: SliceId) -> StoreResult<Vec<SliceId>> {
        if !self.tables.slices.contains_key(&slice) {
            return Err(StoreError::UnknownSlice(slice));
        }
        Ok(self.tables.lineage.descending(slice))
    }

    fn insert_staging(
        &mut self,
        object: ObjectKey,
        attribute: AttributeKey,
        value: &Value,
        slice: SliceId,
    ) -> StoreResult<()> {
        let previous_seq = self.tables.last_seq;
        self.tables.last_seq += 1;
        self.tables.staging.push(DataRow {
            seq: self.tables.last_seq,
            object,
            attribute,
            value: value.clone(),
            slice,
        });
        self.record(Undo::Staged { previous_seq });
        Ok(())
    }

    fn staging_len(&self) -> StoreResult<usize> {
        Ok(self.tables.staging.len())
    }

    fn flush_staging(&mut self) -> StoreResult<usize> {
        let moved = self.tables.staging.len();
        let Tables { data, staging, .. } = &mut self.tables;
        data.append(staging);
        if moved > 0 {
            self.record(Undo::Flushed { moved });
        }
        Ok(moved)
    }

    fn select_visible(
        &self,
        slice: SliceId,
        object: ObjectKey,
        attribute: AttributeKey,
    ) -> StoreResult<Option<DataRow>> {
        let candidates = self
            .tables
            .data
            .iter()
            .filter(|row| row.object == object && row.attribute == attribute);
        Ok(self.tables.lineage.resolve(slice, candidates).cloned())
    }

    fn select_visible_for_object(
        &self,
        slice: SliceId,
        object: ObjectKey,
    ) -> StoreResult<Vec<DataRow>> {
        let mut by_attribute: BTreeMap<AttributeKey, Vec<&DataRow>> = BTreeMap::new();
        for row in self.tables.data.iter().filter(|row| row.object == object) {
            by_attribute.entry(row.attribute).or_default().push(row);
        }
        Ok(by_attribute
            .into_values()
            .filter_map(|writes| self.tables.lineage.resolve(slice, writes))
            .cloned()
            .collect())
    }

    fn select_written_in(&self, slice: SliceId) -> StoreResult<Vec<DataRow>> {
        Ok(self
            .tables
            .data
            .iter()
            .filter(|row| row.slice == slice)
            .cloned()
            .collect())
    }

    fn count_writes(&self, object: ObjectKey, attribute: AttributeKey) -> StoreResult<usize> {
        Ok(self
            .tables
            .data
            .iter()
            .chain(self.tables.staging.iter())
            .filter(|row| row.object == object && row.attribute == attribute)
            .count())
    }

    fn reset(&mut self) -> StoreResult<()> {
        let previous = std::mem::take(&mut self.tables);
        self.record(Undo::Reset(Box::new(previous)));
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("objects", &self.tables.objects.len())
            .field("slices", &self.tables.slices.len())
            .field("data", &self.tables.data.len())
            .field("staging", &self.tables.staging.len())
            .field("in_transaction", &self.journal.is_some())
            .finish()
    }
}
