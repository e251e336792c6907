use strata_types::{AttributeKey, DataRow, ObjectKey, ObjectRow, Slice, SliceId, Value};

use crate::error::StoreResult;

/// The query/execution engine underneath the repository manager.
///
/// All implementations must satisfy these invariants:
/// - Slice ids are assigned by the backend and strictly increase.
/// - `lineage(s)` is exactly `{s} ∪ lineage(parent(s))`, fixed at creation.
/// - `Data` is append-only; the only deletion path is [`delete_object`].
/// - Reads never observe `StagingData`.
///
/// Backends are driven by a single owner and are not required to be `Sync`.
///
/// [`delete_object`]: Backend::delete_object
pub trait Backend: Send {
    // ---- transactions ----

    /// Open a transaction. Fails if one is already open.
    fn begin(&mut self) -> StoreResult<()>;

    /// Commit the open transaction.
    fn commit(&mut self) -> StoreResult<()>;

    /// Discard everything written since `begin`.
    fn rollback(&mut self) -> StoreResult<()>;

    /// `true` while a transaction is open.
    fn in_transaction(&self) -> bool;

    // ---- objects ----

    /// Insert an object row. Fails with `DuplicateObject` if the key exists.
    fn insert_object(&mut self, row: &ObjectRow) -> StoreResult<()>;

    /// Look up an object by key. Returns `Ok(None)` if absent.
    fn select_object(&self, key: ObjectKey) -> StoreResult<Option<ObjectRow>>;

    /// All objects of the given type, ordered by key.
    fn select_objects_by_type(&self, type_name: &str) -> StoreResult<Vec<ObjectRow>>;

    /// Delete an object row together with every write for it.
    ///
    /// Returns `true` if the object existed.
    fn delete_object(&mut self, key: ObjectKey) -> StoreResult<bool>;

    /// The greatest object key in the store, if any.
    fn max_object_key(&self) -> StoreResult<Option<ObjectKey>>;

    // ---- slices ----

    /// Create a slice under `parent` (or a root slice) and record its lineage.
    fn insert_slice(&mut self, parent: Option<SliceId>) -> StoreResult<Slice>;

    /// Look up a slice by id. Returns `Ok(None)` if absent.
    fn select_slice(&self, id: SliceId) -> StoreResult<Option<Slice>>;

    /// Every slice, ordered by ascending id.
    fn select_slices(&self) -> StoreResult<Vec<Slice>>;

    /// Ancestors-or-self of `slice`, nearest first (descending id).
    fn lineage(&self, slice: SliceId) -> StoreResult<Vec<SliceId>>;

    // ---- attribute writes ----

    /// Append a write to the staging area.
    fn insert_staging(
        &mut self,
        object: ObjectKey,
        attribute: AttributeKey,
        value: &Value,
        slice: SliceId,
    ) -> StoreResult<()>;

    /// Number of rows waiting in the staging area.
    fn staging_len(&self) -> StoreResult<usize>;

    /// Copy every staged write into `Data` in insertion order, then clear
    /// the staging area. Returns the number of rows moved.
    fn flush_staging(&mut self) -> StoreResult<usize>;

    /// The write of `attribute` on `object` visible from `slice`.
    fn select_visible(
        &self,
        slice: SliceId,
        object: ObjectKey,
        attribute: AttributeKey,
    ) -> StoreResult<Option<DataRow>>;

    /// For every attribute `object` has ever had, the write visible from
    /// `slice`. One row per attribute, ordered by attribute key.
    fn select_visible_for_object(&self, slice: SliceId, object: ObjectKey)
        -> StoreResult<Vec<DataRow>>;

    /// Every write that originated in exactly `slice`, in write order.
    fn select_written_in(&self, slice: SliceId) -> StoreResult<Vec<DataRow>>;

    /// Total stored writes for an object/attribute pair, staged or not.
    fn count_writes(&self, object: ObjectKey, attribute: AttributeKey) -> StoreResult<usize>;

    // ---- maintenance ----

    /// Delete every row from every table. The schema is kept.
    fn reset(&mut self) -> StoreResult<()>;

    /// Reclaim free space. Backends without a notion of it do nothing.
    fn compact(&mut self) -> StoreResult<()> {
        Ok(())
    }
}
