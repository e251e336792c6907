//! Change-tracked entities.
//!
//! Objects and properties share one lifecycle, recorded in [`EntityMeta`]:
//!
//! ```text
//! Detached -> Added -> Unchanged <-> Modified
//! Added | Unchanged | Modified -> Deleted
//! ```
//!
//! An entity does not hold a reference to its manager. Attaching records the
//! manager's [`ManagerId`] and the slice that was current at the time, which
//! is all `is_relevant` needs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;

use strata_types::{AttributeKey, EntryState, ObjectKey, SliceId, Value};

use crate::error::{CoreError, CoreResult};
use crate::manager::Manager;

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a [`Manager`] instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ManagerId(u64);

impl ManagerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "manager#{}", self.0)
    }
}

/// Tracking data shared by every entity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EntityMeta {
    state: EntryState,
    slice: Option<SliceId>,
    manager: Option<ManagerId>,
}

impl EntityMeta {
    pub fn state(&self) -> EntryState {
        self.state
    }

    /// The slice in which the entity was last known to be in sync.
    pub fn slice(&self) -> Option<SliceId> {
        self.slice
    }

    pub fn manager(&self) -> Option<ManagerId> {
        self.manager
    }

    pub(crate) fn attach(&mut self, manager: ManagerId, slice: Option<SliceId>) {
        self.manager = Some(manager);
        self.slice = slice;
        if self.state == EntryState::Detached {
            self.state = EntryState::Added;
        }
    }

    /// Record that the entity now matches the store as of `slice`.
    pub(crate) fn synced(&mut self, manager: ManagerId, slice: Option<SliceId>) {
        self.manager = Some(manager);
        self.slice = slice;
        self.state = EntryState::Unchanged;
    }

    pub(crate) fn set_state(&mut self, state: EntryState) {
        self.state = state;
    }

    /// Note a value change. Entities not yet persisted keep their state.
    fn touch(&mut self) {
        if matches!(self.state, EntryState::Unchanged | EntryState::Modified) {
            self.state = EntryState::Modified;
        }
    }
}

/// Behavior shared by objects and properties.
pub trait Entity {
    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn state(&self) -> EntryState {
        self.meta().state()
    }

    fn is_attached(&self) -> bool {
        self.meta().manager().is_some()
    }

    /// `true` when the entity belongs to `manager` and was recorded in its
    /// current slice. This says nothing about whether the value is fresh.
    fn is_relevant(&self, manager: &Manager) -> bool {
        let meta = self.meta();
        meta.manager() == Some(manager.id())
            && meta.slice().is_some()
            && meta.slice() == manager.current_slice_id()
    }

    /// Flag the entity for removal on the next save.
    fn mark_deleted(&mut self) {
        self.meta_mut().set_state(EntryState::Deleted);
    }
}

/// An object row as seen through a manager.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectEntry {
    pub key: ObjectKey,
    pub type_name: String,
    meta: EntityMeta,
}

impl ObjectEntry {
    /// A detached object that has not been stored yet.
    pub fn new(key: ObjectKey, type_name: impl Into<String>) -> Self {
        Self {
            key,
            type_name: type_name.into(),
            meta: EntityMeta::default(),
        }
    }
}

impl Entity for ObjectEntry {
    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

/// One attribute value of one object.
#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    pub object: ObjectKey,
    pub attribute: AttributeKey,
    value: Value,
    meta: EntityMeta,
}

impl Property {
    /// A detached property holding `value`.
    pub fn new(object: ObjectKey, attribute: AttributeKey, value: Value) -> Self {
        Self {
            object,
            attribute,
            value,
            meta: EntityMeta::default(),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Decode the value into `T`.
    pub fn get<T: DeserializeOwned>(&self) -> CoreResult<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }

    /// Replace the value. Refused once the property is `Deleted`.
    pub fn set_value<T: Serialize>(&mut self, value: T) -> CoreResult<()> {
        let value = serde_json::to_value(value)?;
        self.replace_value(value)
    }

    pub(crate) fn replace_value(&mut self, value: Value) -> CoreResult<()> {
        if self.meta.state() == EntryState::Deleted {
            return Err(CoreError::protocol(format!(
                "property {}/{} is deleted",
                self.object, self.attribute
            )));
        }
        self.value = value;
        self.meta.touch();
        Ok(())
    }

    /// Reload from a stored value without marking the entity dirty.
    pub(crate) fn load(&mut self, value: Value) {
        self.value = value;
    }

    /// Whether saving this property would write anything.
    pub fn is_dirty(&self) -> bool {
        self.state() == EntryState::Detached || self.state().is_pending()
    }
}

impl Entity for Property {
    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}
