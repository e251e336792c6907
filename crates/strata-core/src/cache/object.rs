use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use strata_types::{AttributeKey, EntryState, ObjectKey};

use crate::entity::{Entity, EntityMeta, ObjectEntry, Property};
use crate::error::{CoreError, CoreResult};
use crate::manager::Manager;

/// An object together with a local copy of its properties.
///
/// Reads and writes go against the local property set. Nothing reaches the
/// store until [`save`](Self::save) (or the owning repository's commit).
#[derive(Clone, Debug, PartialEq)]
pub struct CachedObject {
    entry: ObjectEntry,
    properties: BTreeMap<AttributeKey, Property>,
}

impl CachedObject {
    /// An empty, detached object.
    pub fn new(key: ObjectKey, type_name: impl Into<String>) -> Self {
        Self {
            entry: ObjectEntry::new(key, type_name),
            properties: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.entry.key
    }

    pub fn type_name(&self) -> &str {
        &self.entry.type_name
    }

    pub fn entry(&self) -> &ObjectEntry {
        &self.entry
    }

    pub fn properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.values()
    }

    pub fn property(&self, attribute: AttributeKey) -> Option<&Property> {
        self.properties.get(&attribute)
    }

    /// Direct access to a tracked property, e.g. to change a value that was
    /// already written in the current slice.
    pub fn property_mut(&mut self, attribute: AttributeKey) -> Option<&mut Property> {
        self.properties.get_mut(&attribute)
    }

    /// Set `attribute` in the local property set.
    ///
    /// The first write to an attribute creates a property attached to
    /// `manager`. A property recorded in an earlier slice is overwritten and
    /// re-stamped with the current slice, so its pending write lands there.
    /// A property already recorded in the current slice is a conflict.
    pub fn set_property<V: Serialize>(
        &mut self,
        manager: &Manager,
        attribute: AttributeKey,
        value: V,
    ) -> CoreResult<()> {
        let value = serde_json::to_value(value)?;
        let object = self.key();
        match self.properties.get_mut(&attribute) {
            Some(existing) => {
                if existing.state() != EntryState::Deleted && existing.is_relevant(manager) {
                    return Err(CoreError::PropertyExists { object, attribute });
                }
                existing.replace_value(value)?;
                existing.meta_mut().attach(manager.id(), manager.current_slice_id());
            }
            None => {
                let mut property = Property::new(object, attribute, value);
                manager.attach(&mut property);
                self.properties.insert(attribute, property);
            }
        }
        Ok(())
    }

    /// Read `attribute` from the local property set.
    pub fn get_property<V: DeserializeOwned>(&self, attribute: AttributeKey) -> CoreResult<V> {
        match self.properties.get(&attribute) {
            Some(property) if property.state() != EntryState::Deleted => property.get(),
            _ => Err(CoreError::PropertyNotFound {
                object: self.key(),
                attribute,
            }),
        }
    }

    pub fn has_changes(&self) -> bool {
        self.entry.state().is_pending() || self.properties.values().any(Property::is_dirty)
    }

    /// Push this object and its dirty properties through `manager` in one batch.
    ///
    /// On failure the batch is rolled back and the object's tracking state is
    /// put back as it was, so the same changes can be saved again.
    pub fn save(&mut self, manager: &mut Manager) -> CoreResult<()> {
        let checkpoint = self.checkpoint();
        let result = manager.in_batch(|m| self.save_in(m));
        if result.is_err() {
            self.restore(checkpoint);
        }
        result
    }

    fn save_in(&mut self, manager: &mut Manager) -> CoreResult<()> {
        let key = self.key();
        match self.entry.state() {
            EntryState::Deleted => {
                match manager.remove_object(key) {
                    Ok(()) | Err(CoreError::ObjectNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
                debug!(object = %key, "cached object deleted");
                return Ok(());
            }
            EntryState::Detached | EntryState::Added => {
                if !manager.object_exists(key)? {
                    manager.create_object(Some(key), &self.entry.type_name)?;
                }
            }
            EntryState::Unchanged | EntryState::Modified => {}
        }

        let mut saved = 0usize;
        for property in self.properties.values_mut().filter(|p| p.is_dirty()) {
            manager.set_property(property)?;
            saved += 1;
        }
        self.entry
            .meta_mut()
            .synced(manager.id(), manager.current_slice_id());
        debug!(object = %key, properties = saved, "cached object saved");
        Ok(())
    }

    pub(crate) fn checkpoint(&self) -> ObjectCheckpoint {
        ObjectCheckpoint {
            entry: self.entry.meta().clone(),
            properties: self
                .properties
                .iter()
                .map(|(attribute, p)| (*attribute, p.meta().clone()))
                .collect(),
        }
    }

    pub(crate) fn restore(&mut self, checkpoint: ObjectCheckpoint) {
        *self.entry.meta_mut() = checkpoint.entry;
        for (attribute, meta) in checkpoint.properties {
            if let Some(property) = self.properties.get_mut(&attribute) {
                *property.meta_mut() = meta;
            }
        }
    }

    pub(crate) fn set_type_name(&mut self, type_name: &str) {
        if self.entry.type_name != type_name {
            self.entry.type_name = type_name.to_string();
        }
    }

    /// Replace the local property set with what is visible from the
    /// manager's current slice.
    pub(crate) fn reload(&mut self, manager: &Manager) -> CoreResult<()> {
        let properties = manager.get_object_properties(self.key())?;
        self.properties = properties
            .into_iter()
            .map(|p| (p.attribute, p))
            .collect();
        self.entry
            .meta_mut()
            .synced(manager.id(), manager.current_slice_id());
        Ok(())
    }
}

/// Tracking state of a [`CachedObject`] and its properties. Values are not
/// included: saving never changes them.
#[derive(Clone, Debug)]
pub(crate) struct ObjectCheckpoint {
    entry: EntityMeta,
    properties: Vec<(AttributeKey, EntityMeta)>,
}

impl Entity for CachedObject {
    fn meta(&self) -> &EntityMeta {
        self.entry.meta()
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        self.entry.meta_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreConfig;

    fn attr(raw: u64) -> AttributeKey {
        AttributeKey::new(raw)
    }

    fn manager_with_slice() -> Manager {
        let mut manager = Manager::open(&StoreConfig::memory()).unwrap();
        manager.next_slice().unwrap();
        manager
    }

    #[test]
    fn first_write_attaches_property() {
        let manager = manager_with_slice();
        let mut object = CachedObject::new(ObjectKey::new(1), "point");
        object.set_property(&manager, attr(1), 3.5).unwrap();

        let property = object.property(attr(1)).unwrap();
        assert_eq!(property.state(), EntryState::Added);
        assert!(property.is_relevant(&manager));
        assert_eq!(object.get_property::<f64>(attr(1)).unwrap(), 3.5);
        assert!(object.has_changes());
    }

    #[test]
    fn second_write_in_same_slice_conflicts() {
        let manager = manager_with_slice();
        let mut object = CachedObject::new(ObjectKey::new(1), "point");
        object.set_property(&manager, attr(1), "a").unwrap();
        let err = object.set_property(&manager, attr(1), "b").unwrap_err();
        assert!(matches!(err, CoreError::PropertyExists { .. }));
        assert_eq!(object.get_property::<String>(attr(1)).unwrap(), "a");
    }

    #[test]
    fn stale_write_is_restamped() {
        let mut manager = manager_with_slice();
        let mut object = CachedObject::new(ObjectKey::new(1), "point");
        object.set_property(&manager, attr(1), "a").unwrap();
        object.save(&mut manager).unwrap();

        let next = manager.next_slice().unwrap();
        object.set_property(&manager, attr(1), "b").unwrap();
        let property = object.property(attr(1)).unwrap();
        assert_eq!(property.state(), EntryState::Modified);
        assert_eq!(property.meta().slice(), Some(next.id));
    }

    #[test]
    fn missing_property_is_not_found() {
        let object = CachedObject::new(ObjectKey::new(1), "point");
        assert!(matches!(
            object.get_property::<i32>(attr(9)),
            Err(CoreError::PropertyNotFound { .. })
        ));
    }

    #[test]
    fn save_persists_object_and_properties() {
        let mut manager = manager_with_slice();
        let mut object = CachedObject::new(ObjectKey::new(4), "point");
        manager.attach(&mut object);
        object.set_property(&manager, attr(1), 10).unwrap();
        object.set_property(&manager, attr(2), 20).unwrap();
        object.save(&mut manager).unwrap();

        assert_eq!(object.state(), EntryState::Unchanged);
        assert!(!object.has_changes());
        assert!(manager.object_exists(ObjectKey::new(4)).unwrap());
        assert_eq!(manager.get_value::<i32>(ObjectKey::new(4), attr(2)).unwrap(), 20);
    }

    #[test]
    fn saving_deleted_object_removes_it() {
        let mut manager = manager_with_slice();
        let mut object = CachedObject::new(ObjectKey::new(4), "point");
        object.set_property(&manager, attr(1), 1).unwrap();
        object.save(&mut manager).unwrap();

        object.mark_deleted();
        object.save(&mut manager).unwrap();
        assert!(!manager.object_exists(ObjectKey::new(4)).unwrap());
        assert_eq!(manager.write_count(ObjectKey::new(4), attr(1)).unwrap(), 0);
    }

    #[test]
    fn deleted_property_save_is_unimplemented() {
        let mut manager = manager_with_slice();
        let mut object = CachedObject::new(ObjectKey::new(4), "point");
        object.set_property(&manager, attr(1), 1).unwrap();
        object.save(&mut manager).unwrap();

        object.property_mut(attr(1)).unwrap().mark_deleted();
        assert!(object.has_changes());
        let err = object.save(&mut manager).unwrap_err();
        assert!(matches!(err, CoreError::Unimplemented(_)));
    }

    #[test]
    fn failed_save_keeps_earlier_properties_dirty() {
        let mut manager = manager_with_slice();
        let key = ObjectKey::new(4);
        let mut object = CachedObject::new(key, "point");
        object.set_property(&manager, attr(1), "old").unwrap();
        object.set_property(&manager, attr(2), 2).unwrap();
        object.save(&mut manager).unwrap();

        manager.next_slice().unwrap();
        object.set_property(&manager, attr(1), "new").unwrap();
        object.property_mut(attr(2)).unwrap().mark_deleted();
        assert!(object.save(&mut manager).is_err());

        let property = object.property(attr(1)).unwrap();
        assert_eq!(property.state(), EntryState::Modified);
        assert!(object.has_changes());
        assert_eq!(manager.get_value::<String>(key, attr(1)).unwrap(), "old");
        assert_eq!(manager.write_count(key, attr(1)).unwrap(), 1);
    }

    #[test]
    fn failed_first_save_leaves_object_unstored() {
        let mut manager = manager_with_slice();
        let key = ObjectKey::new(5);
        let mut object = CachedObject::new(key, "point");
        manager.attach(&mut object);
        object.set_property(&manager, attr(1), 1).unwrap();
        object.property_mut(attr(1)).unwrap().mark_deleted();

        assert!(object.save(&mut manager).is_err());
        assert_eq!(object.state(), EntryState::Added);
        assert!(!manager.object_exists(key).unwrap());
    }

    #[test]
    fn reload_reads_current_lineage() {
        let mut manager = manager_with_slice();
        let key = ObjectKey::new(2);
        manager.create_object(Some(key), "point").unwrap();
        manager.set_value(key, attr(1), "root").unwrap();

        let mut object = CachedObject::new(key, "point");
        object.reload(&manager).unwrap();
        assert_eq!(object.state(), EntryState::Unchanged);
        assert_eq!(object.get_property::<String>(attr(1)).unwrap(), "root");
        assert_eq!(object.properties().count(), 1);
    }
}
