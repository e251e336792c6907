use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, info, warn};

use strata_types::{EntryState, ObjectKey};

use super::object::ObjectCheckpoint;
use super::{CachedObject, CachedType};
use crate::entity::Entity;
use crate::error::{CoreError, CoreResult};
use crate::manager::Manager;

/// Builds a repository's element type from a freshly loaded object.
pub type Factory<T> = fn(CachedObject) -> T;

/// A named in-memory collection of objects of one type.
///
/// The repository name doubles as the object type: `refresh` loads every
/// object whose type equals the name.
pub struct CacheRepository<T: CachedType = CachedObject> {
    name: String,
    factory: Factory<T>,
    objects: BTreeMap<ObjectKey, T>,
    removed: BTreeSet<ObjectKey>,
}

impl<T: CachedType> CacheRepository<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_factory(name, T::from_cached)
    }

    pub fn with_factory(name: impl Into<String>, factory: Factory<T>) -> Self {
        Self {
            name: name.into(),
            factory,
            objects: BTreeMap::new(),
            removed: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, key: ObjectKey) -> bool {
        self.objects.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = ObjectKey> + '_ {
        self.objects.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.objects.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.objects.values_mut()
    }

    pub fn get_object(&self, key: ObjectKey) -> CoreResult<&T> {
        self.objects
            .get(&key)
            .ok_or(CoreError::CachedObjectNotFound(key))
    }

    pub fn get_object_mut(&mut self, key: ObjectKey) -> CoreResult<&mut T> {
        self.objects
            .get_mut(&key)
            .ok_or(CoreError::CachedObjectNotFound(key))
    }

    /// Start tracking `object`, attaching it to `manager`. The object takes
    /// the repository name as its type.
    pub fn attach_object(&mut self, manager: &Manager, mut object: T) -> CoreResult<&mut T> {
        let key = object.cached().key();
        if self.objects.contains_key(&key) {
            return Err(CoreError::CachedObjectExists(key));
        }
        if object.cached().type_name() != self.name {
            debug!(
                repo = %self.name,
                object = %key,
                previous = object.cached().type_name(),
                "object type replaced by repository name"
            );
            object.cached_mut().set_type_name(&self.name);
        }
        manager.attach(object.cached_mut());
        self.removed.remove(&key);
        debug!(repo = %self.name, object = %key, "object attached");
        Ok(self.objects.entry(key).or_insert(object))
    }

    /// Create and track an empty object under `key`.
    ///
    /// Fails if `key` is already tracked; use [`get_object`](Self::get_object)
    /// for objects that exist.
    pub fn create_object_with_key(&mut self, manager: &Manager, key: ObjectKey) -> CoreResult<&mut T> {
        if self.objects.contains_key(&key) {
            return Err(CoreError::CachedObjectExists(key));
        }
        let object = (self.factory)(CachedObject::new(key, self.name.clone()));
        self.attach_object(manager, object)
    }

    /// Create and track an empty object under a fresh key.
    pub fn create_object(&mut self, manager: &mut Manager) -> CoreResult<&mut T> {
        let key = manager.get_unique_object_key()?;
        self.create_object_with_key(manager, key)
    }

    /// Stop tracking `key`. Its stored row is deleted on the next commit.
    pub fn remove_object(&mut self, key: ObjectKey) -> CoreResult<T> {
        let object = self
            .objects
            .remove(&key)
            .ok_or(CoreError::CachedObjectNotFound(key))?;
        self.removed.insert(key);
        Ok(object)
    }

    pub fn has_changes(&self) -> bool {
        !self.removed.is_empty() || self.objects.values().any(|o| o.cached().has_changes())
    }

    /// Reconcile the collection with the manager's current view.
    ///
    /// Tracked objects still present in the store are reloaded in place, new
    /// ones are added, and the rest are dropped. Local changes are discarded.
    pub fn refresh(&mut self, manager: &Manager) -> CoreResult<()> {
        let mut stale: BTreeSet<ObjectKey> = self.objects.keys().copied().collect();

        for row in manager.get_objects_by_type(&self.name)? {
            stale.remove(&row.key);
            match self.objects.get_mut(&row.key) {
                Some(object) => object.cached_mut().reload(manager)?,
                None => {
                    let mut cached = CachedObject::new(row.key, row.type_name);
                    cached.reload(manager)?;
                    self.objects.insert(row.key, (self.factory)(cached));
                }
            }
        }

        if !stale.is_empty() {
            warn!(repo = %self.name, dropped = stale.len(), "dropping objects missing from store");
            for key in &stale {
                self.objects.remove(key);
            }
        }
        self.removed.clear();
        info!(repo = %self.name, objects = self.objects.len(), "repository refreshed");
        Ok(())
    }

    /// Save every changed object under one batch.
    ///
    /// If the batch fails every object's tracking state is restored, so the
    /// collection still reports the unsaved changes. Removed and deleted
    /// objects are forgotten only once the outermost batch has committed;
    /// inside a caller's batch they stay pending and a later commit skips
    /// them as already gone.
    pub fn commit(&mut self, manager: &mut Manager) -> CoreResult<()> {
        if !self.has_changes() {
            return Ok(());
        }
        let checkpoint = self.checkpoint();
        let removed = &self.removed;
        let objects = &mut self.objects;
        let result = manager.in_batch(|m| {
            for key in removed {
                match m.remove_object(*key) {
                    Ok(()) | Err(CoreError::ObjectNotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            }
            for object in objects.values_mut() {
                if object.cached().has_changes() {
                    object.cached_mut().save(m)?;
                }
            }
            Ok(())
        });
        if let Err(err) = result {
            warn!(repo = %self.name, error = %err, "repository commit rolled back");
            self.restore(checkpoint);
            return Err(err);
        }
        if manager.batch_depth() == 0 {
            self.finish_commit();
        }
        Ok(())
    }

    /// Tracking state of every changed object.
    pub(crate) fn checkpoint(&self) -> RepoCheckpoint {
        RepoCheckpoint(
            self.objects
                .iter()
                .filter(|(_, o)| o.cached().has_changes())
                .map(|(key, o)| (*key, o.cached().checkpoint()))
                .collect(),
        )
    }

    pub(crate) fn restore(&mut self, checkpoint: RepoCheckpoint) {
        for (key, saved) in checkpoint.0 {
            if let Some(object) = self.objects.get_mut(&key) {
                object.cached_mut().restore(saved);
            }
        }
    }

    /// Forget removed and deleted objects once their removal is durable.
    pub(crate) fn finish_commit(&mut self) {
        let removed = self.removed.len();
        self.removed.clear();
        self.objects
            .retain(|_, o| o.cached().state() != EntryState::Deleted);
        info!(repo = %self.name, removed, "repository committed");
    }
}

/// Saved tracking state of a repository's changed objects.
#[derive(Debug, Default)]
pub(crate) struct RepoCheckpoint(BTreeMap<ObjectKey, ObjectCheckpoint>);

impl<T: CachedType> fmt::Debug for CacheRepository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRepository")
            .field("name", &self.name)
            .field("objects", &self.objects.len())
            .field("removed", &self.removed.len())
            .finish()
    }
}
