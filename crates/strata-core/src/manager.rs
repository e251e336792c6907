use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use strata_store::{Backend, InMemoryBackend};
use strata_types::{AttributeKey, EntryState, ObjectKey, ObjectRow, Slice, SliceId, Value};

use crate::batch::BatchController;
use crate::cache::{CacheRepository, CachedType, ErasedRepository, Factory, RepoCheckpoint};
use crate::config::{BackendKind, StoreConfig};
use crate::entity::{Entity, ManagerId, ObjectEntry, Property};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventKind, EventRouter, EventStream, StoreEvent};

const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Orchestrates versioned reads and writes over a [`Backend`].
///
/// The manager owns the backend, the current slice pointer, the object key
/// counter, the batch controller and the registry of cache repositories.
/// It is a single-writer structure: every operation takes `&self` or
/// `&mut self` and completes before returning.
pub struct Manager {
    id: ManagerId,
    backend: Box<dyn Backend>,
    current: Option<Slice>,
    last_key: ObjectKey,
    batch: BatchController,
    repos: BTreeMap<String, Box<dyn ErasedRepository>>,
    events: EventRouter,
}

impl Manager {
    /// Wrap an existing backend. The key counter resumes after the largest
    /// stored object key.
    pub fn new(backend: Box<dyn Backend>) -> CoreResult<Self> {
        Self::with_event_capacity(backend, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(backend: Box<dyn Backend>, capacity: usize) -> CoreResult<Self> {
        let last_key = backend.max_object_key()?.unwrap_or(ObjectKey::new(0));
        let id = ManagerId::next();
        debug!(manager = %id, last_key = %last_key, "manager created");
        Ok(Self {
            id,
            backend,
            current: None,
            last_key,
            batch: BatchController::default(),
            repos: BTreeMap::new(),
            events: EventRouter::new(capacity),
        })
    }

    /// Build the configured backend and wrap it.
    pub fn open(config: &StoreConfig) -> CoreResult<Self> {
        let backend: Box<dyn Backend> = match config.backend {
            BackendKind::Memory => Box::new(InMemoryBackend::new()),
            BackendKind::Sqlite => open_sqlite(config)?,
        };
        let mut manager = Self::with_event_capacity(backend, config.event_capacity)?;
        if config.reset_on_open {
            manager.reset()?;
            if config.compact_on_reset {
                manager.compact()?;
            }
        }
        info!(backend = ?config.backend, path = ?config.path, "store opened");
        Ok(manager)
    }

    pub fn id(&self) -> ManagerId {
        self.id
    }

    /// Read-only access to the backend.
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    // ---- slices ----

    pub fn current_slice(&self) -> Option<Slice> {
        self.current
    }

    pub fn current_slice_id(&self) -> Option<SliceId> {
        self.current.map(|s| s.id)
    }

    /// Create a slice under `parent`. Without a parent the new slice becomes
    /// a sibling of the current slice (a root if there is no current slice
    /// or it is itself a root).
    pub fn add_slice(&mut self, parent: Option<&Slice>) -> CoreResult<Slice> {
        let parent = match parent {
            Some(p) => Some(p.id),
            None => self.current.and_then(|c| c.parent),
        };
        let slice = self.in_batch(|m| Ok(m.backend.insert_slice(parent)?))?;
        info!(slice = %slice.id, parent = ?parent, "slice created");
        Ok(slice)
    }

    /// Create a child of the current slice.
    pub fn add_next_slice(&mut self) -> CoreResult<Slice> {
        let current = self.current;
        self.add_slice(current.as_ref())
    }

    /// Move the current slice pointer. Stored data is untouched.
    pub fn set_current_slice(&mut self, slice: Slice) -> CoreResult<()> {
        let stored = self.get_slice(slice.id)?;
        let previous = self.current.replace(stored);
        info!(
            previous = ?previous.map(|s| s.id),
            current = %stored.id,
            "current slice changed"
        );
        self.events.emit(StoreEvent::SliceChanged {
            previous,
            current: stored,
        });
        Ok(())
    }

    /// Create a child of the current slice and switch to it.
    pub fn next_slice(&mut self) -> CoreResult<Slice> {
        let slice = self.add_next_slice()?;
        self.set_current_slice(slice)?;
        Ok(slice)
    }

    pub fn get_slice(&self, id: SliceId) -> CoreResult<Slice> {
        self.backend
            .select_slice(id)?
            .ok_or(CoreError::SliceNotFound(id))
    }

    /// Every slice, ascending by id.
    pub fn slices(&self) -> CoreResult<Vec<Slice>> {
        Ok(self.backend.select_slices()?)
    }

    /// Ancestors-or-self of `slice`, nearest first.
    pub fn lineage(&self, slice: &Slice) -> CoreResult<Vec<SliceId>> {
        Ok(self.backend.lineage(slice.id)?)
    }

    /// Every write made in exactly `slice`, as `Added` properties.
    pub fn slice_writes(&self, slice: &Slice) -> CoreResult<Vec<Property>> {
        self.get_slice(slice.id)?;
        let rows = self.backend.select_written_in(slice.id)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut property = Property::new(row.object, row.attribute, row.value);
                property.meta_mut().attach(self.id, Some(row.slice));
                property
            })
            .collect())
    }

    pub fn remove_slice(&mut self, _slice: &Slice) -> CoreResult<()> {
        Err(CoreError::Unimplemented("remove_slice"))
    }

    // ---- batches ----

    pub fn start_batch(&mut self) -> CoreResult<()> {
        self.batch.start(self.backend.as_mut())
    }

    pub fn end_batch(&mut self) -> CoreResult<()> {
        self.batch.end(self.backend.as_mut())?;
        for event in self.batch.take_committed() {
            self.events.emit(event);
        }
        Ok(())
    }

    pub fn batch_depth(&self) -> usize {
        self.batch.depth()
    }

    /// Run `f` inside a batch. If `f` fails the batch level is closed
    /// without committing, and the outermost level rolls back.
    pub fn in_batch<R>(&mut self, f: impl FnOnce(&mut Self) -> CoreResult<R>) -> CoreResult<R> {
        self.start_batch()?;
        match f(self) {
            Ok(value) => {
                self.end_batch()?;
                Ok(value)
            }
            Err(err) => {
                self.batch.abort(self.backend.as_mut());
                Err(err)
            }
        }
    }

    // ---- objects ----

    /// Next key from the counter. Keys strictly increase; once `u64::MAX`
    /// has been handed out every further call fails and the counter stays.
    pub fn get_unique_object_key(&mut self) -> CoreResult<ObjectKey> {
        let next = self
            .last_key
            .checked_next()
            .ok_or(CoreError::KeySpaceExhausted(self.last_key))?;
        self.last_key = next;
        Ok(next)
    }

    /// Store a new object row. An explicit key also advances the counter
    /// once it has been stored.
    pub fn create_object(&mut self, key: Option<ObjectKey>, type_name: &str) -> CoreResult<ObjectEntry> {
        let key = match key {
            Some(key) => key,
            None => self.get_unique_object_key()?,
        };
        let row = ObjectRow::new(key, type_name);
        self.in_batch(|m| Ok(m.backend.insert_object(&row)?))?;
        self.last_key = self.last_key.max(key);
        debug!(object = %key, type_name, "object created");
        self.notify(StoreEvent::ObjectsChanged {
            state: EntryState::Added,
            keys: vec![key],
        });
        Ok(self.entry_from_row(row))
    }

    pub fn object_exists(&self, key: ObjectKey) -> CoreResult<bool> {
        Ok(self.backend.select_object(key)?.is_some())
    }

    pub fn get_object(&self, key: ObjectKey) -> CoreResult<ObjectEntry> {
        let row = self
            .backend
            .select_object(key)?
            .ok_or(CoreError::ObjectNotFound(key))?;
        Ok(self.entry_from_row(row))
    }

    /// Objects of `type_name`, ordered by key. Empty when none match.
    pub fn get_objects_by_type(&self, type_name: &str) -> CoreResult<Vec<ObjectEntry>> {
        let rows = self.backend.select_objects_by_type(type_name)?;
        Ok(rows.into_iter().map(|row| self.entry_from_row(row)).collect())
    }

    /// Delete an object together with all of its attribute writes.
    pub fn remove_object(&mut self, key: ObjectKey) -> CoreResult<()> {
        let existed = self.in_batch(|m| Ok(m.backend.delete_object(key)?))?;
        if !existed {
            return Err(CoreError::ObjectNotFound(key));
        }
        debug!(object = %key, "object removed");
        self.notify(StoreEvent::ObjectsChanged {
            state: EntryState::Deleted,
            keys: vec![key],
        });
        Ok(())
    }

    // ---- properties ----

    /// A new, unsaved property attached to this manager.
    pub fn create_property<T: Serialize>(
        &self,
        object: ObjectKey,
        attribute: AttributeKey,
        value: T,
    ) -> CoreResult<Property> {
        let mut property = Property::new(object, attribute, serde_json::to_value(value)?);
        self.attach(&mut property);
        Ok(property)
    }

    /// The property visible from the current slice.
    pub fn get_property(&self, object: ObjectKey, attribute: AttributeKey) -> CoreResult<Property> {
        let value = self.visible_value(object, attribute)?;
        let mut property = Property::new(object, attribute, value);
        property.meta_mut().synced(self.id, self.current_slice_id());
        Ok(property)
    }

    /// Reload `property` from the current slice's lineage.
    pub fn fetch_property(&self, property: &mut Property) -> CoreResult<()> {
        let value = self.visible_value(property.object, property.attribute)?;
        property.load(value);
        property.meta_mut().synced(self.id, self.current_slice_id());
        Ok(())
    }

    /// Save `property` as a new write in the current slice.
    pub fn set_property(&mut self, property: &mut Property) -> CoreResult<()> {
        if property.state() == EntryState::Deleted {
            return self.remove_property(property);
        }
        self.in_batch(|m| m.stage_write(property.object, property.attribute, property.value().clone()))?;
        property.meta_mut().synced(self.id, self.current_slice_id());
        Ok(())
    }

    /// Append a write of `value` tagged with the current slice.
    pub fn set_value<T: Serialize>(
        &mut self,
        object: ObjectKey,
        attribute: AttributeKey,
        value: T,
    ) -> CoreResult<()> {
        let value = serde_json::to_value(value)?;
        self.in_batch(|m| m.stage_write(object, attribute, value))
    }

    pub fn get_value<T: DeserializeOwned>(&self, object: ObjectKey, attribute: AttributeKey) -> CoreResult<T> {
        self.get_property(object, attribute)?.get()
    }

    /// For every attribute `key` has ever had, the value visible from the
    /// current slice. Empty without a current slice.
    pub fn get_object_properties(&self, key: ObjectKey) -> CoreResult<Vec<Property>> {
        let Some(slice) = self.current else {
            return Ok(Vec::new());
        };
        let rows = self.backend.select_visible_for_object(slice.id, key)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut property = Property::new(row.object, row.attribute, row.value);
                property.meta_mut().synced(self.id, Some(slice.id));
                property
            })
            .collect())
    }

    pub fn remove_property(&mut self, _property: &Property) -> CoreResult<()> {
        Err(CoreError::Unimplemented("remove_property"))
    }

    /// Stored writes for the pair, staged or flushed, across all slices.
    pub fn write_count(&self, object: ObjectKey, attribute: AttributeKey) -> CoreResult<usize> {
        Ok(self.backend.count_writes(object, attribute)?)
    }

    /// Attach `entity` to this manager in the current slice.
    pub fn attach<E: Entity + ?Sized>(&self, entity: &mut E) {
        entity.meta_mut().attach(self.id, self.current_slice_id());
    }

    fn visible_value(&self, object: ObjectKey, attribute: AttributeKey) -> CoreResult<Value> {
        let not_found = CoreError::PropertyNotFound { object, attribute };
        let Some(slice) = self.current else {
            return Err(not_found);
        };
        self.backend
            .select_visible(slice.id, object, attribute)?
            .map(|row| row.value)
            .ok_or(not_found)
    }

    fn stage_write(&mut self, object: ObjectKey, attribute: AttributeKey, value: Value) -> CoreResult<()> {
        let Some(slice) = self.current else {
            return Err(CoreError::protocol("attribute write with no current slice"));
        };
        self.batch.note_write()?;
        self.backend.insert_staging(object, attribute, &value, slice.id)?;
        debug!(object = %object, attribute = %attribute, slice = %slice.id, "write staged");
        self.notify(StoreEvent::DataChanged {
            state: EntryState::Modified,
            slice: slice.id,
            entries: vec![(object, attribute)],
        });
        Ok(())
    }

    /// Publish `event` now, or when the open batch commits.
    fn notify(&mut self, event: StoreEvent) {
        if let Err(event) = self.batch.defer(event) {
            self.events.emit(event);
        }
    }

    fn entry_from_row(&self, row: ObjectRow) -> ObjectEntry {
        let mut entry = ObjectEntry::new(row.key, row.type_name);
        entry.meta_mut().synced(self.id, self.current_slice_id());
        entry
    }

    // ---- cache repositories ----

    /// Register a repository built with [`CachedType::from_cached`].
    pub fn create_repo<T: CachedType>(&mut self, name: &str) -> CoreResult<()> {
        self.create_repo_with::<T>(name, T::from_cached)
    }

    /// Register a repository that builds its elements with `factory`.
    pub fn create_repo_with<T: CachedType>(&mut self, name: &str, factory: Factory<T>) -> CoreResult<()> {
        if self.repos.contains_key(name) {
            return Err(CoreError::RepoExists(name.to_string()));
        }
        let repo = CacheRepository::with_factory(name, factory);
        self.repos.insert(name.to_string(), Box::new(repo));
        info!(repo = name, element = std::any::type_name::<T>(), "repository registered");
        Ok(())
    }

    pub fn get_repo<T: CachedType>(&self, name: &str) -> CoreResult<&CacheRepository<T>> {
        let repo = self
            .repos
            .get(name)
            .ok_or_else(|| CoreError::RepoNotFound(name.to_string()))?;
        repo.as_any()
            .downcast_ref::<CacheRepository<T>>()
            .ok_or_else(|| mismatch::<T>(name))
    }

    pub fn get_repo_mut<T: CachedType>(&mut self, name: &str) -> CoreResult<&mut CacheRepository<T>> {
        let repo = self
            .repos
            .get_mut(name)
            .ok_or_else(|| CoreError::RepoNotFound(name.to_string()))?;
        repo.as_any_mut()
            .downcast_mut::<CacheRepository<T>>()
            .ok_or_else(|| mismatch::<T>(name))
    }

    /// Run `f` with a registered repository and the manager side by side,
    /// for operations such as `refresh` and `commit` that need both.
    pub fn with_repo<T, R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut CacheRepository<T>, &mut Manager) -> CoreResult<R>,
    ) -> CoreResult<R>
    where
        T: CachedType,
    {
        self.get_repo::<T>(name)?;
        let erased = self
            .repos
            .remove(name)
            .ok_or_else(|| CoreError::RepoNotFound(name.to_string()))?;
        let mut repo = erased
            .into_any()
            .downcast::<CacheRepository<T>>()
            .map_err(|_| mismatch::<T>(name))?;
        let result = f(&mut repo, self);
        self.repos.insert(name.to_string(), repo);
        result
    }

    pub fn remove_repo(&mut self, name: &str) -> CoreResult<()> {
        if self.repos.remove(name).is_none() {
            return Err(CoreError::RepoNotFound(name.to_string()));
        }
        info!(repo = name, "repository removed");
        Ok(())
    }

    pub fn repo_names(&self) -> impl Iterator<Item = &str> {
        self.repos.keys().map(String::as_str)
    }

    /// `true` if any registered repository holds unsaved changes.
    pub fn has_changes(&self) -> bool {
        self.repos.values().any(|repo| repo.has_changes())
    }

    /// Commit every registered repository inside one batch. If any of them
    /// fails, all of them keep their unsaved changes.
    pub fn commit(&mut self) -> CoreResult<()> {
        let mut repos = std::mem::take(&mut self.repos);
        let checkpoints: Vec<(String, RepoCheckpoint)> = repos
            .iter()
            .map(|(name, repo)| (name.clone(), repo.checkpoint()))
            .collect();
        let result = self.in_batch(|m| {
            for (name, repo) in repos.iter_mut() {
                if repo.has_changes() {
                    debug!(repo = %name, "committing repository");
                    repo.commit(m)?;
                }
            }
            Ok(())
        });
        match &result {
            Ok(()) if self.batch.is_open() => {}
            Ok(()) => repos.values_mut().for_each(|repo| repo.finish_commit()),
            Err(_) => {
                for (name, checkpoint) in checkpoints {
                    if let Some(repo) = repos.get_mut(&name) {
                        repo.restore(checkpoint);
                    }
                }
            }
        }
        repos.append(&mut self.repos);
        self.repos = repos;
        result
    }

    // ---- events ----

    /// Receive every event from now on.
    pub fn subscribe(&mut self) -> EventStream {
        self.events.subscribe(None)
    }

    /// Receive only events of the given kinds.
    pub fn subscribe_filtered(&mut self, kinds: &[EventKind]) -> EventStream {
        self.events.subscribe(Some(kinds.to_vec()))
    }

    // ---- maintenance ----

    /// Truncate every table and forget the current slice. Registered
    /// repositories are kept; refresh them to observe the empty store.
    pub fn reset(&mut self) -> CoreResult<()> {
        if self.batch.is_open() {
            return Err(CoreError::protocol("reset inside an open batch"));
        }
        self.backend.reset()?;
        self.batch.clear();
        self.current = None;
        self.last_key = ObjectKey::new(0);
        info!("store reset");
        Ok(())
    }

    pub fn compact(&mut self) -> CoreResult<()> {
        if self.batch.is_open() {
            return Err(CoreError::protocol("compact inside an open batch"));
        }
        self.backend.compact()?;
        debug!("store compacted");
        Ok(())
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("id", &self.id)
            .field("current", &self.current)
            .field("last_key", &self.last_key)
            .field("batch_depth", &self.batch.depth())
            .field("repos", &self.repos.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn mismatch<T>(name: &str) -> CoreError {
    CoreError::RepoTypeMismatch {
        name: name.to_string(),
        expected: std::any::type_name::<T>(),
    }
}

#[cfg(feature = "sqlite")]
fn open_sqlite(config: &StoreConfig) -> CoreResult<Box<dyn Backend>> {
    let backend = match &config.path {
        Some(path) => strata_store::SqliteBackend::open(path)?,
        None => strata_store::SqliteBackend::open_in_memory()?,
    };
    Ok(Box::new(backend))
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(_config: &StoreConfig) -> CoreResult<Box<dyn Backend>> {
    Err(CoreError::Config("built without sqlite support".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedObject;
    use crate::error::ErrorKind;
    use proptest::prelude::*;
    use strata_store::StoreError;

    const X: AttributeKey = AttributeKey::new(1);

    fn memory() -> Manager {
        Manager::open(&StoreConfig::memory()).unwrap()
    }

    #[test]
    fn slice_switch_scenario() {
        let mut m = memory();
        let root = m.add_slice(None).unwrap();
        m.set_current_slice(root).unwrap();
        let o = m.create_object(None, "thing").unwrap().key;
        m.set_value(o, X, "foo").unwrap();

        let child = m.next_slice().unwrap();
        assert_eq!(child.parent, Some(root.id));
        m.set_value(o, X, "baz").unwrap();
        assert_eq!(m.get_value::<String>(o, X).unwrap(), "baz");

        m.set_current_slice(root).unwrap();
        assert_eq!(m.get_value::<String>(o, X).unwrap(), "foo");
    }

    #[test]
    fn ancestor_write_visible_until_overridden() {
        let mut m = memory();
        let a = m.next_slice().unwrap();
        let o = m.create_object(None, "thing").unwrap().key;
        m.set_value(o, X, 1).unwrap();
        let b = m.next_slice().unwrap();
        let c = m.next_slice().unwrap();
        assert_eq!(m.get_value::<i32>(o, X).unwrap(), 1);

        m.set_current_slice(b).unwrap();
        m.set_value(o, X, 2).unwrap();
        m.set_current_slice(c).unwrap();
        assert_eq!(m.get_value::<i32>(o, X).unwrap(), 2);
        m.set_current_slice(a).unwrap();
        assert_eq!(m.get_value::<i32>(o, X).unwrap(), 1);
        assert_eq!(m.lineage(&c).unwrap(), vec![c.id, b.id, a.id]);
    }

    #[test]
    fn add_slice_without_parent_uses_current_parent() {
        let mut m = memory();
        let root = m.next_slice().unwrap();
        let child = m.next_slice().unwrap();
        let sibling = m.add_slice(None).unwrap();
        assert_eq!(sibling.parent, Some(root.id));
        assert!(sibling.id > child.id);
        assert_eq!(m.slices().unwrap().len(), 3);
    }

    #[test]
    fn unknown_slice_is_rejected() {
        let mut m = memory();
        let ghost = Slice::root(SliceId::new(42));
        assert!(matches!(
            m.set_current_slice(ghost),
            Err(CoreError::SliceNotFound(_))
        ));
        assert!(matches!(
            m.add_slice(Some(&ghost)),
            Err(CoreError::SliceNotFound(_))
        ));
        assert_eq!(m.batch_depth(), 0);
    }

    #[test]
    fn explicit_key_advances_counter() {
        let mut m = memory();
        m.create_object(Some(ObjectKey::new(50)), "thing").unwrap();
        let generated = m.create_object(None, "thing").unwrap();
        assert_eq!(generated.key, ObjectKey::new(51));
    }

    #[test]
    fn exhausted_key_space_is_reported() {
        let mut m = memory();
        let top = ObjectKey::new(u64::MAX);
        m.create_object(Some(top), "thing").unwrap();

        let err = m.create_object(None, "thing").unwrap_err();
        assert!(matches!(err, CoreError::KeySpaceExhausted(k) if k == top));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(m.get_unique_object_key().is_err());
        assert_eq!(m.get_objects_by_type("thing").unwrap().len(), 1);
    }

    #[test]
    fn rejected_explicit_key_leaves_counter() {
        let config = StoreConfig {
            backend: BackendKind::Sqlite,
            ..StoreConfig::memory()
        };
        let mut m = Manager::open(&config).unwrap();
        let beyond = ObjectKey::new(i64::MAX as u64 + 1);
        let err = m.create_object(Some(beyond), "thing").unwrap_err();
        assert!(matches!(err, CoreError::Store(StoreError::KeyOutOfRange(_))));
        assert_eq!(m.batch_depth(), 0);
        assert_eq!(m.create_object(None, "thing").unwrap().key, ObjectKey::new(1));
    }

    #[test]
    fn duplicate_object_conflicts() {
        let mut m = memory();
        m.create_object(Some(ObjectKey::new(3)), "thing").unwrap();
        let err = m.create_object(Some(ObjectKey::new(3)), "thing").unwrap_err();
        assert!(matches!(err, CoreError::ObjectExists(_)));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn lookups_report_not_found() {
        let mut m = memory();
        m.next_slice().unwrap();
        let missing = ObjectKey::new(9);
        assert!(matches!(m.get_object(missing), Err(CoreError::ObjectNotFound(_))));
        assert!(matches!(
            m.get_property(missing, X),
            Err(CoreError::PropertyNotFound { .. })
        ));
        assert!(m.get_objects_by_type("thing").unwrap().is_empty());
        assert!(m.get_object_properties(missing).unwrap().is_empty());
        assert!(matches!(m.remove_object(missing), Err(CoreError::ObjectNotFound(_))));
    }

    #[test]
    fn write_without_slice_is_violation() {
        let mut m = memory();
        let o = m.create_object(None, "thing").unwrap().key;
        let err = m.set_value(o, X, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert_eq!(m.batch_depth(), 0);
        assert_eq!(m.write_count(o, X).unwrap(), 0);
    }

    #[test]
    fn end_batch_without_start_is_violation() {
        let mut m = memory();
        assert!(matches!(m.end_batch(), Err(CoreError::ProtocolViolation(_))));
    }

    #[test]
    fn staged_writes_flush_at_outer_end() {
        let mut m = memory();
        m.next_slice().unwrap();
        let o = m.create_object(None, "thing").unwrap().key;

        m.start_batch().unwrap();
        m.start_batch().unwrap();
        m.set_value(o, X, "pending").unwrap();
        m.end_batch().unwrap();
        assert!(m.backend().in_transaction());
        assert!(m.get_property(o, X).is_err());
        assert_eq!(m.backend().staging_len().unwrap(), 1);

        m.end_batch().unwrap();
        assert!(!m.backend().in_transaction());
        assert_eq!(m.get_value::<String>(o, X).unwrap(), "pending");
    }

    #[test]
    fn failed_batch_rolls_back() {
        let mut m = memory();
        m.next_slice().unwrap();
        let o = m.create_object(None, "thing").unwrap().key;
        let result: CoreResult<()> = m.in_batch(|m| {
            m.set_value(o, X, 1)?;
            m.create_object(Some(o), "thing")?;
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(m.batch_depth(), 0);
        assert_eq!(m.write_count(o, X).unwrap(), 0);
    }

    #[test]
    fn properties_roundtrip_through_entities() {
        let mut m = memory();
        let slice = m.next_slice().unwrap();
        let o = m.create_object(None, "thing").unwrap().key;

        let mut p = m.create_property(o, X, vec![1, 2]).unwrap();
        assert_eq!(p.state(), EntryState::Added);
        m.set_property(&mut p).unwrap();
        assert_eq!(p.state(), EntryState::Unchanged);
        assert!(p.is_relevant(&m));

        let mut stale = m.get_property(o, X).unwrap();
        m.set_value(o, X, vec![3]).unwrap();
        m.fetch_property(&mut stale).unwrap();
        assert_eq!(stale.get::<Vec<i32>>().unwrap(), vec![3]);

        let writes = m.slice_writes(&slice).unwrap();
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| w.state() == EntryState::Added));
    }

    #[test]
    fn object_properties_resolve_per_attribute() {
        let mut m = memory();
        m.next_slice().unwrap();
        let o = m.create_object(None, "thing").unwrap().key;
        m.set_value(o, AttributeKey::new(1), "a").unwrap();
        m.set_value(o, AttributeKey::new(2), "b").unwrap();
        m.next_slice().unwrap();
        m.set_value(o, AttributeKey::new(2), "c").unwrap();

        let values: Vec<Value> = m
            .get_object_properties(o)
            .unwrap()
            .into_iter()
            .map(|p| p.value().clone())
            .collect();
        assert_eq!(values, vec![Value::from("a"), Value::from("c")]);
    }

    #[test]
    fn unsupported_removals() {
        let mut m = memory();
        let slice = m.next_slice().unwrap();
        let p = Property::new(ObjectKey::new(1), X, Value::Null);
        assert!(matches!(m.remove_slice(&slice), Err(CoreError::Unimplemented(_))));
        assert!(matches!(m.remove_property(&p), Err(CoreError::Unimplemented(_))));
    }

    #[test]
    fn remove_object_drops_history() {
        let mut m = memory();
        m.next_slice().unwrap();
        let o = m.create_object(None, "thing").unwrap().key;
        m.set_value(o, X, 1).unwrap();
        m.remove_object(o).unwrap();
        assert!(!m.object_exists(o).unwrap());
        assert_eq!(m.write_count(o, X).unwrap(), 0);
    }

    #[test]
    fn repo_registry() {
        let mut m = memory();
        m.create_repo::<CachedObject>("person").unwrap();
        assert!(matches!(
            m.create_repo::<CachedObject>("person"),
            Err(CoreError::RepoExists(_))
        ));
        assert_eq!(m.get_repo::<CachedObject>("person").unwrap().name(), "person");
        assert!(matches!(
            m.get_repo::<CachedObject>("car"),
            Err(CoreError::RepoNotFound(_))
        ));
        assert_eq!(m.repo_names().collect::<Vec<_>>(), vec!["person"]);
        m.remove_repo("person").unwrap();
        assert!(matches!(m.remove_repo("person"), Err(CoreError::RepoNotFound(_))));
    }

    struct Tagged(CachedObject);

    impl CachedType for Tagged {
        fn from_cached(object: CachedObject) -> Self {
            Tagged(object)
        }

        fn cached(&self) -> &CachedObject {
            &self.0
        }

        fn cached_mut(&mut self) -> &mut CachedObject {
            &mut self.0
        }
    }

    #[test]
    fn repo_type_mismatch() {
        let mut m = memory();
        m.create_repo::<Tagged>("person").unwrap();
        assert!(matches!(
            m.get_repo::<CachedObject>("person"),
            Err(CoreError::RepoTypeMismatch { .. })
        ));
        let result = m.with_repo::<CachedObject, _>("person", |_, _| Ok(()));
        assert!(result.is_err());
        assert!(m.get_repo::<Tagged>("person").is_ok());
    }

    #[test]
    fn commit_saves_all_repositories() {
        let mut m = memory();
        m.next_slice().unwrap();
        m.create_repo::<CachedObject>("person").unwrap();
        assert!(!m.has_changes());

        let key = m
            .with_repo::<CachedObject, _>("person", |repo, m| {
                let object = repo.create_object(m)?;
                object.set_property(m, X, "ada")?;
                Ok(object.key())
            })
            .unwrap();
        assert!(m.has_changes());

        m.commit().unwrap();
        assert!(!m.has_changes());
        assert_eq!(m.get_value::<String>(key, X).unwrap(), "ada");
        assert!(m.get_repo::<CachedObject>("person").is_ok());
    }

    #[test]
    fn failed_commit_keeps_every_repository_dirty() {
        let mut m = memory();
        m.next_slice().unwrap();
        m.create_repo::<CachedObject>("person").unwrap();
        let (a, b) = m
            .with_repo::<CachedObject, _>("person", |repo, m| {
                let a = repo.create_object(m)?;
                a.set_property(m, X, "old")?;
                let a = a.key();
                let b = repo.create_object(m)?;
                b.set_property(m, X, "old")?;
                Ok((a, b.key()))
            })
            .unwrap();
        m.commit().unwrap();

        m.next_slice().unwrap();
        m.with_repo::<CachedObject, _>("person", |repo, m| {
            repo.get_object_mut(a)?.set_property(m, X, "new")?;
            repo.get_object_mut(b)?
                .property_mut(X)
                .ok_or(CoreError::PropertyNotFound { object: b, attribute: X })?
                .mark_deleted();
            Ok(())
        })
        .unwrap();
        assert!(matches!(m.commit(), Err(CoreError::Unimplemented(_))));

        assert!(m.has_changes());
        let repo = m.get_repo::<CachedObject>("person").unwrap();
        let cached = repo.get_object(a).unwrap();
        assert_eq!(cached.property(X).unwrap().state(), EntryState::Modified);
        assert_eq!(cached.get_property::<String>(X).unwrap(), "new");
        assert_eq!(m.get_value::<String>(a, X).unwrap(), "old");
    }

    #[test]
    fn commit_without_changes_is_inert() {
        let mut m = memory();
        m.create_repo::<CachedObject>("person").unwrap();
        assert!(!m.has_changes());
        m.commit().unwrap();
        assert!(!m.has_changes());
        assert!(m.backend().select_slices().unwrap().is_empty());
    }

    #[test]
    fn events_follow_mutations() {
        let mut m = memory();
        let mut all = m.subscribe();
        let mut slices = m.subscribe_filtered(&[EventKind::SliceChanged]);

        let root = m.next_slice().unwrap();
        let o = m.create_object(None, "thing").unwrap().key;
        m.set_value(o, X, true).unwrap();

        assert_eq!(
            all.try_recv().unwrap(),
            StoreEvent::SliceChanged {
                previous: None,
                current: root
            }
        );
        assert_eq!(all.try_recv().unwrap().kind(), EventKind::ObjectsChanged);
        assert_eq!(all.try_recv().unwrap().kind(), EventKind::DataChanged);
        assert_eq!(slices.try_recv().unwrap().kind(), EventKind::SliceChanged);
        assert!(slices.try_recv().is_err());
    }

    #[test]
    fn events_wait_for_outermost_commit() {
        let mut m = memory();
        m.next_slice().unwrap();
        let mut data = m.subscribe_filtered(&[EventKind::ObjectsChanged, EventKind::DataChanged]);

        m.start_batch().unwrap();
        let o = m.create_object(None, "thing").unwrap().key;
        m.set_value(o, X, 1).unwrap();
        assert!(data.try_recv().is_err());

        m.end_batch().unwrap();
        assert_eq!(data.try_recv().unwrap().kind(), EventKind::ObjectsChanged);
        assert_eq!(data.try_recv().unwrap().kind(), EventKind::DataChanged);
        assert!(data.try_recv().is_err());
    }

    #[test]
    fn rolled_back_batch_publishes_nothing() {
        let mut m = memory();
        m.next_slice().unwrap();
        let o = m.create_object(None, "thing").unwrap().key;
        let mut data = m.subscribe_filtered(&[EventKind::ObjectsChanged, EventKind::DataChanged]);

        let result: CoreResult<()> = m.in_batch(|m| {
            m.set_value(o, X, 1)?;
            m.remove_object(o)?;
            m.create_object(None, "thing")?;
            Err(CoreError::protocol("abandoned"))
        });
        assert!(result.is_err());
        assert!(data.try_recv().is_err());
        assert!(m.object_exists(o).unwrap());

        m.set_value(o, X, 2).unwrap();
        assert_eq!(data.try_recv().unwrap().kind(), EventKind::DataChanged);
    }

    #[test]
    fn reset_clears_store_and_pointer() {
        let mut m = memory();
        m.next_slice().unwrap();
        m.create_object(None, "thing").unwrap();
        m.reset().unwrap();
        assert!(m.current_slice().is_none());
        assert!(m.slices().unwrap().is_empty());
        assert_eq!(m.get_unique_object_key().unwrap(), ObjectKey::new(1));

        m.start_batch().unwrap();
        assert!(matches!(m.reset(), Err(CoreError::ProtocolViolation(_))));
        m.end_batch().unwrap();
    }

    #[test]
    fn sqlite_store_resumes_key_counter() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::sqlite(dir.path().join("strata.db"));
        {
            let mut m = Manager::open(&config).unwrap();
            let root = m.next_slice().unwrap();
            m.create_object(Some(ObjectKey::new(7)), "thing").unwrap();
            m.set_value(ObjectKey::new(7), X, "kept").unwrap();
            assert_eq!(root.id, SliceId::new(1));
        }
        let mut m = Manager::open(&config).unwrap();
        assert_eq!(m.get_unique_object_key().unwrap(), ObjectKey::new(8));
        m.set_current_slice(m.get_slice(SliceId::new(1)).unwrap()).unwrap();
        assert_eq!(m.get_value::<String>(ObjectKey::new(7), X).unwrap(), "kept");
        drop(m);

        let reset = StoreConfig {
            reset_on_open: true,
            ..config
        };
        let m = Manager::open(&reset).unwrap();
        assert!(m.slices().unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn generated_keys_strictly_increase(explicit in proptest::collection::vec(0u64..500, 0..8), generated in 1usize..8) {
            let mut m = memory();
            for raw in &explicit {
                let _ = m.create_object(Some(ObjectKey::new(*raw)), "thing");
            }
            let floor = explicit.iter().copied().max().unwrap_or(0);
            let mut previous = ObjectKey::new(floor);
            for _ in 0..generated {
                let key = m.create_object(None, "thing").unwrap().key;
                prop_assert!(key > previous);
                previous = key;
            }
        }

        #[test]
        fn writes_are_append_only(slices in proptest::collection::vec(0usize..3, 1..20)) {
            let mut m = memory();
            let mut created = vec![m.next_slice().unwrap()];
            created.push(m.next_slice().unwrap());
            created.push(m.next_slice().unwrap());
            let o = m.create_object(None, "thing").unwrap().key;
            for (i, pick) in slices.iter().enumerate() {
                m.set_current_slice(created[*pick]).unwrap();
                m.set_value(o, X, i).unwrap();
            }
            prop_assert_eq!(m.write_count(o, X).unwrap(), slices.len());
        }
    }
}
