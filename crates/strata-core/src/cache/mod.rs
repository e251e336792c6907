//! In-memory materialization of typed objects.
//!
//! A [`CacheRepository`] holds every object of one type, keyed by object key,
//! and is synchronized with a [`Manager`](crate::Manager) through `refresh`
//! (pull) and `commit` (push). Each tracked object is a [`CachedObject`], or
//! a caller type wrapping one that implements [`CachedType`].

mod object;
mod repository;

use std::any::Any;

pub use object::CachedObject;
pub use repository::{CacheRepository, Factory};
pub(crate) use repository::RepoCheckpoint;

use crate::error::CoreResult;
use crate::manager::Manager;

/// A type a cache repository can hold.
///
/// The repository builds instances through a factory, by default
/// [`CachedType::from_cached`].
pub trait CachedType: Send + 'static {
    fn from_cached(object: CachedObject) -> Self
    where
        Self: Sized;

    fn cached(&self) -> &CachedObject;

    fn cached_mut(&mut self) -> &mut CachedObject;
}

impl CachedType for CachedObject {
    fn from_cached(object: CachedObject) -> Self {
        object
    }

    fn cached(&self) -> &CachedObject {
        self
    }

    fn cached_mut(&mut self) -> &mut CachedObject {
        self
    }
}

/// Type-erased view of a repository held in the manager's registry.
pub(crate) trait ErasedRepository: Send {
    fn has_changes(&self) -> bool;

    fn commit(&mut self, manager: &mut Manager) -> CoreResult<()>;

    fn checkpoint(&self) -> RepoCheckpoint;

    fn restore(&mut self, checkpoint: RepoCheckpoint);

    fn finish_commit(&mut self);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: CachedType> ErasedRepository for CacheRepository<T> {
    fn has_changes(&self) -> bool {
        CacheRepository::has_changes(self)
    }

    fn commit(&mut self, manager: &mut Manager) -> CoreResult<()> {
        CacheRepository::commit(self, manager)
    }

    fn checkpoint(&self) -> RepoCheckpoint {
        CacheRepository::checkpoint(self)
    }

    fn restore(&mut self, checkpoint: RepoCheckpoint) {
        CacheRepository::restore(self, checkpoint)
    }

    fn finish_commit(&mut self) {
        CacheRepository::finish_commit(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
