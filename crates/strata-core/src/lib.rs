//! Strata repository manager.
//!
//! Objects carry independently versioned attributes. Every attribute write
//! is appended under the current [`Slice`](strata_types::Slice), a node of an
//! immutable version tree, and reads resolve the most recent write visible
//! from the current slice's lineage.
//!
//! # Layers
//!
//! - [`Manager`] owns a [`Backend`](strata_store::Backend) and drives slices,
//!   objects, properties and nested batches
//! - [`entity`] holds the change-tracking state shared by objects and properties
//! - [`cache`] materializes typed objects in memory with refresh and commit
//! - [`events`] broadcasts slice, object and data changes to subscribers
//!
//! # Example
//!
//! ```
//! use strata_core::{Manager, StoreConfig};
//! use strata_types::AttributeKey;
//!
//! let mut manager = Manager::open(&StoreConfig::memory())?;
//! let root = manager.next_slice()?;
//! let key = manager.create_object(None, "note")?.key;
//! manager.set_value(key, AttributeKey::new(1), "draft")?;
//!
//! manager.next_slice()?;
//! manager.set_value(key, AttributeKey::new(1), "final")?;
//! assert_eq!(manager.get_value::<String>(key, AttributeKey::new(1))?, "final");
//!
//! manager.set_current_slice(root)?;
//! assert_eq!(manager.get_value::<String>(key, AttributeKey::new(1))?, "draft");
//! # Ok::<(), strata_core::CoreError>(())
//! ```

mod batch;
pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod manager;

pub use cache::{CacheRepository, CachedObject, CachedType, Factory};
pub use config::{BackendKind, StoreConfig};
pub use entity::{Entity, EntityMeta, ManagerId, ObjectEntry, Property};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use events::{EventKind, EventStream, StoreEvent};
pub use manager::Manager;
