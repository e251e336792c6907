//! Storage backends for Strata.
//!
//! A backend is the query/execution engine underneath the repository
//! manager. It stores five logical tables:
//!
//! - `Objects(id, type)`
//! - `Slices(id, parent_slice_id)`
//! - `AncestorLineage(child_slice_id, ancestor_slice_id)`, one row per
//!   slice and ancestor-or-self pair
//! - `Data(object_id, attribute_key, value, slice_id)`, append-only
//! - `StagingData`, the same shape as `Data`, emptied on every flush
//!
//! All backends implement the [`Backend`] trait:
//!
//! - [`InMemoryBackend`] is a collection-based store for tests and embedding
//! - [`SqliteBackend`] wraps a SQLite database (feature `sqlite`, on by default)
//!
//! # Design Rules
//!
//! 1. Attribute writes are never updated in place, only appended.
//! 2. The lineage rows of a slice are derived from its parent's rows when the
//!    slice is created and never change afterwards.
//! 3. Visibility is resolved by one ordered lookup over the lineage rows:
//!    greatest originating slice first, then latest write.
//! 4. Reads only ever see `Data`. Staged writes become visible on flush.

pub mod error;
pub mod lineage;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use lineage::LineageIndex;
pub use memory::InMemoryBackend;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
pub use traits::Backend;
