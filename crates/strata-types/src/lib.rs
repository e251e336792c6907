//! Foundation types for Strata, a versioned entity-attribute-value store.
//!
//! Every other Strata crate depends on `strata-types`.
//!
//! # Key Types
//!
//! - [`ObjectKey`]: unique identifier of a stored object
//! - [`AttributeKey`]: identifier of an attribute within an object
//! - [`SliceId`] / [`Slice`]: immutable nodes of the version tree
//! - [`EntryState`]: change-tracking lifecycle of objects and properties
//! - [`ObjectRow`] / [`DataRow`]: rows exchanged with storage backends

pub mod error;
pub mod ids;
pub mod row;
pub mod slice;
pub mod state;

pub use error::TypeError;
pub use ids::{AttributeKey, ObjectKey, SliceId};
pub use row::{DataRow, ObjectRow};
pub use slice::Slice;
pub use state::EntryState;

/// Opaque attribute value. Values are stored and returned as JSON.
pub type Value = serde_json::Value;
