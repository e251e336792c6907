//! Rows exchanged between the manager and a storage backend.

use serde::{Deserialize, Serialize};

use crate::ids::{AttributeKey, ObjectKey, SliceId};
use crate::Value;

/// A row of the `Objects` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRow {
    pub key: ObjectKey,
    pub type_name: String,
}

impl ObjectRow {
    pub fn new(key: ObjectKey, type_name: impl Into<String>) -> Self {
        Self {
            key,
            type_name: type_name.into(),
        }
    }
}

/// A single append-only attribute write.
///
/// `seq` is assigned by the backend in insertion order. Among writes that
/// originate in the same slice, the one with the greater `seq` is newer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    pub seq: u64,
    pub object: ObjectKey,
    pub attribute: AttributeKey,
    pub value: Value,
    pub slice: SliceId,
}
