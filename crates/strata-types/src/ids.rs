//! Integer identifiers for objects, attributes and slices.
//!
//! All three are thin newtypes over `u64` so they cannot be mixed up at call
//! sites. Backends that store signed integers convert at their boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

macro_rules! integer_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw integer.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// The raw integer value.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl FromStr for $name {
            type Err = TypeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim()
                    .parse::<u64>()
                    .map(Self)
                    .map_err(|_| TypeError::InvalidId {
                        kind: $label,
                        input: s.to_string(),
                    })
            }
        }
    };
}

integer_id!(
    /// Unique key of an object. Keys are never reused within a store.
    ObjectKey,
    "object"
);

integer_id!(
    /// Key of an attribute, scoped to its owning object.
    AttributeKey,
    "attribute"
);

integer_id!(
    /// Identifier of a slice. Assigned by the backend, strictly increasing.
    SliceId,
    "slice"
);

impl ObjectKey {
    /// The key immediately after this one, or `None` at `u64::MAX`.
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn display_is_raw_number() {
        assert_eq!(ObjectKey::new(42).to_string(), "42");
        assert_eq!(SliceId::new(7).to_string(), "7");
    }

    #[test]
    fn debug_names_the_kind() {
        assert_eq!(format!("{:?}", AttributeKey::new(3)), "AttributeKey(3)");
    }

    #[test]
    fn parse_rejects_garbage() {
        let err = "abc".parse::<SliceId>().unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidId {
                kind: "slice",
                input: "abc".into()
            }
        );
    }

    #[test]
    fn parse_trims_whitespace() {
        assert_eq!(" 12 ".parse::<ObjectKey>().unwrap(), ObjectKey::new(12));
    }

    #[test]
    fn checked_next_stops_at_max() {
        assert_eq!(ObjectKey::new(9).checked_next(), Some(ObjectKey::new(10)));
        assert_eq!(ObjectKey::new(u64::MAX).checked_next(), None);
    }

    #[test]
    fn serde_is_transparent() {
        let json = serde_json::to_string(&ObjectKey::new(5)).unwrap();
        assert_eq!(json, "5");
        let back: ObjectKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ObjectKey::new(5));
    }

    proptest! {
        #[test]
        fn ordering_follows_raw_value(a in 0u64..u64::MAX, b in 0u64..u64::MAX) {
            prop_assert_eq!(ObjectKey::new(a) < ObjectKey::new(b), a < b);
        }
    }
}
