use strata_store::StoreError;
use strata_types::{AttributeKey, ObjectKey, SliceId};
use thiserror::Error;

/// Errors from manager, batch and cache operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectKey),

    #[error("property not found: object {object}, attribute {attribute}")]
    PropertyNotFound {
        object: ObjectKey,
        attribute: AttributeKey,
    },

    #[error("slice not found: {0}")]
    SliceNotFound(SliceId),

    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("cached object not found: {0}")]
    CachedObjectNotFound(ObjectKey),

    #[error("object already exists: {0}")]
    ObjectExists(ObjectKey),

    #[error("object key space exhausted after {0}")]
    KeySpaceExhausted(ObjectKey),

    #[error("repository already exists: {0}")]
    RepoExists(String),

    #[error("cached object already exists: {0}")]
    CachedObjectExists(ObjectKey),

    #[error("property already set in current slice: object {object}, attribute {attribute}")]
    PropertyExists {
        object: ObjectKey,
        attribute: AttributeKey,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("not supported: {0}")]
    Unimplemented(&'static str),

    #[error("repository {name} does not hold {expected}")]
    RepoTypeMismatch {
        name: String,
        expected: &'static str,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("value error: {0}")]
    Value(#[from] serde_json::Error),
}

/// Coarse classification of a [`CoreError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    ProtocolViolation,
    Unimplemented,
    Configuration,
    Storage,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ObjectNotFound(_)
            | Self::PropertyNotFound { .. }
            | Self::SliceNotFound(_)
            | Self::RepoNotFound(_)
            | Self::CachedObjectNotFound(_) => ErrorKind::NotFound,
            Self::ObjectExists(_)
            | Self::KeySpaceExhausted(_)
            | Self::RepoExists(_)
            | Self::CachedObjectExists(_)
            | Self::PropertyExists { .. } => ErrorKind::Conflict,
            Self::ProtocolViolation(_) | Self::RepoTypeMismatch { .. } => {
                ErrorKind::ProtocolViolation
            }
            Self::Unimplemented(_) => ErrorKind::Unimplemented,
            Self::Config(_) => ErrorKind::Configuration,
            Self::Store(_) | Self::Value(_) => ErrorKind::Storage,
        }
    }

    /// `true` for outcomes a caller is expected to handle during normal use.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound | ErrorKind::Conflict)
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateObject(key) => Self::ObjectExists(key),
            StoreError::UnknownSlice(slice) => Self::SliceNotFound(slice),
            other => Self::Store(other),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_collisions_become_conflicts() {
        let err: CoreError = StoreError::DuplicateObject(ObjectKey::new(4)).into();
        assert!(matches!(err, CoreError::ObjectExists(k) if k.get() == 4));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_recoverable());
    }

    #[test]
    fn unknown_slice_is_not_found() {
        let err: CoreError = StoreError::UnknownSlice(SliceId::new(9)).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "slice not found: 9");
    }

    #[test]
    fn key_limits_are_classified() {
        let exhausted = CoreError::KeySpaceExhausted(ObjectKey::new(u64::MAX));
        assert_eq!(exhausted.kind(), ErrorKind::Conflict);
        assert!(exhausted.is_recoverable());

        let out_of_range: CoreError = StoreError::KeyOutOfRange(u64::MAX).into();
        assert_eq!(out_of_range.kind(), ErrorKind::Storage);
    }

    #[test]
    fn protocol_violations_are_fatal() {
        let err = CoreError::protocol("batch ended without start");
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        assert!(!err.is_recoverable());
        assert!(!CoreError::Unimplemented("remove_slice").is_recoverable());
        assert!(!CoreError::from(StoreError::NoTransaction).is_recoverable());
    }
}
