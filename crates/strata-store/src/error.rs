use strata_types::{ObjectKey, SliceId};

/// Errors from backend operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An object row with this key already exists.
    #[error("object already exists: {0}")]
    DuplicateObject(ObjectKey),

    /// A slice referenced as parent or query scope does not exist.
    #[error("unknown slice: {0}")]
    UnknownSlice(SliceId),

    /// An identifier does not fit the backend's integer column type.
    #[error("identifier out of range for this backend: {0}")]
    KeyOutOfRange(u64),

    /// `begin` was called while a transaction is already open.
    #[error("transaction already active")]
    TransactionActive,

    /// `commit` or `rollback` was called with no open transaction.
    #[error("no active transaction")]
    NoTransaction,

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Error reported by the SQLite engine.
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error from the underlying storage.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for backend operations.
pub type StoreResult<T> = Result<T, StoreError>;
