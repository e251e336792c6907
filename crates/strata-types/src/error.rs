use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid {kind} identifier: {input:?}")]
    InvalidId { kind: &'static str, input: String },
}
