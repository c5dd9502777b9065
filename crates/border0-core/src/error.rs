//! Common error types for the Border0 SDK.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while validating core data model values.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// A socket name is empty or contains characters the platform rejects.
    #[error("invalid socket name {0:?}")]
    InvalidSocketName(String),

    /// A timestamp could not be interpreted.
    #[error("invalid time: {0}")]
    InvalidTime(String),
}
