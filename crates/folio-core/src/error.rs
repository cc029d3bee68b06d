//! Error types shared by the folio crates

use thiserror::Error;

/// Errors raised while parsing or validating core types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// An unrecognised block type tag
    #[error("Unknown block kind: {0}")]
    UnknownBlockKind(String),

    /// An unrecognised execution metadata tag
    #[error("Unknown execution metadata: {0}")]
    UnknownMetadata(String),

    /// An unrecognised role name
    #[error("Unknown role: {0}")]
    UnknownRole(String),
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;
