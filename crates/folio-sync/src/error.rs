//! Error types for the replicated document and wire protocol

use thiserror::Error;

/// Errors that can occur while manipulating or exchanging documents
#[derive(Debug, Error)]
pub enum SyncError {
    /// Stored document bytes could not be loaded
    #[error("Failed to load document: {0}")]
    DocumentLoad(String),

    /// A CRDT operation failed
    #[error("Document operation failed: {0}")]
    DocumentOperation(String),

    /// Incremental bytes could not be merged
    #[error("Failed to merge update: {0}")]
    SyncMerge(String),

    /// A required shared object is missing from the document
    #[error("Missing document object: {0}")]
    MissingObject(String),

    /// The referenced block does not exist
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    /// Serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A frame could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

impl From<automerge::AutomergeError> for SyncError {
    fn from(e: automerge::AutomergeError) -> Self {
        SyncError::DocumentOperation(e.to_string())
    }
}

impl From<postcard::Error> for SyncError {
    fn from(e: postcard::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type alias for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
