//! Error types for sessions, connections and execution

use folio_storage::StorageError;
use folio_sync::SyncError;
use thiserror::Error;

/// Errors surfaced by the session layer
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Document error: {0}")]
    Sync(#[from] SyncError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A frame or handshake that breaks the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The client's clock does not match the session
    #[error("Clock mismatch: client {client}, server {server}")]
    ClockMismatch { client: u64, server: u64 },

    #[error("Session manager is shutting down")]
    ShuttingDown,

    /// A block execution strategy failed
    #[error("Execution error: {0}")]
    Execution(String),

    /// A background worker is gone
    #[error("Channel closed: {0}")]
    Closed(String),
}

impl SessionError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
