//! # Folio Session
//!
//! Live notebook sessions of one server process.
//!
//! ## Components
//!
//! - [`Session`]: owns one replicated document, its connections and
//!   presence, persists every update and replicates it to other processes
//! - [`SessionManager`]: loads sessions on demand, keeps idle ones warm in
//!   a byte-weighted cache, sweeps unused ones and drains all on shutdown
//! - [`Connection`]: handshake and frame handling of one client
//! - [`ReplicationHandle`]: keeps a session in step with the same session
//!   hosted by other processes
//! - [`BlockExecutor`]: strategy that runs one kind of block operation,
//!   driven by the per-session executor loop
//!
//! ## Example
//!
//! ```rust,ignore
//! use folio_session::{Connection, ConnectParams, SessionContext, SessionManager};
//!
//! let manager = SessionManager::new(ctx);
//! manager.start().await;
//!
//! let (out_tx, out_rx) = tokio::sync::mpsc::channel(manager.config().outbound_capacity);
//! let connection = Connection::accept(&manager, user, params, out_tx).await?;
//! tokio::spawn(connection.run(in_rx));
//!
//! manager.shutdown().await;
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod executor;
pub mod manager;
mod persist;
pub mod replication;
pub mod session;

pub use auth::{RoleResolver, StaticRoles, StaticUsers, UserDirectory, UserProfile};
pub use config::SessionConfig;
pub use connection::{ConnectParams, Connection, Inbound};
pub use context::SessionContext;
pub use error::{SessionError, SessionResult};
pub use executor::{
    BlockExecutor, BlockRun, ExecutionEvents, ExecutionStrategies, Supervisor, UnconfiguredExecutor,
};
pub use manager::{PinnedSession, SessionManager};
pub use replication::{ReplicaTarget, ReplicationHandle};
pub use session::{ConnId, DocumentEvent, Outbound, Session, UpdateOrigin};
