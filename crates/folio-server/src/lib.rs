//! Websocket server hosting collaborative notebook sessions
//!
//! Clients connect to `/sync?documentId=..&clock=..` with the user id in the
//! `x-folio-user` header and speak the binary frame protocol of
//! `folio-sync`. Block execution engines are not attached here; every run
//! fails until a deployment supplies its own strategies.

pub mod auth;
pub mod config;
pub mod routes;
pub mod ws;

use std::sync::Arc;

use folio_session::{
    ExecutionStrategies, SessionConfig, SessionContext, SessionManager, StaticUsers,
};
use folio_storage::{
    DocumentStore, LockConfig, LockManager, LocalPubSub, MemoryStore, RedbStore, RedbStoreConfig,
    StoreLockBackend,
};
use tracing::info;

pub use config::ServerConfig;
pub use routes::{router, AppState};

use crate::auth::UniformRoles;

/// Open the store and assemble a started session manager
pub async fn build_manager(
    config: &ServerConfig,
    session: SessionConfig,
    strategies: ExecutionStrategies,
) -> anyhow::Result<Arc<SessionManager>> {
    let store: Arc<dyn DocumentStore> = if config.in_memory {
        info!("Using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedbStore::open(RedbStoreConfig {
            db_path: config.db_path(),
        })?)
    };
    let lock_config = LockConfig::default();
    let hub = Arc::new(LocalPubSub::stored(store.clone()));
    let backend = Arc::new(StoreLockBackend::new(
        store.clone(),
        hub.clone(),
        lock_config.partitions,
    ));
    let locks = Arc::new(LockManager::new(backend, lock_config));

    let ctx = SessionContext::new(
        session,
        store,
        locks,
        hub,
        Arc::new(UniformRoles::new(config.default_role)),
        Arc::new(StaticUsers::new()),
        Arc::new(strategies),
    );
    let manager = SessionManager::new(ctx);
    manager.start().await;
    Ok(manager)
}
