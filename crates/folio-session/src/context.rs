//! Collaborators shared by every session of one manager

use std::sync::Arc;

use folio_storage::{DocumentStore, LockManager, PubSub};
use tokio::sync::broadcast;

use crate::auth::{RoleResolver, UserDirectory};
use crate::config::SessionConfig;
use crate::executor::ExecutionStrategies;
use crate::session::DocumentEvent;

/// Everything a session needs besides its own persistor
pub struct SessionContext {
    pub config: SessionConfig,
    pub store: Arc<dyn DocumentStore>,
    pub locks: Arc<LockManager>,
    pub hub: Arc<dyn PubSub>,
    pub roles: Arc<dyn RoleResolver>,
    pub users: Arc<dyn UserDirectory>,
    pub strategies: Arc<ExecutionStrategies>,
    pub events: broadcast::Sender<DocumentEvent>,
}

impl SessionContext {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn DocumentStore>,
        locks: Arc<LockManager>,
        hub: Arc<dyn PubSub>,
        roles: Arc<dyn RoleResolver>,
        users: Arc<dyn UserDirectory>,
        strategies: Arc<ExecutionStrategies>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        Self {
            config,
            store,
            locks,
            hub,
            roles,
            users,
            strategies,
            events,
        }
    }

    /// Send an event; having no listener is fine
    pub(crate) fn emit(&self, event: DocumentEvent) {
        let _ = self.events.send(event);
    }
}
