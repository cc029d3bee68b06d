#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use folio_core::{DocumentId, Role, SessionKey, UserId, WorkspaceId};
use folio_session::{
    ConnectParams, Connection, ExecutionStrategies, Inbound, Outbound, SessionConfig,
    SessionContext, SessionManager, SessionResult, StaticRoles, StaticUsers,
};
use folio_storage::{
    DocumentRecord, DocumentStore, LockConfig, LockManager, LocalPubSub, MemoryStore,
    SnapshotRecord, StoreLockBackend,
};
use folio_sync::{Frame, NotebookDocument};
use tokio::sync::mpsc;

/// Store, hub and directories shared by every simulated process
pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub hub: Arc<LocalPubSub>,
    pub roles: Arc<StaticRoles>,
    pub users: Arc<StaticUsers>,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(LocalPubSub::stored(store.clone()));
        Self {
            store,
            hub,
            roles: Arc::new(StaticRoles::new()),
            users: Arc::new(StaticUsers::new()),
        }
    }

    pub fn dyn_store(&self) -> Arc<dyn DocumentStore> {
        self.store.clone()
    }

    /// A manager with its own lock owner, as a separate process would have
    pub async fn manager(&self, strategies: ExecutionStrategies) -> Arc<SessionManager> {
        self.manager_with(SessionConfig::testing(), strategies).await
    }

    pub async fn manager_with(
        &self,
        config: SessionConfig,
        strategies: ExecutionStrategies,
    ) -> Arc<SessionManager> {
        let backend = Arc::new(StoreLockBackend::new(self.dyn_store(), self.hub.clone(), 32));
        let locks = Arc::new(LockManager::new(backend, LockConfig::default()));
        let ctx = SessionContext::new(
            config,
            self.dyn_store(),
            locks,
            self.hub.clone(),
            self.roles.clone(),
            self.users.clone(),
            Arc::new(strategies),
        );
        let manager = SessionManager::new(ctx);
        manager.start().await;
        manager
    }

    pub async fn create_document(&self, id: &str) -> DocumentId {
        let id = DocumentId::new(id);
        self.store
            .put_document(&DocumentRecord::new(id.clone(), WorkspaceId::new("ws")))
            .await
            .unwrap();
        id
    }

    /// Store a fresh document state under `clock`; returns the stored bytes
    pub async fn store_state(&self, id: &DocumentId, clock: u64) -> Vec<u8> {
        let state = NotebookDocument::new().unwrap().save();
        self.store
            .put_snapshot(&SessionKey::document(id.clone()), &SnapshotRecord::new(state.clone(), clock))
            .await
            .unwrap();
        state
    }

    pub fn grant(&self, user: &str, id: &DocumentId, role: Role) {
        self.roles.grant(user, id.clone(), role);
    }
}

/// Both ends of a fake transport
pub struct TestClient {
    pub connection: Option<Connection>,
    pub outbound: mpsc::Receiver<Outbound>,
    pub inbound: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Option<mpsc::UnboundedReceiver<Inbound>>,
}

impl TestClient {
    pub async fn connect(
        manager: &Arc<SessionManager>,
        user: &str,
        document_id: &DocumentId,
        clock: u64,
    ) -> SessionResult<Self> {
        let params = ConnectParams {
            document_id: document_id.clone(),
            clock,
            is_app: false,
            viewer_id: None,
        };
        Self::connect_with(manager, user, params).await
    }

    pub async fn connect_with(
        manager: &Arc<SessionManager>,
        user: &str,
        params: ConnectParams,
    ) -> SessionResult<Self> {
        let (out_tx, out_rx) = mpsc::channel(manager.config().outbound_capacity);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let connection = Connection::accept(manager, UserId::new(user), params, out_tx).await?;
        Ok(Self {
            connection: Some(connection),
            outbound: out_rx,
            inbound: in_tx,
            inbound_rx: Some(in_rx),
        })
    }

    /// Start serving inbound messages
    pub fn spawn(&mut self) -> tokio::task::JoinHandle<()> {
        let connection = self.connection.take().expect("connection already running");
        let inbound = self.inbound_rx.take().expect("inbound already taken");
        tokio::spawn(connection.run(inbound))
    }

    pub fn send(&self, frame: &Frame) {
        self.inbound
            .send(Inbound::Frame(frame.encode().unwrap()))
            .unwrap();
    }

    /// Next frame, skipping pings
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
                .await
                .ok()??;
            match message {
                Outbound::Frame(bytes) => return Some(Frame::decode(&bytes).unwrap()),
                Outbound::Ping => continue,
                Outbound::Close => return None,
            }
        }
    }

    /// Whether nothing arrives within `wait`
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.outbound.recv()).await.is_err()
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
