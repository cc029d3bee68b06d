//! One live replicated notebook and everything attached to it
//!
//! A [`Session`] exclusively owns its [`NotebookDocument`]. Connections,
//! the replication provider and the executor never hold the document; they
//! go through [`Session::transact`], [`Session::apply_update`] and
//! [`Session::with_doc`], which serialize access behind one async mutex.
//!
//! Every applied update fans out while the document lock is still held, so
//! all connections observe updates in the order they were applied:
//!
//! 1. broadcast to every connection except the one it came from
//! 2. forwarded to other processes, unless it came from one
//! 3. appended to the durable log, unless it came from another process or
//!    is a duplicate
//!
//! Each connection's outbound queue is bounded. A connection whose queue is
//! full when a broadcast arrives is told to close rather than buffer
//! without limit.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use folio_core::{DocumentId, Role, SessionKey, UserId};
use folio_storage::{LoadedState, Persistor};
use folio_sync::{
    Awareness, ClientId, Frame, HeadHash, NotebookDocument, SyncMessage, SyncResult,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, MutexGuard, Notify};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::context::SessionContext;
use crate::error::{SessionError, SessionResult};
use crate::executor::Executor;
use crate::persist::PersistHandle;
use crate::replication::{ReplicaTarget, ReplicationHandle};

pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Where an update came from, which decides where it goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// A client connection of this process
    Connection(ConnId),
    /// Another process, through replication
    Replication,
    /// Code running in this process, such as the executor
    Local,
    /// Content copied from another document; never persisted
    Duplicating,
}

impl UpdateOrigin {
    fn connection(self) -> Option<ConnId> {
        match self {
            UpdateOrigin::Connection(id) => Some(id),
            _ => None,
        }
    }

    fn replicates(self) -> bool {
        !matches!(self, UpdateOrigin::Replication)
    }

    fn persists(self) -> bool {
        !matches!(self, UpdateOrigin::Replication | UpdateOrigin::Duplicating)
    }
}

/// Message queued for one connection's transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded [`Frame`]
    Frame(Vec<u8>),
    Ping,
    Close,
}

/// Notable changes, published on the manager's event channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    TitleChanged { document_id: DocumentId, title: String },
    /// The session replaced its state under a new clock
    Reset { key: SessionKey, clock: u64 },
    /// A client was turned away with a stale clock and must refetch
    ResyncRequired { key: SessionKey, user: UserId },
}

pub(crate) struct DocState {
    pub doc: NotebookDocument,
    pub title: String,
}

struct ConnEntry {
    tx: mpsc::Sender<Outbound>,
    /// Signalled when `tx` is full and the connection must close
    overflow: Arc<Notify>,
    /// Clock the connection synced against
    clock: u64,
    /// Awareness clients announced over this connection
    controlled: HashSet<ClientId>,
}

/// In-memory owner of one replicated document
pub struct Session {
    key: SessionKey,
    me: Weak<Session>,
    ctx: Arc<SessionContext>,
    persistor: Arc<dyn Persistor>,
    state: Arc<Mutex<DocState>>,
    clock: Arc<AtomicU64>,
    byte_length: Arc<AtomicUsize>,
    awareness: Mutex<Awareness>,
    conns: DashMap<ConnId, ConnEntry>,
    /// Callers inside [`crate::SessionManager::get_session_for_update`]
    updating: AtomicUsize,
    executing: AtomicBool,
    closing: AtomicBool,
    persist: PersistHandle,
    replication: OnceLock<ReplicationHandle>,
    executor: Mutex<Option<Executor>>,
    reset_lock: Mutex<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("clock", &self.clock())
            .field("connections", &self.conns.len())
            .finish()
    }
}

impl Session {
    /// Load the session's state and start its background tasks
    #[instrument(skip(persistor, ctx), fields(key = %persistor.key()))]
    pub async fn open(
        persistor: Arc<dyn Persistor>,
        ctx: Arc<SessionContext>,
    ) -> SessionResult<Arc<Self>> {
        let key = persistor.key().clone();
        let mut loaded = persistor.load().await?;

        if needs_history_cleanup(&loaded, &ctx) {
            info!(
                key = %key,
                latency_ms = loaded.apply_latency.as_millis() as u64,
                "Slow load of an old clock, dropping document history"
            );
            loaded = persistor.clean_history(&loaded.doc).await?;
        }

        let title = loaded.doc.title().unwrap_or_default();
        let state = Arc::new(Mutex::new(DocState {
            doc: loaded.doc,
            title,
        }));
        let clock = Arc::new(AtomicU64::new(loaded.clock));
        let byte_length = Arc::new(AtomicUsize::new(loaded.byte_length));
        let persist = PersistHandle::spawn(
            persistor.clone(),
            state.clone(),
            clock.clone(),
            byte_length.clone(),
            ctx.config.persist_interval,
        );

        let session = Arc::new_cyclic(|me| Session {
            key,
            me: me.clone(),
            ctx,
            persistor,
            state,
            clock,
            byte_length,
            awareness: Mutex::new(Awareness::new()),
            conns: DashMap::new(),
            updating: AtomicUsize::new(0),
            executing: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            persist,
            replication: OnceLock::new(),
            executor: Mutex::new(None),
            reset_lock: Mutex::new(()),
        });

        let replication = ReplicationHandle::spawn(
            Arc::downgrade(&session),
            session.key.channel(),
            session.ctx.hub.clone(),
            &session.ctx.config,
        );
        let _ = session.replication.set(replication);
        session.start_executor().await;

        info!(key = %session.key, clock = session.clock(), "Session opened");
        Ok(session)
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Size of the last stored state, used as the cache weight
    pub fn byte_length(&self) -> usize {
        self.byte_length.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Open connections plus in-flight update callers
    pub fn refs(&self) -> usize {
        self.conns.len() + self.updating.load(Ordering::SeqCst)
    }

    /// Whether nothing holds the session and no block is executing
    pub fn can_collect(&self) -> bool {
        self.refs() == 0
            && !self.executing.load(Ordering::SeqCst)
            && self.ctx.strategies.is_idle(&self.key)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Mark the session as going away; returns false if it already was
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn pin(&self) {
        self.updating.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unpin(&self) {
        self.updating.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn set_executing(&self, executing: bool) {
        self.executing.store(executing, Ordering::SeqCst);
    }

    pub(crate) fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub(crate) fn persistor(&self) -> &Arc<dyn Persistor> {
        &self.persistor
    }

    /// Move the session clock to one a client proved current
    pub(crate) fn fast_forward(&self, clock: u64) {
        info!(key = %self.key, from = self.clock(), to = clock, "Fast-forwarding session clock");
        self.clock.store(clock, Ordering::SeqCst);
    }

    /// Read or inspect the document
    pub async fn with_doc<T>(
        &self,
        f: impl FnOnce(&mut NotebookDocument) -> SyncResult<T>,
    ) -> SessionResult<T> {
        let mut state = self.state.lock().await;
        Ok(f(&mut state.doc)?)
    }

    /// Mutate the document from this process
    pub async fn transact<T>(
        &self,
        f: impl FnOnce(&mut NotebookDocument) -> SyncResult<T>,
    ) -> SessionResult<T> {
        let mut state = self.state.lock().await;
        let (out, update) = state.doc.transact(f)?;
        if !update.is_empty() {
            self.commit(state, update, UpdateOrigin::Local).await?;
        }
        Ok(out)
    }

    /// Merge an encoded update
    ///
    /// Returns whether the document changed. A persistence failure is
    /// returned after the update was applied and broadcast.
    pub async fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> SessionResult<bool> {
        let mut state = self.state.lock().await;
        if !state.doc.apply_update(update)? {
            trace!(key = %self.key, ?origin, "Update changed nothing");
            return Ok(false);
        }
        self.commit(state, update.to_vec(), origin).await?;
        Ok(true)
    }

    async fn commit(
        &self,
        mut state: MutexGuard<'_, DocState>,
        update: Vec<u8>,
        origin: UpdateOrigin,
    ) -> SessionResult<()> {
        let clock = self.clock();
        let frame = Frame::Sync(SyncMessage::Update {
            update: update.clone(),
        })
        .encode()?;
        self.broadcast(&frame, origin.connection());

        if origin.replicates() {
            if let Some(replication) = self.replication.get() {
                replication.local_update(update.clone());
            }
        }
        let persisted = origin.persists().then(|| self.persist.append(clock, update));
        let title = self.track_title(&mut state);
        drop(state);

        if let Some(title) = title {
            self.title_changed(title).await;
        }
        match persisted {
            Some(rx) => rx
                .await
                .map_err(|_| SessionError::closed("persistence worker"))?,
            None => Ok(()),
        }
    }

    fn broadcast(&self, frame: &[u8], except: Option<ConnId>) {
        for conn in self.conns.iter() {
            if Some(*conn.key()) == except {
                continue;
            }
            match conn.tx.try_send(Outbound::Frame(frame.to_vec())) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(key = %self.key, conn_id = *conn.key(), "Outbound queue full, closing slow connection");
                    conn.overflow.notify_one();
                }
            }
        }
    }

    fn track_title(&self, state: &mut DocState) -> Option<String> {
        if self.key.is_app() {
            return None;
        }
        let title = state.doc.title().ok()?;
        if title == state.title {
            return None;
        }
        state.title = title.clone();
        Some(title)
    }

    async fn title_changed(&self, title: String) {
        let document_id = self.key.document_id().clone();
        match self.ctx.store.update_title(&document_id, &title).await {
            Ok(true) => debug!(document_id = %document_id, title = %title, "Title updated"),
            Ok(false) => debug!(document_id = %document_id, "Document record is gone, title not stored"),
            Err(e) => error!(document_id = %document_id, error = %e, "Failed to store title"),
        }
        self.ctx
            .emit(DocumentEvent::TitleChanged { document_id, title });
    }

    /// Whether `update` from a user with `role` may be applied
    pub async fn can_write(&self, role: Role, update: &[u8]) -> bool {
        let mut state = self.state.lock().await;
        self.persistor.can_write(role, update, &mut state.doc)
    }

    /// Encoded step 1 frame advertising the current heads
    pub async fn sync_step1(&self) -> SessionResult<Vec<u8>> {
        let mut state = self.state.lock().await;
        Ok(Frame::Sync(SyncMessage::step1(&mut state.doc)).encode()?)
    }

    /// Encoded step 2 frame answering a peer's heads
    pub async fn sync_step2(&self, heads: &[HeadHash]) -> SessionResult<Vec<u8>> {
        let mut state = self.state.lock().await;
        Ok(Frame::Sync(SyncMessage::step2(&mut state.doc, heads)).encode()?)
    }

    /// Encoded awareness frame with every known client, if there are any
    pub async fn awareness_frame(&self) -> SessionResult<Option<Vec<u8>>> {
        let awareness = self.awareness.lock().await;
        let clients = awareness.client_ids();
        if clients.is_empty() {
            return Ok(None);
        }
        let update = awareness.encode_update(&clients)?;
        Ok(Some(Frame::Awareness(update).encode()?))
    }

    /// Merge presence sent by a connection and rebroadcast what changed
    pub async fn apply_awareness(&self, conn: ConnId, update: &[u8]) -> SessionResult<()> {
        let mut awareness = self.awareness.lock().await;
        let changes = awareness.apply_update(update)?;
        if changes.is_empty() {
            return Ok(());
        }
        if let Some(mut entry) = self.conns.get_mut(&conn) {
            entry.controlled.extend(changes.added.iter().chain(&changes.updated));
            for removed in &changes.removed {
                entry.controlled.remove(removed);
            }
        }

        let encoded = awareness.encode_update(&changes.all())?;
        self.broadcast(&Frame::Awareness(encoded.clone()).encode()?, None);
        if let Some(replication) = self.replication.get() {
            replication.local_awareness(encoded);
        }
        Ok(())
    }

    /// Register a connection that synced against `clock`
    ///
    /// The returned [`Notify`] fires once the connection fell too far behind.
    pub(crate) fn add_connection(&self, tx: mpsc::Sender<Outbound>, clock: u64) -> (ConnId, Arc<Notify>) {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::SeqCst);
        let overflow = Arc::new(Notify::new());
        self.conns.insert(
            id,
            ConnEntry {
                tx,
                overflow: overflow.clone(),
                clock,
                controlled: HashSet::new(),
            },
        );
        debug!(key = %self.key, conn_id = id, connections = self.conns.len(), "Connection added");
        (id, overflow)
    }

    /// Clock the connection synced against, `None` once it is gone
    pub(crate) fn connection_clock(&self, conn: ConnId) -> Option<u64> {
        self.conns.get(&conn).map(|entry| entry.clock)
    }

    /// Forget a connection and retract the presence it announced
    pub(crate) async fn remove_connection(&self, conn: ConnId) {
        let Some((_, entry)) = self.conns.remove(&conn) else {
            return;
        };
        let _ = entry.tx.try_send(Outbound::Close);
        debug!(key = %self.key, conn_id = conn, connections = self.conns.len(), "Connection removed");

        if entry.controlled.is_empty() {
            return;
        }
        let controlled: Vec<ClientId> = entry.controlled.into_iter().collect();
        let mut awareness = self.awareness.lock().await;
        let removed = awareness.remove_states(&controlled);
        if removed.is_empty() {
            return;
        }
        match awareness
            .encode_update(&removed)
            .and_then(|update| Ok((Frame::Awareness(update.clone()).encode()?, update)))
        {
            Ok((frame, update)) => {
                self.broadcast(&frame, None);
                if let Some(replication) = self.replication.get() {
                    replication.local_awareness(update);
                }
            }
            Err(e) => warn!(key = %self.key, error = %e, "Failed to encode presence removal"),
        }
    }

    /// Ask every connection to close
    pub fn close_connections(&self) {
        for conn in self.conns.iter() {
            if conn.tx.try_send(Outbound::Close).is_err() {
                conn.overflow.notify_one();
            }
        }
    }

    /// Write queued updates and a pending snapshot
    pub async fn flush(&self) {
        self.persist.flush().await;
    }

    /// Replace the stored state under a new clock and reset to it
    pub async fn replace_state(&self, state: &[u8]) -> SessionResult<()> {
        let loaded = self.persistor.replace_state(state).await?;
        self.reset(loaded).await
    }

    /// Reload from durable storage and reset to it
    pub async fn reload(&self) -> SessionResult<()> {
        let loaded = self.persistor.load().await?;
        self.reset(loaded).await
    }

    /// Swap in `loaded` as the session's state
    #[instrument(skip(self, loaded), fields(key = %self.key, clock = loaded.clock))]
    pub async fn reset(&self, loaded: LoadedState) -> SessionResult<()> {
        let _guard = self.reset_lock.lock().await;
        if self.is_closing() {
            return Ok(());
        }

        self.stop_executor().await;
        self.persist.flush().await;

        {
            let mut state = self.state.lock().await;
            state.title = loaded.doc.title().unwrap_or_default();
            state.doc = loaded.doc;
            self.clock.store(loaded.clock, Ordering::SeqCst);
            self.byte_length.store(loaded.byte_length, Ordering::SeqCst);
        }

        // Connections synced against the old state must resync
        self.close_connections();
        if let Some(replication) = self.replication.get() {
            replication.reset();
        }
        self.start_executor().await;

        info!(key = %self.key, clock = loaded.clock, "Session reset");
        self.ctx.emit(DocumentEvent::Reset {
            key: self.key.clone(),
            clock: loaded.clock,
        });
        Ok(())
    }

    async fn start_executor(&self) {
        let mut executor = self.executor.lock().await;
        if executor.is_none() {
            *executor = Some(Executor::start(self.me.clone(), self.key.clone(), &self.ctx));
        }
    }

    async fn stop_executor(&self) {
        let executor = self.executor.lock().await.take();
        if let Some(executor) = executor {
            executor.stop().await;
        }
    }

    /// Stop background work and write the final state
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn destroy(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.stop_executor().await;
        if let Some(replication) = self.replication.get() {
            replication.stop().await;
        }
        self.persist.stop().await;
        self.close_connections();
        info!(key = %self.key, clock = self.clock(), "Session destroyed");
    }
}

fn needs_history_cleanup(loaded: &LoadedState, ctx: &SessionContext) -> bool {
    if loaded.apply_latency <= ctx.config.history_cleanup_latency {
        return false;
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default();
    let age = Duration::from_millis(now.saturating_sub(loaded.clock_updated_at_millis).max(0) as u64);
    age > ctx.config.history_cleanup_clock_age
}

#[async_trait]
impl ReplicaTarget for Session {
    fn clock(&self) -> u64 {
        Session::clock(self)
    }

    async fn heads(&self) -> SessionResult<Vec<HeadHash>> {
        self.with_doc(|doc| Ok(doc.heads())).await
    }

    async fn changes_since(&self, heads: &[HeadHash]) -> SessionResult<Vec<u8>> {
        self.with_doc(|doc| Ok(doc.save_after(heads))).await
    }

    async fn apply_foreign(&self, update: &[u8]) -> SessionResult<()> {
        self.apply_update(update, UpdateOrigin::Replication).await?;
        Ok(())
    }

    async fn apply_foreign_awareness(&self, update: &[u8]) -> SessionResult<()> {
        let mut awareness = self.awareness.lock().await;
        let changes = awareness.apply_update(update)?;
        if !changes.is_empty() {
            let encoded = awareness.encode_update(&changes.all())?;
            self.broadcast(&Frame::Awareness(encoded).encode()?, None);
        }
        Ok(())
    }

    fn newer_clock(&self, clock: u64) {
        let Some(session) = self.me.upgrade() else {
            return;
        };
        info!(key = %self.key, local = self.clock(), remote = clock, "Another process moved the clock, reloading");
        tokio::spawn(async move {
            if let Err(e) = session.reload().await {
                error!(key = %session.key, error = %e, "Failed to reload after clock change");
            }
        });
    }
}
