//! Registry of live sessions
//!
//! A session is reachable from two places:
//!
//! - the live map, holding every session with connections or callers
//! - a byte-weighted LRU cache that keeps recently idle sessions warm
//!
//! A periodic sweep drops sessions from the live map once nothing references
//! them and their strategies are idle. A session is destroyed only when it
//! is in neither place: by the sweep if the cache already evicted it, or by
//! the cache eviction listener if the sweep already dropped it.

use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use folio_core::SessionKey;
use folio_storage::{AppPersistor, DocumentPersistor, Persistor};
use moka::notification::RemovalCause;
use moka::sync::Cache;
use tokio::sync::{broadcast, Mutex, OnceCell, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SessionConfig;
use crate::context::SessionContext;
use crate::error::{SessionError, SessionResult};
use crate::session::{DocumentEvent, Session};

type LiveMap = DashMap<SessionKey, Arc<Session>>;

/// A session that cannot be collected while this guard lives
pub struct PinnedSession {
    session: Arc<Session>,
}

impl PinnedSession {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Deref for PinnedSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for PinnedSession {
    fn drop(&mut self) {
        self.session.unpin();
    }
}

/// Owns every session of this process
pub struct SessionManager {
    ctx: Arc<SessionContext>,
    live: Arc<LiveMap>,
    cache: Cache<SessionKey, Arc<Session>>,
    creating: DashMap<SessionKey, Arc<OnceCell<Arc<Session>>>>,
    destroying: Arc<StdMutex<JoinSet<()>>>,
    accepting: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    collector: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(ctx: SessionContext) -> Arc<Self> {
        let live: Arc<LiveMap> = Arc::new(DashMap::new());
        let destroying = Arc::new(StdMutex::new(JoinSet::new()));

        let listener_live = live.clone();
        let listener_destroying = destroying.clone();
        let cache = Cache::builder()
            .max_capacity(ctx.config.cache_max_bytes)
            .weigher(|_key: &SessionKey, session: &Arc<Session>| -> u32 {
                u32::try_from(session.byte_length()).unwrap_or(u32::MAX).max(1)
            })
            .eviction_listener(move |key: Arc<SessionKey>, session: Arc<Session>, cause| {
                if cause == RemovalCause::Replaced || listener_live.contains_key(key.as_ref()) {
                    return;
                }
                if session.begin_close() {
                    debug!(key = %key, ?cause, "Evicted from cache, destroying");
                    spawn_destroy(&listener_destroying, session);
                }
            })
            .build();

        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            ctx: Arc::new(ctx),
            live,
            cache,
            creating: DashMap::new(),
            destroying,
            accepting: AtomicBool::new(true),
            shutdown_tx,
            collector: Mutex::new(None),
        })
    }

    /// Start the periodic collection sweep
    pub async fn start(self: &Arc<Self>) {
        let mut collector = self.collector.lock().await;
        if collector.is_some() {
            return;
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.ctx.config.collect_interval;
        let retention = self.ctx.config.payload_retention;

        *collector = Some(tokio::spawn(async move {
            let mut sweep = tokio::time::interval(interval);
            let mut prune = tokio::time::interval(retention);
            sweep.tick().await;
            prune.tick().await;
            loop {
                tokio::select! {
                    _ = sweep.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let removed = manager.collect();
                        if removed > 0 {
                            debug!(removed, live = manager.live.len(), "Collected idle sessions");
                        }
                    }
                    _ = prune.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        if let Err(e) = manager.ctx.hub.maintain(retention).await {
                            warn!(error = %e, "Failed to prune pub/sub payloads");
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Session collector stopped");
        }));
        info!(interval_ms = interval.as_millis() as u64, "Session manager started");
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DocumentEvent> {
        self.ctx.events.subscribe()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, key: &SessionKey) -> bool {
        self.live.contains_key(key)
    }

    pub fn is_cached(&self, key: &SessionKey) -> bool {
        self.cache.contains_key(key)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Drop `key` from the warm cache
    pub fn evict(&self, key: &SessionKey) {
        self.cache.invalidate(key);
        self.cache.run_pending_tasks();
    }

    /// Live session for `key`, loading it if needed
    ///
    /// Concurrent callers for the same key share one load.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn get_session(&self, key: &SessionKey) -> SessionResult<Arc<Session>> {
        if !self.is_accepting() {
            return Err(SessionError::ShuttingDown);
        }
        if let Some(session) = self.live.get(key).map(|entry| entry.value().clone()) {
            return Ok(session);
        }
        if let Some(session) = self.cache.get(key) {
            if !session.is_closing() {
                let session = self.live.entry(key.clone()).or_insert(session).clone();
                return Ok(session);
            }
        }

        let cell = self.creating.entry(key.clone()).or_default().clone();
        let result = cell
            .get_or_try_init(|| self.open(key))
            .await
            .map(Arc::clone);
        self.creating.remove_if(key, |_, current| Arc::ptr_eq(current, &cell));
        result
    }

    async fn open(&self, key: &SessionKey) -> SessionResult<Arc<Session>> {
        let session = Session::open(self.persistor_for(key), self.ctx.clone()).await?;
        self.live.insert(key.clone(), session.clone());
        self.cache.insert(key.clone(), session.clone());
        Ok(session)
    }

    fn persistor_for(&self, key: &SessionKey) -> Arc<dyn Persistor> {
        let store = self.ctx.store.clone();
        let locks = self.ctx.locks.clone();
        match key {
            SessionKey::Document(id) => Arc::new(DocumentPersistor::new(id.clone(), store, locks)),
            SessionKey::App {
                document_id,
                app_id,
                viewer,
            } => Arc::new(AppPersistor::new(
                document_id.clone(),
                app_id.clone(),
                viewer.clone(),
                store,
                locks,
            )),
        }
    }

    /// Live session for `key`, held in the live map until the guard drops
    pub async fn pin(&self, key: &SessionKey) -> SessionResult<PinnedSession> {
        loop {
            let session = self.get_session(key).await?;
            // Under the shard lock, so the sweep cannot drop it in between
            let pinned = match self.live.entry(key.clone()) {
                Entry::Occupied(entry) if !entry.get().is_closing() => {
                    entry.get().pin();
                    Some(entry.get().clone())
                }
                Entry::Occupied(_) => None,
                Entry::Vacant(entry) if !session.is_closing() => {
                    session.pin();
                    entry.insert(session.clone());
                    Some(session)
                }
                Entry::Vacant(_) => None,
            };
            if let Some(session) = pinned {
                return Ok(PinnedSession { session });
            }
            debug!(key = %key, "Session closed while pinning, retrying");
            tokio::task::yield_now().await;
        }
    }

    /// Run `f` against the session for `key` while it is pinned
    pub async fn get_session_for_update<F, Fut, T>(&self, key: &SessionKey, f: F) -> SessionResult<T>
    where
        F: FnOnce(Arc<Session>) -> Fut,
        Fut: Future<Output = SessionResult<T>>,
    {
        let pinned = self.pin(key).await?;
        f(pinned.session().clone()).await
    }

    /// One collection sweep; returns how many sessions left the live map
    pub fn collect(&self) -> usize {
        let candidates: Vec<SessionKey> = self
            .live
            .iter()
            .filter(|entry| entry.value().can_collect())
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for key in candidates {
            let mut destroy = false;
            let Some((key, session)) = self.live.remove_if(&key, |key, session| {
                if !session.can_collect() {
                    return false;
                }
                if !self.cache.contains_key(key) {
                    destroy = session.begin_close();
                }
                true
            }) else {
                continue;
            };
            removed += 1;
            if destroy {
                debug!(key = %key, "Idle and not cached, destroying");
                spawn_destroy(&self.destroying, session);
            } else if !session.is_closing() {
                // Re-weigh with the size of the latest stored state
                debug!(key = %key, bytes = session.byte_length(), "Idle, kept warm in cache");
                self.cache.insert(key, session);
            }
        }
        if removed > 0 {
            self.cache.run_pending_tasks();
        }
        self.reap_destroyed();
        removed
    }

    fn reap_destroyed(&self) {
        if let Ok(mut destroying) = self.destroying.lock() {
            while let Some(result) = destroying.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "Session destroy task failed");
                }
            }
        }
    }

    /// Stop accepting work, drain every session and write its final state
    ///
    /// Connections are asked to close; sessions still live after the
    /// shutdown timeout are destroyed regardless.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        if let Some(collector) = self.collector.lock().await.take() {
            let _ = collector.await;
        }

        let started = Instant::now();
        let timeout = self.ctx.config.shutdown_timeout;
        info!(sessions = self.live.len(), "Shutting down session manager");

        while !self.live.is_empty() {
            if started.elapsed() >= timeout {
                self.force_destroy().await;
                break;
            }
            for entry in self.live.iter() {
                if entry.connection_count() > 0 {
                    entry.close_connections();
                }
            }
            for session in self.drain_idle() {
                if session.begin_close() {
                    session.destroy().await;
                }
            }
            if self.live.is_empty() {
                break;
            }
            debug!(sessions = self.live.len(), "Waiting for sessions to drain");
            tokio::time::sleep(self.ctx.config.shutdown_poll_interval).await;
        }

        let cached: Vec<Arc<Session>> = self.cache.iter().map(|(_, session)| session).collect();
        for session in cached {
            if session.begin_close() {
                session.destroy().await;
            }
        }
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();

        let mut pending = match self.destroying.lock() {
            Ok(mut destroying) => std::mem::take(&mut *destroying),
            Err(_) => JoinSet::new(),
        };
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Session destroy task failed");
            }
        }
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Session manager shut down");
    }

    fn drain_idle(&self) -> Vec<Arc<Session>> {
        let keys: Vec<SessionKey> = self.live.iter().map(|entry| entry.key().clone()).collect();
        keys.iter()
            .filter_map(|key| self.live.remove_if(key, |_, session| session.can_collect()))
            .map(|(_, session)| session)
            .collect()
    }

    async fn force_destroy(&self) {
        let keys: Vec<SessionKey> = self.live.iter().map(|entry| entry.key().clone()).collect();
        let remaining: Vec<(SessionKey, Arc<Session>)> =
            keys.iter().filter_map(|key| self.live.remove(key)).collect();
        warn!(
            count = remaining.len(),
            keys = ?remaining.iter().map(|(key, _)| key.to_string()).collect::<Vec<_>>(),
            "Sessions did not drain in time, destroying them"
        );

        let semaphore = Arc::new(Semaphore::new(self.ctx.config.force_destroy_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (key, session) in remaining {
            let permit = semaphore.clone().acquire_owned().await;
            tasks.spawn(async move {
                let _permit = permit;
                if session.begin_close() {
                    session.destroy().await;
                }
                key
            });
        }
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(key) => debug!(key = %key, "Force-destroyed session"),
                Err(e) => error!(error = %e, "Failed to destroy session"),
            }
        }
    }
}

fn spawn_destroy(destroying: &StdMutex<JoinSet<()>>, session: Arc<Session>) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!(key = %session.key(), "No runtime to destroy session on");
        return;
    };
    match destroying.lock() {
        Ok(mut destroying) => {
            destroying.spawn_on(async move { session.destroy().await }, &handle);
        }
        Err(_) => {
            handle.spawn(async move { session.destroy().await });
        }
    }
}
