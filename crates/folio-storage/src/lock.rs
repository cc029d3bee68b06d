//! Cross-process named locks
//!
//! A [`LockManager`] serializes holders of one lock name in two stages:
//! first through a local FIFO mutex so tasks of this process queue up fairly,
//! then through a [`LockBackend`] shared by every process. A held lease is
//! kept alive by a background extender; waiters sleep until a release
//! notification arrives on the lock's partition channel or the retry
//! timeout elapses.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{StorageError, StorageResult};
use crate::pubsub::{PubSub, Subscription};
use crate::store::DocumentStore;

/// Timing and partitioning of cross-process locks
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease lifetime without extension
    pub ttl: Duration,
    /// Longest wait for a release notification before retrying
    pub retry_timeout: Duration,
    /// Number of release notification channels
    pub partitions: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            retry_timeout: Duration::from_secs(30),
            partitions: 32,
        }
    }
}

impl LockConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    fn extend_interval(&self) -> Duration {
        (self.ttl / 3).max(Duration::from_millis(1))
    }
}

/// Coordination service that owns the shared lock state
#[async_trait]
pub trait LockBackend: Send + Sync + 'static {
    /// Take the lock if it is free or expired
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> StorageResult<bool>;

    /// Push the expiry of a held lock; false once it was lost
    async fn extend(&self, name: &str, owner: &str, ttl: Duration) -> StorageResult<bool>;

    /// Release a held lock and notify waiters
    async fn release(&self, name: &str, owner: &str) -> StorageResult<()>;

    /// Listen for releases of `name`; subscribe before trying to acquire
    fn release_listener(&self, name: &str) -> ReleaseListener;
}

/// Waits for release notifications of one lock name
pub struct ReleaseListener {
    name: String,
    subscription: Subscription,
}

impl ReleaseListener {
    pub fn new(name: impl Into<String>, subscription: Subscription) -> Self {
        Self {
            name: name.into(),
            subscription,
        }
    }

    /// Wait until `name` is released or `timeout` elapses
    pub async fn wait(&mut self, timeout: Duration) -> bool {
        let Self { name, subscription } = self;
        let name = name.as_bytes();
        let wait = async {
            while let Some(payload) = subscription.recv().await {
                if payload.as_ref() == name {
                    return true;
                }
            }
            false
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}

/// Release channel of a lock name
pub fn release_channel(name: &str, partitions: u32) -> String {
    let hash = blake3::hash(name.as_bytes());
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&hash.as_bytes()[..4]);
    let partition = u32::from_le_bytes(prefix) % partitions.max(1);
    format!("lock_releases_{partition}")
}

/// [`LockBackend`] over lock rows of a [`DocumentStore`]
pub struct StoreLockBackend {
    store: Arc<dyn DocumentStore>,
    hub: Arc<dyn PubSub>,
    partitions: u32,
}

impl StoreLockBackend {
    pub fn new(store: Arc<dyn DocumentStore>, hub: Arc<dyn PubSub>, partitions: u32) -> Self {
        Self {
            store,
            hub,
            partitions,
        }
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl LockBackend for StoreLockBackend {
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> StorageResult<bool> {
        self.store.try_lock(name, owner, ttl_millis(ttl)).await
    }

    async fn extend(&self, name: &str, owner: &str, ttl: Duration) -> StorageResult<bool> {
        self.store.extend_lock(name, owner, ttl_millis(ttl)).await
    }

    async fn release(&self, name: &str, owner: &str) -> StorageResult<()> {
        if self.store.release_lock(name, owner).await? {
            let channel = release_channel(name, self.partitions);
            self.hub
                .publish(&channel, Bytes::copy_from_slice(name.as_bytes()))
                .await?;
        }
        Ok(())
    }

    fn release_listener(&self, name: &str) -> ReleaseListener {
        let channel = release_channel(name, self.partitions);
        ReleaseListener::new(name, self.hub.subscribe(&channel))
    }
}

type LocalQueues = DashMap<String, Arc<Mutex<()>>>;

/// Acquires named locks on behalf of one process
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    config: LockConfig,
    owner: String,
    local: Arc<LocalQueues>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        Self {
            backend,
            config,
            owner: uuid::Uuid::new_v4().to_string(),
            local: Arc::new(DashMap::new()),
        }
    }

    /// Owner id written into lock rows held by this manager
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Wait for the lock and return a lease that keeps it alive
    pub async fn acquire(&self, name: &str) -> StorageResult<LockLease> {
        let queue = self.local.entry(name.to_string()).or_default().clone();
        let local_guard = queue.lock_owned().await;

        loop {
            let mut listener = self.backend.release_listener(name);
            if self
                .backend
                .try_acquire(name, &self.owner, self.config.ttl)
                .await?
            {
                break;
            }
            trace!(lock = name, "Lock busy, waiting for release");
            if !listener.wait(self.config.retry_timeout).await {
                debug!(lock = name, "No release notification, retrying");
            }
        }

        trace!(lock = name, owner = %self.owner, "Lock acquired");
        Ok(LockLease::start(
            name.to_string(),
            self.owner.clone(),
            self.backend.clone(),
            self.config.clone(),
            local_guard,
            self.local.clone(),
        ))
    }

    /// Run `f` while holding the lock
    pub async fn with_lock<F, Fut, T>(&self, name: &str, f: F) -> StorageResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.acquire(name).await?;
        let out = f().await;
        lease.release().await?;
        Ok(out)
    }
}

/// A held lock
///
/// Dropping a lease without [`LockLease::release`] stops the extender and
/// releases the lock from a background task.
pub struct LockLease {
    name: String,
    owner: String,
    backend: Arc<dyn LockBackend>,
    stop: Option<oneshot::Sender<()>>,
    extender: Option<JoinHandle<()>>,
    local_guard: Option<OwnedMutexGuard<()>>,
    local: Arc<LocalQueues>,
}

impl LockLease {
    fn start(
        name: String,
        owner: String,
        backend: Arc<dyn LockBackend>,
        config: LockConfig,
        local_guard: OwnedMutexGuard<()>,
        local: Arc<LocalQueues>,
    ) -> Self {
        let (stop, mut stopped) = oneshot::channel();
        let extender = {
            let name = name.clone();
            let owner = owner.clone();
            let backend = backend.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(config.extend_interval());
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = &mut stopped => break,
                        _ = interval.tick() => {
                            match backend.extend(&name, &owner, config.ttl).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    warn!(lock = %name, "Lock lost while held");
                                    break;
                                }
                                Err(e) => warn!(lock = %name, error = %e, "Failed to extend lock"),
                            }
                        }
                    }
                }
            })
        };

        Self {
            name,
            owner,
            backend,
            stop: Some(stop),
            extender: Some(extender),
            local_guard: Some(local_guard),
            local,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn stop_extender(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(extender) = self.extender.take() {
            if let Err(e) = extender.await {
                warn!(lock = %self.name, error = %e, "Lock extender panicked");
            }
        }
    }

    fn release_local(&mut self) {
        drop(self.local_guard.take());
        self.local
            .remove_if(&self.name, |_, queue| Arc::strong_count(queue) == 1);
    }

    /// Release the lock and wake waiters
    pub async fn release(mut self) -> StorageResult<()> {
        self.stop_extender().await;
        let result = self.backend.release(&self.name, &self.owner).await;
        self.release_local();
        trace!(lock = %self.name, "Lock released");
        result.map_err(|e| StorageError::lock(format!("release of {} failed: {e}", self.name)))
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.local_guard.is_none() {
            return;
        }
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let backend = self.backend.clone();
            let name = self.name.clone();
            let owner = self.owner.clone();
            handle.spawn(async move {
                if let Err(e) = backend.release(&name, &owner).await {
                    warn!(lock = %name, error = %e, "Failed to release dropped lock");
                }
            });
        }
        self.release_local();
    }
}
