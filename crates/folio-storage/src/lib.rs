//! # Folio Storage
//!
//! Durable state of notebook sessions and the cross-process plumbing that
//! keeps several server processes consistent.
//!
//! ## Components
//!
//! - [`DocumentStore`]: records, snapshots, the incremental update log,
//!   pub/sub payloads and lock rows. [`MemoryStore`] and [`RedbStore`]
//!   implement it.
//! - [`Persistor`]: load/persist/authorize strategy of one session key,
//!   with the canonical [`DocumentPersistor`] and the published
//!   [`AppPersistor`].
//! - [`LockManager`]: named cross-process locks over a [`LockBackend`].
//! - [`PubSub`]: channel publish/subscribe between processes, with the
//!   in-memory [`LocalPubSub`] optionally shipping stored payload ids.
//! - [`publish_app`]: writes a new published app snapshot and resyncs
//!   viewers that never diverged.
//!
//! ## Example
//!
//! ```rust,ignore
//! use folio_storage::{DocumentPersistor, LockConfig, LockManager, MemoryStore, LocalPubSub, StoreLockBackend};
//!
//! let store = Arc::new(MemoryStore::new());
//! let hub = Arc::new(LocalPubSub::stored(store.clone()));
//! let backend = Arc::new(StoreLockBackend::new(store.clone(), hub.clone(), 32));
//! let locks = Arc::new(LockManager::new(backend, LockConfig::default()));
//!
//! let persistor = DocumentPersistor::new("doc-1".into(), store, locks);
//! let loaded = persistor.load().await?;
//! ```

pub mod error;
pub mod lock;
pub mod persistor;
pub mod publish;
pub mod pubsub;
pub mod store;

pub use error::{StorageError, StorageResult};
pub use lock::{LockBackend, LockConfig, LockLease, LockManager, ReleaseListener, StoreLockBackend};
pub use persistor::{AppPersistor, DocumentPersistor, LoadedState, Persistor, COMPACTION_THRESHOLD};
pub use publish::{publish_app, PublishOutcome};
pub use pubsub::{LocalPubSub, MessageStream, PayloadMode, PubSub, Subscription};
pub use store::{
    AppRecord, DocumentRecord, DocumentStore, MemoryStore, RedbStore, RedbStoreConfig,
    SnapshotRecord, UpdateId, UpdateRecord,
};
