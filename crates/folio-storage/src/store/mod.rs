//! Durable store abstraction
//!
//! Holds every record the session layer needs to survive a restart:
//! document and app records, snapshots keyed by [`SessionKey`], the
//! incremental update log, pub/sub payloads and lock rows.
//!
//! Two back ends are provided: [`MemoryStore`] for tests and single-process
//! deployments, and [`RedbStore`] backed by a redb database file.

mod memory;
mod persistent;

pub use memory::MemoryStore;
pub use persistent::{RedbStore, RedbStoreConfig};

use async_trait::async_trait;
use folio_core::{AppId, DocumentId, SessionKey, UserId, WorkspaceId};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

/// Identifier of one entry in the update log
pub type UpdateId = u64;

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Metadata of a notebook document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub workspace_id: WorkspaceId,
    pub title: String,
    /// When the document was created (Unix millis)
    pub created_at_millis: i64,
    /// When the title last changed (Unix millis)
    pub updated_at_millis: i64,
}

impl DocumentRecord {
    pub fn new(id: DocumentId, workspace_id: WorkspaceId) -> Self {
        let now = now_millis();
        Self {
            id,
            workspace_id,
            title: String::new(),
            created_at_millis: now,
            updated_at_millis: now,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }
}

/// A published app of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: AppId,
    pub document_id: DocumentId,
    pub created_at_millis: i64,
}

impl AppRecord {
    pub fn new(id: AppId, document_id: DocumentId) -> Self {
        Self {
            id,
            document_id,
            created_at_millis: now_millis(),
        }
    }
}

/// Stored state of one session key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub state: Vec<u8>,
    /// Bumped whenever the state is replaced rather than merged
    pub clock: u64,
    /// When `clock` last changed (Unix millis)
    pub clock_updated_at_millis: i64,
    /// Per-viewer app snapshots only: the viewer interacted with inputs
    pub user_changed_state: bool,
}

impl SnapshotRecord {
    pub fn new(state: Vec<u8>, clock: u64) -> Self {
        Self {
            state,
            clock,
            clock_updated_at_millis: now_millis(),
            user_changed_state: false,
        }
    }
}

/// One entry of the incremental update log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub id: UpdateId,
    /// Session key the update belongs to, in its display form
    pub key: String,
    /// Snapshot clock the update was produced against
    pub clock: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LockRow {
    pub owner: String,
    pub expires_at_millis: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PayloadRow {
    pub created_at_millis: i64,
    pub data: Vec<u8>,
}

/// Durable storage for notebook sessions
///
/// Every method is a short, self-contained operation; callers coordinate
/// multi-step read-modify-write sequences with the lock manager.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    // ===== Documents =====

    async fn put_document(&self, record: &DocumentRecord) -> StorageResult<()>;

    async fn get_document(&self, id: &DocumentId) -> StorageResult<Option<DocumentRecord>>;

    async fn delete_document(&self, id: &DocumentId) -> StorageResult<bool>;

    /// Set the title of an existing document; false when it does not exist
    async fn update_title(&self, id: &DocumentId, title: &str) -> StorageResult<bool>;

    // ===== Apps =====

    async fn put_app(&self, record: &AppRecord) -> StorageResult<()>;

    async fn get_app(&self, id: &AppId) -> StorageResult<Option<AppRecord>>;

    /// Most recently published app of a document
    async fn latest_app(&self, document_id: &DocumentId) -> StorageResult<Option<AppRecord>>;

    // ===== Snapshots =====

    async fn get_snapshot(&self, key: &SessionKey) -> StorageResult<Option<SnapshotRecord>>;

    async fn put_snapshot(&self, key: &SessionKey, record: &SnapshotRecord) -> StorageResult<()>;

    /// Viewers that own a snapshot of `app_id`
    async fn app_viewers(&self, app_id: &AppId) -> StorageResult<Vec<UserId>>;

    // ===== Update log =====

    async fn append_update(
        &self,
        key: &SessionKey,
        clock: u64,
        data: &[u8],
    ) -> StorageResult<UpdateId>;

    /// Every update of `key`, oldest first
    async fn updates(&self, key: &SessionKey) -> StorageResult<Vec<UpdateRecord>>;

    async fn delete_updates(&self, ids: &[UpdateId]) -> StorageResult<()>;

    // ===== Pub/sub payloads =====

    async fn put_payload(&self, data: &[u8]) -> StorageResult<String>;

    async fn get_payload(&self, id: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Delete payloads created before `before_millis`; returns how many
    async fn prune_payloads(&self, before_millis: i64) -> StorageResult<usize>;

    // ===== Lock rows =====

    /// Take the named lock when it is free, expired, or already ours
    async fn try_lock(&self, name: &str, owner: &str, ttl_millis: i64) -> StorageResult<bool>;

    /// Push the expiry of a lock we hold; false when we no longer hold it
    async fn extend_lock(&self, name: &str, owner: &str, ttl_millis: i64) -> StorageResult<bool>;

    /// Release a lock we hold; false when we did not hold it
    async fn release_lock(&self, name: &str, owner: &str) -> StorageResult<bool>;
}

/// Whether a lock row may be taken by `owner` at `now`
pub(crate) fn lock_available(row: Option<&LockRow>, owner: &str, now: i64) -> bool {
    match row {
        None => true,
        Some(row) => row.owner == owner || row.expires_at_millis < now,
    }
}
