//! In-memory document store
//!
//! Suitable for tests and for running several simulated processes against
//! one shared store.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use folio_core::{AppId, DocumentId, SessionKey, UserId};
use tracing::trace;

use super::{
    lock_available, now_millis, AppRecord, DocumentRecord, DocumentStore, LockRow, PayloadRow,
    SnapshotRecord, UpdateId, UpdateRecord,
};
use crate::error::{StorageError, StorageResult};

/// In-memory implementation of [`DocumentStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: DashMap<DocumentId, DocumentRecord>,
    apps: DashMap<AppId, AppRecord>,
    snapshots: DashMap<String, SnapshotRecord>,
    viewers: DashMap<AppId, Vec<UserId>>,
    /// Ordered so listing by key is oldest first
    updates: Mutex<BTreeMap<UpdateId, UpdateRecord>>,
    next_update: AtomicU64,
    payloads: DashMap<String, PayloadRow>,
    locks: DashMap<String, LockRow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of update log entries across all keys
    pub fn update_count(&self) -> usize {
        self.updates.lock().map(|u| u.len()).unwrap_or(0)
    }

    fn updates_guard(
        &self,
    ) -> StorageResult<std::sync::MutexGuard<'_, BTreeMap<UpdateId, UpdateRecord>>> {
        self.updates
            .lock()
            .map_err(|_| StorageError::database("update log mutex poisoned"))
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn put_document(&self, record: &DocumentRecord) -> StorageResult<()> {
        self.documents.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_document(&self, id: &DocumentId) -> StorageResult<Option<DocumentRecord>> {
        Ok(self.documents.get(id).map(|r| r.clone()))
    }

    async fn delete_document(&self, id: &DocumentId) -> StorageResult<bool> {
        Ok(self.documents.remove(id).is_some())
    }

    async fn update_title(&self, id: &DocumentId, title: &str) -> StorageResult<bool> {
        match self.documents.get_mut(id) {
            Some(mut record) => {
                record.title = title.to_string();
                record.updated_at_millis = now_millis();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn put_app(&self, record: &AppRecord) -> StorageResult<()> {
        self.apps.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_app(&self, id: &AppId) -> StorageResult<Option<AppRecord>> {
        Ok(self.apps.get(id).map(|r| r.clone()))
    }

    async fn latest_app(&self, document_id: &DocumentId) -> StorageResult<Option<AppRecord>> {
        Ok(self
            .apps
            .iter()
            .filter(|app| &app.document_id == document_id)
            .max_by_key(|app| app.created_at_millis)
            .map(|app| app.clone()))
    }

    async fn get_snapshot(&self, key: &SessionKey) -> StorageResult<Option<SnapshotRecord>> {
        Ok(self.snapshots.get(&key.to_string()).map(|r| r.clone()))
    }

    async fn put_snapshot(&self, key: &SessionKey, record: &SnapshotRecord) -> StorageResult<()> {
        if let SessionKey::App {
            app_id,
            viewer: Some(viewer),
            ..
        } = key
        {
            let mut viewers = self.viewers.entry(app_id.clone()).or_default();
            if !viewers.contains(viewer) {
                viewers.push(viewer.clone());
            }
        }
        self.snapshots.insert(key.to_string(), record.clone());
        trace!(%key, clock = record.clock, bytes = record.state.len(), "stored snapshot");
        Ok(())
    }

    async fn app_viewers(&self, app_id: &AppId) -> StorageResult<Vec<UserId>> {
        Ok(self
            .viewers
            .get(app_id)
            .map(|v| v.clone())
            .unwrap_or_default())
    }

    async fn append_update(
        &self,
        key: &SessionKey,
        clock: u64,
        data: &[u8],
    ) -> StorageResult<UpdateId> {
        let id = self.next_update.fetch_add(1, Ordering::SeqCst) + 1;
        self.updates_guard()?.insert(
            id,
            UpdateRecord {
                id,
                key: key.to_string(),
                clock,
                data: data.to_vec(),
            },
        );
        Ok(id)
    }

    async fn updates(&self, key: &SessionKey) -> StorageResult<Vec<UpdateRecord>> {
        let key = key.to_string();
        Ok(self
            .updates_guard()?
            .values()
            .filter(|u| u.key == key)
            .cloned()
            .collect())
    }

    async fn delete_updates(&self, ids: &[UpdateId]) -> StorageResult<()> {
        let mut updates = self.updates_guard()?;
        for id in ids {
            updates.remove(id);
        }
        Ok(())
    }

    async fn put_payload(&self, data: &[u8]) -> StorageResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.payloads.insert(
            id.clone(),
            PayloadRow {
                created_at_millis: now_millis(),
                data: data.to_vec(),
            },
        );
        Ok(id)
    }

    async fn get_payload(&self, id: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.payloads.get(id).map(|p| p.data.clone()))
    }

    async fn prune_payloads(&self, before_millis: i64) -> StorageResult<usize> {
        let before = self.payloads.len();
        self.payloads
            .retain(|_, payload| payload.created_at_millis >= before_millis);
        Ok(before.saturating_sub(self.payloads.len()))
    }

    async fn try_lock(&self, name: &str, owner: &str, ttl_millis: i64) -> StorageResult<bool> {
        let now = now_millis();
        let row = LockRow {
            owner: owner.to_string(),
            expires_at_millis: now + ttl_millis,
        };
        match self.locks.entry(name.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(row);
                Ok(true)
            }
            Entry::Occupied(mut entry) => {
                if lock_available(Some(entry.get()), owner, now) {
                    entry.insert(row);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn extend_lock(&self, name: &str, owner: &str, ttl_millis: i64) -> StorageResult<bool> {
        match self.locks.get_mut(name) {
            Some(mut row) if row.owner == owner => {
                row.expires_at_millis = now_millis() + ttl_millis;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, name: &str, owner: &str) -> StorageResult<bool> {
        Ok(self
            .locks
            .remove_if(name, |_, row| row.owner == owner)
            .is_some())
    }
}
