//! Persistor of the canonical document

use std::sync::Arc;

use async_trait::async_trait;
use folio_core::{DocumentId, Role, SessionKey};
use folio_sync::NotebookDocument;
use tracing::{debug, error, instrument, trace};

use super::{bumped, compact, loaded_from, merge_states, replay, LoadedState, Persistor};
use crate::error::StorageResult;
use crate::lock::LockManager;
use crate::store::{DocumentStore, SnapshotRecord, UpdateId};

/// Persistor of an editable notebook document
pub struct DocumentPersistor {
    key: SessionKey,
    document_id: DocumentId,
    store: Arc<dyn DocumentStore>,
    locks: Arc<LockManager>,
}

impl DocumentPersistor {
    pub fn new(document_id: DocumentId, store: Arc<dyn DocumentStore>, locks: Arc<LockManager>) -> Self {
        Self {
            key: SessionKey::Document(document_id.clone()),
            document_id,
            store,
            locks,
        }
    }

    fn lock_name(&self) -> String {
        format!("document:{}", self.document_id)
    }

    async fn load_locked(&self) -> StorageResult<LoadedState> {
        let record = self.store.get_snapshot(&self.key).await?;
        let (state, clock, clock_updated_at_millis) = match &record {
            Some(r) => (r.state.as_slice(), r.clock, r.clock_updated_at_millis),
            None => (&[][..], 0, 0),
        };

        let updates = self.store.updates(&self.key).await?;
        let mut replayed = replay(state, clock, updates)?;
        trace!(
            document_id = %self.document_id,
            clock,
            updates = replayed.applied.len(),
            "Applied stored updates"
        );
        compact(self.store.as_ref(), &self.key, &mut replayed, record.as_ref(), clock).await?;

        Ok(LoadedState {
            doc: replayed.doc,
            clock,
            byte_length: state.len(),
            apply_latency: replayed.apply_latency,
            clock_updated_at_millis,
        })
    }

    async fn persist_locked(&self, clock: u64, state: &[u8], folded: &[UpdateId]) -> StorageResult<usize> {
        if self.store.get_document(&self.document_id).await?.is_none() {
            debug!(document_id = %self.document_id, "Document record is gone, dropping write");
            return Ok(0);
        }

        let stored = self.store.get_snapshot(&self.key).await?;
        if let Some(stored) = &stored {
            if stored.clock > clock {
                debug!(
                    document_id = %self.document_id,
                    clock,
                    stored_clock = stored.clock,
                    "Stored state is newer, dropping write"
                );
                return Ok(stored.state.len());
            }
        }

        let merged = merge_states(state, stored.as_ref().map(|s| s.state.as_slice()))?;
        let byte_length = merged.len();
        let record = match stored {
            Some(mut stored) => {
                stored.state = merged;
                stored
            }
            None => SnapshotRecord::new(merged, clock),
        };
        self.store.put_snapshot(&self.key, &record).await?;
        if !folded.is_empty() {
            self.store.delete_updates(folded).await?;
        }
        Ok(byte_length)
    }

    async fn write_new_clock(&self, doc: NotebookDocument, state: Vec<u8>) -> StorageResult<LoadedState> {
        let stored = self.store.get_snapshot(&self.key).await?;
        let record = bumped(stored.as_ref(), state);
        self.store.put_snapshot(&self.key, &record).await?;

        let stale: Vec<UpdateId> = self
            .store
            .updates(&self.key)
            .await?
            .into_iter()
            .map(|u| u.id)
            .collect();
        self.store.delete_updates(&stale).await?;

        debug!(document_id = %self.document_id, clock = record.clock, "Stored state under new clock");
        Ok(loaded_from(doc, &record))
    }
}

#[async_trait]
impl Persistor for DocumentPersistor {
    fn key(&self) -> &SessionKey {
        &self.key
    }

    #[instrument(skip(self), fields(document_id = %self.document_id))]
    async fn load(&self) -> StorageResult<LoadedState> {
        let lease = self.locks.acquire(&self.lock_name()).await?;
        let result = self.load_locked().await;
        lease.release().await?;
        result.inspect_err(|e| error!(error = %e, "Failed to load document state"))
    }

    async fn current_clock(&self) -> StorageResult<Option<u64>> {
        Ok(self.store.get_snapshot(&self.key).await?.map(|r| r.clock))
    }

    async fn persist_update(&self, clock: u64, update: &[u8]) -> StorageResult<UpdateId> {
        self.store.append_update(&self.key, clock, update).await
    }

    #[instrument(skip(self, state, folded), fields(document_id = %self.document_id))]
    async fn persist(&self, clock: u64, state: &[u8], folded: &[UpdateId]) -> StorageResult<usize> {
        let lease = self.locks.acquire(&self.lock_name()).await?;
        let result = self.persist_locked(clock, state, folded).await;
        lease.release().await?;
        result
    }

    #[instrument(skip(self, doc), fields(document_id = %self.document_id))]
    async fn clean_history(&self, doc: &NotebookDocument) -> StorageResult<LoadedState> {
        let mut fresh = doc.without_history()?;
        let state = fresh.save();
        let lease = self.locks.acquire(&self.lock_name()).await?;
        let result = self.write_new_clock(fresh, state).await;
        lease.release().await?;
        result
    }

    #[instrument(skip(self, state), fields(document_id = %self.document_id))]
    async fn replace_state(&self, state: &[u8]) -> StorageResult<LoadedState> {
        let doc = NotebookDocument::load(state)?;
        let lease = self.locks.acquire(&self.lock_name()).await?;
        let result = self.write_new_clock(doc, state.to_vec()).await;
        lease.release().await?;
        result
    }

    fn can_write(&self, role: Role, _update: &[u8], _doc: &mut NotebookDocument) -> bool {
        role.can_edit()
    }
}
