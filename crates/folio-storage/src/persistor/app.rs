//! Persistor of a published app, shared or per viewer

use std::sync::Arc;

use async_trait::async_trait;
use folio_core::{AppId, DocumentId, Role, SessionKey, UserId};
use folio_sync::NotebookDocument;
use tracing::{debug, error, instrument, trace};

use super::rules::{blocks_acceptable, layout_equal, user_changed_state};
use super::{bumped, compact, loaded_from, merge_states, replay, LoadedState, Persistor};
use crate::error::{StorageError, StorageResult};
use crate::lock::LockManager;
use crate::store::{DocumentStore, SnapshotRecord, UpdateId};

/// Persistor of a published app
///
/// Without a viewer it manipulates the shared published snapshot. With a
/// viewer it reads the published snapshot until the viewer's own snapshot
/// exists, and writes only the viewer's snapshot.
pub struct AppPersistor {
    key: SessionKey,
    published_key: SessionKey,
    app_id: AppId,
    viewer: Option<UserId>,
    store: Arc<dyn DocumentStore>,
    locks: Arc<LockManager>,
}

impl AppPersistor {
    pub fn new(
        document_id: DocumentId,
        app_id: AppId,
        viewer: Option<UserId>,
        store: Arc<dyn DocumentStore>,
        locks: Arc<LockManager>,
    ) -> Self {
        Self {
            key: SessionKey::app(document_id.clone(), app_id.clone(), viewer.clone()),
            published_key: SessionKey::app(document_id, app_id.clone(), None),
            app_id,
            viewer,
            store,
            locks,
        }
    }

    fn lock_name(&self) -> String {
        format!("app:{}", self.app_id)
    }

    async fn published(&self) -> StorageResult<SnapshotRecord> {
        if self.store.get_app(&self.app_id).await?.is_none() {
            return Err(StorageError::not_found(format!("app {}", self.app_id)));
        }
        self.store
            .get_snapshot(&self.published_key)
            .await?
            .ok_or_else(|| StorageError::not_found(format!("published state of app {}", self.app_id)))
    }

    /// Own snapshot of the viewer, if this persistor has a viewer and it exists
    async fn own(&self) -> StorageResult<Option<SnapshotRecord>> {
        match self.viewer {
            Some(_) => self.store.get_snapshot(&self.key).await,
            None => Ok(None),
        }
    }

    async fn load_locked(&self) -> StorageResult<LoadedState> {
        let published = self.published().await?;

        if let Some(own) = self.own().await? {
            let updates = self.store.updates(&self.key).await?;
            let mut replayed = replay(&own.state, own.clock, updates)?;
            compact(self.store.as_ref(), &self.key, &mut replayed, Some(&own), own.clock).await?;
            return Ok(LoadedState {
                doc: replayed.doc,
                clock: own.clock,
                byte_length: own.state.len(),
                apply_latency: replayed.apply_latency,
                clock_updated_at_millis: own.clock_updated_at_millis,
            });
        }

        // bind to the published state
        let mut updates = self.store.updates(&self.published_key).await?;
        let shared_updates = updates.len();
        if self.viewer.is_some() {
            // writes the viewer made before their first snapshot
            updates.extend(self.store.updates(&self.key).await?);
        }
        let mut replayed = replay(&published.state, published.clock, updates)?;
        trace!(
            app_id = %self.app_id,
            clock = published.clock,
            updates = replayed.applied.len(),
            "Applied published updates"
        );
        if self.viewer.is_none() || replayed.applied.len() == shared_updates {
            compact(
                self.store.as_ref(),
                &self.published_key,
                &mut replayed,
                Some(&published),
                published.clock,
            )
            .await?;
        }

        Ok(LoadedState {
            doc: replayed.doc,
            clock: published.clock,
            byte_length: published.state.len(),
            apply_latency: replayed.apply_latency,
            clock_updated_at_millis: published.clock_updated_at_millis,
        })
    }

    async fn persist_locked(&self, clock: u64, state: &[u8], folded: &[UpdateId]) -> StorageResult<usize> {
        let published = self.published().await?;
        let own = self.own().await?;

        let stored_clock = match (&self.viewer, &own) {
            (Some(_), Some(own)) => own.clock,
            _ => published.clock,
        };
        if stored_clock > clock {
            debug!(app_id = %self.app_id, clock, stored_clock, "Stored state is newer, dropping write");
            return Ok(0);
        }

        let record = match &self.viewer {
            None => {
                let mut record = published;
                record.state = merge_states(state, Some(&record.state))?;
                record
            }
            Some(_) => {
                let merged = merge_states(state, own.as_ref().map(|o| o.state.as_slice()))?;
                let current = NotebookDocument::load(&merged)?.blocks()?;
                let published_blocks = NotebookDocument::load(&published.state)?.blocks()?;
                let changed = user_changed_state(&current, &published_blocks)?;

                let mut record = own.unwrap_or_else(|| SnapshotRecord::new(Vec::new(), clock));
                record.state = merged;
                record.user_changed_state = changed;
                record
            }
        };

        let byte_length = record.state.len();
        self.store.put_snapshot(&self.key, &record).await?;
        if !folded.is_empty() {
            self.store.delete_updates(folded).await?;
        }
        Ok(byte_length)
    }

    async fn write_new_clock(&self, doc: NotebookDocument, state: Vec<u8>) -> StorageResult<LoadedState> {
        let published = self.published().await?;
        let own = self.own().await?;

        let mut record = bumped(Some(own.as_ref().unwrap_or(&published)), state);
        record.user_changed_state = own.as_ref().is_some_and(|o| o.user_changed_state);
        self.store.put_snapshot(&self.key, &record).await?;

        let stale: Vec<UpdateId> = self
            .store
            .updates(&self.key)
            .await?
            .into_iter()
            .map(|u| u.id)
            .collect();
        self.store.delete_updates(&stale).await?;

        debug!(key = %self.key, clock = record.clock, "Stored app state under new clock");
        Ok(loaded_from(doc, &record))
    }

    fn check_write(&self, update: &[u8], doc: &mut NotebookDocument) -> StorageResult<bool> {
        let mut next = doc.fork();
        next.apply_update(update)?;

        if !layout_equal(&doc.layout()?, &next.layout()?) {
            debug!(key = %self.key, "Rejected app write: layout changed");
            return Ok(false);
        }
        if !blocks_acceptable(&doc.blocks()?, &next.blocks()?) {
            debug!(key = %self.key, "Rejected app write: block changed");
            return Ok(false);
        }
        Ok(true)
    }
}

#[async_trait]
impl Persistor for AppPersistor {
    fn key(&self) -> &SessionKey {
        &self.key
    }

    #[instrument(skip(self), fields(key = %self.key))]
    async fn load(&self) -> StorageResult<LoadedState> {
        let lease = self.locks.acquire(&self.lock_name()).await?;
        let result = self.load_locked().await;
        lease.release().await?;
        result.inspect_err(|e| error!(error = %e, "Failed to load app state"))
    }

    async fn current_clock(&self) -> StorageResult<Option<u64>> {
        if let Some(own) = self.own().await? {
            return Ok(Some(own.clock));
        }
        Ok(self
            .store
            .get_snapshot(&self.published_key)
            .await?
            .map(|r| r.clock))
    }

    async fn persist_update(&self, clock: u64, update: &[u8]) -> StorageResult<UpdateId> {
        self.store.append_update(&self.key, clock, update).await
    }

    #[instrument(skip(self, state, folded), fields(key = %self.key))]
    async fn persist(&self, clock: u64, state: &[u8], folded: &[UpdateId]) -> StorageResult<usize> {
        let lease = self.locks.acquire(&self.lock_name()).await?;
        let result = self.persist_locked(clock, state, folded).await;
        lease.release().await?;
        result
    }

    #[instrument(skip(self, doc), fields(key = %self.key))]
    async fn clean_history(&self, doc: &NotebookDocument) -> StorageResult<LoadedState> {
        let mut fresh = doc.without_history()?;
        let state = fresh.save();
        let lease = self.locks.acquire(&self.lock_name()).await?;
        let result = self.write_new_clock(fresh, state).await;
        lease.release().await?;
        result
    }

    #[instrument(skip(self, state), fields(key = %self.key))]
    async fn replace_state(&self, state: &[u8]) -> StorageResult<LoadedState> {
        let doc = NotebookDocument::load(state)?;
        let lease = self.locks.acquire(&self.lock_name()).await?;
        let result = self.write_new_clock(doc, state.to_vec()).await;
        lease.release().await?;
        result
    }

    fn can_write(&self, _role: Role, update: &[u8], doc: &mut NotebookDocument) -> bool {
        self.check_write(update, doc).unwrap_or_else(|e| {
            debug!(key = %self.key, error = %e, "Rejected unreadable app write");
            false
        })
    }
}
