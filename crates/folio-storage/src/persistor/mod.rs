//! Persistors: how one session key loads, saves and authorizes writes
//!
//! Two variants share the [`Persistor`] contract:
//!
//! - [`DocumentPersistor`] for the canonical document, where writes are
//!   gated on the user's role
//! - [`AppPersistor`] for published apps, where a viewer gets the shared
//!   published snapshot until they diverge, and writes are gated on
//!   structural equality with the published app
//!
//! Every read-modify-write of stored state runs under a cross-process lock
//! named after the document (`document:{id}`) or the app (`app:{id}`).

mod app;
mod document;
pub mod rules;

pub use app::AppPersistor;
pub use document::DocumentPersistor;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use folio_core::{Role, SessionKey};
use folio_sync::NotebookDocument;
use tracing::debug;

use crate::error::StorageResult;
use crate::store::{now_millis, DocumentStore, SnapshotRecord, UpdateId, UpdateRecord};

/// More updates than this are folded into the snapshot on load
pub const COMPACTION_THRESHOLD: usize = 100;

/// State produced by [`Persistor::load`] and friends
pub struct LoadedState {
    pub doc: NotebookDocument,
    pub clock: u64,
    /// Size of the stored state the document was built from
    pub byte_length: usize,
    /// Time spent applying the stored state
    pub apply_latency: Duration,
    /// When the clock last changed (Unix millis)
    pub clock_updated_at_millis: i64,
}

impl std::fmt::Debug for LoadedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedState")
            .field("clock", &self.clock)
            .field("byte_length", &self.byte_length)
            .field("apply_latency", &self.apply_latency)
            .finish()
    }
}

/// Durable state strategy of one session key
#[async_trait]
pub trait Persistor: Send + Sync + 'static {
    /// Key of the session this persistor serves
    fn key(&self) -> &SessionKey;

    /// Build the document from its snapshot and pending updates
    async fn load(&self) -> StorageResult<LoadedState>;

    /// Stored clock, if any state was ever stored
    async fn current_clock(&self) -> StorageResult<Option<u64>>;

    /// Append one incremental update produced against `clock`
    async fn persist_update(&self, clock: u64, update: &[u8]) -> StorageResult<UpdateId>;

    /// Merge `state` into the stored snapshot
    ///
    /// `folded` are update log entries that `state` already contains; they
    /// are deleted once the snapshot is written. Returns the stored size.
    async fn persist(&self, clock: u64, state: &[u8], folded: &[UpdateId]) -> StorageResult<usize>;

    /// Store `doc` without its history under a new clock
    async fn clean_history(&self, doc: &NotebookDocument) -> StorageResult<LoadedState>;

    /// Replace the stored state under a new clock
    async fn replace_state(&self, state: &[u8]) -> StorageResult<LoadedState>;

    /// Whether `update`, sent by a user with `role`, may be applied to `doc`
    fn can_write(&self, role: Role, update: &[u8], doc: &mut NotebookDocument) -> bool;
}

/// Snapshot plus its pending updates, applied in order
pub(crate) struct Replay {
    pub doc: NotebookDocument,
    pub applied: Vec<UpdateRecord>,
    pub apply_latency: Duration,
}

/// Rebuild a document from `snapshot` and the updates logged at its clock
pub(crate) fn replay(snapshot: &[u8], clock: u64, updates: Vec<UpdateRecord>) -> StorageResult<Replay> {
    let started = Instant::now();
    let mut doc = NotebookDocument::load(snapshot)?;
    let applied: Vec<UpdateRecord> = updates.into_iter().filter(|u| u.clock == clock).collect();
    for update in &applied {
        doc.apply_update(&update.data)?;
    }
    Ok(Replay {
        doc,
        applied,
        apply_latency: started.elapsed(),
    })
}

/// Fold replayed updates into the snapshot once there are too many
pub(crate) async fn compact(
    store: &dyn DocumentStore,
    key: &SessionKey,
    replay: &mut Replay,
    record: Option<&SnapshotRecord>,
    clock: u64,
) -> StorageResult<()> {
    if replay.applied.len() <= COMPACTION_THRESHOLD {
        return Ok(());
    }

    let mut compacted = match record {
        Some(record) => record.clone(),
        None => SnapshotRecord::new(Vec::new(), clock),
    };
    compacted.state = replay.doc.save();
    store.put_snapshot(key, &compacted).await?;

    let ids: Vec<UpdateId> = replay.applied.iter().map(|u| u.id).collect();
    store.delete_updates(&ids).await?;
    debug!(key = %key, folded = ids.len(), "Compacted update log");
    Ok(())
}

/// Load `state` into a fresh document and merge it with `stored`
pub(crate) fn merge_states(state: &[u8], stored: Option<&[u8]>) -> StorageResult<Vec<u8>> {
    let mut doc = NotebookDocument::load(state)?;
    if let Some(stored) = stored {
        let mut stored = NotebookDocument::load(stored)?;
        doc.merge(&mut stored)?;
    }
    Ok(doc.save())
}

/// Snapshot record for a state that replaces the stored one
pub(crate) fn bumped(record: Option<&SnapshotRecord>, state: Vec<u8>) -> SnapshotRecord {
    let clock = record.map(|r| r.clock + 1).unwrap_or(1);
    SnapshotRecord {
        state,
        clock,
        clock_updated_at_millis: now_millis(),
        user_changed_state: false,
    }
}

/// Loaded state for a freshly written snapshot
pub(crate) fn loaded_from(doc: NotebookDocument, record: &SnapshotRecord) -> LoadedState {
    LoadedState {
        doc,
        clock: record.clock,
        byte_length: record.state.len(),
        apply_latency: Duration::ZERO,
        clock_updated_at_millis: record.clock_updated_at_millis,
    }
}
