//! Publishing a document as an app

use folio_core::{SessionKey, UserId};
use folio_sync::NotebookDocument;
use tracing::{info, instrument};

use crate::error::StorageResult;
use crate::lock::LockManager;
use crate::persistor::bumped;
use crate::store::{now_millis, AppRecord, DocumentStore, SnapshotRecord, UpdateId};

/// Result of [`publish_app`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Clock of the new published snapshot
    pub clock: u64,
    /// Viewers whose snapshot now matches the new publish
    pub resynced: Vec<UserId>,
    /// Viewers that interacted with the app and keep their snapshot
    pub diverged: Vec<UserId>,
}

async fn clear_updates(store: &dyn DocumentStore, key: &SessionKey) -> StorageResult<()> {
    let ids: Vec<UpdateId> = store.updates(key).await?.into_iter().map(|u| u.id).collect();
    store.delete_updates(&ids).await
}

/// Publish `state` as the new shared snapshot of `app`
///
/// Viewer snapshots that never diverged from the previous publish are
/// replaced with the new state under a bumped clock, so live viewers reload.
#[instrument(skip(store, locks, state), fields(app_id = %app.id, document_id = %app.document_id))]
pub async fn publish_app(
    store: &dyn DocumentStore,
    locks: &LockManager,
    app: &AppRecord,
    state: &[u8],
) -> StorageResult<PublishOutcome> {
    // reject bytes that would not load
    NotebookDocument::load(state)?;

    let lease = locks.acquire(&format!("app:{}", app.id)).await?;
    let result: StorageResult<PublishOutcome> = async {
        if store.get_app(&app.id).await?.is_none() {
            store.put_app(app).await?;
        }

        let published_key = SessionKey::app(app.document_id.clone(), app.id.clone(), None);
        let previous = store.get_snapshot(&published_key).await?;
        let record = bumped(previous.as_ref(), state.to_vec());
        store.put_snapshot(&published_key, &record).await?;
        clear_updates(store, &published_key).await?;

        let mut resynced = Vec::new();
        let mut diverged = Vec::new();
        for viewer in store.app_viewers(&app.id).await? {
            let key = SessionKey::app(app.document_id.clone(), app.id.clone(), Some(viewer.clone()));
            let Some(own) = store.get_snapshot(&key).await? else {
                continue;
            };
            if own.user_changed_state {
                diverged.push(viewer);
                continue;
            }
            let resync = SnapshotRecord {
                state: state.to_vec(),
                clock: own.clock + 1,
                clock_updated_at_millis: now_millis(),
                user_changed_state: false,
            };
            store.put_snapshot(&key, &resync).await?;
            clear_updates(store, &key).await?;
            resynced.push(viewer);
        }

        info!(
            clock = record.clock,
            resynced = resynced.len(),
            diverged = diverged.len(),
            "Published app"
        );
        Ok(PublishOutcome {
            clock: record.clock,
            resynced,
            diverged,
        })
    }
    .await;
    lease.release().await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{LockConfig, StoreLockBackend};
    use crate::persistor::{AppPersistor, Persistor};
    use crate::pubsub::LocalPubSub;
    use crate::store::MemoryStore;
    use folio_core::{AppId, BlockKind, DocumentId};
    use folio_sync::Block;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_publish_resyncs_only_untouched_viewers() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let backend = Arc::new(StoreLockBackend::new(store.clone(), Arc::new(LocalPubSub::inline()), 32));
        let locks = Arc::new(LockManager::new(backend, LockConfig::default()));
        let app = AppRecord::new(AppId::new("app"), DocumentId::new("doc"));

        let mut v1 = NotebookDocument::new().unwrap();
        v1.upsert_block(&Block::new("in", BlockKind::Input).with_attr("value", json!(1)))
            .unwrap();
        let first = publish_app(store.as_ref(), &locks, &app, &v1.save()).await.unwrap();
        assert_eq!(first.clock, 1);

        let viewer = |name: &str| {
            AppPersistor::new(
                app.document_id.clone(),
                app.id.clone(),
                Some(UserId::new(name)),
                store.clone(),
                locks.clone(),
            )
        };
        let (idle, busy) = (viewer("idle"), viewer("busy"));

        let mut idle_doc = idle.load().await.unwrap().doc;
        idle.persist(1, &idle_doc.save(), &[]).await.unwrap();

        let mut busy_doc = busy.load().await.unwrap().doc;
        busy_doc.set_block_attr("in", "value", &json!(2)).unwrap();
        busy.persist(1, &busy_doc.save(), &[]).await.unwrap();

        let mut v2 = NotebookDocument::new().unwrap();
        v2.upsert_block(&Block::new("in", BlockKind::Input).with_attr("value", json!(10)))
            .unwrap();
        let second = publish_app(store.as_ref(), &locks, &app, &v2.save()).await.unwrap();

        assert_eq!(second.clock, 2);
        assert_eq!(second.resynced, vec![UserId::new("idle")]);
        assert_eq!(second.diverged, vec![UserId::new("busy")]);

        let idle_loaded = idle.load().await.unwrap();
        assert_eq!(idle_loaded.clock, 2);
        assert_eq!(
            idle_loaded.doc.block("in").unwrap().unwrap().attr("value"),
            Some(&json!(10))
        );
        let busy_loaded = busy.load().await.unwrap();
        assert_eq!(
            busy_loaded.doc.block("in").unwrap().unwrap().attr("value"),
            Some(&json!(2))
        );
    }

    #[tokio::test]
    async fn test_publish_rejects_garbage() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let backend = Arc::new(StoreLockBackend::new(store.clone(), Arc::new(LocalPubSub::inline()), 32));
        let locks = LockManager::new(backend, LockConfig::default());
        let app = AppRecord::new(AppId::new("app"), DocumentId::new("doc"));
        assert!(publish_app(store.as_ref(), &locks, &app, b"not a document").await.is_err());
        assert!(store.get_app(&app.id).await.unwrap().is_none());
    }
}
