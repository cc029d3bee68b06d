//! Session lifetime: collection, warm cache, eviction and shutdown

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, Fixture, TestClient};
use folio_core::{BlockKind, CompletedOutcome, Role, SessionKey};
use folio_session::{
    BlockExecutor, BlockRun, ExecutionStrategies, Inbound, SessionConfig, SessionError,
    SessionManager, SessionResult,
};
use folio_sync::Block;

/// Sweeps only when the test calls `collect`
fn manual_sweep() -> SessionConfig {
    SessionConfig::testing().with_collect_interval(Duration::from_secs(3600))
}

async fn manual_manager(fixture: &Fixture, strategies: ExecutionStrategies) -> Arc<SessionManager> {
    fixture.manager_with(manual_sweep(), strategies).await
}

#[tokio::test]
async fn test_connection_keeps_session_live() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    fixture.grant("ada", &doc_id, Role::Editor);
    let manager = manual_manager(&fixture, ExecutionStrategies::default()).await;
    let key = SessionKey::document(doc_id.clone());

    let mut client = TestClient::connect(&manager, "ada", &doc_id, 0).await.unwrap();
    client.next_frame().await.unwrap();
    client.spawn();
    assert_eq!(manager.collect(), 0);
    assert!(manager.is_live(&key));

    client.inbound.send(Inbound::Closed).unwrap();
    let session = manager.get_session(&key).await.unwrap();
    let s = &session;
    assert!(eventually(|| async move { s.connection_count() == 0 }).await);

    assert_eq!(manager.collect(), 1);
    assert!(!manager.is_live(&key));
    assert!(manager.is_cached(&key));
    assert!(!session.is_closing());

    // Reconnecting picks the warm session back up
    let again = manager.get_session(&key).await.unwrap();
    assert!(Arc::ptr_eq(&session, &again));
    assert!(manager.is_live(&key));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_eviction_destroys_collected_session() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let manager = manual_manager(&fixture, ExecutionStrategies::default()).await;
    let key = SessionKey::document(doc_id);

    let session = manager.get_session(&key).await.unwrap();
    assert_eq!(manager.collect(), 1);
    manager.evict(&key);
    assert!(session.is_closing());

    let fresh = manager.get_session(&key).await.unwrap();
    assert!(!Arc::ptr_eq(&session, &fresh));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_grown_session_is_weighed_again_when_collected() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let config = manual_sweep().with_cache_max_bytes(4096);
    let manager = fixture.manager_with(config, ExecutionStrategies::default()).await;
    let key = SessionKey::document(doc_id);

    let session = manager.get_session(&key).await.unwrap();
    assert!(session.byte_length() < 4096);

    // Random text so the stored state stays large after compression
    let source: String = (0..400).map(|_| uuid::Uuid::new_v4().to_string()).collect();
    let block = Block::new("big", BlockKind::Python).with_attr("source", source.into());
    session
        .transact(|doc| doc.append_block(&block))
        .await
        .unwrap();
    session.flush().await;
    assert!(session.byte_length() > 4096);

    assert_eq!(manager.collect(), 1);
    let m = &manager;
    let k = &key;
    assert!(eventually(|| async move { !m.is_cached(k) }).await);
    let s = &session;
    assert!(eventually(|| async move { s.is_closing() }).await);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_sweep_destroys_session_already_evicted() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let manager = manual_manager(&fixture, ExecutionStrategies::default()).await;
    let key = SessionKey::document(doc_id);

    let session = manager.get_session(&key).await.unwrap();
    manager.evict(&key);
    // Still live, so eviction alone keeps it open
    assert!(!session.is_closing());

    assert_eq!(manager.collect(), 1);
    assert!(session.is_closing());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_pin_prevents_collection() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let manager = manual_manager(&fixture, ExecutionStrategies::default()).await;
    let key = SessionKey::document(doc_id);

    let pinned = manager.pin(&key).await.unwrap();
    assert_eq!(pinned.refs(), 1);
    assert_eq!(manager.collect(), 0);

    drop(pinned);
    assert_eq!(manager.collect(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_update_callers_hold_session() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let manager = manual_manager(&fixture, ExecutionStrategies::default()).await;
    let key = SessionKey::document(doc_id);

    let collected = manager
        .get_session_for_update(&key, |session| {
            let manager = manager.clone();
            async move {
                assert_eq!(session.refs(), 1);
                Ok(manager.collect())
            }
        })
        .await
        .unwrap();
    assert_eq!(collected, 0);
    assert_eq!(manager.collect(), 1);

    manager.shutdown().await;
}

/// Reports busy for the documents it holds
#[derive(Default)]
struct Busy(Mutex<HashSet<SessionKey>>);

impl Busy {
    fn hold(&self, key: &SessionKey) {
        self.0.lock().unwrap().insert(key.clone());
    }

    fn release(&self, key: &SessionKey) {
        self.0.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl BlockExecutor for Busy {
    async fn run(&self, run: &BlockRun) -> SessionResult<()> {
        run.complete(CompletedOutcome::Success).await?;
        Ok(())
    }

    fn is_idle(&self, key: &SessionKey) -> bool {
        !self.0.lock().unwrap().contains(key)
    }
}

#[tokio::test]
async fn test_busy_strategy_prevents_collection() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let busy = Arc::new(Busy::default());
    let manager = manual_manager(&fixture, ExecutionStrategies::uniform(busy.clone())).await;
    let key = SessionKey::document(doc_id);

    manager.get_session(&key).await.unwrap();
    busy.hold(&key);
    assert_eq!(manager.collect(), 0);

    busy.release(&key);
    assert_eq!(manager.collect(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_busy_document_does_not_hold_other_sessions() {
    let fixture = Fixture::new();
    let doc_a = fixture.create_document("doc-a").await;
    let doc_b = fixture.create_document("doc-b").await;
    let busy = Arc::new(Busy::default());
    let manager = manual_manager(&fixture, ExecutionStrategies::uniform(busy.clone())).await;
    let key_a = SessionKey::document(doc_a);
    let key_b = SessionKey::document(doc_b);

    manager.get_session(&key_a).await.unwrap();
    manager.get_session(&key_b).await.unwrap();
    busy.hold(&key_a);

    assert_eq!(manager.collect(), 1);
    assert!(manager.is_live(&key_a));
    assert!(!manager.is_live(&key_b));

    busy.release(&key_a);
    assert_eq!(manager.collect(), 1);
    assert!(!manager.is_live(&key_a));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_loads_share_one_session() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let manager = manual_manager(&fixture, ExecutionStrategies::default()).await;
    let key = SessionKey::document(doc_id);

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let manager = manager.clone();
        let key = key.clone();
        tasks.spawn(async move { manager.get_session(&key).await.unwrap() });
    }
    let sessions: Vec<_> = tasks.join_all().await;
    assert!(sessions.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(manager.live_count(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_background_sweep_collects_idle_sessions() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let manager = fixture.manager(ExecutionStrategies::default()).await;
    let key = SessionKey::document(doc_id);

    manager.get_session(&key).await.unwrap();
    let m = &manager;
    assert!(eventually(|| async move { m.live_count() == 0 }).await);
    assert!(manager.is_cached(&key));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_writes_final_state() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let key = SessionKey::document(doc_id);

    let first = fixture.manager(ExecutionStrategies::default()).await;
    let session = first.get_session(&key).await.unwrap();
    session
        .transact(|doc| doc.append_block(&Block::new("b1", BlockKind::Sql)))
        .await
        .unwrap();
    first.shutdown().await;

    assert!(!first.is_accepting());
    assert!(matches!(
        first.get_session(&key).await,
        Err(SessionError::ShuttingDown)
    ));

    let second = fixture.manager(ExecutionStrategies::default()).await;
    let reopened = second.get_session(&key).await.unwrap();
    assert!(!Arc::ptr_eq(&session, &reopened));
    let block = reopened.with_doc(|doc| doc.block("b1")).await.unwrap();
    assert!(block.is_some());

    second.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_force_destroys_stuck_sessions() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    fixture.grant("ada", &doc_id, Role::Editor);
    let config = manual_sweep().with_shutdown_timeout(Duration::from_millis(200));
    let manager = fixture.manager_with(config, ExecutionStrategies::default()).await;

    // Never served, so the close request is never acknowledged
    let mut client = TestClient::connect(&manager, "ada", &doc_id, 0).await.unwrap();
    client.next_frame().await.unwrap();
    let session = client.connection.as_ref().unwrap().session().clone();

    tokio::time::timeout(Duration::from_secs(2), manager.shutdown())
        .await
        .unwrap();
    assert!(session.is_closing());
    assert_eq!(manager.live_count(), 0);
}
