//! Handshake and frame handling of client connections

mod common;

use std::time::Duration;

use common::{eventually, Fixture, TestClient};
use folio_core::{BlockKind, Role, SessionKey};
use folio_session::{DocumentEvent, ExecutionStrategies, SessionError};
use folio_storage::{DocumentStore, SnapshotRecord};
use folio_sync::{Awareness, Block, Frame, NotebookDocument, SyncMessage};
use serde_json::json;

/// Client replica built from the same stored state as the server
fn client_doc(state: &[u8]) -> NotebookDocument {
    NotebookDocument::load(state).unwrap()
}

fn update_frame(update: Vec<u8>) -> Frame {
    Frame::Sync(SyncMessage::Update { update })
}

#[tokio::test]
async fn test_matching_clock_gets_step1() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    fixture.store_state(&doc_id, 5).await;
    fixture.grant("ada", &doc_id, Role::Editor);
    let manager = fixture.manager(ExecutionStrategies::default()).await;

    let mut client = TestClient::connect(&manager, "ada", &doc_id, 5).await.unwrap();
    let frame = client.next_frame().await.unwrap();
    assert!(matches!(frame, Frame::Sync(SyncMessage::Step1 { .. })));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_durable_clock_fast_forwards_session() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let state = fixture.store_state(&doc_id, 5).await;
    fixture.grant("ada", &doc_id, Role::Editor);
    let manager = fixture.manager(ExecutionStrategies::default()).await;

    let session = manager.get_session(&SessionKey::document(doc_id.clone())).await.unwrap();
    assert_eq!(session.clock(), 5);

    // Another process moved the durable clock the client already synced with
    fixture
        .store
        .put_snapshot(&SessionKey::document(doc_id.clone()), &SnapshotRecord::new(state, 7))
        .await
        .unwrap();

    let mut client = TestClient::connect(&manager, "ada", &doc_id, 7).await.unwrap();
    assert_eq!(session.clock(), 7);
    assert!(matches!(client.next_frame().await, Some(Frame::Sync(SyncMessage::Step1 { .. }))));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_stale_clock_is_refused_and_resync_requested() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    fixture.store_state(&doc_id, 7).await;
    fixture.grant("ada", &doc_id, Role::Editor);
    let manager = fixture.manager(ExecutionStrategies::default()).await;
    let mut events = manager.subscribe_events();

    let result = TestClient::connect(&manager, "ada", &doc_id, 5).await;
    assert!(matches!(
        result,
        Err(SessionError::ClockMismatch { client: 5, server: 7 })
    ));

    let event = events.recv().await.unwrap();
    assert!(matches!(event, DocumentEvent::ResyncRequired { ref user, .. } if user.as_str() == "ada"));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_handshake_rejections() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    fixture.grant("ada", &doc_id, Role::Editor);
    let manager = fixture.manager(ExecutionStrategies::default()).await;

    let no_role = TestClient::connect(&manager, "mallory", &doc_id, 0).await;
    assert!(matches!(no_role, Err(SessionError::Unauthorized(_))));

    fixture.roles.grant_all("ada", Role::Editor);
    let missing = TestClient::connect(&manager, "ada", &"nope".into(), 0).await;
    assert!(matches!(missing, Err(SessionError::NotFound(_))));

    let params = folio_session::ConnectParams {
        document_id: doc_id.clone(),
        clock: 0,
        is_app: true,
        viewer_id: Some("someone-else".into()),
    };
    let wrong_viewer = TestClient::connect_with(&manager, "ada", params).await;
    assert!(matches!(wrong_viewer, Err(SessionError::Unauthorized(_))));

    let params = folio_session::ConnectParams {
        document_id: doc_id.clone(),
        clock: 0,
        is_app: true,
        viewer_id: None,
    };
    let no_app = TestClient::connect_with(&manager, "ada", params).await;
    assert!(matches!(no_app, Err(SessionError::NotFound(_))));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_editor_update_is_broadcast_and_logged() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let state = fixture.store_state(&doc_id, 1).await;
    fixture.grant("ada", &doc_id, Role::Editor);
    fixture.grant("grace", &doc_id, Role::Viewer);
    let manager = fixture.manager(ExecutionStrategies::default()).await;

    let mut writer = TestClient::connect(&manager, "ada", &doc_id, 1).await.unwrap();
    let mut reader = TestClient::connect(&manager, "grace", &doc_id, 1).await.unwrap();
    writer.next_frame().await.unwrap();
    reader.next_frame().await.unwrap();
    writer.spawn();
    reader.spawn();

    let mut local = client_doc(&state);
    let (_, update) = local
        .transact(|doc| doc.upsert_block(&Block::new("b1", BlockKind::Sql)))
        .unwrap();
    writer.send(&update_frame(update.clone()));

    let received = reader.next_frame().await.unwrap();
    assert_eq!(received, update_frame(update));
    // The sender does not get its own update back
    assert!(writer.is_quiet(Duration::from_millis(100)).await);

    let session = manager.get_session(&SessionKey::document(doc_id)).await.unwrap();
    assert!(session.with_doc(|doc| doc.block("b1")).await.unwrap().is_some());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_viewer_update_is_dropped_and_connection_stays_open() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let state = fixture.store_state(&doc_id, 1).await;
    fixture.grant("grace", &doc_id, Role::Viewer);
    let manager = fixture.manager(ExecutionStrategies::default()).await;

    let mut viewer = TestClient::connect(&manager, "grace", &doc_id, 1).await.unwrap();
    viewer.next_frame().await.unwrap();
    viewer.spawn();

    let mut local = client_doc(&state);
    let (_, update) = local
        .transact(|doc| doc.upsert_block(&Block::new("b1", BlockKind::Sql)))
        .unwrap();
    viewer.send(&update_frame(update));

    // Still served: a step 1 is answered with a step 2
    let heads = local.heads();
    viewer.send(&Frame::Sync(SyncMessage::Step1 { heads }));
    assert!(matches!(viewer.next_frame().await, Some(Frame::Sync(SyncMessage::Step2 { .. }))));

    let session = manager.get_session(&SessionKey::document(doc_id)).await.unwrap();
    assert!(session.with_doc(|doc| doc.block("b1")).await.unwrap().is_none());
    assert_eq!(session.connection_count(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_closes_connection() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    fixture.grant("ada", &doc_id, Role::Editor);
    let manager = fixture.manager(ExecutionStrategies::default()).await;

    let mut client = TestClient::connect(&manager, "ada", &doc_id, 0).await.unwrap();
    client.next_frame().await.unwrap();
    let task = client.spawn();

    client
        .inbound
        .send(folio_session::Inbound::Frame(vec![0xff, 0xff, 0xff]))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(client.next_frame().await.is_none());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_closing_retracts_presence() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    fixture.grant("ada", &doc_id, Role::Editor);
    fixture.grant("grace", &doc_id, Role::Editor);
    let manager = fixture.manager(ExecutionStrategies::default()).await;

    let mut ada = TestClient::connect(&manager, "ada", &doc_id, 0).await.unwrap();
    let mut grace = TestClient::connect(&manager, "grace", &doc_id, 0).await.unwrap();
    ada.next_frame().await.unwrap();
    grace.next_frame().await.unwrap();
    ada.spawn();
    grace.spawn();

    let mut presence = Awareness::new();
    let announce = Awareness::encode_state(42, 1, &json!({"user": "ada"})).unwrap();
    ada.send(&Frame::Awareness(announce));

    let Some(Frame::Awareness(update)) = grace.next_frame().await else {
        panic!("expected presence");
    };
    presence.apply_update(&update).unwrap();
    assert!(presence.state(42).is_some());

    ada.inbound.send(folio_session::Inbound::Closed).unwrap();
    let Some(Frame::Awareness(removal)) = grace.next_frame().await else {
        panic!("expected presence removal");
    };
    let changes = presence.apply_update(&removal).unwrap();
    assert_eq!(changes.removed, vec![42]);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_title_change_updates_record() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    fixture.grant("ada", &doc_id, Role::Editor);
    let manager = fixture.manager(ExecutionStrategies::default()).await;
    let mut events = manager.subscribe_events();

    let session = manager.get_session(&SessionKey::document(doc_id.clone())).await.unwrap();
    session.transact(|doc| doc.set_title("Quarterly report")).await.unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(
        event,
        DocumentEvent::TitleChanged {
            document_id: doc_id.clone(),
            title: "Quarterly report".into()
        }
    );
    let record = fixture.store.get_document(&doc_id).await.unwrap().unwrap();
    assert_eq!(record.title, "Quarterly report");

    manager.shutdown().await;
}

#[tokio::test]
async fn test_revoked_role_closes_connection() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    fixture.grant("ada", &doc_id, Role::Editor);
    let config = folio_session::SessionConfig::testing()
        .with_role_refresh_interval(Duration::from_millis(50));
    let manager = fixture.manager_with(config, ExecutionStrategies::default()).await;

    let mut client = TestClient::connect(&manager, "ada", &doc_id, 0).await.unwrap();
    client.next_frame().await.unwrap();
    let task = client.spawn();

    fixture.roles.revoke("ada", doc_id.clone());
    tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

    let session = manager.get_session(&SessionKey::document(doc_id)).await.unwrap();
    let session = &session;
    assert!(eventually(|| async move { session.connection_count() == 0 }).await);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_slow_reader_is_closed_when_its_queue_fills() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    fixture.grant("ada", &doc_id, Role::Editor);
    fixture.grant("grace", &doc_id, Role::Viewer);
    let config = folio_session::SessionConfig::testing().with_outbound_capacity(4);
    let manager = fixture.manager_with(config, ExecutionStrategies::default()).await;

    let mut fast = TestClient::connect(&manager, "ada", &doc_id, 0).await.unwrap();
    let mut slow = TestClient::connect(&manager, "grace", &doc_id, 0).await.unwrap();
    fast.next_frame().await.unwrap();
    fast.spawn();
    // Never drained past the greeting
    let slow_task = slow.spawn();

    let session = manager.get_session(&SessionKey::document(doc_id)).await.unwrap();
    for i in 0..10 {
        let block = Block::new(format!("b{i}"), BlockKind::Sql);
        session.transact(|doc| doc.append_block(&block)).await.unwrap();
        assert!(matches!(fast.next_frame().await, Some(Frame::Sync(SyncMessage::Update { .. }))));
    }

    tokio::time::timeout(Duration::from_secs(2), slow_task)
        .await
        .unwrap()
        .unwrap();
    let s = &session;
    assert!(eventually(|| async move { s.connection_count() == 1 }).await);

    // The fast client is still served
    session
        .transact(|doc| doc.append_block(&Block::new("last", BlockKind::Sql)))
        .await
        .unwrap();
    assert!(fast.next_frame().await.is_some());

    manager.shutdown().await;
}
