//! Queue draining by the per-session executor

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{eventually, Fixture};
use folio_core::{BlockKind, CompletedOutcome, ItemMetadata, ItemStatus, SessionKey};
use folio_session::{BlockExecutor, BlockRun, ExecutionStrategies, Session, SessionError, SessionResult};
use folio_sync::{Block, NotebookDocument, RunAllSource};
use folio_storage::{DocumentStore, SnapshotRecord};
use proptest::prelude::*;
use serde_json::json;

/// Statuses of the other items of a batch, seen when a block started
type Observation = Vec<(String, ItemStatus)>;

/// Completes every block successfully, except those listed in `failing`
#[derive(Default)]
struct Recorder {
    failing: Vec<String>,
    runs: Mutex<Vec<(String, Observation)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Recorder {
    fn failing(blocks: &[&str]) -> Self {
        Self {
            failing: blocks.iter().map(|b| b.to_string()).collect(),
            ..Default::default()
        }
    }

    fn run_order(&self) -> Vec<String> {
        self.runs.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
    }

    fn observation(&self, block_id: &str) -> Option<Observation> {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == block_id)
            .map(|(_, seen)| seen.clone())
    }
}

#[async_trait]
impl BlockExecutor for Recorder {
    async fn run(&self, run: &BlockRun) -> SessionResult<()> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        let batch_id = run.execution.batch_id.clone();
        let batch = run.session.with_doc(|doc| doc.batch(&batch_id)).await?;
        let seen = batch
            .map(|batch| {
                batch
                    .items
                    .into_iter()
                    .map(|item| (item.block_id, item.status))
                    .collect()
            })
            .unwrap_or_default();
        self.runs.lock().unwrap().push((run.block.id.clone(), seen));
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&run.block.id) {
            return Err(SessionError::execution(format!("{} exploded", run.block.id)));
        }
        run.set_block_attr("output", json!("done")).await?;
        run.complete(CompletedOutcome::Success).await?;
        Ok(())
    }
}

/// Waits for an abort request, then completes as aborted
#[derive(Default)]
struct Blocking {
    started: AtomicUsize,
    aborted: AtomicUsize,
}

#[async_trait]
impl BlockExecutor for Blocking {
    async fn run(&self, run: &BlockRun) -> SessionResult<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        run.aborted().await;
        self.aborted.fetch_add(1, Ordering::SeqCst);
        run.complete(CompletedOutcome::Aborted).await?;
        Ok(())
    }

    fn is_idle(&self, _key: &SessionKey) -> bool {
        self.started.load(Ordering::SeqCst) == self.aborted.load(Ordering::SeqCst)
    }
}

fn notebook(blocks: &[&str]) -> NotebookDocument {
    let mut doc = NotebookDocument::new().unwrap();
    doc.transact(|doc| {
        for id in blocks {
            doc.append_block(&Block::new(*id, BlockKind::Python))?;
        }
        Ok(())
    })
    .unwrap();
    doc
}

async fn drained(session: &Session) -> bool {
    session
        .with_doc(|doc| doc.current_batch())
        .await
        .unwrap()
        .is_none()
}

#[tokio::test]
async fn test_failed_item_does_not_stop_batch() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let mut doc = notebook(&["b1", "b2", "b3"]);
    fixture
        .store
        .put_snapshot(&SessionKey::document(doc_id.clone()), &SnapshotRecord::new(doc.save(), 1))
        .await
        .unwrap();

    let recorder = Arc::new(Recorder::failing(&["b2"]));
    let manager = fixture.manager(ExecutionStrategies::uniform(recorder.clone())).await;
    let pinned = manager.pin(&SessionKey::document(doc_id)).await.unwrap();
    let session = pinned.session().clone();

    session
        .transact(|doc| doc.enqueue_run_all(RunAllSource::User(None)))
        .await
        .unwrap();
    let s = &session;
    assert!(eventually(|| async move { drained(s).await }).await);

    assert_eq!(recorder.run_order(), vec!["b1", "b2", "b3"]);
    let seen = recorder.observation("b3").unwrap();
    assert!(seen.contains(&("b1".into(), ItemStatus::completed(CompletedOutcome::Success))));
    assert!(seen.contains(&("b2".into(), ItemStatus::completed(CompletedOutcome::Error))));
    assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);

    let output = session.with_doc(|doc| doc.block("b3")).await.unwrap().unwrap();
    assert_eq!(output.attr("output"), Some(&json!("done")));

    drop(pinned);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_abort_request_reaches_strategy() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let mut doc = notebook(&["b1"]);
    fixture
        .store
        .put_snapshot(&SessionKey::document(doc_id.clone()), &SnapshotRecord::new(doc.save(), 1))
        .await
        .unwrap();

    let blocking = Arc::new(Blocking::default());
    let manager = fixture.manager(ExecutionStrategies::uniform(blocking.clone())).await;
    let key = SessionKey::document(doc_id);
    let pinned = manager.pin(&key).await.unwrap();
    let session = pinned.session().clone();

    let item = session
        .transact(|doc| doc.enqueue_block("b1", None, ItemMetadata::Python { is_suggestion: false }))
        .await
        .unwrap()
        .unwrap();

    let s = &session;
    let running = &item;
    assert!(
        eventually(|| async move {
            matches!(
                s.with_doc(|doc| doc.item_status(running)).await.unwrap(),
                Some(ItemStatus::Running)
            )
        })
        .await
    );
    assert!(!blocking.is_idle(&key));

    session.transact(|doc| doc.set_item_aborting(&item)).await.unwrap();
    assert!(eventually(|| async move { drained(s).await }).await);
    assert_eq!(blocking.aborted.load(Ordering::SeqCst), 1);

    drop(pinned);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_item_aborted_while_queued_never_starts() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let mut doc = notebook(&["b1", "b2"]);
    fixture
        .store
        .put_snapshot(&SessionKey::document(doc_id.clone()), &SnapshotRecord::new(doc.save(), 1))
        .await
        .unwrap();

    let blocking = Arc::new(Blocking::default());
    let manager = fixture.manager(ExecutionStrategies::uniform(blocking.clone())).await;
    let pinned = manager.pin(&SessionKey::document(doc_id)).await.unwrap();
    let session = pinned.session().clone();

    let (first, second) = session
        .transact(|doc| {
            doc.enqueue_run_all(RunAllSource::User(None))?;
            let batch = doc.current_batch()?.expect("batch");
            Ok((batch.item_ref(&batch.items[0]), batch.item_ref(&batch.items[1])))
        })
        .await
        .unwrap();

    let s = &session;
    let running = &first;
    assert!(
        eventually(|| async move {
            matches!(
                s.with_doc(|doc| doc.item_status(running)).await.unwrap(),
                Some(ItemStatus::Running)
            )
        })
        .await
    );

    // b2 is asked to stop before its turn, then b1 is aborted
    session.transact(|doc| doc.set_item_aborting(&second)).await.unwrap();
    session.transact(|doc| doc.set_item_aborting(&first)).await.unwrap();
    assert!(eventually(|| async move { drained(s).await }).await);
    assert_eq!(blocking.started.load(Ordering::SeqCst), 1);
    assert_eq!(blocking.aborted.load(Ordering::SeqCst), 1);

    drop(pinned);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_orphaned_running_item_is_aborted_without_running() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;

    // A previous executor died while running b1
    let mut doc = notebook(&["b1", "b2"]);
    doc.transact(|doc| {
        doc.enqueue_run_all(RunAllSource::User(None))?;
        let batch = doc.current_batch()?.expect("batch");
        let first = batch.item_ref(&batch.items[0]);
        doc.set_item_running(&first)?;
        Ok(())
    })
    .unwrap();
    fixture
        .store
        .put_snapshot(&SessionKey::document(doc_id.clone()), &SnapshotRecord::new(doc.save(), 1))
        .await
        .unwrap();

    let recorder = Arc::new(Recorder::default());
    let manager = fixture.manager(ExecutionStrategies::uniform(recorder.clone())).await;
    let pinned = manager.pin(&SessionKey::document(doc_id)).await.unwrap();
    let session = pinned.session().clone();

    let s = &session;
    assert!(eventually(|| async move { drained(s).await }).await);
    assert_eq!(recorder.run_order(), vec!["b2"]);
    let seen = recorder.observation("b2").unwrap();
    assert!(seen.contains(&("b1".into(), ItemStatus::completed(CompletedOutcome::Aborted))));

    drop(pinned);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_mismatched_operation_fails_item() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let mut doc = notebook(&["b1", "b2"]);
    fixture
        .store
        .put_snapshot(&SessionKey::document(doc_id.clone()), &SnapshotRecord::new(doc.save(), 1))
        .await
        .unwrap();

    let recorder = Arc::new(Recorder::default());
    let manager = fixture.manager(ExecutionStrategies::uniform(recorder.clone())).await;
    let pinned = manager.pin(&SessionKey::document(doc_id)).await.unwrap();
    let session = pinned.session().clone();

    // SQL on a python block, then a normal run of b2 in its own batch
    session
        .transact(|doc| {
            doc.enqueue_block("b1", None, ItemMetadata::Sql {
                is_suggestion: false,
                selected_code: None,
            })?;
            doc.enqueue_block("b2", None, ItemMetadata::Python { is_suggestion: false })?;
            Ok(())
        })
        .await
        .unwrap();

    let s = &session;
    assert!(eventually(|| async move { drained(s).await }).await);
    assert_eq!(recorder.run_order(), vec!["b2"]);

    drop(pinned);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_unconfigured_engine_marks_block_failed() {
    let fixture = Fixture::new();
    let doc_id = fixture.create_document("doc-1").await;
    let mut doc = notebook(&["b1"]);
    fixture
        .store
        .put_snapshot(&SessionKey::document(doc_id.clone()), &SnapshotRecord::new(doc.save(), 1))
        .await
        .unwrap();

    let manager = fixture.manager(ExecutionStrategies::default()).await;
    let pinned = manager.pin(&SessionKey::document(doc_id)).await.unwrap();
    let session = pinned.session().clone();
    session
        .transact(|doc| doc.enqueue_run_all(RunAllSource::User(None)))
        .await
        .unwrap();

    let s = &session;
    assert!(eventually(|| async move { drained(s).await }).await);
    let block = session.with_doc(|doc| doc.block("b1")).await.unwrap().unwrap();
    assert!(block.attr("error").is_some());

    drop(pinned);
    manager.shutdown().await;
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(4))]

    #[test]
    fn test_queue_runs_in_order_one_at_a_time(count in 1usize..6, failing in proptest::collection::vec(any::<bool>(), 6)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let fixture = Fixture::new();
            let doc_id = fixture.create_document("doc-1").await;
            let ids: Vec<String> = (0..count).map(|i| format!("b{i}")).collect();
            let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            let mut doc = notebook(&refs);
            fixture
                .store
                .put_snapshot(&SessionKey::document(doc_id.clone()), &SnapshotRecord::new(doc.save(), 1))
                .await
                .unwrap();

            let failing_ids: Vec<&str> = refs
                .iter()
                .zip(&failing)
                .filter(|(_, fail)| **fail)
                .map(|(id, _)| *id)
                .collect();
            let recorder = Arc::new(Recorder::failing(&failing_ids));
            let manager = fixture.manager(ExecutionStrategies::uniform(recorder.clone())).await;
            let pinned = manager.pin(&SessionKey::document(doc_id)).await.unwrap();
            let session = pinned.session().clone();
            session
                .transact(|doc| doc.enqueue_run_all(RunAllSource::User(None)))
                .await
                .unwrap();

            let s = &session;
            assert!(eventually(|| async move { drained(s).await }).await);
            assert_eq!(recorder.run_order(), ids);
            assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);

            drop(pinned);
            manager.shutdown().await;
        });
    }
}
