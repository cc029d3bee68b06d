//! Per-session execution loop
//!
//! Exactly one executor across all processes works a session's queue at a
//! time, guarded by the cross-process lock `executor:{key}`. It takes the
//! first non-completed item of the head batch and:
//!
//! - enqueued or running: dispatches it to the strategy for its operation
//! - aborting or unknown: completes it as aborted without running it
//!
//! A batch whose items are all completed is dropped from the queue. Items
//! found running when the lock is acquired were left by an executor that
//! died; they become unknown and are therefore aborted. Whether their
//! external side effect really stopped is not verified.

mod events;
mod strategy;
mod supervisor;

pub use events::ExecutionEvents;
pub use strategy::{BlockExecutor, BlockRun, ExecutionStrategies, UnconfiguredExecutor};
pub use supervisor::Supervisor;

use std::sync::{Arc, Weak};

use folio_core::{CompletedOutcome, ItemStatus, SessionKey};
use folio_sync::{BatchSnapshot, Execution, ItemRef, ItemSnapshot};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::context::SessionContext;
use crate::error::SessionResult;
use crate::session::Session;

/// Supervised execution loop of one session
pub(crate) struct Executor {
    supervisor: Supervisor,
}

impl Executor {
    pub fn start(session: Weak<Session>, key: SessionKey, ctx: &Arc<SessionContext>) -> Self {
        let backoff = ctx.config.executor_restart_backoff;
        let ctx = ctx.clone();
        let name = format!("executor:{key}");
        let supervisor = Supervisor::start(name, backoff, move |stop| {
            run_loop(session.clone(), key.clone(), ctx.clone(), stop)
        });
        Self { supervisor }
    }

    pub async fn stop(self) {
        self.supervisor.stop().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Idle,
    Progressed,
}

async fn run_loop(
    session: Weak<Session>,
    key: SessionKey,
    ctx: Arc<SessionContext>,
    mut stop: watch::Receiver<bool>,
) -> SessionResult<()> {
    let lock_name = format!("executor:{key}");
    let lease = tokio::select! {
        lease = ctx.locks.acquire(&lock_name) => lease?,
        _ = stop.wait_for(|stopped| *stopped) => return Ok(()),
    };
    debug!(key = %key, "Executor acquired queue lock");

    let result = drive(&session, &ctx, &mut stop).await;
    if let Err(e) = lease.release().await {
        warn!(key = %key, error = %e, "Failed to release executor lock");
    }
    result
}

async fn drive(
    session: &Weak<Session>,
    ctx: &SessionContext,
    stop: &mut watch::Receiver<bool>,
) -> SessionResult<()> {
    let mut recovered = false;
    loop {
        if *stop.borrow() {
            return Ok(());
        }
        let Some(session) = session.upgrade() else {
            return Ok(());
        };
        if !recovered {
            recover_orphans(&session).await?;
            recovered = true;
        }
        let step = step(&session, ctx).await?;
        drop(session);

        if step == Step::Idle {
            tokio::select! {
                _ = tokio::time::sleep(ctx.config.executor_idle_poll) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Mark items another executor left running as unknown
async fn recover_orphans(session: &Session) -> SessionResult<()> {
    let Some(batch) = session.with_doc(|doc| doc.current_batch()).await? else {
        return Ok(());
    };
    let orphaned: Vec<ItemRef> = batch
        .items
        .iter()
        .filter(|item| matches!(item.status, ItemStatus::Running))
        .map(|item| batch.item_ref(item))
        .collect();
    if orphaned.is_empty() {
        return Ok(());
    }

    warn!(key = %session.key(), batch_id = %batch.id, count = orphaned.len(), "Found items left running by a previous executor");
    session
        .transact(|doc| {
            for item in &orphaned {
                doc.set_item_status(item, ItemStatus::Unknown)?;
            }
            Ok(())
        })
        .await
}

async fn step(session: &Arc<Session>, ctx: &SessionContext) -> SessionResult<Step> {
    let Some(batch) = session.with_doc(|doc| doc.current_batch()).await? else {
        return Ok(Step::Idle);
    };
    let Some(item) = batch.current().cloned() else {
        debug!(key = %session.key(), batch_id = %batch.id, items = batch.len(), "Batch finished");
        session.transact(|doc| doc.advance_queue()).await?;
        return Ok(Step::Progressed);
    };

    match item.status {
        ItemStatus::Enqueued | ItemStatus::Running => dispatch(session, ctx, &batch, item).await?,
        ItemStatus::Aborting | ItemStatus::Unknown => {
            info!(
                key = %session.key(),
                batch_id = %batch.id,
                item_id = %item.id,
                status = item.status.tag(),
                "Completing item as aborted"
            );
            complete(session, &batch.item_ref(&item), CompletedOutcome::Aborted).await?;
        }
        ItemStatus::Completed { .. } => {}
    }
    Ok(Step::Progressed)
}

async fn complete(session: &Session, item: &ItemRef, outcome: CompletedOutcome) -> SessionResult<()> {
    session
        .transact(|doc| doc.set_item_completed(item, outcome))
        .await?;
    Ok(())
}

/// Clears the session's executing flag, even if the strategy panics
struct ExecutingGuard<'a>(&'a Session);

impl<'a> ExecutingGuard<'a> {
    fn new(session: &'a Session) -> Self {
        session.set_executing(true);
        Self(session)
    }
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.set_executing(false);
    }
}

#[instrument(skip_all, fields(key = %session.key(), batch_id = %batch.id, item_id = %item.id, block_id = %item.block_id))]
async fn dispatch(
    session: &Arc<Session>,
    ctx: &SessionContext,
    batch: &BatchSnapshot,
    item: ItemSnapshot,
) -> SessionResult<()> {
    let item_ref = batch.item_ref(&item);
    let block = session.with_doc(|doc| doc.block(&item.block_id)).await?;
    let Some(block) = block else {
        warn!("Block of execution item no longer exists");
        return complete(session, &item_ref, CompletedOutcome::Error).await;
    };
    let Some(kind) = block.kind() else {
        warn!(block_type = %block.type_tag, "Block has an unknown type");
        return complete(session, &item_ref, CompletedOutcome::Error).await;
    };
    if let Some(expected) = item.metadata.expected_block_kind() {
        if expected != kind {
            warn!(block_kind = %kind, expected = %expected, "Operation does not match block kind");
            return complete(session, &item_ref, CompletedOutcome::Error).await;
        }
    }
    let Some(strategy) = ctx.strategies.for_metadata(&item.metadata).cloned() else {
        return complete(session, &item_ref, CompletedOutcome::Success).await;
    };

    match session.transact(|doc| doc.claim_item(&item_ref)).await? {
        Some(ItemStatus::Enqueued | ItemStatus::Running) => {}
        Some(ItemStatus::Aborting | ItemStatus::Unknown) => {
            info!("Abort requested before the block started");
            return complete(session, &item_ref, CompletedOutcome::Aborted).await;
        }
        Some(ItemStatus::Completed { .. }) | None => {
            debug!("Item settled before it started");
            return Ok(());
        }
    }
    let events =
        ExecutionEvents::resolve(session.key().document_id(), batch, &item, ctx.users.as_ref()).await;
    events.block_started(kind, &item.metadata);

    let (abort_tx, abort_rx) = watch::channel(false);
    let execution = Execution {
        batch_id: batch.id.clone(),
        item,
    };
    let run = BlockRun::new(session.clone(), execution, block, events, abort_rx);

    let result = {
        let _executing = ExecutingGuard::new(session);
        let fut = strategy.run(&run);
        tokio::pin!(fut);
        let mut poll = tokio::time::interval(ctx.config.executor_idle_poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = &mut fut => break result,
                _ = poll.tick() => {
                    if *abort_tx.borrow() {
                        continue;
                    }
                    let status = session.with_doc(|doc| doc.item_status(&item_ref)).await;
                    if matches!(status, Ok(Some(ItemStatus::Aborting))) {
                        info!("Abort requested, signalling strategy");
                        let _ = abort_tx.send(true);
                    }
                }
            }
        }
    };

    if let Err(e) = result {
        error!(error = %e, "Block execution failed");
        complete(session, &item_ref, CompletedOutcome::Error).await?;
    }

    let status = session.with_doc(|doc| doc.item_status(&item_ref)).await?;
    let outcome = match status {
        Some(status) if status.is_terminal() => status.complete_status(),
        Some(status) => {
            warn!(status = status.tag(), "Strategy left item without a terminal status, marking as failed");
            complete(session, &item_ref, CompletedOutcome::Error).await?;
            Some(CompletedOutcome::Error)
        }
        None => {
            debug!("Item was removed while running");
            None
        }
    };
    run.events.block_finished(kind, outcome);
    Ok(())
}
