//! Ordered, coalesced persistence of one session
//!
//! Every update is appended to the durable log in the order it was applied.
//! Snapshots run one at a time, at most once per `persist_interval`, and only
//! when updates arrived since the previous run. A snapshot deletes the log
//! entries this worker appended, since the snapshot now contains them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use folio_storage::{Persistor, UpdateId};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::error::{SessionError, SessionResult};
use crate::session::DocState;

pub(crate) enum PersistCommand {
    Update {
        clock: u64,
        update: Vec<u8>,
        reply: oneshot::Sender<SessionResult<()>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Sender side of the persistence worker
pub(crate) struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PersistHandle {
    pub fn spawn(
        persistor: Arc<dyn Persistor>,
        state: Arc<Mutex<DocState>>,
        clock: Arc<AtomicU64>,
        byte_length: Arc<AtomicUsize>,
        interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = PersistWorker {
            persistor,
            state,
            clock,
            byte_length,
            interval,
            pending: Vec::new(),
            dirty: false,
            last_run: None,
        };
        let task = tokio::spawn(worker.run(rx));
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue `update`; the receiver resolves once it is in the durable log
    pub fn append(&self, clock: u64, update: Vec<u8>) -> oneshot::Receiver<SessionResult<()>> {
        let (reply, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(PersistCommand::Update { reply, .. })) =
            self.tx.send(PersistCommand::Update { clock, update, reply })
        {
            let _ = reply.send(Err(SessionError::closed("persistence worker")));
        }
        rx
    }

    /// Write everything queued so far, including a snapshot if one is due
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Flush, then stop the worker
    pub async fn stop(&self) {
        self.flush().await;
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

struct PersistWorker {
    persistor: Arc<dyn Persistor>,
    state: Arc<Mutex<DocState>>,
    clock: Arc<AtomicU64>,
    byte_length: Arc<AtomicUsize>,
    interval: Duration,
    /// Log entries not yet folded into a snapshot
    pending: Vec<UpdateId>,
    dirty: bool,
    last_run: Option<Instant>,
}

impl PersistWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PersistCommand>) {
        loop {
            let due = self
                .dirty
                .then(|| self.last_run.map_or_else(Instant::now, |at| at + self.interval));

            tokio::select! {
                command = rx.recv() => match command {
                    Some(PersistCommand::Update { clock, update, reply }) => {
                        let result = self.append(clock, &update).await;
                        let _ = reply.send(result);
                    }
                    Some(PersistCommand::Flush { reply }) => {
                        while let Ok(command) = rx.try_recv() {
                            self.handle_queued(command).await;
                        }
                        if self.dirty {
                            self.snapshot().await;
                        }
                        let _ = reply.send(());
                    }
                    None => {
                        if self.dirty {
                            self.snapshot().await;
                        }
                        break;
                    }
                },
                _ = sleep_until(due), if due.is_some() => {
                    self.snapshot().await;
                }
            }
        }
        debug!(key = %self.persistor.key(), "Persistence worker stopped");
    }

    async fn handle_queued(&mut self, command: PersistCommand) {
        match command {
            PersistCommand::Update { clock, update, reply } => {
                let result = self.append(clock, &update).await;
                let _ = reply.send(result);
            }
            PersistCommand::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn append(&mut self, clock: u64, update: &[u8]) -> SessionResult<()> {
        // The snapshot carries this update even if the log write fails
        self.dirty = true;
        match self.persistor.persist_update(clock, update).await {
            Ok(id) => {
                trace!(key = %self.persistor.key(), id, clock, "Update appended");
                self.pending.push(id);
                Ok(())
            }
            Err(e) => {
                error!(key = %self.persistor.key(), clock, error = %e, "Failed to append update");
                Err(e.into())
            }
        }
    }

    async fn snapshot(&mut self) {
        self.last_run = Some(Instant::now());
        let (state, clock) = {
            let mut guard = self.state.lock().await;
            (guard.doc.save(), self.clock.load(Ordering::SeqCst))
        };

        match self.persistor.persist(clock, &state, &self.pending).await {
            Ok(size) => {
                debug!(key = %self.persistor.key(), clock, size, folded = self.pending.len(), "Snapshot persisted");
                if size > 0 {
                    self.byte_length.store(size, Ordering::SeqCst);
                }
                self.pending.clear();
                self.dirty = false;
            }
            Err(e) => {
                error!(key = %self.persistor.key(), clock, error = %e, "Failed to persist snapshot, will retry");
            }
        }
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
