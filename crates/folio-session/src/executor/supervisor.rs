//! Restart-on-failure ownership of a long-running task

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::SessionResult;

/// Runs a task body until stopped, restarting it after a failure
///
/// The body receives a stop signal and should return `Ok(())` once it flips
/// to `true`. An error or a panic is logged and the body is started again
/// after `backoff` plus up to half of it in jitter. A body that returns `Ok(())` on its own ends supervision.
pub struct Supervisor {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Supervisor {
    pub fn start<F, Fut>(name: impl Into<String>, backoff: Duration, mut body: F) -> Self
    where
        F: FnMut(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = SessionResult<()>> + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut stop = stop_rx;
            let mut restarts: u64 = 0;
            loop {
                if *stop.borrow() {
                    break;
                }
                match tokio::spawn(body(stop.clone())).await {
                    Ok(Ok(())) => break,
                    Ok(Err(e)) => error!(task = %task_name, restarts, error = %e, "Supervised task failed"),
                    Err(e) => error!(task = %task_name, restarts, error = %e, "Supervised task panicked"),
                }
                restarts += 1;
                tokio::select! {
                    _ = tokio::time::sleep(jittered(backoff)) => {}
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(task = %task_name, "Supervisor exited");
        });

        Self {
            name,
            stop_tx,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the body to stop and wait for it
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.handle.await {
            error!(task = %self.name, error = %e, "Supervisor did not exit cleanly");
        }
    }
}

fn jittered(backoff: Duration) -> Duration {
    let spread = backoff.as_millis() as u64 / 2;
    if spread == 0 {
        return backoff;
    }
    backoff + Duration::from_millis(rand::rng().random_range(0..=spread))
}
