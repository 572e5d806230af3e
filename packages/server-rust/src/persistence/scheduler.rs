//! Drives the flush cycles of one persistence worker.
//!
//! A spawned task runs a cycle on every interval tick, whenever the backlog
//! signal fires, and on explicit requests, then one last cycle on shutdown.
//! Cycles of one worker never overlap.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::{Flush, FlushReport};
use crate::error::WorkerError;

/// Shortest tick period; a zero interval is raised to this.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

type FlushReply = oneshot::Sender<Result<FlushReport, WorkerError>>;

/// Handle on a running flush task.
pub struct FlushScheduler {
    requests: Option<mpsc::Sender<FlushReply>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FlushScheduler {
    /// Spawns the flush task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn start(persistence: Arc<dyn Flush>, backlog: Arc<Notify>, interval: Duration) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let (requests, mut request_rx) = mpsc::channel::<FlushReply>(16);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first immediate tick.
            ticks.tick().await;

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        let _ = persistence.flush().await;
                    }
                    () = backlog.notified() => {
                        debug!(role = persistence.role(), "backlog threshold reached");
                        let _ = persistence.flush().await;
                    }
                    Some(reply) = request_rx.recv() => {
                        let _ = reply.send(persistence.flush().await);
                    }
                    _ = &mut shutdown_rx => break,
                }
            }

            let _ = persistence.flush().await;
            debug!(role = persistence.role(), "flush scheduler stopped");
        });

        Self {
            requests: Some(requests),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Runs a cycle now, after any cycle already in progress.
    ///
    /// # Errors
    ///
    /// Returns the cycle's error, or [`WorkerError::WorkerStopped`] if the
    /// scheduler has been stopped.
    pub async fn flush_now(&self, role: &str) -> Result<FlushReport, WorkerError> {
        let stopped = || WorkerError::WorkerStopped {
            role: role.to_string(),
        };
        let requests = self.requests.as_ref().ok_or_else(stopped)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        requests.send(reply_tx).await.map_err(|_| stopped())?;
        reply_rx.await.map_err(|_| stopped())?
    }

    /// Stops the task after a final cycle and waits for it.
    pub async fn stop(&mut self) {
        self.requests.take();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
