//! Single-threaded cooperative task scheduling.
//!
//! The producer and every data source run on one logical task runner: all
//! service callbacks execute there with no interleaving, and deferred work
//! is expressed as delayed tasks. The production implementation drains a
//! queue on a single tokio task; tests substitute a manually pumped runner.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Posting interface for the cooperative runner.
pub trait TaskRunner: Send + Sync + 'static {
    /// Enqueue `task` to run as soon as the runner is idle.
    fn post_task(&self, task: Task);

    /// Enqueue `task` to run no earlier than `delay` from now.
    fn post_delayed_task(&self, task: Task, delay: Duration);
}

/// Tokio-backed runner draining tasks on a single spawned task.
///
/// Tasks never run concurrently with each other. Delayed tasks re-enter the
/// same queue once their sleep elapses, preserving the non-interleaving
/// guarantee. Must be created inside a tokio runtime.
pub struct TokioTaskRunner {
    tx: tokio::sync::mpsc::UnboundedSender<Task>,
    cancel: CancellationToken,
}

impl TokioTaskRunner {
    /// Spawn the drain loop and return a posting handle.
    pub fn new() -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Task>();
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => {
                        debug!("task runner stopped");
                        break;
                    }
                    task = rx.recv() => {
                        match task {
                            Some(task) => task(),
                            None => break,
                        }
                    }
                }
            }
        });

        Self { tx, cancel }
    }

    /// Stop the drain loop. Pending tasks are dropped.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Default for TokioTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner for TokioTaskRunner {
    fn post_task(&self, task: Task) {
        if self.tx.send(task).is_err() {
            warn!("task runner stopped, dropping task");
        }
    }

    fn post_delayed_task(&self, task: Task, delay: Duration) {
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if tx.send(task).is_err() {
                        warn!("task runner stopped, dropping delayed task");
                    }
                }
            }
        });
    }
}
