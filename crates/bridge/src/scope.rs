use std::future::Future;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Every task the engine runs for its calls, on the worker pool.
///
/// Cancelling the scope cancels every call token derived from it. Nothing is spawned outside a
/// scope, so stopping the engine can wait for all of it.
#[derive(Debug, Clone)]
pub struct WorkerScope {
    handle: Handle,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl WorkerScope {
    pub fn new(handle: Handle) -> Self {
        Self { handle, tracker: TaskTracker::new(), token: CancellationToken::new() }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// A token cancelled with the scope, or on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn_on(task, &self.handle)
    }

    pub fn spawn_blocking<F, T>(&self, task: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.tracker.spawn_blocking_on(task, &self.handle)
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Cancels the scope and waits up to `grace` for its tasks. Returns whether they all finished.
    ///
    /// Blocks the current thread, must not be called from async code.
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.token.cancel();
        self.tracker.close();

        let tracker = self.tracker.clone();
        let finished = self.handle.block_on(async move { tokio::time::timeout(grace, tracker.wait()).await.is_ok() });
        if finished {
            debug!("worker scope drained");
        } else {
            warn!(remaining = self.tracker.len(), ?grace, "worker scope not drained within grace period");
        }
        finished
    }
}
