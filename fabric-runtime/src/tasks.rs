//! Tracked background tasks, joinable at shutdown.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors produced by the task registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The registry is closed and will not accept new tasks.
    #[error("task registry closed")]
    Closed,
}

struct Tracked {
    name: String,
    handle: JoinHandle<()>,
}

/// Registry of long-running tasks started by an agent.
///
/// Every background task an agent starts goes through here, so the set is
/// observable and joinable: at shutdown the runtime cancels the shared
/// token, waits up to the grace period, then aborts stragglers and reports
/// how many did not stop in time.
#[derive(Clone)]
pub struct TaskRegistry {
    tracked: Arc<Mutex<Vec<Tracked>>>,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl TaskRegistry {
    /// Creates an empty registry cancelled by `cancel`.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tracked: Arc::new(Mutex::new(Vec::new())),
            cancel,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the cancellation token background tasks must observe.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns and tracks a named background task.
    ///
    /// The future should watch [`TaskRegistry::cancellation`] and unwind at
    /// its next suspension point once cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Closed`] once shutdown has begun.
    pub async fn register<F>(&self, name: impl Into<String>, task: F) -> Result<(), TaskError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(TaskError::Closed);
        }
        let name = name.into();
        debug!(task = %name, "background task registered");
        let handle = tokio::spawn(task);
        self.tracked.lock().await.push(Tracked { name, handle });
        Ok(())
    }

    /// Returns the number of tracked tasks still running.
    pub async fn running(&self) -> usize {
        let tracked = self.tracked.lock().await;
        tracked.iter().filter(|t| !t.handle.is_finished()).count()
    }

    /// Cancels all tasks and waits up to `grace` for them to finish.
    ///
    /// Returns the number of tasks that had to be aborted because they did
    /// not observe cancellation in time.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();

        let mut tracked = std::mem::take(&mut *self.tracked.lock().await);
        let deadline = tokio::time::Instant::now() + grace;
        let mut unterminated = 0;
        for task in &mut tracked {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, &mut task.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) if join_err.is_cancelled() => {}
                Ok(Err(join_err)) => {
                    warn!(task = %task.name, error = %join_err, "background task panicked");
                }
                Err(_) => {
                    warn!(task = %task.name, "background task ignored shutdown; aborting");
                    task.handle.abort();
                    unterminated += 1;
                }
            }
        }
        unterminated
    }
}
