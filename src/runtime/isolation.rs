// src/runtime/isolation.rs

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::panic_message;
use crate::error::ActivityError;
use crate::utils::prometheus_metrics::ISOLATED_WORKER_CRASHES_TOTAL;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IsolationError {
    #[error("no isolated worker became available within {0:?}")]
    Exhausted(Duration),

    #[error("isolated work exceeded its {0:?} deadline")]
    TimedOut(Duration),

    #[error("isolated worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("isolated work was cancelled")]
    Cancelled,

    #[error(transparent)]
    Failed(ActivityError),
}

impl From<IsolationError> for ActivityError {
    fn from(err: IsolationError) -> Self {
        match err {
            IsolationError::Failed(inner) => inner,
            IsolationError::WorkerCrashed(msg) => ActivityError::WorkerCrashed(msg),
            other => ActivityError::Transient(other.to_string()),
        }
    }
}

struct IsolatedWorker {
    id: usize,
    sender: mpsc::Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

impl IsolatedWorker {
    fn spawn(id: usize) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name(format!("isolated-worker-{}", id))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })?;
        Ok(IsolatedWorker {
            id,
            sender,
            handle: Some(handle),
        })
    }
}

struct ExecutorShared {
    size: usize,
    idle: Mutex<Vec<IsolatedWorker>>,
    permits: Arc<Semaphore>,
    next_id: AtomicUsize,
    replaced: AtomicUsize,
}

impl ExecutorShared {
    fn checkout(&self) -> Result<IsolatedWorker, IsolationError> {
        let worker = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        match worker {
            Some(worker) => Ok(worker),
            // A replacement could not be spawned earlier; try again now.
            None => IsolatedWorker::spawn(self.next_id.fetch_add(1, Ordering::Relaxed))
                .map_err(|e| IsolationError::WorkerCrashed(format!("cannot spawn worker: {}", e))),
        }
    }

    fn give_back(&self, worker: IsolatedWorker) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(worker);
        }
    }

    /// Detaches a worker whose state can no longer be trusted and spawns a fresh one.
    fn replace(&self, worker: IsolatedWorker) {
        // Dropping the sender lets the old thread exit once its current job returns.
        drop(worker.sender);
        self.replaced.fetch_add(1, Ordering::Relaxed);
        ISOLATED_WORKER_CRASHES_TOTAL.inc();
        match IsolatedWorker::spawn(self.next_id.fetch_add(1, Ordering::Relaxed)) {
            Ok(fresh) => {
                debug!(old = worker.id, new = fresh.id, "Replaced isolated worker");
                self.give_back(fresh);
            }
            Err(e) => error!(error = %e, "Failed to spawn replacement isolated worker"),
        }
    }
}

/// Returns the worker to the pool, or replaces it, when a call finishes.
struct WorkerLease {
    worker: Option<IsolatedWorker>,
    healthy: bool,
    shared: Arc<ExecutorShared>,
    permit: Option<OwnedSemaphorePermit>,
    // Closes once the job has returned (or its thread died).
    finished: Option<oneshot::Receiver<()>>,
}

impl WorkerLease {
    fn dispatch(&mut self, job: Job) -> bool {
        match &self.worker {
            Some(worker) => worker.sender.send(job).is_ok(),
            None => false,
        }
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            if self.healthy {
                self.shared.give_back(worker);
            } else {
                self.shared.replace(worker);
            }
        }
        // An abandoned job keeps its slot until it returns, so no more than
        // `size` jobs ever run at once.
        let permit = self.permit.take();
        let finished = self.finished.take();
        if let (false, Some(permit), Some(finished)) = (self.healthy, permit, finished) {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        let _ = finished.await;
                        drop(permit);
                    });
                }
                Err(_) => drop(permit),
            }
        }
    }
}

/// Fixed-size pool of dedicated OS threads for CPU-bound work.
///
/// Each call moves its closure (and everything it captures) onto one worker,
/// so the caller shares no mutable memory with the job. The tokio scheduler
/// only awaits a oneshot channel and is never blocked by the work itself.
/// A worker that panics, overruns its deadline or is cancelled is detached
/// and replaced; any late result it produces is discarded. A thread cannot be
/// stopped from outside, so an abandoned job keeps its slot until it returns.
#[derive(Clone)]
pub struct IsolatedExecutor {
    shared: Arc<ExecutorShared>,
}

impl IsolatedExecutor {
    /// Spawns `size` workers up front.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            workers.push(IsolatedWorker::spawn(id)?);
        }
        debug!(size, "Isolated executor started");
        Ok(IsolatedExecutor {
            shared: Arc::new(ExecutorShared {
                size,
                idle: Mutex::new(workers),
                permits: Arc::new(Semaphore::new(size)),
                next_id: AtomicUsize::new(size),
                replaced: AtomicUsize::new(0),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn available_workers(&self) -> usize {
        self.shared.permits.available_permits()
    }

    /// Number of workers replaced after a crash, timeout or cancellation.
    pub fn replaced_workers(&self) -> usize {
        self.shared.replaced.load(Ordering::Relaxed)
    }

    /// Runs `job` on an isolated worker.
    ///
    /// `timeout` covers both waiting for a free worker and running the job.
    pub async fn run<F, T>(
        &self,
        job: F,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, IsolationError>
    where
        F: FnOnce() -> Result<T, ActivityError> + Send + 'static,
        T: Send + 'static,
    {
        let deadline = tokio::time::Instant::now() + timeout;

        let permit = tokio::select! {
            acquired = tokio::time::timeout_at(deadline, Arc::clone(&self.shared.permits).acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => permit,
                    _ => {
                        warn!(?timeout, "Isolated executor exhausted");
                        return Err(IsolationError::Exhausted(timeout));
                    }
                }
            }
            _ = cancel.cancelled() => return Err(IsolationError::Cancelled),
        };

        let worker = self.shared.checkout()?;
        let (finished_tx, finished_rx) = oneshot::channel::<()>();
        let mut lease = WorkerLease {
            worker: Some(worker),
            healthy: false,
            shared: Arc::clone(&self.shared),
            permit: Some(permit),
            finished: Some(finished_rx),
        };

        let (tx, mut rx) = oneshot::channel();
        let wrapped: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(job));
            // The caller may have given up already; nothing to do then.
            let _ = tx.send(outcome);
            drop(finished_tx);
        });
        if !lease.dispatch(wrapped) {
            return Err(IsolationError::WorkerCrashed(
                "worker thread is no longer running".to_string(),
            ));
        }

        let received = tokio::select! {
            received = tokio::time::timeout_at(deadline, &mut rx) => Some(received),
            _ = cancel.cancelled() => None,
        };

        match received {
            None => {
                debug!("Cancelling isolated job; worker will be replaced");
                Err(IsolationError::Cancelled)
            }
            Some(Err(_)) => {
                warn!(?timeout, "Isolated job overran its deadline; worker will be replaced");
                Err(IsolationError::TimedOut(timeout))
            }
            Some(Ok(Err(_))) => Err(IsolationError::WorkerCrashed(
                "worker exited without reporting a result".to_string(),
            )),
            Some(Ok(Ok(Err(panic)))) => {
                let message = panic_message(panic.as_ref());
                error!(%message, "Isolated worker crashed");
                Err(IsolationError::WorkerCrashed(message))
            }
            Some(Ok(Ok(Ok(result)))) => {
                lease.healthy = true;
                result.map_err(IsolationError::Failed)
            }
        }
    }

    /// Stops idle workers and waits for their threads to exit.
    pub fn shutdown(&self) {
        let workers: Vec<IsolatedWorker> = self
            .shared
            .idle
            .lock()
            .map(|mut idle| idle.drain(..).collect())
            .unwrap_or_default();
        for mut worker in workers {
            let handle = worker.handle.take();
            drop(worker);
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    warn!("Isolated worker thread panicked during shutdown");
                }
            }
        }
        debug!("Isolated executor shut down");
    }
}
