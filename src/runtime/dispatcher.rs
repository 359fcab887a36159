// src/runtime/dispatcher.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::health::{HealthLevel, HealthSignal};
use super::panic_message;
use crate::error::ActivityError;
use crate::utils::prometheus_metrics::{
    DISPATCH_IN_FLIGHT, DISPATCH_REJECTED_TOTAL, DISPATCH_SLOTS_RECLAIMED_TOTAL,
};

/// Logical worker-pool domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    #[serde(rename = "io-activity-queue")]
    IoActivity,
    #[serde(rename = "cpu-activity-queue")]
    CpuActivity,
    #[serde(rename = "parsing-activity-queue")]
    ParsingActivity,
    #[serde(rename = "notify-activity-queue")]
    NotifyActivity,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::IoActivity,
        QueueName::CpuActivity,
        QueueName::ParsingActivity,
        QueueName::NotifyActivity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::IoActivity => "io-activity-queue",
            QueueName::CpuActivity => "cpu-activity-queue",
            QueueName::ParsingActivity => "parsing-activity-queue",
            QueueName::NotifyActivity => "notify-activity-queue",
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainLimits {
    /// Tasks allowed to execute at once.
    pub max_concurrency: usize,
    /// Tasks allowed to wait for a free slot before new ones are rejected.
    pub max_concurrent_polls: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{0} rejected the task: admission queue is full")]
    Rejected(QueueName),

    #[error("task on {queue} exceeded its {timeout:?} timeout")]
    TimedOut { queue: QueueName, timeout: Duration },

    #[error("task on {0} was cancelled")]
    Cancelled(QueueName),

    #[error("task on {queue} crashed: {message}")]
    Crashed { queue: QueueName, message: String },

    #[error(transparent)]
    Activity(ActivityError),
}

impl From<DispatchError> for ActivityError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Activity(inner) => inner,
            DispatchError::Crashed { message, .. } => ActivityError::WorkerCrashed(message),
            other => ActivityError::Transient(other.to_string()),
        }
    }
}

/// Point-in-time view of one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainStats {
    pub queue: QueueName,
    pub max_concurrency: usize,
    pub effective_limit: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub available_slots: usize,
    /// Slots still tied to a running task; reclaimed ones are not counted.
    pub held_leases: usize,
}

struct Lease {
    deadline: Instant,
    _permit: OwnedSemaphorePermit,
}

struct Domain {
    queue: QueueName,
    limits: DomainLimits,
    slots: Arc<Semaphore>,
    polls: Arc<Semaphore>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    throttled: AtomicUsize,
    next_lease: AtomicU64,
    leases: Mutex<HashMap<u64, Lease>>,
}

impl Domain {
    fn new(queue: QueueName, limits: DomainLimits) -> Self {
        Domain {
            queue,
            limits,
            slots: Arc::new(Semaphore::new(limits.max_concurrency.max(1))),
            polls: Arc::new(Semaphore::new(limits.max_concurrent_polls)),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            throttled: AtomicUsize::new(0),
            next_lease: AtomicU64::new(0),
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, permit: OwnedSemaphorePermit, deadline: Instant) -> u64 {
        let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut leases) = self.leases.lock() {
            leases.insert(
                id,
                Lease {
                    deadline,
                    _permit: permit,
                },
            );
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        DISPATCH_IN_FLIGHT
            .with_label_values(&[self.queue.as_str()])
            .set(now as i64);
        id
    }

    fn finish(&self, lease_id: u64) {
        if let Ok(mut leases) = self.leases.lock() {
            leases.remove(&lease_id);
        }
        let now = self.in_flight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        DISPATCH_IN_FLIGHT
            .with_label_values(&[self.queue.as_str()])
            .set(now as i64);
    }

    /// Drops expired leases along with their slots. The task keeps counting
    /// as in flight until it actually ends.
    fn reclaim_expired(&self, now: Instant) -> usize {
        let mut reclaimed = 0;
        if let Ok(mut leases) = self.leases.lock() {
            let before = leases.len();
            leases.retain(|_, lease| lease.deadline > now);
            reclaimed = before - leases.len();
        }
        if reclaimed > 0 {
            DISPATCH_SLOTS_RECLAIMED_TOTAL
                .with_label_values(&[self.queue.as_str()])
                .inc_by(reclaimed as f64);
            warn!(queue = %self.queue, reclaimed, "Reclaimed slots held past their timeout");
        }
        reclaimed
    }
}

/// Moves into the spawned task; frees the lease however the task ends.
struct InFlightGuard {
    domain: Arc<Domain>,
    lease_id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.domain.finish(self.lease_id);
    }
}

/// Separate bounded concurrency domains, one per workload class.
///
/// A submission first takes a poll permit (the waiting room). If none is
/// left the task is rejected outright. It then waits for a slot, runs on its
/// own tokio task under the caller's timeout, and gives the slot back on
/// every exit path.
pub struct WorkerPoolDispatcher {
    domains: HashMap<QueueName, Arc<Domain>>,
    reclaim_grace: Duration,
}

impl WorkerPoolDispatcher {
    pub fn new(limits: impl Fn(QueueName) -> DomainLimits, reclaim_grace: Duration) -> Self {
        let domains = QueueName::ALL
            .into_iter()
            .map(|queue| (queue, Arc::new(Domain::new(queue, limits(queue)))))
            .collect();
        WorkerPoolDispatcher {
            domains,
            reclaim_grace,
        }
    }

    fn domain(&self, queue: QueueName) -> &Arc<Domain> {
        // Every QueueName is inserted in `new`.
        &self.domains[&queue]
    }

    pub async fn submit<F, T>(
        &self,
        queue: QueueName,
        timeout: Duration,
        cancel: &CancellationToken,
        task: F,
    ) -> Result<T, DispatchError>
    where
        F: Future<Output = Result<T, ActivityError>> + Send + 'static,
        T: Send + 'static,
    {
        let domain = Arc::clone(self.domain(queue));

        let poll = match Arc::clone(&domain.polls).try_acquire_owned() {
            Ok(poll) => poll,
            Err(_) => {
                DISPATCH_REJECTED_TOTAL
                    .with_label_values(&[queue.as_str()])
                    .inc();
                debug!(%queue, "Admission queue full; rejecting task");
                return Err(DispatchError::Rejected(queue));
            }
        };

        let slot = tokio::select! {
            slot = Arc::clone(&domain.slots).acquire_owned() => {
                slot.map_err(|_| DispatchError::Rejected(queue))?
            }
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled(queue)),
        };
        drop(poll);

        let lease_id = domain.register(slot, Instant::now() + timeout + self.reclaim_grace);
        let guard = InFlightGuard {
            domain: Arc::clone(&domain),
            lease_id,
        };

        let handle = tokio::spawn(async move {
            let _guard = guard;
            task.await
        });
        let abort = handle.abort_handle();

        tokio::select! {
            joined = tokio::time::timeout(timeout, handle) => match joined {
                Err(_) => {
                    abort.abort();
                    warn!(%queue, ?timeout, "Task timed out");
                    Err(DispatchError::TimedOut { queue, timeout })
                }
                Ok(Err(join_err)) if join_err.is_panic() => {
                    let message = panic_message(join_err.into_panic().as_ref());
                    warn!(%queue, %message, "Task panicked");
                    Err(DispatchError::Crashed { queue, message })
                }
                Ok(Err(_)) => Err(DispatchError::Cancelled(queue)),
                Ok(Ok(result)) => result.map_err(DispatchError::Activity),
            },
            _ = cancel.cancelled() => {
                abort.abort();
                Err(DispatchError::Cancelled(queue))
            }
        }
    }

    /// Frees slots whose lease outlived its timeout plus grace.
    pub fn reclaim_expired(&self) -> usize {
        let now = Instant::now();
        self.domains
            .values()
            .map(|domain| domain.reclaim_expired(now))
            .sum()
    }

    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        dispatcher.reclaim_expired();
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            debug!("Dispatcher reaper stopped");
        })
    }

    /// Halves each domain's effective concurrency while the signal is critical.
    pub fn attach_health(
        &self,
        signal: watch::Receiver<HealthSignal>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.domains
            .values()
            .map(|domain| {
                tokio::spawn(throttle_domain(
                    Arc::clone(domain),
                    signal.clone(),
                    cancel.clone(),
                ))
            })
            .collect()
    }

    pub fn stats(&self, queue: QueueName) -> DomainStats {
        let domain = self.domain(queue);
        let max_concurrency = domain.limits.max_concurrency.max(1);
        DomainStats {
            queue,
            max_concurrency,
            effective_limit: max_concurrency - domain.throttled.load(Ordering::SeqCst),
            in_flight: domain.in_flight.load(Ordering::SeqCst),
            peak_in_flight: domain.peak_in_flight.load(Ordering::SeqCst),
            available_slots: domain.slots.available_permits(),
            held_leases: domain.leases.lock().map(|leases| leases.len()).unwrap_or(0),
        }
    }
}

async fn throttle_domain(
    domain: Arc<Domain>,
    mut signal: watch::Receiver<HealthSignal>,
    cancel: CancellationToken,
) {
    let limit = domain.limits.max_concurrency.max(1);
    let reduce = limit - (limit / 2).max(1);
    let mut held: Option<OwnedSemaphorePermit> = None;

    loop {
        let level = signal.borrow_and_update().level;
        if level == HealthLevel::Critical && held.is_none() && reduce > 0 {
            // Parks `reduce` slots as running tasks finish.
            tokio::select! {
                permits = Arc::clone(&domain.slots).acquire_many_owned(reduce as u32) => {
                    if let Ok(permits) = permits {
                        held = Some(permits);
                        domain.throttled.store(reduce, Ordering::SeqCst);
                        info!(queue = %domain.queue, effective = limit - reduce, "Throttling domain");
                    }
                }
                changed = signal.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = cancel.cancelled() => break,
            }
        } else if level != HealthLevel::Critical && held.is_some() {
            held = None;
            domain.throttled.store(0, Ordering::SeqCst);
            info!(queue = %domain.queue, "Domain throttle lifted");
        }

        tokio::select! {
            changed = signal.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    drop(held);
    domain.throttled.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_serialize_to_wire_identifiers() {
        for queue in QueueName::ALL {
            assert_eq!(
                serde_json::to_string(&queue).unwrap(),
                format!("\"{}\"", queue.as_str())
            );
        }
    }

    #[test]
    fn dispatch_errors_classify_as_activity_errors() {
        let err: ActivityError = DispatchError::Rejected(QueueName::CpuActivity).into();
        assert!(err.is_retryable());

        let err: ActivityError = DispatchError::Crashed {
            queue: QueueName::CpuActivity,
            message: "boom".into(),
        }
        .into();
        assert_eq!(err, ActivityError::WorkerCrashed("boom".into()));
    }
}
