// src/runtime/resource_pool.rs

use async_trait::async_trait;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{ActivityError, PipelineError};
use crate::utils::prometheus_metrics::{
    RESOURCE_POOL_EXHAUSTED_TOTAL, RESOURCE_POOL_STALE_DISCARDED_TOTAL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Stale,
}

/// Knows how to build and probe one kind of external-resource handle.
#[async_trait]
pub trait ResourceManager: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    async fn create(&self) -> Result<Self::Resource, ActivityError>;

    async fn check_health(&self, resource: &Self::Resource) -> Health;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("resource pool '{pool}' exhausted after waiting {waited:?}")]
    ResourceExhausted { pool: String, waited: Duration },

    #[error("resource pool '{pool}' could not create a handle: {reason}")]
    Create { pool: String, reason: ActivityError },
}

impl From<PoolError> for ActivityError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::ResourceExhausted { .. } => ActivityError::Transient(err.to_string()),
            PoolError::Create { reason, .. } => reason,
        }
    }
}

impl From<PoolError> for PipelineError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::ResourceExhausted { pool, waited } => PipelineError::ResourceExhausted {
                pool,
                waited_ms: waited.as_millis() as u64,
            },
            PoolError::Create { pool, reason } => {
                PipelineError::Repository(format!("pool '{}': {}", pool, reason))
            }
        }
    }
}

struct IdleResource<R> {
    resource: R,
    last_used: Instant,
}

struct PoolShared<M: ResourceManager> {
    name: String,
    manager: M,
    size: usize,
    max_idle: Option<Duration>,
    idle: Mutex<VecDeque<IdleResource<M::Resource>>>,
    permits: Arc<Semaphore>,
}

impl<M: ResourceManager> PoolShared<M> {
    fn pop_idle(&self) -> Option<IdleResource<M::Resource>> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop_back())
    }

    fn push_idle(&self, resource: M::Resource) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.size {
                idle.push_back(IdleResource {
                    resource,
                    last_used: Instant::now(),
                });
            }
        }
    }

    fn idle_len(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

/// Snapshot of how a pool's handles are distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub size: usize,
    pub idle: usize,
    pub outstanding: usize,
}

/// Fixed-size pool of reusable handles.
///
/// At most `size` handles are ever borrowed at once. Idle handles are probed
/// on the way out; a stale one is dropped and a fresh one is built in its
/// place, so the pool refills lazily instead of in the background.
pub struct ResourcePool<M: ResourceManager> {
    shared: Arc<PoolShared<M>>,
}

impl<M: ResourceManager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        ResourcePool {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ResourceManager> ResourcePool<M> {
    pub fn new(name: impl Into<String>, manager: M, size: usize, max_idle: Option<Duration>) -> Self {
        let size = size.max(1);
        ResourcePool {
            shared: Arc::new(PoolShared {
                name: name.into(),
                manager,
                size,
                max_idle,
                idle: Mutex::new(VecDeque::with_capacity(size)),
                permits: Arc::new(Semaphore::new(size)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Pre-creates handles until the idle set is full.
    pub async fn warm(&self) -> Result<usize, PoolError> {
        let mut created = 0;
        while self.shared.idle_len() < self.shared.size {
            let resource = self
                .shared
                .manager
                .create()
                .await
                .map_err(|reason| PoolError::Create {
                    pool: self.shared.name.clone(),
                    reason,
                })?;
            self.shared.push_idle(resource);
            created += 1;
        }
        debug!(pool = %self.shared.name, created, "Warmed resource pool");
        Ok(created)
    }

    /// Borrows a healthy handle.
    ///
    /// `timeout` bounds the whole checkout: waiting for a free slot, health-checking
    /// idle handles and creating a new one.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledResource<M>, PoolError> {
        match tokio::time::timeout(timeout, self.checkout()).await {
            Ok(checked_out) => checked_out,
            Err(_) => {
                RESOURCE_POOL_EXHAUSTED_TOTAL
                    .with_label_values(&[self.shared.name.as_str()])
                    .inc();
                warn!(pool = %self.shared.name, ?timeout, "Resource pool exhausted");
                Err(PoolError::ResourceExhausted {
                    pool: self.shared.name.clone(),
                    waited: timeout,
                })
            }
        }
    }

    async fn checkout(&self) -> Result<PooledResource<M>, PoolError> {
        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::ResourceExhausted {
                pool: self.shared.name.clone(),
                waited: Duration::ZERO,
            })?;

        loop {
            let candidate = self.shared.pop_idle();
            match candidate {
                Some(idle) => {
                    let expired = self
                        .shared
                        .max_idle
                        .map(|max| idle.last_used.elapsed() > max)
                        .unwrap_or(false);
                    if expired
                        || self.shared.manager.check_health(&idle.resource).await == Health::Stale
                    {
                        RESOURCE_POOL_STALE_DISCARDED_TOTAL
                            .with_label_values(&[self.shared.name.as_str()])
                            .inc();
                        debug!(pool = %self.shared.name, expired, "Discarding stale pooled handle");
                        continue;
                    }
                    return Ok(PooledResource {
                        resource: Some(idle.resource),
                        last_used: idle.last_used,
                        discard: false,
                        shared: Arc::clone(&self.shared),
                        _permit: permit,
                    });
                }
                None => {
                    let resource =
                        self.shared
                            .manager
                            .create()
                            .await
                            .map_err(|reason| PoolError::Create {
                                pool: self.shared.name.clone(),
                                reason,
                            })?;
                    return Ok(PooledResource {
                        resource: Some(resource),
                        last_used: Instant::now(),
                        discard: false,
                        shared: Arc::clone(&self.shared),
                        _permit: permit,
                    });
                }
            }
        }
    }

    /// Returns a handle to the pool. Dropping the handle does the same.
    pub fn release(&self, handle: PooledResource<M>) {
        drop(handle);
    }

    pub async fn check_health(&self, handle: &PooledResource<M>) -> Health {
        match handle.resource.as_ref() {
            Some(resource) => self.shared.manager.check_health(resource).await,
            None => Health::Stale,
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.shared.size,
            idle: self.shared.idle_len(),
            outstanding: self.shared.size - self.shared.permits.available_permits(),
        }
    }
}

/// A borrowed handle. Goes back to the idle set when dropped unless it was
/// marked stale.
pub struct PooledResource<M: ResourceManager> {
    resource: Option<M::Resource>,
    last_used: Instant,
    discard: bool,
    shared: Arc<PoolShared<M>>,
    // Dropped after the handle is back in the idle set.
    _permit: OwnedSemaphorePermit,
}

impl<M: ResourceManager> PooledResource<M> {
    /// When this handle was last returned to the pool.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Keeps the handle out of the pool once it is released.
    pub fn mark_stale(&mut self) {
        self.discard = true;
    }
}

impl<M: ResourceManager> Deref for PooledResource<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource
            .as_ref()
            .expect("pooled resource accessed after release")
    }
}

impl<M: ResourceManager> DerefMut for PooledResource<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource
            .as_mut()
            .expect("pooled resource accessed after release")
    }
}

impl<M: ResourceManager> Drop for PooledResource<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            if !self.discard {
                self.shared.push_idle(resource);
            }
        }
    }
}
