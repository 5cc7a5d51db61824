//! Bounded pool of reusable, expensive resources (browser processes).
//!
//! At most `capacity` resources are checked out at once. Idle resources are
//! health-checked on checkout and replaced when they fail the check. A
//! [`Pooled`] handle returns its resource on drop unless it was discarded.

use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::util::lock::mutex_lock;

/// Lifecycle hooks for pooled resources.
#[async_trait]
pub trait PoolManager: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;
    type Error: std::fmt::Display + Send;

    async fn create(&self) -> Result<Self::Resource, Self::Error>;

    async fn is_healthy(&self, resource: &Self::Resource) -> bool;

    async fn destroy(&self, resource: Self::Resource);
}

#[derive(Debug, Error)]
pub enum CheckoutError<E> {
    #[error("resource pool is closed")]
    Closed,
    #[error("failed to create pooled resource: {0}")]
    Create(E),
}

struct PoolInner<M: PoolManager> {
    manager: M,
    idle: Mutex<Vec<M::Resource>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

pub struct Pool<M: PoolManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: PoolManager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: PoolManager> Pool<M> {
    pub fn new(manager: M, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                manager,
                idle: Mutex::new(Vec::with_capacity(capacity)),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn idle_len(&self) -> usize {
        mutex_lock(&self.inner.idle, "render::pool", "idle").len()
    }

    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Wait for a free slot, then hand out a healthy idle resource or create one.
    pub async fn checkout(&self) -> Result<Pooled<M>, CheckoutError<M::Error>> {
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| CheckoutError::Closed)?;

        loop {
            let candidate = mutex_lock(&self.inner.idle, "render::pool", "idle").pop();
            let Some(resource) = candidate else {
                break;
            };
            if self.inner.manager.is_healthy(&resource).await {
                return Ok(self.wrap(resource, permit));
            }
            warn!(
                target = "application::render::pool",
                op = "pool::checkout",
                result = "evicted",
                "Idle resource failed health check; replacing"
            );
            self.inner.manager.destroy(resource).await;
        }

        let resource = self
            .inner
            .manager
            .create()
            .await
            .map_err(CheckoutError::Create)?;
        debug!(
            target = "application::render::pool",
            op = "pool::checkout",
            result = "created",
            capacity = self.inner.capacity,
            "Created pooled resource"
        );
        Ok(self.wrap(resource, permit))
    }

    /// Destroy every idle resource.
    pub async fn drain(&self) {
        let idle: Vec<M::Resource> =
            std::mem::take(&mut *mutex_lock(&self.inner.idle, "render::pool", "idle"));
        for resource in idle {
            self.inner.manager.destroy(resource).await;
        }
    }

    fn wrap(&self, resource: M::Resource, permit: OwnedSemaphorePermit) -> Pooled<M> {
        Pooled {
            resource: Some(resource),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }
}

/// A checked-out resource. Returned to the pool on drop.
pub struct Pooled<M: PoolManager> {
    resource: Option<M::Resource>,
    pool: Arc<PoolInner<M>>,
    _permit: OwnedSemaphorePermit,
}

impl<M: PoolManager> Pooled<M> {
    /// Drop the resource instead of returning it, e.g. after it crashed mid-use.
    pub fn discard(mut self) {
        if let Some(resource) = self.resource.take() {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                pool.manager.destroy(resource).await;
            });
        }
    }
}

impl<M: PoolManager> Deref for Pooled<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        // Only `discard` and `drop` take the resource, and both consume the handle.
        match self.resource.as_ref() {
            Some(resource) => resource,
            None => unreachable!("pooled resource accessed after release"),
        }
    }
}

impl<M: PoolManager> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.resource.as_mut() {
            Some(resource) => resource,
            None => unreachable!("pooled resource accessed after release"),
        }
    }
}

impl<M: PoolManager> Drop for Pooled<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            mutex_lock(&self.pool.idle, "render::pool", "idle").push(resource);
        }
    }
}
