//! # Fair Counting Semaphore
//!
//! A named, instrumented wrapper around `tokio::sync::Semaphore`. Waiters are
//! served strictly in arrival order, and every permit is an RAII guard, so
//! `available_permits() + held_permits() == capacity()` holds on every exit
//! path, including cancellation of a pending `acquire()`.
//!
//! Priority is never expressed by reordering one semaphore's queue; callers
//! that need tiers use one semaphore per tier.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SemaphoreError {
    #[error("Semaphore {name} is closed")]
    Closed { name: String },

    #[error("No permits available on {name}")]
    NoPermits { name: String },
}

#[derive(Debug)]
struct SemaphoreInner {
    name: String,
    capacity: usize,
    permits: Arc<tokio::sync::Semaphore>,
    waiting: AtomicUsize,
    total_acquired: AtomicU64,
}

/// Cloneable handle to a shared semaphore
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                name: name.into(),
                capacity,
                permits: Arc::new(tokio::sync::Semaphore::new(capacity)),
                waiting: AtomicUsize::new(0),
                total_acquired: AtomicU64::new(0),
            }),
        }
    }

    /// Wait for a permit. Suspends the calling task with no timeout.
    pub async fn acquire(&self) -> Result<SemaphorePermit, SemaphoreError> {
        let _waiting = WaitingGuard::new(&self.inner.waiting);

        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SemaphoreError::Closed {
                name: self.inner.name.clone(),
            })?;

        Ok(self.wrap(permit))
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(&self) -> Result<SemaphorePermit, SemaphoreError> {
        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(self.wrap(permit)),
            Err(tokio::sync::TryAcquireError::Closed) => Err(SemaphoreError::Closed {
                name: self.inner.name.clone(),
            }),
            Err(tokio::sync::TryAcquireError::NoPermits) => Err(SemaphoreError::NoPermits {
                name: self.inner.name.clone(),
            }),
        }
    }

    fn wrap(&self, permit: OwnedSemaphorePermit) -> SemaphorePermit {
        self.inner.total_acquired.fetch_add(1, Ordering::Relaxed);
        SemaphorePermit {
            permit: Some(permit),
            name: self.inner.name.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Permits currently checked out
    pub fn held_permits(&self) -> usize {
        self.inner.capacity.saturating_sub(self.available_permits())
    }

    /// Tasks suspended in `acquire()`
    pub fn waiting(&self) -> usize {
        self.inner.waiting.load(Ordering::Acquire)
    }

    pub fn total_acquired(&self) -> u64 {
        self.inner.total_acquired.load(Ordering::Relaxed)
    }

    /// Fraction of capacity in use, in [0, 1]
    pub fn utilization(&self) -> f64 {
        if self.inner.capacity == 0 {
            return 1.0;
        }
        self.held_permits() as f64 / self.inner.capacity as f64
    }

    /// Reject all current and future waiters
    pub fn close(&self) {
        debug!(semaphore = %self.inner.name, "Semaphore closed");
        self.inner.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }
}

/// A checked-out permit; returned to the semaphore exactly once
#[derive(Debug)]
pub struct SemaphorePermit {
    permit: Option<OwnedSemaphorePermit>,
    name: String,
}

impl SemaphorePermit {
    /// Return the permit now, waking the longest waiter
    pub fn release(mut self) {
        self.permit.take();
    }

    pub fn semaphore_name(&self) -> &str {
        &self.name
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        // Dropping the owned permit hands it back to tokio's FIFO queue
        self.permit.take();
    }
}

struct WaitingGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
