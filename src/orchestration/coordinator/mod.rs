//! # Concurrency Coordinator
//!
//! Issues per-job distributed locks and owns the global backpressure valve.
//!
//! ## Key Components
//!
//! - [`LockManager`] - one live lock per key, token-checked release
//! - [`BackpressureController`] - acceptance-rate throttling and priority weights

pub mod backpressure;
pub mod locks;

pub use backpressure::{BackpressureController, PriorityWeights};
pub use locks::{DistributedLock, LockGuard, LockManager, LockOptions};

use crate::config::BackpressureConfig;
use crate::error::EngineResult;
use crate::models::Priority;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub struct ConcurrencyCoordinator {
    locks: Arc<LockManager>,
    backpressure: BackpressureController,
}

impl ConcurrencyCoordinator {
    pub fn new(backpressure: BackpressureConfig) -> Self {
        Self {
            locks: Arc::new(LockManager::new()),
            backpressure: BackpressureController::new(backpressure),
        }
    }

    pub fn acquire_distributed_lock(
        &self,
        key: &str,
        options: LockOptions,
    ) -> EngineResult<DistributedLock> {
        self.locks.acquire(key, options)
    }

    /// Acquire a lock wrapped in a guard that releases it on every exit path
    pub fn lock_guard(&self, key: &str, options: LockOptions) -> EngineResult<LockGuard> {
        let lock = self.locks.acquire(key, options)?;
        Ok(LockGuard::new(Arc::clone(&self.locks), lock))
    }

    pub fn release_distributed_lock(&self, lock: &DistributedLock) -> bool {
        self.locks.release(lock)
    }

    pub fn extend_lock(&self, lock: &mut DistributedLock, ttl: Duration) -> bool {
        self.locks.extend(lock, ttl)
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks.is_locked(key)
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn set_acceptance_rate(&self, rate: f64) {
        self.backpressure.set_acceptance_rate(rate);
    }

    pub fn adjust_priority_weights(&self, adjustments: &HashMap<Priority, f64>) {
        self.backpressure.adjust_priority_weights(adjustments);
    }

    pub fn should_accept(&self, priority: Priority) -> bool {
        self.backpressure.should_accept(priority)
    }

    pub fn backpressure(&self) -> &BackpressureController {
        &self.backpressure
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            acceptance_rate: self.backpressure.acceptance_rate(),
            backpressure_active: self.backpressure.is_active(),
            weights: self.backpressure.weights(),
            active_locks: self.locks.active_locks(),
            locks_acquired: self.locks.total_acquired(),
            lock_contentions: self.locks.total_contended(),
            admissions_accepted: self.backpressure.accepted(),
            admissions_rejected: self.backpressure.rejected(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorStatus {
    pub acceptance_rate: f64,
    pub backpressure_active: bool,
    pub weights: PriorityWeights,
    pub active_locks: usize,
    pub locks_acquired: u64,
    pub lock_contentions: u64,
    pub admissions_accepted: u64,
    pub admissions_rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_guard_through_coordinator() {
        let coordinator = ConcurrencyCoordinator::new(BackpressureConfig::default());
        let guard = coordinator
            .lock_guard("job", LockOptions::new(Duration::from_secs(30)))
            .unwrap();
        assert!(coordinator.lock_guard("job", LockOptions::new(Duration::from_secs(30))).is_err());
        assert_eq!(coordinator.status().active_locks, 1);

        drop(guard);
        assert!(!coordinator.is_locked("job"));
        assert_eq!(coordinator.status().lock_contentions, 1);
    }

    #[tokio::test]
    async fn test_acquire_and_release_distributed_lock() {
        let coordinator = ConcurrencyCoordinator::new(BackpressureConfig::default());
        let lock = coordinator
            .acquire_distributed_lock(
                "campaign-7",
                LockOptions::new(Duration::from_secs(30))
                    .with_partition(3)
                    .with_priority(Priority::High),
            )
            .unwrap();
        assert_eq!(lock.owner_partition, Some(3));
        assert!(coordinator.is_locked("campaign-7"));

        let contended = coordinator
            .acquire_distributed_lock("campaign-7", LockOptions::new(Duration::from_secs(30)));
        match contended {
            Err(crate::error::EngineError::LockContention {
                owner_partition, ..
            }) => assert_eq!(owner_partition, Some(3)),
            other => panic!("expected contention, got {other:?}"),
        }

        assert!(coordinator.release_distributed_lock(&lock));
        assert!(!coordinator.is_locked("campaign-7"));
        // Second release of the same acquisition is a no-op
        assert!(!coordinator.release_distributed_lock(&lock));

        let status = coordinator.status();
        assert_eq!(status.locks_acquired, 1);
        assert_eq!(status.lock_contentions, 1);
        assert_eq!(status.active_locks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_handle_cannot_release_newer_lock() {
        let coordinator = ConcurrencyCoordinator::new(BackpressureConfig::default());
        let stale = coordinator
            .acquire_distributed_lock("job", LockOptions::new(Duration::from_millis(100)))
            .unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        let mut current = coordinator
            .acquire_distributed_lock("job", LockOptions::new(Duration::from_secs(5)))
            .unwrap();
        assert_ne!(stale.token, current.token);

        assert!(!coordinator.release_distributed_lock(&stale));
        assert!(coordinator.is_locked("job"));

        assert!(coordinator.extend_lock(&mut current, Duration::from_secs(60)));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(coordinator.is_locked("job"));
        assert!(coordinator.release_distributed_lock(&current));
    }
}
