//! # Execution Pool Management
//!
//! Each pool owns one fair semaphore sized to its tier's `max_concurrency`,
//! along with the tier's wall-clock timeout and retry budget. A job must hold
//! a partition slot before it waits here, so scarce pool permits are never
//! held while partition selection is still pending.

use crate::concurrency::{Semaphore, SemaphoreError, SemaphorePermit};
use crate::config::{PoolConfig, PoolsConfig};
use crate::models::Priority;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug)]
pub struct ExecutionPool {
    tier: Priority,
    semaphore: Semaphore,
    base_timeout: Duration,
    retry_count: u32,
    timeout_multiplier: RwLock<f64>,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

impl ExecutionPool {
    pub fn new(tier: Priority, config: &PoolConfig) -> Self {
        debug!(
            "🏊 POOL: Creating {} pool (max_concurrency: {}, timeout: {}s, retries: {})",
            tier, config.max_concurrency, config.timeout_secs, config.retry_count
        );

        Self {
            tier,
            semaphore: Semaphore::new(format!("pool-{tier}"), config.max_concurrency),
            base_timeout: config.timeout(),
            retry_count: config.retry_count,
            timeout_multiplier: RwLock::new(1.0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    pub fn tier(&self) -> Priority {
        self.tier
    }

    /// Suspend until a permit frees. No timeout is applied here; the job's
    /// wall-clock budget starts once execution begins.
    pub async fn acquire(&self) -> Result<SemaphorePermit, SemaphoreError> {
        self.semaphore.acquire().await
    }

    /// Base timeout scaled by the current backpressure multiplier
    pub fn effective_timeout(&self) -> Duration {
        self.base_timeout.mul_f64(*self.timeout_multiplier.read())
    }

    pub fn base_timeout(&self) -> Duration {
        self.base_timeout
    }

    pub fn set_timeout_multiplier(&self, multiplier: f64) {
        *self.timeout_multiplier.write() = multiplier.max(1.0);
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_concurrency(&self) -> usize {
        self.semaphore.capacity()
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn held_permits(&self) -> usize {
        self.semaphore.held_permits()
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            tier: self.tier,
            max_concurrency: self.semaphore.capacity(),
            in_use: self.semaphore.held_permits(),
            available: self.semaphore.available_permits(),
            queue_depth: self.semaphore.waiting(),
            effective_timeout_ms: self.effective_timeout().as_millis() as u64,
            retry_count: self.retry_count,
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

/// The four priority tiers
#[derive(Debug)]
pub struct ExecutionPools {
    critical: ExecutionPool,
    high: ExecutionPool,
    normal: ExecutionPool,
    low: ExecutionPool,
}

impl ExecutionPools {
    pub fn new(config: &PoolsConfig) -> Self {
        let pools = Self {
            critical: ExecutionPool::new(Priority::Critical, &config.critical),
            high: ExecutionPool::new(Priority::High, &config.high),
            normal: ExecutionPool::new(Priority::Normal, &config.normal),
            low: ExecutionPool::new(Priority::Low, &config.low),
        };
        info!(
            "✅ POOL: Execution pools ready (critical: {}, high: {}, normal: {}, low: {})",
            config.critical.max_concurrency,
            config.high.max_concurrency,
            config.normal.max_concurrency,
            config.low.max_concurrency
        );
        pools
    }

    pub fn pool(&self, priority: Priority) -> &ExecutionPool {
        match priority {
            Priority::Critical => &self.critical,
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExecutionPool> {
        [&self.critical, &self.high, &self.normal, &self.low].into_iter()
    }

    pub fn set_timeout_multiplier(&self, multiplier: f64) {
        for pool in self.iter() {
            pool.set_timeout_multiplier(multiplier);
        }
    }

    pub fn close(&self) {
        for pool in self.iter() {
            pool.close();
        }
    }

    pub fn statuses(&self) -> Vec<PoolStatus> {
        self.iter().map(ExecutionPool::status).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub tier: Priority,
    pub max_concurrency: usize,
    pub in_use: usize,
    pub available: usize,
    pub queue_depth: usize,
    pub effective_timeout_ms: u64,
    pub retry_count: u32,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}
