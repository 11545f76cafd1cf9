//! # Resource Partition
//!
//! An isolated slice of execution capacity. Everything a partition owns is
//! exclusive to it: its active-job set, its connection and worker pools, its
//! result cache, and its circuit breaker. Partitions are created at engine
//! startup and are never destroyed, only marked unhealthy.

use crate::concurrency::{Semaphore, SemaphoreError, SemaphorePermit};
use crate::config::PartitionConfig;
use crate::models::{JobId, PartitionId};
use crate::partition::PartitionMetrics;
use crate::resilience::{Admission, CircuitBreaker, CircuitState};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ResourcePartition {
    id: PartitionId,
    max_capacity: usize,
    active_jobs: Mutex<HashSet<JobId>>,
    breaker: CircuitBreaker,
    metrics: Mutex<PartitionMetrics>,
    connections: Semaphore,
    workers: Semaphore,
    cache: DashMap<String, Value>,
    cache_capacity: usize,
    healthy: AtomicBool,
    /// Jobs this partition has been asked to shed by rebalancing
    shed_budget: AtomicUsize,
}

impl ResourcePartition {
    pub fn new(id: PartitionId, config: &PartitionConfig) -> Self {
        Self {
            id,
            max_capacity: config.max_capacity,
            active_jobs: Mutex::new(HashSet::with_capacity(config.max_capacity)),
            breaker: CircuitBreaker::new(
                format!("partition-{id}"),
                config.circuit_breaker.clone(),
            ),
            metrics: Mutex::new(PartitionMetrics::new(config.metrics_window)),
            connections: Semaphore::new(
                format!("partition-{id}-connections"),
                config.connection_pool_size,
            ),
            workers: Semaphore::new(format!("partition-{id}-workers"), config.worker_pool_size),
            cache: DashMap::new(),
            cache_capacity: config.cache_capacity,
            healthy: AtomicBool::new(true),
            shed_budget: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Reserve a place in `activeJobs`. Returns `None` when the partition is
    /// full or its half-open breaker already has a trial job; the capacity
    /// check, breaker admission and insert happen under one lock.
    pub fn try_reserve(self: &Arc<Self>, job_id: &str) -> Option<PartitionSlot> {
        let mut active = self.active_jobs.lock();
        if active.len() >= self.max_capacity || active.contains(job_id) {
            return None;
        }
        let probe = match self.breaker.try_admit()? {
            Admission::Normal => None,
            Admission::Probe(token) => Some(token),
        };
        active.insert(job_id.to_string());
        drop(active);

        debug!(
            partition_id = self.id,
            job_id = %job_id,
            probe = probe.is_some(),
            "📦 PARTITION: slot reserved"
        );

        Some(PartitionSlot {
            partition: Arc::clone(self),
            job_id: job_id.to_string(),
            probe,
            released: false,
        })
    }

    fn release(&self, job_id: &str) {
        if self.active_jobs.lock().remove(job_id) {
            debug!(partition_id = self.id, job_id = %job_id, "📦 PARTITION: slot released");
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_jobs.lock().len()
    }

    pub fn active_job_ids(&self) -> Vec<JobId> {
        self.active_jobs.lock().iter().cloned().collect()
    }

    /// Fraction of `max_capacity` in use
    pub fn load(&self) -> f64 {
        if self.max_capacity == 0 {
            return 1.0;
        }
        self.active_count() as f64 / self.max_capacity as f64
    }

    /// Mean utilization of the connection and worker pools
    pub fn resource_utilization(&self) -> f64 {
        (self.connections.utilization() + self.workers.utilization()) / 2.0
    }

    /// Check out one connection and one worker for the duration of a step
    pub async fn acquire_resources(&self) -> Result<PartitionResources, SemaphoreError> {
        let connection = self.connections.acquire().await?;
        let worker = self.workers.acquire().await?;
        Ok(PartitionResources {
            _connection: connection,
            _worker: worker,
        })
    }

    /// Feed a step outcome into the metrics window and the circuit breaker
    pub fn record_outcome(&self, duration: Duration, success: bool) {
        self.metrics.lock().record(duration, success);
        if success {
            self.breaker.record_success(duration);
        } else {
            self.breaker.record_failure(duration);
        }
    }

    /// Healthy and not circuit-broken. May move an expired open circuit to
    /// half-open as a side effect.
    pub fn is_selectable(&self) -> bool {
        self.is_healthy() && self.breaker.allows_traffic()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn metrics(&self) -> PartitionMetrics {
        self.metrics.lock().clone()
    }

    /// Start error-rate tracking afresh, e.g. when a partition is restored
    pub fn clear_metrics_window(&self) {
        self.metrics.lock().clear_window();
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn mark_unhealthy(&self, reason: &str) {
        if self.healthy.swap(false, Ordering::AcqRel) {
            warn!(partition_id = self.id, reason = %reason, "⚠️ PARTITION: marked unhealthy");
        }
    }

    pub fn mark_healthy(&self) {
        if !self.healthy.swap(true, Ordering::AcqRel) {
            debug!(partition_id = self.id, "✅ PARTITION: marked healthy");
        }
    }

    pub(crate) fn set_shed_budget(&self, jobs: usize) {
        self.shed_budget.store(jobs, Ordering::Release);
    }

    /// Claim one unit of the shed budget; true means the caller should move
    pub fn claim_shed(&self) -> bool {
        self.shed_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn cache_get(&self, key: &str) -> Option<Value> {
        self.cache.get(key).map(|entry| entry.value().clone())
    }

    /// Insert into the bounded cache, evicting an arbitrary entry when full
    pub fn cache_put(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if self.cache_capacity == 0 {
            return;
        }
        if self.cache.len() >= self.cache_capacity && !self.cache.contains_key(&key) {
            let victim = self.cache.iter().next().map(|entry| entry.key().clone());
            if let Some(victim) = victim {
                self.cache.remove(&victim);
            }
        }
        self.cache.insert(key, value);
    }

    pub fn cache_remove(&self, key: &str) -> Option<Value> {
        self.cache.remove(key).map(|(_, value)| value)
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn status(&self) -> PartitionStatus {
        let metrics = self.metrics.lock().clone();
        PartitionStatus {
            id: self.id,
            active_jobs: self.active_count(),
            max_capacity: self.max_capacity,
            load: self.load(),
            circuit_state: self.breaker.state(),
            consecutive_failures: self.breaker.consecutive_failures(),
            healthy: self.is_healthy(),
            avg_execution_ms: metrics.avg_execution_ms(),
            error_rate: metrics.error_rate(),
            p95_latency_ms: metrics.p95_latency_ms(),
            resource_utilization: self.resource_utilization(),
            connections_in_use: self.connections.held_permits(),
            workers_in_use: self.workers.held_permits(),
            cache_entries: self.cache.len(),
        }
    }
}

/// A reserved place in a partition's active-job set, released on drop
#[derive(Debug)]
pub struct PartitionSlot {
    partition: Arc<ResourcePartition>,
    job_id: JobId,
    /// Half-open trial token held by this reservation
    probe: Option<u64>,
    released: bool,
}

impl PartitionSlot {
    pub fn partition(&self) -> &Arc<ResourcePartition> {
        &self.partition
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition.id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            if let Some(token) = self.probe.take() {
                self.partition.breaker.release_probe(token);
            }
            self.partition.release(&self.job_id);
        }
    }
}

impl Drop for PartitionSlot {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Connection and worker permits held while a step runs
#[derive(Debug)]
pub struct PartitionResources {
    _connection: SemaphorePermit,
    _worker: SemaphorePermit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionStatus {
    pub id: PartitionId,
    pub active_jobs: usize,
    pub max_capacity: usize,
    pub load: f64,
    pub circuit_state: CircuitState,
    pub consecutive_failures: u64,
    pub healthy: bool,
    pub avg_execution_ms: f64,
    pub error_rate: f64,
    pub p95_latency_ms: f64,
    pub resource_utilization: f64,
    pub connections_in_use: usize,
    pub workers_in_use: usize,
    pub cache_entries: usize,
}
