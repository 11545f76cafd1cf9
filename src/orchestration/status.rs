//! System status snapshot returned by `ExecutionEngine::get_system_status`.

use crate::consistency::ConsistencyStats;
use crate::execution::PoolStatus;
use crate::models::PartitionId;
use crate::orchestration::coordinator::CoordinatorStatus;
use crate::partition::PartitionStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Engine-wide counters and job latency figures
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub requeued: u64,
    pub cancelled: u64,
    pub avg_job_ms: f64,
    pub p95_job_ms: f64,
    /// Failed share of recently finished jobs
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub generated_at: DateTime<Utc>,
    pub version: String,
    /// Whether the maintenance loop is running
    pub maintenance_running: bool,
    pub active_jobs: usize,
    /// In-flight jobs per execution phase
    pub phases: BTreeMap<String, usize>,
    pub overall_load: f64,
    pub partitions: Vec<PartitionStatus>,
    pub pools: Vec<PoolStatus>,
    pub coordinator: CoordinatorStatus,
    pub consistency: ConsistencyStats,
    pub event_count: u64,
    pub stream_count: usize,
    pub stats: EngineStats,
}

impl SystemStatus {
    /// Partitions whose breaker is not closed or that are marked unhealthy
    pub fn degraded_partitions(&self) -> Vec<PartitionId> {
        self.partitions
            .iter()
            .filter(|p| !p.healthy || p.circuit_state != crate::resilience::CircuitState::Closed)
            .map(|p| p.id)
            .collect()
    }

    /// Total jobs waiting on any execution pool
    pub fn queue_depth(&self) -> usize {
        self.pools.iter().map(|p| p.queue_depth).sum()
    }
}
