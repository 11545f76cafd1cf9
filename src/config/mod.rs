//! # Engine Configuration System
//!
//! Layered configuration for the execution engine. Every section carries
//! defaults that reproduce the documented operating envelope (ten partitions of
//! one hundred jobs, four priority pools, triple replication), so an engine can
//! be built from `EngineConfig::default()` alone. [`ConfigManager`] overlays
//! YAML files and `TASKER_ENGINE__*` environment variables on top.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_engine::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let partitions = manager.config().partitions.count;
//! let critical_timeout = manager.config().pools.critical.timeout();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::constants::system;
use crate::models::Priority;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Resource partition layout and per-partition resources
    pub partitions: PartitionConfig,

    /// Weighted partition scoring factors
    pub scoring: ScoringWeights,

    /// Load-balancing strategy tuning
    pub selection: SelectionConfig,

    /// Priority-tiered execution pools
    pub pools: PoolsConfig,

    /// Distributed lock settings
    pub coordinator: CoordinatorConfig,

    /// Global admission throttling
    pub backpressure: BackpressureConfig,

    /// Event log replication and snapshots
    pub event_store: EventStoreConfig,

    /// Cross-partition checkpoint verification
    pub consistency: ConsistencyConfig,

    /// Periodic maintenance loop
    pub maintenance: MaintenanceConfig,

    /// Re-queue and cross-partition fan-out policy
    pub recovery: RecoveryConfig,
}

impl EngineConfig {
    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> ConfigResult<()> {
        if self.partitions.count == 0 {
            return Err(ConfigurationError::invalid_value(
                "partitions.count",
                self.partitions.count,
                "at least one partition is required",
            ));
        }
        if self.partitions.max_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "partitions.max_capacity",
                self.partitions.max_capacity,
                "partition capacity must be positive",
            ));
        }
        if self.partitions.connection_pool_size == 0 || self.partitions.worker_pool_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "partitions.worker_pool_size",
                self.partitions.worker_pool_size,
                "partition resource pools must be positive",
            ));
        }
        if self.partitions.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "partitions.circuit_breaker.failure_threshold",
                0,
                "failure threshold must be positive",
            ));
        }

        self.scoring.validate()?;

        for priority in Priority::ALL {
            let pool = self.pools.for_priority(priority);
            if pool.max_concurrency == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("pools.{priority}.max_concurrency"),
                    0,
                    "pool concurrency must be positive",
                ));
            }
            if pool.timeout_secs == 0 {
                return Err(ConfigurationError::invalid_value(
                    format!("pools.{priority}.timeout_secs"),
                    0,
                    "pool timeout must be positive",
                ));
            }
        }

        let rate = self.backpressure.default_acceptance_rate;
        if !(rate > 0.0 && rate <= 1.0) {
            return Err(ConfigurationError::invalid_value(
                "backpressure.default_acceptance_rate",
                rate,
                "acceptance rate must be within (0, 1]",
            ));
        }
        let reduced = self.backpressure.reduced_acceptance_rate;
        if !(reduced > 0.0 && reduced <= 1.0) {
            return Err(ConfigurationError::invalid_value(
                "backpressure.reduced_acceptance_rate",
                reduced,
                "acceptance rate must be within (0, 1]",
            ));
        }

        if self.event_store.replication_factor == 0 {
            return Err(ConfigurationError::invalid_value(
                "event_store.replication_factor",
                0,
                "replication factor must be positive",
            ));
        }
        if self.event_store.snapshot_interval == 0 {
            return Err(ConfigurationError::invalid_value(
                "event_store.snapshot_interval",
                0,
                "snapshot interval must be positive",
            ));
        }
        if self.consistency.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "consistency.poll_interval_ms",
                0,
                "poll interval must be positive",
            ));
        }

        Ok(())
    }
}

/// Partition layout and resources
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Partitions created at engine startup
    pub count: usize,
    /// Maximum concurrently active jobs per partition
    pub max_capacity: usize,
    /// Exclusive connection pool size per partition
    pub connection_pool_size: usize,
    /// Exclusive worker pool size per partition
    pub worker_pool_size: usize,
    /// Maximum entries in the partition-local cache
    pub cache_capacity: usize,
    /// Recent outcomes kept for error rate and p95 latency
    pub metrics_window: usize,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            count: system::DEFAULT_PARTITION_COUNT,
            max_capacity: system::DEFAULT_PARTITION_CAPACITY,
            connection_pool_size: system::DEFAULT_CONNECTION_POOL_SIZE,
            worker_pool_size: system::DEFAULT_WORKER_POOL_SIZE,
            cache_capacity: system::DEFAULT_CACHE_CAPACITY,
            metrics_window: system::DEFAULT_METRICS_WINDOW,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Circuit breaker thresholds for a partition
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting a half-open probe
    pub recovery_timeout_ms: u64,
    /// Successful half-open calls required to close the circuit
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: system::DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout_ms: system::DEFAULT_RECOVERY_TIMEOUT_MS,
            success_threshold: 1,
        }
    }
}

/// Weights of the partition scoring factors; must sum to 1.0
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub load: f64,
    pub performance: f64,
    pub availability: f64,
    pub resource: f64,
    pub error: f64,
}

impl ScoringWeights {
    pub fn total(&self) -> f64 {
        self.load + self.performance + self.availability + self.resource + self.error
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let weights = [
            ("scoring.load", self.load),
            ("scoring.performance", self.performance),
            ("scoring.availability", self.availability),
            ("scoring.resource", self.resource),
            ("scoring.error", self.error),
        ];
        for (field, weight) in weights {
            if !(0.0..=1.0).contains(&weight) {
                return Err(ConfigurationError::invalid_value(
                    field,
                    weight,
                    "scoring weights must be within [0, 1]",
                ));
            }
        }
        if (self.total() - 1.0).abs() > 0.001 {
            return Err(ConfigurationError::invalid_value(
                "scoring",
                self.total(),
                "scoring weights must sum to 1.0",
            ));
        }
        Ok(())
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            load: 0.30,
            performance: 0.25,
            availability: 0.20,
            resource: 0.15,
            error: 0.10,
        }
    }
}

/// Load-balancing strategy tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Score boost for critical jobs
    pub critical_boost: f64,
    /// Score boost for high-priority jobs
    pub high_boost: f64,
    /// Critical jobs prefer partitions with load strictly below this
    pub critical_max_load: f64,
    /// Critical jobs prefer partitions with availability strictly above this
    pub critical_min_availability: f64,
    /// High-priority round robin skips partitions at or above this load
    pub high_max_load: f64,
    /// Candidates considered by weighted-random selection
    pub top_candidates: usize,
    /// Average execution time treated as the worst performance
    pub performance_ceiling_ms: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            critical_boost: 0.20,
            high_boost: 0.10,
            critical_max_load: 0.5,
            critical_min_availability: 0.9,
            high_max_load: 0.8,
            top_candidates: 3,
            performance_ceiling_ms: 60_000,
        }
    }
}

/// Settings for one execution pool tier
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    pub max_concurrency: usize,
    pub timeout_secs: u64,
    pub retry_count: u32,
}

impl PoolConfig {
    pub fn new(max_concurrency: usize, timeout_secs: u64, retry_count: u32) -> Self {
        Self {
            max_concurrency,
            timeout_secs,
            retry_count,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// The four fixed priority tiers
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub critical: PoolConfig,
    pub high: PoolConfig,
    pub normal: PoolConfig,
    pub low: PoolConfig,
}

impl PoolsConfig {
    pub fn for_priority(&self, priority: Priority) -> &PoolConfig {
        match priority {
            Priority::Critical => &self.critical,
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            critical: PoolConfig::new(100, 5 * 60, 3),
            high: PoolConfig::new(300, 10 * 60, 2),
            normal: PoolConfig::new(500, 30 * 60, 1),
            low: PoolConfig::new(200, 60 * 60, 0),
        }
    }
}

/// Distributed lock settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Added to the pool timeout to form a job lock's TTL
    pub lock_ttl_margin_ms: u64,
}

impl CoordinatorConfig {
    pub fn lock_ttl_margin(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_margin_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_ttl_margin_ms: 30_000,
        }
    }
}

/// Global admission throttling
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackpressureConfig {
    pub default_acceptance_rate: f64,
    /// Acceptance rate applied when backpressure activates
    pub reduced_acceptance_rate: f64,
    /// Pool timeout inflation while backpressure is active
    pub timeout_multiplier: f64,
    pub critical_weight: f64,
    pub high_weight: f64,
    pub normal_weight: f64,
    pub low_weight: f64,
    /// Mean partition utilization below which backpressure is relieved
    pub relief_utilization_threshold: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            default_acceptance_rate: system::DEFAULT_ACCEPTANCE_RATE,
            reduced_acceptance_rate: system::BACKPRESSURE_ACCEPTANCE_RATE,
            timeout_multiplier: system::BACKPRESSURE_TIMEOUT_MULTIPLIER,
            critical_weight: 2.0,
            high_weight: 1.0,
            normal_weight: 1.0,
            low_weight: 0.5,
            relief_utilization_threshold: 0.5,
        }
    }
}

/// Acknowledgements required before an append returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteConsistency {
    /// Majority of replicas
    Quorum,
    /// Every replica
    All,
}

/// Event log replication and snapshots
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventStoreConfig {
    pub replication_factor: usize,
    pub write_consistency: WriteConsistency,
    /// Events per partition between snapshots
    pub snapshot_interval: u64,
    pub replica_ack_timeout_ms: u64,
    /// Broadcast channel capacity for event subscribers
    pub publisher_capacity: usize,
    /// Age after which terminated, snapshotted streams are compacted
    pub retention_secs: u64,
}

impl EventStoreConfig {
    pub fn replica_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_ack_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            replication_factor: system::DEFAULT_REPLICATION_FACTOR,
            write_consistency: WriteConsistency::Quorum,
            snapshot_interval: system::DEFAULT_SNAPSHOT_INTERVAL,
            replica_ack_timeout_ms: 5_000,
            publisher_capacity: 1_000,
            retention_secs: 3_600,
        }
    }
}

/// Cross-partition checkpoint verification
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    pub max_wait_ms: u64,
    pub poll_interval_ms: u64,
}

impl ConsistencyConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: system::DEFAULT_CONSISTENCY_MAX_WAIT_MS,
            poll_interval_ms: system::DEFAULT_CONSISTENCY_POLL_MS,
        }
    }
}

/// Periodic maintenance loop
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_ms: u64,
    /// Error rate above which a partition is marked unhealthy
    pub unhealthy_error_rate: f64,
    /// Outcomes required before the error rate is trusted
    pub min_samples: usize,
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            unhealthy_error_rate: 0.5,
            min_samples: 20,
        }
    }
}

/// Re-queue and cross-partition fan-out policy
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Upper bound on re-queues of a single job, across all failure kinds
    pub max_requeues: u32,
    pub requeue_delay_ms: u64,
    /// Secondary partitions mirroring state for cross-partition jobs
    pub cross_partition_fanout: usize,
}

impl RecoveryConfig {
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_requeues: 3,
            requeue_delay_ms: 100,
            cross_partition_fanout: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.partitions.count, 10);
        assert_eq!(config.partitions.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.event_store.replication_factor, 3);
        assert_eq!(config.consistency.max_wait(), Duration::from_secs(30));
    }

    #[test]
    fn test_pool_tiers_match_documented_envelope() {
        let pools = PoolsConfig::default();
        assert_eq!(pools.critical.max_concurrency, 100);
        assert_eq!(pools.critical.timeout(), Duration::from_secs(300));
        assert_eq!(pools.critical.retry_count, 3);
        assert_eq!(pools.high.max_concurrency, 300);
        assert_eq!(pools.normal.timeout(), Duration::from_secs(1_800));
        assert_eq!(pools.low.retry_count, 0);
        assert_eq!(pools.for_priority(Priority::Low).max_concurrency, 200);
    }

    #[test]
    fn test_scoring_weights_must_sum_to_one() {
        let mut config = EngineConfig::default();
        config.scoring.load = 0.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_invalid_acceptance_rate_rejected() {
        let mut config = EngineConfig::default();
        config.backpressure.default_acceptance_rate = 0.0;
        assert!(config.validate().is_err());

        config.backpressure.default_acceptance_rate = 1.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_replication_factor_rejected() {
        let mut config = EngineConfig::default();
        config.event_store.replication_factor = 0;
        assert!(config.validate().is_err());
    }
}
