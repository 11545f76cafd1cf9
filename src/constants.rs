//! # System Constants
//!
//! Operational defaults, metric names, and lifecycle topic names shared across
//! the execution engine. Configuration defaults in [`crate::config`] are built
//! from the values in [`system`].

/// Lifecycle topics published alongside persisted job events
pub mod events {
    pub const JOB_STARTED: &str = "job.started";
    pub const JOB_STEP_COMPLETED: &str = "job.step_completed";
    pub const JOB_STEP_FAILED: &str = "job.step_failed";
    pub const JOB_RETRIED: &str = "job.retried";
    pub const JOB_COMPLETED: &str = "job.completed";
    pub const JOB_FAILED: &str = "job.failed";
}

/// Metric names emitted to the injected metrics sink
pub mod metrics {
    pub const ACTIVE_JOBS: &str = "engine.active_jobs";
    pub const JOBS_SUBMITTED: &str = "engine.jobs_submitted";
    pub const JOBS_COMPLETED: &str = "engine.jobs_completed";
    pub const JOBS_FAILED: &str = "engine.jobs_failed";
    pub const JOBS_REJECTED: &str = "engine.jobs_rejected";
    pub const JOBS_REQUEUED: &str = "engine.jobs_requeued";
    pub const JOB_DURATION_MS: &str = "engine.job_duration_ms";
    pub const P95_LATENCY_MS: &str = "engine.p95_latency_ms";
    pub const ERROR_RATE: &str = "engine.error_rate";
    pub const PARTITION_LOAD: &str = "partition.load";
    pub const PARTITION_ERROR_RATE: &str = "partition.error_rate";
    pub const PARTITION_P95_LATENCY_MS: &str = "partition.p95_latency_ms";
    pub const PARTITION_UTILIZATION: &str = "partition.resource_utilization";
    pub const POOL_IN_USE: &str = "pool.in_use";
    pub const POOL_WAITING: &str = "pool.waiting";
    pub const ACCEPTANCE_RATE: &str = "coordinator.acceptance_rate";
    pub const PENDING_CHECKPOINTS: &str = "consistency.pending_checkpoints";
}

/// System-wide defaults
pub mod system {
    pub const ENGINE_VERSION: &str = "0.1.0";

    pub const DEFAULT_PARTITION_COUNT: usize = 10;
    pub const DEFAULT_PARTITION_CAPACITY: usize = 100;
    pub const DEFAULT_CONNECTION_POOL_SIZE: usize = 20;
    pub const DEFAULT_WORKER_POOL_SIZE: usize = 50;
    pub const DEFAULT_CACHE_CAPACITY: usize = 1_000;
    pub const DEFAULT_METRICS_WINDOW: usize = 100;

    /// Consecutive step failures before a partition's breaker opens
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_RECOVERY_TIMEOUT_MS: u64 = 60_000;

    pub const DEFAULT_REPLICATION_FACTOR: usize = 3;
    pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 1_000;

    pub const DEFAULT_CONSISTENCY_MAX_WAIT_MS: u64 = 30_000;
    pub const DEFAULT_CONSISTENCY_POLL_MS: u64 = 250;

    pub const DEFAULT_ACCEPTANCE_RATE: f64 = 1.0;
    pub const BACKPRESSURE_ACCEPTANCE_RATE: f64 = 0.5;
    pub const BACKPRESSURE_TIMEOUT_MULTIPLIER: f64 = 1.5;

    /// Upper bound on steps per job accepted at admission
    pub const MAX_JOB_STEPS: usize = 1_000;
}
