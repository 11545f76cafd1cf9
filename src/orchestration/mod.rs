//! # Orchestration
//!
//! The execution engine and the collaborators it coordinates.
//!
//! ## Core Components
//!
//! - **ExecutionEngine**: admits jobs, reserves partition and pool capacity,
//!   runs steps under the job's lock, and drives recovery
//! - **ConcurrencyCoordinator**: distributed locks and backpressure admission
//! - **ErrorClassifier**: maps failures onto the taxonomy and picks a recovery
//!   action
//! - **StepRegistry**: named step collaborators supplied by the embedding
//!   application
//! - **MetricsSink**: destination for gauges, counters and histograms
//! - **Maintenance**: the periodic loop that sweeps, rebalances, snapshots
//!   and compacts

pub mod coordinator;
pub mod engine;
pub mod error_classifier;
pub mod maintenance;
pub mod metrics;
pub mod status;
pub mod step_handler;

pub use coordinator::{
    BackpressureController, ConcurrencyCoordinator, CoordinatorStatus, DistributedLock, LockGuard,
    LockManager, LockOptions, PriorityWeights,
};
pub use engine::{ExecutionEngine, ExecutionEngineBuilder};
pub use error_classifier::{
    ErrorClassification, ErrorClassifier, ErrorContext, RecoveryAction, StandardErrorClassifier,
};
pub use maintenance::MaintenanceReport;
pub use metrics::{InMemoryMetricsSink, Labels, MetricsSink, TracingMetricsSink};
pub use status::{EngineStats, SystemStatus};
pub use step_handler::{FnStep, Step, StepContext, StepError, StepRegistry};
