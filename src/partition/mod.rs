//! # Resource Partitioning
//!
//! Execution capacity is split into isolated partitions, each owning its own
//! connection pool, worker pool, cache, circuit breaker, and metrics. The
//! [`PartitionManager`] scores partitions and picks one per job using a
//! priority-specific load-balancing strategy.

pub mod manager;
pub mod metrics;
pub mod partition;
pub mod scoring;

pub use manager::{PartitionManager, RebalanceReport};
pub use metrics::PartitionMetrics;
pub use partition::{PartitionResources, PartitionSlot, PartitionStatus, ResourcePartition};
pub use scoring::{PartitionScore, ScoreFactors};
