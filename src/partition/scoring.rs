//! # Partition Scoring
//!
//! Every factor is normalized to [0, 1] with higher meaning better:
//!
//! | factor       | value                                         |
//! |--------------|-----------------------------------------------|
//! | load         | `1 - active / max_capacity`                   |
//! | performance  | `1 - min(avg_execution_ms / ceiling_ms, 1)`   |
//! | availability | 1.0 when closed, 0.5 when half-open           |
//! | resource     | `1 - resource_utilization`                    |
//! | error        | `1 - error_rate`                              |
//!
//! Open or unhealthy partitions are not scored at all.

use crate::config::{ScoringWeights, SelectionConfig};
use crate::models::{PartitionId, Priority};
use crate::partition::ResourcePartition;
use crate::resilience::CircuitState;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreFactors {
    pub load: f64,
    pub performance: f64,
    pub availability: f64,
    pub resource: f64,
    pub error: f64,
}

impl ScoreFactors {
    /// Collect factors for a selectable partition
    pub fn for_partition(partition: &ResourcePartition, performance_ceiling_ms: u64) -> Self {
        let metrics = partition.metrics();
        let ceiling = performance_ceiling_ms.max(1) as f64;

        let availability = match partition.circuit_state() {
            CircuitState::Closed => 1.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 0.0,
        };

        Self {
            load: normalize(1.0 - partition.load()),
            performance: normalize(1.0 - (metrics.avg_execution_ms() / ceiling).min(1.0)),
            availability,
            resource: normalize(1.0 - partition.resource_utilization()),
            error: normalize(1.0 - metrics.error_rate()),
        }
    }

    pub fn weighted(&self, weights: &ScoringWeights) -> f64 {
        weights.load * self.load
            + weights.performance * self.performance
            + weights.availability * self.availability
            + weights.resource * self.resource
            + weights.error * self.error
    }

    /// Fraction of capacity in use, recovered from the load factor
    pub fn utilization(&self) -> f64 {
        1.0 - self.load
    }
}

/// Weighted score plus the priority boost, clamped to [0, 1]
pub fn score(
    factors: &ScoreFactors,
    weights: &ScoringWeights,
    selection: &SelectionConfig,
    priority: Priority,
) -> f64 {
    let boost = match priority {
        Priority::Critical => selection.critical_boost,
        Priority::High => selection.high_boost,
        Priority::Normal | Priority::Low => 0.0,
    };
    normalize(factors.weighted(weights) + boost)
}

fn normalize(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PartitionScore {
    pub partition_id: PartitionId,
    pub score: f64,
    pub factors: ScoreFactors,
}
