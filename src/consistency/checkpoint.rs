use crate::models::{JobId, PartitionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyResult {
    Pending,
    Consistent,
    Inconsistent,
}

/// What every involved partition must have projected
#[derive(Debug, Clone)]
pub struct CheckpointContext {
    pub involved_partitions: BTreeSet<PartitionId>,
    /// Stream sequence each partition must have applied
    pub expected_sequence: u64,
    pub expected_step: usize,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub id: Uuid,
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    pub created_at: Instant,
    pub involved_partitions: BTreeSet<PartitionId>,
    pub expected_sequence: u64,
    pub expected_step: usize,
    pub consistency_result: ConsistencyResult,
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub max_wait_time: Duration,
    /// Defaults to every involved partition
    pub required_partitions: Option<BTreeSet<PartitionId>>,
}

impl WaitOptions {
    pub fn new(max_wait_time: Duration) -> Self {
        Self {
            max_wait_time,
            required_partitions: None,
        }
    }

    pub fn with_required(mut self, partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        self.required_partitions = Some(partitions.into_iter().collect());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub checkpoint_id: Uuid,
    pub job_id: JobId,
    pub result: ConsistencyResult,
    pub diverging_partitions: Vec<PartitionId>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.result == ConsistencyResult::Consistent
    }
}
