//! # Consistency Management
//!
//! Cross-partition jobs are checkpointed: after execution the engine waits,
//! within a bound, for every involved partition's projection to reach the
//! checkpoint's expected sequence. Partitions still behind are reconciled by
//! replaying the canonical event log into them.

pub mod checkpoint;
pub mod manager;

pub use checkpoint::{
    Checkpoint, CheckpointContext, ConsistencyReport, ConsistencyResult, WaitOptions,
};
pub use manager::{ConsistencyChecker, ConsistencyManager, ConsistencyStats};

use crate::events::EventStoreError;
use crate::models::{JobId, PartitionId};
use crate::state_machine::StateMachineError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("Checkpoint {checkpoint_id} not found")]
    CheckpointNotFound { checkpoint_id: Uuid },

    #[error("Reconciliation failed for job {job_id}: partitions {partitions:?} still diverge")]
    ReconciliationFailed {
        job_id: JobId,
        partitions: Vec<PartitionId>,
    },

    #[error("Event store error during reconciliation: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("State machine error during reconciliation: {0}")]
    StateMachine(#[from] StateMachineError),
}
