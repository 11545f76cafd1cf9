use crate::models::{JobId, PartitionId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateMachineError {
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: Option<String>, to: String },

    #[error("Unknown partition {partition_id}")]
    UnknownPartition { partition_id: PartitionId },

    #[error("No state for job {job_id} on partition {partition_id}")]
    JobNotFound {
        job_id: JobId,
        partition_id: PartitionId,
    },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
