//! # Engine Error Types
//!
//! Structured error handling for the execution engine using thiserror. Every
//! subsystem error converts into [`EngineError`], and every [`EngineError`]
//! maps onto one [`ErrorKind`] of the failure taxonomy that drives recovery.

use crate::concurrency::SemaphoreError;
use crate::config::ConfigurationError;
use crate::consistency::ConsistencyError;
use crate::events::EventStoreError;
use crate::models::{JobId, PartitionId, Priority};
use crate::state_machine::StateMachineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure taxonomy used by the error classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Pool, partition, or admission capacity exhausted
    ResourceExhaustion,
    /// Partition circuit breaker open or partition-internal error
    PartitionFailure,
    /// Checkpoint verification failed and could not be reconciled
    ConsistencyViolation,
    /// The step collaborator reported an error
    ExternalSystemFailure,
    /// Another execution holds the job's lock
    LockContention,
    /// Job exceeded its pool's wall-clock budget
    Timeout,
    Generic,
}

impl ErrorKind {
    /// Whether the engine may re-queue a job that failed with this kind
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhaustion
                | Self::PartitionFailure
                | Self::ExternalSystemFailure
                | Self::Timeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhaustion => write!(f, "RESOURCE_EXHAUSTION"),
            Self::PartitionFailure => write!(f, "PARTITION_FAILURE"),
            Self::ConsistencyViolation => write!(f, "CONSISTENCY_VIOLATION"),
            Self::ExternalSystemFailure => write!(f, "EXTERNAL_SYSTEM_FAILURE"),
            Self::LockContention => write!(f, "LOCK_CONTENTION"),
            Self::Timeout => write!(f, "TIMEOUT"),
            Self::Generic => write!(f, "GENERIC"),
        }
    }
}

/// Engine-wide error type
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid job submission: {reason}")]
    InvalidJob { reason: String },

    #[error("Admission rejected for job {job_id} ({priority}): acceptance rate {acceptance_rate:.2}")]
    AdmissionRejected {
        job_id: JobId,
        priority: Priority,
        acceptance_rate: f64,
    },

    #[error("No available partition for job {job_id}: {reason}")]
    NoAvailablePartition {
        job_id: JobId,
        reason: String,
        all_circuit_open: bool,
    },

    #[error("Partition {partition_id} failure: {reason}")]
    PartitionFailure {
        partition_id: PartitionId,
        reason: String,
    },

    #[error("Lock contention on {key}: held by partition {owner_partition:?}")]
    LockContention {
        key: String,
        owner_partition: Option<PartitionId>,
    },

    #[error("Job {job_id} already reached a terminal state")]
    DuplicateJob { job_id: JobId },

    #[error("Step '{step}' failed for job {job_id}: {reason}")]
    StepFailed {
        job_id: JobId,
        step: String,
        reason: String,
        retryable: bool,
    },

    #[error("Job {job_id} timed out after {timeout_ms}ms")]
    Timeout { job_id: JobId, timeout_ms: u64 },

    #[error("Consistency violation for job {job_id}: diverging partitions {partitions:?}")]
    ConsistencyViolation {
        job_id: JobId,
        partitions: Vec<PartitionId>,
    },

    #[error("Job {job_id} was cancelled")]
    Cancelled { job_id: JobId },

    #[error("Job {job_id} failed after {attempts} attempt(s) on partition {partition_id:?}: {source}")]
    JobFailed {
        job_id: JobId,
        attempts: u32,
        partition_id: Option<PartitionId>,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("Consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("Semaphore error: {0}")]
    Semaphore(#[from] SemaphoreError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Map this error onto the recovery taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AdmissionRejected { .. } | Self::Semaphore(_) => ErrorKind::ResourceExhaustion,
            Self::NoAvailablePartition {
                all_circuit_open, ..
            } => {
                if *all_circuit_open {
                    ErrorKind::PartitionFailure
                } else {
                    ErrorKind::ResourceExhaustion
                }
            }
            Self::PartitionFailure { .. } => ErrorKind::PartitionFailure,
            Self::LockContention { .. } | Self::DuplicateJob { .. } => ErrorKind::LockContention,
            Self::StepFailed { retryable, .. } => {
                if *retryable {
                    ErrorKind::ExternalSystemFailure
                } else {
                    ErrorKind::Generic
                }
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConsistencyViolation { .. } | Self::Consistency(_) => {
                ErrorKind::ConsistencyViolation
            }
            Self::JobFailed { source, .. } => source.kind(),
            Self::EventStore(EventStoreError::QuorumNotReached { .. }) => {
                ErrorKind::PartitionFailure
            }
            Self::InvalidJob { .. }
            | Self::Cancelled { .. }
            | Self::EventStore(_)
            | Self::StateMachine(_)
            | Self::Configuration(_)
            | Self::Internal(_) => ErrorKind::Generic,
        }
    }

    /// The partition implicated by this error, if any
    pub fn partition_id(&self) -> Option<PartitionId> {
        match self {
            Self::PartitionFailure { partition_id, .. } => Some(*partition_id),
            Self::JobFailed {
                partition_id,
                source,
                ..
            } => partition_id.or_else(|| source.partition_id()),
            _ => None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
