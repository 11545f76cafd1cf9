//! # Job Failure Classification
//!
//! Maps an execution failure plus its context onto a recovery decision.
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ EngineError     │────▶│ ErrorClassifier │────▶│ Classification  │
//! │ + ErrorContext  │     │                 │     │ + RecoveryAction│
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! | kind                    | recovery                                            |
//! |-------------------------|-----------------------------------------------------|
//! | RESOURCE_EXHAUSTION     | backpressure, rebalance, re-queue at `low`          |
//! | PARTITION_FAILURE       | open breaker, migrate, re-queue at same priority    |
//! | EXTERNAL_SYSTEM_FAILURE | re-queue while the pool's retry budget lasts        |
//! | TIMEOUT                 | re-queue while the pool's retry budget lasts        |
//! | CONSISTENCY_VIOLATION   | terminate (reconciliation already failed)           |
//! | LOCK_CONTENTION         | surface immediately, never retried                  |
//! | GENERIC                 | terminate                                           |

use crate::error::{EngineError, ErrorKind};
use crate::models::{JobId, PartitionId, Priority};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Context information for error classification
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub job_id: JobId,

    /// Priority the failed attempt ran at
    pub priority: Priority,

    /// Partition the failed attempt ran on, if it got that far
    pub partition_id: Option<PartitionId>,

    /// 1-based attempt that just failed
    pub attempt_number: u32,

    /// Re-queues already spent on external/timeout failures
    pub retries_used: u32,

    /// The owning pool's retry count
    pub retry_limit: u32,

    /// Re-queues already spent for any reason
    pub requeues_used: u32,

    pub max_requeues: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum RecoveryAction {
    /// Send the job back to `Queued` at `priority`
    Requeue { priority: Priority },
    /// Move the job to `Failed` permanently
    Terminate,
    /// Return the error to the caller untouched
    Surface,
}

/// Result of error classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub action: RecoveryAction,
    pub retry_delay: Option<Duration>,
    pub error_code: String,
    pub error_message: String,
    pub remediation_suggestions: Vec<String>,
    /// Reduce acceptance, inflate timeouts, and rebalance partitions
    pub activate_backpressure: bool,
    /// Partition whose breaker must open and whose jobs should migrate
    pub open_circuit: Option<PartitionId>,
    pub is_final_attempt: bool,
}

impl ErrorClassification {
    pub fn is_retryable(&self) -> bool {
        matches!(self.action, RecoveryAction::Requeue { .. })
    }
}

/// Trait for error classification strategies
pub trait ErrorClassifier: Send + Sync {
    fn classify_error(&self, error: &EngineError, context: &ErrorContext) -> ErrorClassification;

    fn classifier_name(&self) -> &'static str;
}

/// Standard classifier implementing the engine's recovery policy
#[derive(Debug, Clone)]
pub struct StandardErrorClassifier {
    requeue_delay: Duration,
}

impl StandardErrorClassifier {
    pub fn new(requeue_delay: Duration) -> Self {
        Self { requeue_delay }
    }

    fn requeue(&self, priority: Priority) -> (RecoveryAction, Option<Duration>) {
        (RecoveryAction::Requeue { priority }, Some(self.requeue_delay))
    }

    fn classify_resource_exhaustion(&self, context: &ErrorContext) -> (RecoveryAction, Option<Duration>) {
        if context.requeues_used < context.max_requeues {
            self.requeue(Priority::Low)
        } else {
            (RecoveryAction::Terminate, None)
        }
    }

    fn classify_partition_failure(&self, context: &ErrorContext) -> (RecoveryAction, Option<Duration>) {
        if context.requeues_used < context.max_requeues {
            self.requeue(context.priority)
        } else {
            (RecoveryAction::Terminate, None)
        }
    }

    fn classify_retryable_failure(&self, context: &ErrorContext) -> (RecoveryAction, Option<Duration>) {
        if context.retries_used < context.retry_limit && context.requeues_used < context.max_requeues {
            self.requeue(context.priority)
        } else {
            (RecoveryAction::Terminate, None)
        }
    }
}

impl Default for StandardErrorClassifier {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl ErrorClassifier for StandardErrorClassifier {
    fn classify_error(&self, error: &EngineError, context: &ErrorContext) -> ErrorClassification {
        let kind = error.kind();

        let (action, retry_delay) = match kind {
            ErrorKind::LockContention => (RecoveryAction::Surface, None),
            ErrorKind::ResourceExhaustion => self.classify_resource_exhaustion(context),
            ErrorKind::PartitionFailure => self.classify_partition_failure(context),
            ErrorKind::ExternalSystemFailure | ErrorKind::Timeout => {
                self.classify_retryable_failure(context)
            }
            ErrorKind::ConsistencyViolation | ErrorKind::Generic => (RecoveryAction::Terminate, None),
        };

        let (error_code, remediation_suggestions) = match kind {
            ErrorKind::ResourceExhaustion => (
                "RESOURCE_EXHAUSTION",
                vec![
                    "Reduce submission rate or raise partition capacity".to_string(),
                    "Review execution pool sizing".to_string(),
                ],
            ),
            ErrorKind::PartitionFailure => (
                "PARTITION_FAILURE",
                vec!["Inspect the failing partition's step collaborators".to_string()],
            ),
            ErrorKind::ExternalSystemFailure => (
                "EXTERNAL_SYSTEM_FAILURE",
                vec!["Verify the step's external dependency is healthy".to_string()],
            ),
            ErrorKind::Timeout => (
                "EXECUTION_TIMEOUT",
                vec!["Consider raising the pool timeout for this tier".to_string()],
            ),
            ErrorKind::ConsistencyViolation => (
                "CONSISTENCY_VIOLATION",
                vec!["Inspect the job's event stream for gaps".to_string()],
            ),
            ErrorKind::LockContention => (
                "LOCK_CONTENTION",
                vec!["Do not submit the same job id concurrently".to_string()],
            ),
            ErrorKind::Generic => ("GENERIC", Vec::new()),
        };

        // Only a failure attributed to a specific partition opens its breaker
        let open_circuit = match kind {
            ErrorKind::PartitionFailure => error.partition_id(),
            _ => None,
        };

        ErrorClassification {
            kind,
            action,
            retry_delay,
            error_code: error_code.to_string(),
            error_message: error.to_string(),
            remediation_suggestions,
            activate_backpressure: kind == ErrorKind::ResourceExhaustion,
            open_circuit,
            is_final_attempt: matches!(action, RecoveryAction::Terminate | RecoveryAction::Surface),
        }
    }

    fn classifier_name(&self) -> &'static str {
        "standard"
    }
}
