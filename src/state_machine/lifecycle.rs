//! # Job Lifecycle
//!
//! Drives a job through [`ExecutionPhase`]s. Each engine step fires a
//! [`PhaseEvent`]; illegal sequences are rejected rather than silently
//! accepted.

use crate::models::JobId;
use crate::state_machine::errors::{StateMachineError, StateMachineResult};
use crate::state_machine::ExecutionPhase;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseEvent {
    SelectPartition,
    AcquireSlot,
    AcquireLock,
    Execute,
    AwaitConsistency,
    Finalize,
    Fail,
    Requeue,
}

#[derive(Debug, Clone)]
pub struct JobLifecycle {
    job_id: JobId,
    phase: ExecutionPhase,
    history: Vec<ExecutionPhase>,
}

impl JobLifecycle {
    pub fn new(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            phase: ExecutionPhase::Queued,
            history: vec![ExecutionPhase::Queued],
        }
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.phase
    }

    /// Every phase visited, in order
    pub fn history(&self) -> &[ExecutionPhase] {
        &self.history
    }

    pub fn transition(&mut self, event: PhaseEvent) -> StateMachineResult<ExecutionPhase> {
        let target = Self::determine_target_state(self.phase, event)?;
        debug!(
            job_id = %self.job_id,
            from = %self.phase,
            to = %target,
            "🔁 LIFECYCLE: transition"
        );
        self.phase = target;
        self.history.push(target);
        Ok(target)
    }

    fn determine_target_state(
        current: ExecutionPhase,
        event: PhaseEvent,
    ) -> StateMachineResult<ExecutionPhase> {
        let target = match (current, event) {
            (ExecutionPhase::Queued, PhaseEvent::SelectPartition) => {
                ExecutionPhase::PartitionSelected
            }
            (ExecutionPhase::PartitionSelected, PhaseEvent::AcquireSlot) => {
                ExecutionPhase::SlotAcquired
            }
            (ExecutionPhase::SlotAcquired, PhaseEvent::AcquireLock) => {
                ExecutionPhase::LockAcquired
            }
            (ExecutionPhase::LockAcquired, PhaseEvent::Execute) => ExecutionPhase::Executing,
            (ExecutionPhase::Executing, PhaseEvent::AwaitConsistency) => {
                ExecutionPhase::ConsistencyPending
            }
            (ExecutionPhase::Executing | ExecutionPhase::ConsistencyPending, PhaseEvent::Finalize) => {
                ExecutionPhase::Finalized
            }
            (from, PhaseEvent::Fail) if !from.is_terminal() => ExecutionPhase::Failed,
            (ExecutionPhase::Failed, PhaseEvent::Requeue) => ExecutionPhase::Queued,

            (from, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: Some(from.to_string()),
                    to: format!("{event:?}"),
                })
            }
        };

        debug_assert!(current.can_transition_to(target));
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_with_consistency() {
        let mut lifecycle = JobLifecycle::new("job");
        for event in [
            PhaseEvent::SelectPartition,
            PhaseEvent::AcquireSlot,
            PhaseEvent::AcquireLock,
            PhaseEvent::Execute,
            PhaseEvent::AwaitConsistency,
            PhaseEvent::Finalize,
        ] {
            lifecycle.transition(event).unwrap();
        }
        assert_eq!(lifecycle.phase(), ExecutionPhase::Finalized);
        assert_eq!(lifecycle.history().len(), 7);
    }

    #[test]
    fn test_fail_and_requeue() {
        let mut lifecycle = JobLifecycle::new("job");
        lifecycle.transition(PhaseEvent::SelectPartition).unwrap();
        lifecycle.transition(PhaseEvent::Fail).unwrap();
        assert_eq!(
            lifecycle.transition(PhaseEvent::Requeue).unwrap(),
            ExecutionPhase::Queued
        );
    }

    #[test]
    fn test_invalid_transition() {
        let mut lifecycle = JobLifecycle::new("job");
        let err = lifecycle.transition(PhaseEvent::Execute).unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));

        lifecycle.transition(PhaseEvent::Fail).unwrap();
        assert!(lifecycle.transition(PhaseEvent::Fail).is_err());
    }
}
