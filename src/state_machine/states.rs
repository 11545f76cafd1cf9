use crate::events::{Event, EventType};
use crate::models::{JobId, JobStatus, PartitionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Engine-side lifecycle of one job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    /// Admitted, waiting for a partition
    Queued,
    PartitionSelected,
    /// Holding an execution pool permit
    SlotAcquired,
    LockAcquired,
    Executing,
    /// Waiting for cross-partition checkpoint verification
    ConsistencyPending,
    Finalized,
    Failed,
}

impl ExecutionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }

    /// Whether the phase holds an execution slot
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::SlotAcquired | Self::LockAcquired | Self::Executing | Self::ConsistencyPending
        )
    }

    pub fn can_transition_to(&self, next: ExecutionPhase) -> bool {
        use ExecutionPhase::*;
        matches!(
            (self, next),
            (Queued, PartitionSelected)
                | (PartitionSelected, SlotAcquired)
                | (SlotAcquired, LockAcquired)
                | (LockAcquired, Executing)
                | (Executing, ConsistencyPending)
                | (Executing, Finalized)
                | (ConsistencyPending, Finalized)
                // Any non-terminal phase may fail
                | (Queued | PartitionSelected | SlotAcquired | LockAcquired | Executing | ConsistencyPending, Failed)
                // Re-queue after a recoverable failure
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::PartitionSelected => write!(f, "partition_selected"),
            Self::SlotAcquired => write!(f, "slot_acquired"),
            Self::LockAcquired => write!(f, "lock_acquired"),
            Self::Executing => write!(f, "executing"),
            Self::ConsistencyPending => write!(f, "consistency_pending"),
            Self::Finalized => write!(f, "finalized"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl Default for ExecutionPhase {
    fn default() -> Self {
        Self::Queued
    }
}

/// Projected state of one job, folded from its event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub job_id: JobId,
    pub partition_id: PartitionId,
    /// Index of the next step to run (steps before it are done or skipped)
    pub current_step: usize,
    pub last_result: Option<Value>,
    pub last_error: Option<String>,
    /// Sequence of the last applied event; 0 before any event
    pub sequence: u64,
    pub status: JobStatus,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl JobState {
    pub fn new(job_id: impl Into<JobId>, partition_id: PartitionId) -> Self {
        Self {
            job_id: job_id.into(),
            partition_id,
            current_step: 0,
            last_result: None,
            last_error: None,
            sequence: 0,
            status: JobStatus::Queued,
            attempt: 1,
            timestamp: Utc::now(),
        }
    }

    /// Fold one event in. Events at or below the current sequence are
    /// ignored, which makes redelivery harmless.
    pub fn apply(&mut self, event: &Event) -> bool {
        if event.sequence <= self.sequence {
            return false;
        }

        let step_index = event
            .payload
            .get("step_index")
            .and_then(Value::as_u64)
            .map(|i| i as usize);
        let attempt = event
            .payload
            .get("attempt")
            .and_then(Value::as_u64)
            .map(|a| a as u32);
        let error = event
            .payload
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string);

        match event.event_type {
            EventType::Started => {
                self.status = JobStatus::Running;
                self.attempt = attempt.unwrap_or(self.attempt);
            }
            EventType::StepCompleted => {
                self.status = JobStatus::Running;
                if let Some(index) = step_index {
                    self.current_step = index + 1;
                }
                self.last_result = event.payload.get("result").cloned();
            }
            EventType::StepFailed => {
                self.last_error = error;
                let skipped = event
                    .payload
                    .get("skipped")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if let (true, Some(index)) = (skipped, step_index) {
                    self.current_step = index + 1;
                }
            }
            EventType::Retried => {
                self.status = JobStatus::Queued;
                self.attempt = attempt.unwrap_or(self.attempt + 1);
            }
            EventType::Completed => {
                self.status = JobStatus::Completed;
                if let Some(result) = event.payload.get("result") {
                    self.last_result = Some(result.clone());
                }
            }
            EventType::Failed => {
                self.status = JobStatus::Failed;
                self.last_error = error;
            }
        }

        self.partition_id = event.partition_id;
        self.sequence = event.sequence;
        self.timestamp = event.timestamp;
        true
    }

    /// Fold a whole stream, in sequence order
    pub fn replay<'a>(mut self, events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut ordered: Vec<&Event> = events.into_iter().collect();
        ordered.sort_by_key(|e| e.sequence);
        for event in ordered {
            self.apply(event);
        }
        self
    }

    pub fn delta(&self) -> StateDelta {
        StateDelta::from_state(self)
    }
}

/// The state carried by one projected event, applied last-write-wins by
/// `sequence`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub sequence: u64,
    pub partition_id: PartitionId,
    pub current_step: usize,
    pub last_result: Option<Value>,
    pub last_error: Option<String>,
    pub status: JobStatus,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl StateDelta {
    pub fn from_state(state: &JobState) -> Self {
        Self {
            sequence: state.sequence,
            partition_id: state.partition_id,
            current_step: state.current_step,
            last_result: state.last_result.clone(),
            last_error: state.last_error.clone(),
            status: state.status,
            attempt: state.attempt,
            timestamp: state.timestamp,
        }
    }

    pub(crate) fn apply_to(&self, state: &mut JobState) -> bool {
        if self.sequence <= state.sequence {
            return false;
        }
        state.partition_id = self.partition_id;
        state.current_step = self.current_step;
        state.last_result = self.last_result.clone();
        state.last_error = self.last_error.clone();
        state.status = self.status;
        state.attempt = self.attempt;
        state.sequence = self.sequence;
        state.timestamp = self.timestamp;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn event(sequence: u64, event_type: EventType, payload: Value) -> Event {
        Event {
            id: Uuid::new_v4(),
            stream_id: "job".to_string(),
            partition_id: 1,
            event_type,
            payload,
            timestamp: Utc::now(),
            sequence,
        }
    }

    #[test]
    fn test_phase_transitions() {
        use ExecutionPhase::*;
        assert!(Queued.can_transition_to(PartitionSelected));
        assert!(Executing.can_transition_to(ConsistencyPending));
        assert!(Executing.can_transition_to(Finalized));
        assert!(LockAcquired.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Queued));

        assert!(!Queued.can_transition_to(Executing));
        assert!(!Finalized.can_transition_to(Queued));
        assert!(!Finalized.can_transition_to(Failed));
    }

    #[test]
    fn test_replay_reconstructs_state() {
        let events = vec![
            event(1, EventType::Started, json!({"attempt": 1})),
            event(2, EventType::StepCompleted, json!({"step_index": 0, "result": "a"})),
            event(
                3,
                EventType::StepFailed,
                json!({"step_index": 1, "error": "boom", "skipped": true}),
            ),
            event(4, EventType::StepCompleted, json!({"step_index": 2, "result": "c"})),
            event(5, EventType::Completed, json!({"result": "c"})),
        ];

        let state = JobState::new("job", 0).replay(events.iter().rev());
        assert_eq!(state.current_step, 3);
        assert_eq!(state.sequence, 5);
        assert_eq!(state.status, JobStatus::Completed);
        assert_eq!(state.last_result, Some(json!("c")));
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert_eq!(state.partition_id, 1);
    }

    #[test]
    fn test_redelivered_event_is_ignored() {
        let mut state = JobState::new("job", 0);
        let step = event(2, EventType::StepCompleted, json!({"step_index": 0, "result": 1}));
        assert!(state.apply(&step));
        assert!(!state.apply(&step));
        assert!(!state.apply(&event(1, EventType::Started, json!({}))));
        assert_eq!(state.status, JobStatus::Running);
    }

    #[test]
    fn test_retried_requeues() {
        let mut state = JobState::new("job", 0);
        state.apply(&event(1, EventType::Started, json!({"attempt": 1})));
        state.apply(&event(2, EventType::Retried, json!({"attempt": 2})));
        assert_eq!(state.status, JobStatus::Queued);
        assert_eq!(state.attempt, 2);
    }
}
