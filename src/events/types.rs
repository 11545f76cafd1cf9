//! # Event Types
//!
//! A job's stream follows the grammar
//! `Started (StepCompleted | StepFailed | Retried)* (Completed | Failed)`.
//! A stream may also consist of a lone `Failed` when a job fails before it
//! ever starts executing.

use crate::constants::events;
use crate::error::ErrorKind;
use crate::models::{JobId, PartitionId, Priority};
use crate::state_machine::JobState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    StepCompleted,
    StepFailed,
    /// Non-terminal marker written when a failed attempt is re-queued
    Retried,
    Completed,
    Failed,
}

impl EventType {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Lifecycle topic used when the event is broadcast
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Started => events::JOB_STARTED,
            Self::StepCompleted => events::JOB_STEP_COMPLETED,
            Self::StepFailed => events::JOB_STEP_FAILED,
            Self::Retried => events::JOB_RETRIED,
            Self::Completed => events::JOB_COMPLETED,
            Self::Failed => events::JOB_FAILED,
        }
    }

    /// Whether `next` may follow `previous` (`None` = empty stream)
    pub fn may_follow(previous: Option<EventType>, next: EventType) -> bool {
        match previous {
            None => matches!(next, Self::Started | Self::Failed),
            Some(prev) if prev.is_terminal() => false,
            Some(_) => next != Self::Started,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::StepCompleted => write!(f, "step_completed"),
            Self::StepFailed => write!(f, "step_failed"),
            Self::Retried => write!(f, "retried"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Immutable once appended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub stream_id: JobId,
    pub partition_id: PartitionId,
    pub event_type: EventType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Per-stream, starting at 1
    pub sequence: u64,
}

impl Event {
    /// Decode the payload into one of the typed payload structs
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartedPayload {
    pub priority: Priority,
    pub steps: Vec<String>,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletedPayload {
    pub step_index: usize,
    pub step: String,
    pub result: Value,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedPayload {
    pub step_index: usize,
    pub step: String,
    pub error: String,
    pub kind: ErrorKind,
    pub attempt: u32,
    /// Optional step whose failure was tolerated; execution moved past it
    #[serde(default)]
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetriedPayload {
    /// The attempt about to run
    pub attempt: u32,
    pub reason: String,
    pub kind: ErrorKind,
    pub priority: Priority,
    pub resume_from: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedPayload {
    pub result: Value,
    pub completed_steps: usize,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedPayload {
    pub error: String,
    pub kind: ErrorKind,
    pub attempts: u32,
}

/// Projected job states of one partition at a point in its event count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub partition_id: PartitionId,
    pub taken_at: DateTime<Utc>,
    /// Events appended on this partition when the snapshot was taken
    pub partition_event_count: u64,
    pub states: HashMap<JobId, JobState>,
}

impl Snapshot {
    /// Whether the snapshot holds the job's state through `sequence`
    pub fn covers(&self, job_id: &str, sequence: u64) -> bool {
        self.states
            .get(job_id)
            .map(|state| state.sequence >= sequence)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_grammar() {
        use EventType::*;
        assert!(EventType::may_follow(None, Started));
        assert!(EventType::may_follow(None, Failed));
        assert!(!EventType::may_follow(None, StepCompleted));

        assert!(EventType::may_follow(Some(Started), StepFailed));
        assert!(EventType::may_follow(Some(StepFailed), Retried));
        assert!(EventType::may_follow(Some(Retried), StepCompleted));
        assert!(EventType::may_follow(Some(StepCompleted), Completed));
        assert!(!EventType::may_follow(Some(Retried), Started));

        assert!(!EventType::may_follow(Some(Completed), StepCompleted));
        assert!(!EventType::may_follow(Some(Failed), Failed));
    }

    #[test]
    fn test_payload_decoding() {
        let payload = StepFailedPayload {
            step_index: 2,
            step: "send_sms".to_string(),
            error: "gateway 502".to_string(),
            kind: ErrorKind::ExternalSystemFailure,
            attempt: 1,
            skipped: false,
        };
        let event = Event {
            id: Uuid::new_v4(),
            stream_id: "job".to_string(),
            partition_id: 0,
            event_type: EventType::StepFailed,
            payload: serde_json::to_value(&payload).unwrap(),
            timestamp: Utc::now(),
            sequence: 3,
        };
        assert_eq!(event.payload_as::<StepFailedPayload>(), Some(payload));
        assert!(event.payload_as::<CompletedPayload>().is_none());
    }
}
