//! # Event Store
//!
//! Append-only, replicated log of per-job events. Each job owns one stream
//! whose sequence numbers increase strictly from 1; streams are the sole
//! source of truth for reconstructing job state.

pub mod publisher;
pub mod replica;
pub mod store;
pub mod types;

pub use publisher::EventPublisher;
pub use replica::{Replica, ReplicaSet};
pub use store::{Appender, EventStore, EventStream};
pub use types::{
    CompletedPayload, Event, EventType, FailedPayload, RetriedPayload, Snapshot,
    StartedPayload, StepCompletedPayload, StepFailedPayload,
};

use crate::models::JobId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("Event stream {stream_id} not found")]
    StreamNotFound { stream_id: JobId },

    #[error("Event stream {stream_id} is terminated")]
    StreamTerminated { stream_id: JobId },

    #[error("Event {next} cannot follow {previous:?} in stream {stream_id}")]
    InvalidEventOrder {
        stream_id: JobId,
        previous: Option<EventType>,
        next: EventType,
    },

    #[error("Replication quorum not reached for {stream_id}#{sequence}: {acks}/{required} acks")]
    QuorumNotReached {
        stream_id: JobId,
        sequence: u64,
        acks: usize,
        required: usize,
    },

    #[error("Replica {replica} unavailable")]
    ReplicaUnavailable { replica: usize },

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
