//! # Distributed State Machine
//!
//! One instance per partition, projecting that partition's job streams into
//! current state. Conflicts resolve last-write-wins by event sequence, never
//! by wall-clock time, and every update is idempotent under redelivery.

use crate::events::Event;
use crate::models::{JobId, PartitionId};
use crate::state_machine::{JobState, StateDelta};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Read/write access to a partition's projected state
#[async_trait]
pub trait Projector: Send + Sync {
    fn partition_id(&self) -> PartitionId;

    /// Apply a delta; returns false when it was stale or a duplicate
    async fn update_state(&self, job_id: &str, delta: StateDelta) -> bool;

    async fn get_state(&self, job_id: &str) -> Option<JobState>;

    /// Rebuild a job's state from `base` plus `events`, replacing whatever
    /// is currently projected
    async fn replay(&self, job_id: &str, base: Option<JobState>, events: &[Event]) -> JobState;
}

#[derive(Debug)]
pub struct DistributedStateMachine {
    partition_id: PartitionId,
    states: DashMap<JobId, JobState>,
    applied: AtomicU64,
    ignored: AtomicU64,
}

impl DistributedStateMachine {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            states: DashMap::new(),
            applied: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
        }
    }

    pub fn apply_delta(&self, job_id: &str, delta: &StateDelta) -> bool {
        let mut entry = self
            .states
            .entry(job_id.to_string())
            .or_insert_with(|| JobState::new(job_id, self.partition_id));

        let applied = delta.apply_to(&mut entry);
        if applied {
            self.applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            debug!(
                partition_id = self.partition_id,
                job_id = %job_id,
                delta_sequence = delta.sequence,
                current_sequence = entry.sequence,
                "🧭 STATE: stale delta ignored"
            );
        }
        applied
    }

    /// Fold a single event into the projection
    pub fn apply_event(&self, event: &Event) -> bool {
        let mut entry = self
            .states
            .entry(event.stream_id.clone())
            .or_insert_with(|| JobState::new(event.stream_id.clone(), self.partition_id));
        entry.apply(event)
    }

    pub fn replay_events(&self, job_id: &str, base: Option<JobState>, events: &[Event]) -> JobState {
        let start = base.unwrap_or_else(|| JobState::new(job_id, self.partition_id));
        let state = start.replay(events);
        self.states.insert(job_id.to_string(), state.clone());
        debug!(
            partition_id = self.partition_id,
            job_id = %job_id,
            sequence = state.sequence,
            "🧭 STATE: replayed from event log"
        );
        state
    }

    pub fn state(&self, job_id: &str) -> Option<JobState> {
        self.states.get(job_id).map(|s| s.clone())
    }

    pub fn sequence_of(&self, job_id: &str) -> u64 {
        self.states.get(job_id).map(|s| s.sequence).unwrap_or(0)
    }

    pub fn remove(&self, job_id: &str) -> Option<JobState> {
        self.states.remove(job_id).map(|(_, state)| state)
    }

    pub fn job_count(&self) -> usize {
        self.states.len()
    }

    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn ignored_count(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Projector for DistributedStateMachine {
    fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    async fn update_state(&self, job_id: &str, delta: StateDelta) -> bool {
        self.apply_delta(job_id, &delta)
    }

    async fn get_state(&self, job_id: &str) -> Option<JobState> {
        self.state(job_id)
    }

    async fn replay(&self, job_id: &str, base: Option<JobState>, events: &[Event]) -> JobState {
        self.replay_events(job_id, base, events)
    }
}
