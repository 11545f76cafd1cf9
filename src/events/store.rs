//! # Event Store Implementation
//!
//! Appends are serialized per stream: the stream's lock is held from sequence
//! assignment through replication, so sequence order equals append order and
//! no gaps can appear. Different streams append concurrently.
//!
//! Every `snapshot_interval` events appended on a partition, the store
//! snapshots the projected state of that partition's jobs. Replay for a job
//! starts from the latest snapshot that covers it.

use crate::config::EventStoreConfig;
use crate::events::{Event, EventPublisher, EventStoreError, EventType, ReplicaSet, Snapshot};
use crate::models::{JobId, PartitionId};
use crate::state_machine::JobState;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Narrow append interface handed to execution code
#[async_trait]
pub trait Appender: Send + Sync {
    fn stream_id(&self) -> &str;

    async fn emit(&self, event_type: EventType, payload: Value) -> Result<Event, EventStoreError>;
}

#[derive(Debug)]
struct StreamLog {
    events: Vec<Event>,
}

impl StreamLog {
    fn last_type(&self) -> Option<EventType> {
        self.events.last().map(|e| e.event_type)
    }
}

#[derive(Debug, Clone)]
struct StreamProjection {
    partition_id: PartitionId,
    state: JobState,
    terminated_at: Option<Instant>,
}

#[derive(Debug)]
pub struct EventStore {
    config: EventStoreConfig,
    streams: DashMap<JobId, Arc<Mutex<StreamLog>>>,
    projections: DashMap<JobId, StreamProjection>,
    /// Jobs whose stream and projection were dropped by compaction
    compacted: DashSet<JobId>,
    partition_counts: DashMap<PartitionId, u64>,
    snapshots: DashMap<PartitionId, Snapshot>,
    replicas: ReplicaSet,
    publisher: EventPublisher,
    total_events: AtomicU64,
}

impl EventStore {
    pub fn new(config: EventStoreConfig) -> Self {
        info!(
            replication_factor = config.replication_factor,
            write_consistency = ?config.write_consistency,
            snapshot_interval = config.snapshot_interval,
            "📼 EVENTS: event store initialized"
        );
        Self {
            replicas: ReplicaSet::new(
                config.replication_factor,
                config.write_consistency,
                config.replica_ack_timeout(),
            ),
            publisher: EventPublisher::new(config.publisher_capacity),
            streams: DashMap::new(),
            projections: DashMap::new(),
            compacted: DashSet::new(),
            partition_counts: DashMap::new(),
            snapshots: DashMap::new(),
            total_events: AtomicU64::new(0),
            config,
        }
    }

    /// Open the job's stream, creating it if needed. A re-queued job reopens
    /// its existing stream on whichever partition now runs it.
    pub fn create_stream(
        self: &Arc<Self>,
        job_id: &str,
        partition_id: PartitionId,
    ) -> Result<EventStream, EventStoreError> {
        if self.is_terminated(job_id) {
            return Err(EventStoreError::StreamTerminated {
                stream_id: job_id.to_string(),
            });
        }

        let log = self
            .streams
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(StreamLog { events: Vec::new() })))
            .clone();

        Ok(EventStream {
            store: Arc::clone(self),
            job_id: job_id.to_string(),
            partition_id,
            log,
        })
    }

    async fn append(
        &self,
        log: &Mutex<StreamLog>,
        job_id: &str,
        partition_id: PartitionId,
        event_type: EventType,
        payload: Value,
    ) -> Result<Event, EventStoreError> {
        let mut log = log.lock().await;

        let previous = log.last_type();
        if previous.map(|p| p.is_terminal()).unwrap_or(false) {
            return Err(EventStoreError::StreamTerminated {
                stream_id: job_id.to_string(),
            });
        }
        if !EventType::may_follow(previous, event_type) {
            return Err(EventStoreError::InvalidEventOrder {
                stream_id: job_id.to_string(),
                previous,
                next: event_type,
            });
        }

        let event = Event {
            id: Uuid::new_v4(),
            stream_id: job_id.to_string(),
            partition_id,
            event_type,
            payload,
            timestamp: Utc::now(),
            sequence: log.events.len() as u64 + 1,
        };

        self.replicas.replicate(&event).await?;
        log.events.push(event.clone());
        drop(log);

        self.project(&event);
        self.total_events.fetch_add(1, Ordering::Relaxed);

        let partition_total = {
            let mut count = self.partition_counts.entry(partition_id).or_insert(0);
            *count += 1;
            *count
        };
        if partition_total % self.config.snapshot_interval.max(1) == 0 {
            self.take_snapshot(partition_id);
        }

        debug!(
            stream_id = %event.stream_id,
            sequence = event.sequence,
            event_type = %event.event_type,
            partition_id,
            "📼 EVENTS: appended"
        );
        self.publisher.publish(event.clone());
        Ok(event)
    }

    fn project(&self, event: &Event) {
        let mut entry = self
            .projections
            .entry(event.stream_id.clone())
            .or_insert_with(|| StreamProjection {
                partition_id: event.partition_id,
                state: JobState::new(event.stream_id.clone(), event.partition_id),
                terminated_at: None,
            });
        entry.partition_id = event.partition_id;
        entry.state.apply(event);
        if event.event_type.is_terminal() {
            entry.terminated_at = Some(Instant::now());
        }
    }

    pub async fn read_stream(&self, job_id: &str) -> Result<Vec<Event>, EventStoreError> {
        let log = self
            .streams
            .get(job_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EventStoreError::StreamNotFound {
                stream_id: job_id.to_string(),
            })?;
        let events = log.lock().await.events.clone();
        Ok(events)
    }

    pub fn has_stream(&self, job_id: &str) -> bool {
        self.streams.contains_key(job_id)
    }

    pub fn is_terminated(&self, job_id: &str) -> bool {
        self.compacted.contains(job_id)
            || self
                .projections
                .get(job_id)
                .map(|p| p.terminated_at.is_some())
                .unwrap_or(false)
    }

    /// Current projected state of a job, as folded from its stream
    pub fn projection(&self, job_id: &str) -> Option<JobState> {
        self.projections.get(job_id).map(|p| p.state.clone())
    }

    /// Streams whose latest event was written on `partition_id`
    pub fn stream_ids(&self, partition_id: PartitionId) -> Vec<JobId> {
        self.projections
            .iter()
            .filter(|p| p.partition_id == partition_id)
            .map(|p| p.key().clone())
            .collect()
    }

    pub fn take_snapshot(&self, partition_id: PartitionId) -> Snapshot {
        let states: HashMap<JobId, JobState> = self
            .projections
            .iter()
            .filter(|p| p.partition_id == partition_id)
            .map(|p| (p.key().clone(), p.state.clone()))
            .collect();

        let snapshot = Snapshot {
            partition_id,
            taken_at: Utc::now(),
            partition_event_count: self
                .partition_counts
                .get(&partition_id)
                .map(|c| *c)
                .unwrap_or(0),
            states,
        };

        debug!(
            partition_id,
            jobs = snapshot.states.len(),
            events = snapshot.partition_event_count,
            "📸 EVENTS: snapshot taken"
        );
        self.snapshots.insert(partition_id, snapshot.clone());
        snapshot
    }

    pub fn latest_snapshot(&self, partition_id: PartitionId) -> Option<Snapshot> {
        self.snapshots.get(&partition_id).map(|s| s.clone())
    }

    /// Starting state plus the events to fold over it. The base comes from
    /// the newest snapshot holding the job; without one, replay starts from
    /// the first event.
    pub async fn load_for_replay(
        &self,
        job_id: &str,
    ) -> Result<(Option<JobState>, Vec<Event>), EventStoreError> {
        let events = self.read_stream(job_id).await?;

        let base = self
            .snapshots
            .iter()
            .filter_map(|s| s.states.get(job_id).cloned())
            .max_by_key(|state| state.sequence);

        let after = base.as_ref().map(|s| s.sequence).unwrap_or(0);
        let tail = events.into_iter().filter(|e| e.sequence > after).collect();
        Ok((base, tail))
    }

    /// Drop terminated streams older than `retention` whose final state is
    /// held by a snapshot, along with their projections. Returns the ids of
    /// the jobs removed; they still report as terminated.
    pub fn compact(&self, retention: Duration) -> Vec<JobId> {
        let candidates: Vec<(JobId, PartitionId, u64)> = self
            .projections
            .iter()
            .filter(|p| {
                p.terminated_at
                    .map(|at| at.elapsed() >= retention)
                    .unwrap_or(false)
            })
            .map(|p| (p.key().clone(), p.partition_id, p.state.sequence))
            .collect();

        let mut removed = Vec::new();
        for (job_id, partition_id, sequence) in candidates {
            let covered = self
                .snapshots
                .get(&partition_id)
                .map(|s| s.covers(&job_id, sequence))
                .unwrap_or(false);
            if !covered {
                continue;
            }
            self.compacted.insert(job_id.clone());
            self.projections.remove(&job_id);
            self.streams.remove(&job_id);
            self.replicas.remove_stream(&job_id);
            removed.push(job_id);
        }

        if !removed.is_empty() {
            info!(removed = removed.len(), "🗜️ EVENTS: compacted terminated streams");
        }
        removed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.publisher.subscribe()
    }

    pub fn event_count(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn replicas(&self) -> &ReplicaSet {
        &self.replicas
    }

    pub fn config(&self) -> &EventStoreConfig {
        &self.config
    }
}

/// Append handle for one job's stream
#[derive(Debug, Clone)]
pub struct EventStream {
    store: Arc<EventStore>,
    job_id: JobId,
    partition_id: PartitionId,
    log: Arc<Mutex<StreamLog>>,
}

impl EventStream {
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Subsequent events are attributed to `partition_id`
    pub fn set_partition(&mut self, partition_id: PartitionId) {
        self.partition_id = partition_id;
    }

    pub async fn last_event_type(&self) -> Option<EventType> {
        self.log.lock().await.last_type()
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.events.len()
    }
}

#[async_trait]
impl Appender for EventStream {
    fn stream_id(&self) -> &str {
        &self.job_id
    }

    async fn emit(&self, event_type: EventType, payload: Value) -> Result<Event, EventStoreError> {
        self.store
            .append(&self.log, &self.job_id, self.partition_id, event_type, payload)
            .await
    }
}
