//! # Event Replicas
//!
//! In-memory replicas of the event log. Appends fan out to every replica in
//! its own task; the writer returns once the configured number of
//! acknowledgements arrive. Slow replicas keep their task and catch up in
//! the background.

use crate::config::WriteConsistency;
use crate::events::{Event, EventStoreError};
use crate::models::JobId;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct Replica {
    id: usize,
    log: Mutex<BTreeMap<(JobId, u64), Event>>,
    delay: Mutex<Duration>,
    available: AtomicBool,
}

impl Replica {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            log: Mutex::new(BTreeMap::new()),
            delay: Mutex::new(Duration::ZERO),
            available: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    async fn append(self: Arc<Self>, event: Event) -> Result<usize, EventStoreError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.available.load(Ordering::Acquire) {
            return Err(EventStoreError::ReplicaUnavailable { replica: self.id });
        }
        self.log
            .lock()
            .insert((event.stream_id.clone(), event.sequence), event);
        Ok(self.id)
    }

    /// Delay applied to every subsequent append
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn contains(&self, stream_id: &str, sequence: u64) -> bool {
        self.log.lock().contains_key(&(stream_id.to_string(), sequence))
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }

    fn remove_stream(&self, stream_id: &str) {
        self.log.lock().retain(|(stream, _), _| stream != stream_id);
    }
}

#[derive(Debug)]
pub struct ReplicaSet {
    replicas: Vec<Arc<Replica>>,
    consistency: WriteConsistency,
    ack_timeout: Duration,
}

impl ReplicaSet {
    pub fn new(replication_factor: usize, consistency: WriteConsistency, ack_timeout: Duration) -> Self {
        Self {
            replicas: (0..replication_factor)
                .map(|id| Arc::new(Replica::new(id)))
                .collect(),
            consistency,
            ack_timeout,
        }
    }

    pub fn required_acks(&self) -> usize {
        match self.consistency {
            WriteConsistency::Quorum => self.replicas.len() / 2 + 1,
            WriteConsistency::All => self.replicas.len(),
        }
    }

    pub fn replica(&self, id: usize) -> Option<&Arc<Replica>> {
        self.replicas.get(id)
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Write to every replica and wait for the required acknowledgements
    pub async fn replicate(&self, event: &Event) -> Result<usize, EventStoreError> {
        let required = self.required_acks();
        let mut pending: FuturesUnordered<_> = self
            .replicas
            .iter()
            .map(|replica| tokio::spawn(Arc::clone(replica).append(event.clone())))
            .collect();

        let mut acks = 0usize;
        let collect = async {
            while let Some(joined) = pending.next().await {
                match joined {
                    Ok(Ok(_)) => {
                        acks += 1;
                        if acks >= required {
                            break;
                        }
                    }
                    Ok(Err(e)) => debug!(error = %e, "📼 EVENTS: replica rejected append"),
                    Err(e) => warn!(error = %e, "📼 EVENTS: replica task failed"),
                }
            }
        };
        let _ = tokio::time::timeout(self.ack_timeout, collect).await;

        if acks >= required {
            Ok(acks)
        } else {
            warn!(
                stream_id = %event.stream_id,
                sequence = event.sequence,
                acks,
                required,
                "📼 EVENTS: replication quorum not reached"
            );
            Err(EventStoreError::QuorumNotReached {
                stream_id: event.stream_id.clone(),
                sequence: event.sequence,
                acks,
                required,
            })
        }
    }

    pub(crate) fn remove_stream(&self, stream_id: &str) {
        for replica in &self.replicas {
            replica.remove_stream(stream_id);
        }
    }
}
