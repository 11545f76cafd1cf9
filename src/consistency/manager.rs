//! # Consistency Manager
//!
//! Checkpoint lifecycle: create → wait (bounded poll) → verify → reconcile
//! when a partition is still behind → complete. Reconciliation replays the
//! event store's log into the diverging projections; state is never patched
//! ad hoc.

use crate::config::ConsistencyConfig;
use crate::consistency::{
    Checkpoint, CheckpointContext, ConsistencyError, ConsistencyReport, ConsistencyResult,
    WaitOptions,
};
use crate::events::EventStore;
use crate::models::PartitionId;
use crate::state_machine::{Projector, StateRegistry};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Checkpoint operations used by the engine
#[async_trait]
pub trait ConsistencyChecker: Send + Sync {
    fn create_checkpoint(&self, job_id: &str, context: CheckpointContext) -> Checkpoint;

    async fn wait_for_consistency(
        &self,
        checkpoint: &Checkpoint,
        options: WaitOptions,
    ) -> Result<ConsistencyReport, ConsistencyError>;

    async fn verify_consistency(
        &self,
        checkpoint: &Checkpoint,
    ) -> Result<ConsistencyReport, ConsistencyError>;

    async fn reconcile(&self, checkpoint: &Checkpoint) -> Result<ConsistencyReport, ConsistencyError>;
}

#[derive(Debug)]
pub struct ConsistencyManager {
    config: ConsistencyConfig,
    store: Arc<EventStore>,
    registry: Arc<StateRegistry>,
    checkpoints: DashMap<Uuid, Checkpoint>,
    created: AtomicU64,
    consistent_on_wait: AtomicU64,
    reconciled: AtomicU64,
    reconciliation_failures: AtomicU64,
    expired: AtomicU64,
}

impl ConsistencyManager {
    pub fn new(config: ConsistencyConfig, store: Arc<EventStore>, registry: Arc<StateRegistry>) -> Self {
        Self {
            config,
            store,
            registry,
            checkpoints: DashMap::new(),
            created: AtomicU64::new(0),
            consistent_on_wait: AtomicU64::new(0),
            reconciled: AtomicU64::new(0),
            reconciliation_failures: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ConsistencyConfig {
        &self.config
    }

    /// Full checkpoint cycle for a job: wait up to `max_wait`, reconcile on
    /// divergence, then destroy the checkpoint.
    pub async fn ensure_consistent(
        &self,
        job_id: &str,
        context: CheckpointContext,
    ) -> Result<ConsistencyReport, ConsistencyError> {
        let checkpoint = self.create_checkpoint(job_id, context);
        let outcome = self.settle(&checkpoint).await;
        self.complete_checkpoint(checkpoint.id);
        outcome
    }

    async fn settle(&self, checkpoint: &Checkpoint) -> Result<ConsistencyReport, ConsistencyError> {
        let report = self
            .wait_for_consistency(checkpoint, WaitOptions::new(self.config.max_wait()))
            .await?;
        if report.is_consistent() {
            return Ok(report);
        }
        self.reconcile(checkpoint).await
    }

    fn required_partitions(&self, checkpoint: &Checkpoint, options: Option<&WaitOptions>) -> BTreeSet<PartitionId> {
        options
            .and_then(|o| o.required_partitions.clone())
            .unwrap_or_else(|| checkpoint.involved_partitions.clone())
    }

    async fn diverging(
        &self,
        checkpoint: &Checkpoint,
        partitions: &BTreeSet<PartitionId>,
    ) -> Result<Vec<PartitionId>, ConsistencyError> {
        let mut diverging = Vec::new();
        for partition_id in partitions {
            let machine = self.registry.machine(*partition_id)?;
            let caught_up = machine
                .get_state(&checkpoint.job_id)
                .await
                .map(|state| state.sequence >= checkpoint.expected_sequence)
                .unwrap_or(false);
            if !caught_up {
                diverging.push(*partition_id);
            }
        }
        Ok(diverging)
    }

    fn record_result(&self, checkpoint: &Checkpoint, diverging: Vec<PartitionId>) -> ConsistencyReport {
        let result = if diverging.is_empty() {
            ConsistencyResult::Consistent
        } else {
            ConsistencyResult::Inconsistent
        };
        if let Some(mut stored) = self.checkpoints.get_mut(&checkpoint.id) {
            stored.consistency_result = result;
        }
        ConsistencyReport {
            checkpoint_id: checkpoint.id,
            job_id: checkpoint.job_id.clone(),
            result,
            diverging_partitions: diverging,
        }
    }

    pub fn get_checkpoint(&self, id: Uuid) -> Result<Checkpoint, ConsistencyError> {
        self.checkpoints
            .get(&id)
            .map(|c| c.clone())
            .ok_or(ConsistencyError::CheckpointNotFound { checkpoint_id: id })
    }

    /// Destroy a checkpoint once its job is settled
    pub fn complete_checkpoint(&self, id: Uuid) -> Option<Checkpoint> {
        self.checkpoints.remove(&id).map(|(_, checkpoint)| checkpoint)
    }

    pub fn active_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    /// Destroy checkpoints older than twice the wait bound
    pub fn sweep_expired(&self) -> usize {
        let limit = self.config.max_wait() * 2;
        let before = self.checkpoints.len();
        self.checkpoints
            .retain(|_, checkpoint| checkpoint.created_at.elapsed() <= limit);
        let swept = before.saturating_sub(self.checkpoints.len());
        if swept > 0 {
            self.expired.fetch_add(swept as u64, Ordering::Relaxed);
            warn!(swept, "🧮 CONSISTENCY: expired checkpoints destroyed");
        }
        swept
    }

    pub fn stats(&self) -> ConsistencyStats {
        ConsistencyStats {
            active_checkpoints: self.checkpoints.len(),
            created: self.created.load(Ordering::Relaxed),
            consistent_on_wait: self.consistent_on_wait.load(Ordering::Relaxed),
            reconciled: self.reconciled.load(Ordering::Relaxed),
            reconciliation_failures: self.reconciliation_failures.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl ConsistencyChecker for ConsistencyManager {
    fn create_checkpoint(&self, job_id: &str, context: CheckpointContext) -> Checkpoint {
        let checkpoint = Checkpoint {
            id: Uuid::new_v4(),
            job_id: job_id.to_string(),
            timestamp: Utc::now(),
            created_at: Instant::now(),
            involved_partitions: context.involved_partitions,
            expected_sequence: context.expected_sequence,
            expected_step: context.expected_step,
            consistency_result: ConsistencyResult::Pending,
        };
        self.checkpoints.insert(checkpoint.id, checkpoint.clone());
        self.created.fetch_add(1, Ordering::Relaxed);

        debug!(
            checkpoint_id = %checkpoint.id,
            job_id = %job_id,
            partitions = ?checkpoint.involved_partitions,
            expected_sequence = checkpoint.expected_sequence,
            "🧮 CONSISTENCY: checkpoint created"
        );
        checkpoint
    }

    async fn wait_for_consistency(
        &self,
        checkpoint: &Checkpoint,
        options: WaitOptions,
    ) -> Result<ConsistencyReport, ConsistencyError> {
        let required = self.required_partitions(checkpoint, Some(&options));
        let deadline = Instant::now() + options.max_wait_time;

        loop {
            let diverging = self.diverging(checkpoint, &required).await?;
            if diverging.is_empty() {
                self.consistent_on_wait.fetch_add(1, Ordering::Relaxed);
                return Ok(self.record_result(checkpoint, diverging));
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    checkpoint_id = %checkpoint.id,
                    job_id = %checkpoint.job_id,
                    diverging = ?diverging,
                    waited_ms = options.max_wait_time.as_millis() as u64,
                    "🧮 CONSISTENCY: wait bound reached"
                );
                return Ok(self.record_result(checkpoint, diverging));
            }

            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }

    async fn verify_consistency(
        &self,
        checkpoint: &Checkpoint,
    ) -> Result<ConsistencyReport, ConsistencyError> {
        let required = self.required_partitions(checkpoint, None);
        let diverging = self.diverging(checkpoint, &required).await?;
        Ok(self.record_result(checkpoint, diverging))
    }

    async fn reconcile(&self, checkpoint: &Checkpoint) -> Result<ConsistencyReport, ConsistencyError> {
        let before = self.verify_consistency(checkpoint).await?;
        if before.is_consistent() {
            return Ok(before);
        }

        info!(
            checkpoint_id = %checkpoint.id,
            job_id = %checkpoint.job_id,
            diverging = ?before.diverging_partitions,
            "🧮 CONSISTENCY: reconciling by log replay"
        );

        let (base, tail) = self.store.load_for_replay(&checkpoint.job_id).await?;
        for partition_id in &before.diverging_partitions {
            let machine = self.registry.machine(*partition_id)?;
            machine.replay(&checkpoint.job_id, base.clone(), &tail).await;
        }

        let after = self.verify_consistency(checkpoint).await?;
        if after.is_consistent() {
            self.reconciled.fetch_add(1, Ordering::Relaxed);
            info!(
                checkpoint_id = %checkpoint.id,
                job_id = %checkpoint.job_id,
                "🧮 CONSISTENCY: reconciled"
            );
            Ok(after)
        } else {
            self.reconciliation_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                checkpoint_id = %checkpoint.id,
                job_id = %checkpoint.job_id,
                diverging = ?after.diverging_partitions,
                "🧮 CONSISTENCY: reconciliation failed"
            );
            Err(ConsistencyError::ReconciliationFailed {
                job_id: checkpoint.job_id.clone(),
                partitions: after.diverging_partitions,
            })
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsistencyStats {
    pub active_checkpoints: usize,
    pub created: u64,
    pub consistent_on_wait: u64,
    pub reconciled: u64,
    pub reconciliation_failures: u64,
    pub expired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventStoreConfig;
    use crate::events::{Appender, EventType};
    use serde_json::json;
    use std::time::Duration;

    async fn fixture() -> (Arc<EventStore>, Arc<StateRegistry>, ConsistencyManager, u64) {
        let store = Arc::new(EventStore::new(EventStoreConfig::default()));
        let registry = Arc::new(StateRegistry::new(0..2));
        let manager = ConsistencyManager::new(
            ConsistencyConfig::default(),
            Arc::clone(&store),
            Arc::clone(&registry),
        );

        let stream = store.create_stream("job", 0).unwrap();
        stream.emit(EventType::Started, json!({})).await.unwrap();
        let last = stream
            .emit(EventType::StepCompleted, json!({"step_index": 0, "result": "ok"}))
            .await
            .unwrap();

        (store, registry, manager, last.sequence)
    }

    fn context(expected_sequence: u64) -> CheckpointContext {
        CheckpointContext {
            involved_partitions: [0, 1].into_iter().collect(),
            expected_sequence,
            expected_step: 1,
        }
    }

    #[tokio::test]
    async fn test_consistent_when_all_partitions_caught_up() {
        let (store, registry, manager, seq) = fixture().await;
        let state = store.projection("job").unwrap();
        for id in 0..2 {
            registry.update_state(id, "job", &state.delta()).unwrap();
        }

        let checkpoint = manager.create_checkpoint("job", context(seq));
        let report = manager
            .wait_for_consistency(&checkpoint, WaitOptions::new(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(report.is_consistent());
        assert_eq!(
            manager.get_checkpoint(checkpoint.id).unwrap().consistency_result,
            ConsistencyResult::Consistent
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_replays_into_lagging_partition() {
        let (store, registry, manager, seq) = fixture().await;
        registry
            .update_state(0, "job", &store.projection("job").unwrap().delta())
            .unwrap();

        let report = manager.ensure_consistent("job", context(seq)).await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(registry.machine(1).unwrap().sequence_of("job"), seq);
        assert_eq!(manager.active_checkpoints(), 0);
        assert_eq!(manager.stats().reconciled, 1);
    }

    #[tokio::test]
    async fn test_reconcile_fails_without_log() {
        let (_store, _registry, manager, _seq) = fixture().await;
        // Expect more than the log holds
        let checkpoint = manager.create_checkpoint("job", context(99));
        let err = manager.reconcile(&checkpoint).await.unwrap_err();
        assert!(matches!(err, ConsistencyError::ReconciliationFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired_checkpoints() {
        let (_store, _registry, manager, seq) = fixture().await;
        manager.create_checkpoint("job", context(seq));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(manager.sweep_expired(), 1);
        assert_eq!(manager.active_checkpoints(), 0);
    }
}
