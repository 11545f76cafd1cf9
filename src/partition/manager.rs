//! # Partition Manager
//!
//! Owns the fixed set of resource partitions and chooses one per job.
//!
//! Selection ranks every selectable partition by weighted score, then applies
//! a priority-specific strategy over the ranking:
//! - **critical**: best-available partitions (low load, fully available) first
//! - **high**: load-aware round robin
//! - **normal / low**: weighted-random among the top candidates, proportional
//!   to score, to avoid every job herding onto the same partition
//!
//! The strategy only orders candidates; reservations are attempted in that
//! order so a full partition never fails a job that another partition could
//! take.

use crate::config::{EngineConfig, PartitionConfig, ScoringWeights, SelectionConfig};
use crate::error::{EngineError, EngineResult};
use crate::models::{JobId, PartitionId, Priority};
use crate::partition::scoring::{self, PartitionScore, ScoreFactors};
use crate::partition::{PartitionSlot, ResourcePartition};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Load above the mean beyond which a partition is asked to shed jobs
const REBALANCE_TOLERANCE: f64 = 0.2;

type Candidate = (Arc<ResourcePartition>, PartitionScore);

#[derive(Debug)]
pub struct PartitionManager {
    partitions: RwLock<Vec<Arc<ResourcePartition>>>,
    weights: RwLock<ScoringWeights>,
    selection: SelectionConfig,
    round_robin: AtomicUsize,
}

impl PartitionManager {
    pub fn new(weights: ScoringWeights, selection: SelectionConfig) -> Self {
        Self {
            partitions: RwLock::new(Vec::new()),
            weights: RwLock::new(weights),
            selection,
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Build a manager with `partitions.count` identical partitions
    pub fn from_config(config: &EngineConfig) -> Self {
        let manager = Self::new(config.scoring.clone(), config.selection.clone());
        for _ in 0..config.partitions.count {
            manager.add_partition(&config.partitions);
        }
        info!(
            partitions = config.partitions.count,
            capacity = config.partitions.max_capacity,
            "🎯 PARTITION: manager initialized"
        );
        manager
    }

    /// Add a partition; ids are assigned densely from 0
    pub fn add_partition(&self, config: &PartitionConfig) -> Arc<ResourcePartition> {
        let mut partitions = self.partitions.write();
        let id = partitions.len() as PartitionId;
        let partition = Arc::new(ResourcePartition::new(id, config));
        partitions.push(Arc::clone(&partition));
        debug!(partition_id = id, capacity = config.max_capacity, "🎯 PARTITION: added");
        partition
    }

    pub fn get_partitions(&self) -> Vec<Arc<ResourcePartition>> {
        self.partitions.read().clone()
    }

    pub fn get_partition(&self, id: PartitionId) -> Option<Arc<ResourcePartition>> {
        self.partitions.read().get(id as usize).cloned()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn weights(&self) -> ScoringWeights {
        self.weights.read().clone()
    }

    pub fn set_weights(&self, weights: ScoringWeights) {
        *self.weights.write() = weights;
    }

    /// Scores of every selectable partition, best first
    pub fn score_partitions(&self, priority: Priority) -> Vec<PartitionScore> {
        self.rank_candidates(priority, &[])
            .into_iter()
            .map(|(_, score)| score)
            .collect()
    }

    fn rank_candidates(&self, priority: Priority, exclude: &[PartitionId]) -> Vec<Candidate> {
        let weights = self.weights.read().clone();
        let mut ranked: Vec<Candidate> = self
            .get_partitions()
            .into_iter()
            .filter(|p| !exclude.contains(&p.id()) && p.is_selectable())
            .map(|p| {
                let factors =
                    ScoreFactors::for_partition(&p, self.selection.performance_ceiling_ms);
                let score = PartitionScore {
                    partition_id: p.id(),
                    score: scoring::score(&factors, &weights, &self.selection, priority),
                    factors,
                };
                (p, score)
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.1.score
                .total_cmp(&a.1.score)
                .then(a.1.partition_id.cmp(&b.1.partition_id))
        });
        ranked
    }

    fn order_for_priority(&self, priority: Priority, ranked: Vec<Candidate>) -> Vec<Candidate> {
        match priority {
            Priority::Critical => self.best_available_order(ranked),
            Priority::High => self.round_robin_order(ranked),
            Priority::Normal | Priority::Low => self.weighted_random_order(ranked),
        }
    }

    fn best_available_order(&self, ranked: Vec<Candidate>) -> Vec<Candidate> {
        let (mut preferred, rest): (Vec<_>, Vec<_>) = ranked.into_iter().partition(|(_, s)| {
            s.factors.utilization() < self.selection.critical_max_load
                && s.factors.availability > self.selection.critical_min_availability
        });
        preferred.sort_by(|a, b| {
            b.1.factors
                .availability
                .total_cmp(&a.1.factors.availability)
                .then(a.1.factors.utilization().total_cmp(&b.1.factors.utilization()))
        });
        preferred.extend(rest);
        preferred
    }

    fn round_robin_order(&self, mut ranked: Vec<Candidate>) -> Vec<Candidate> {
        if ranked.is_empty() {
            return ranked;
        }
        ranked.sort_by_key(|(_, s)| s.partition_id);
        let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % ranked.len();
        ranked.rotate_left(start);

        let (mut light, heavy): (Vec<_>, Vec<_>) = ranked
            .into_iter()
            .partition(|(_, s)| s.factors.utilization() < self.selection.high_max_load);
        light.extend(heavy);
        light
    }

    fn weighted_random_order(&self, mut ranked: Vec<Candidate>) -> Vec<Candidate> {
        let k = self.selection.top_candidates.max(1).min(ranked.len());
        let rest = ranked.split_off(k);
        let mut top = ranked;
        let mut rng = rand::thread_rng();
        let mut ordered = Vec::with_capacity(top.len() + rest.len());

        while !top.is_empty() {
            let total: f64 = top.iter().map(|(_, s)| s.score).sum();
            let index = if total <= 0.0 {
                rng.gen_range(0..top.len())
            } else {
                let mut pick = rng.gen::<f64>() * total;
                let mut chosen = top.len() - 1;
                for (i, (_, s)) in top.iter().enumerate() {
                    if pick < s.score {
                        chosen = i;
                        break;
                    }
                    pick -= s.score;
                }
                chosen
            };
            ordered.push(top.remove(index));
        }

        ordered.extend(rest);
        ordered
    }

    /// Select and reserve a partition for a job
    pub fn select_partition(&self, job_id: &str, priority: Priority) -> EngineResult<PartitionSlot> {
        self.select_partition_excluding(job_id, priority, &[])
    }

    pub fn select_partition_excluding(
        &self,
        job_id: &str,
        priority: Priority,
        exclude: &[PartitionId],
    ) -> EngineResult<PartitionSlot> {
        let ranked = self.rank_candidates(priority, exclude);
        if ranked.is_empty() {
            warn!(job_id = %job_id, %priority, "🎯 PARTITION: no selectable partition");
            return Err(EngineError::NoAvailablePartition {
                job_id: job_id.to_string(),
                reason: "every partition is circuit-broken or unhealthy".to_string(),
                all_circuit_open: true,
            });
        }

        for (partition, score) in self.order_for_priority(priority, ranked) {
            if let Some(slot) = partition.try_reserve(job_id) {
                debug!(
                    job_id = %job_id,
                    %priority,
                    partition_id = score.partition_id,
                    score = score.score,
                    "🎯 PARTITION: selected"
                );
                return Ok(slot);
            }
        }

        Err(EngineError::NoAvailablePartition {
            job_id: job_id.to_string(),
            reason: "every selectable partition is at capacity".to_string(),
            all_circuit_open: false,
        })
    }

    /// Best-scoring selectable partitions other than `primary`, without
    /// reserving capacity on them
    pub fn select_secondaries(&self, primary: PartitionId, count: usize) -> Vec<PartitionId> {
        self.rank_candidates(Priority::Normal, &[primary])
            .into_iter()
            .take(count)
            .map(|(_, score)| score.partition_id)
            .collect()
    }

    /// Move a job's reservation onto another partition. The new slot is
    /// reserved before the old one is released, so the job is never without
    /// capacity.
    pub fn migrate_slot(&self, slot: &mut PartitionSlot, priority: Priority) -> EngineResult<PartitionId> {
        let from = slot.partition_id();
        let replacement = self.select_partition_excluding(slot.job_id(), priority, &[from])?;
        let to = replacement.partition_id();
        let old = std::mem::replace(slot, replacement);
        drop(old);

        info!(job_id = %slot.job_id(), from, to, "🚚 PARTITION: job migrated");
        Ok(to)
    }

    pub fn jobs_on(&self, partition_id: PartitionId) -> Vec<JobId> {
        self.get_partition(partition_id)
            .map(|p| p.active_job_ids())
            .unwrap_or_default()
    }

    /// Ask every job on a failed partition to move. Running jobs pick this up
    /// between steps and migrate through [`Self::migrate_slot`].
    pub fn migrate_jobs(&self, from: PartitionId) -> Vec<JobId> {
        let Some(partition) = self.get_partition(from) else {
            return Vec::new();
        };
        let jobs = partition.active_job_ids();
        partition.set_shed_budget(jobs.len());
        if !jobs.is_empty() {
            info!(partition_id = from, jobs = jobs.len(), "🚚 PARTITION: evacuation requested");
        }
        jobs
    }

    /// Ask partitions loaded well above the mean to shed jobs. Shedding is
    /// cooperative: running jobs migrate between steps.
    pub fn rebalance(&self) -> RebalanceReport {
        let partitions: Vec<_> = self
            .get_partitions()
            .into_iter()
            .filter(|p| p.is_selectable())
            .collect();

        if partitions.is_empty() {
            return RebalanceReport::default();
        }

        let mean_load = partitions.iter().map(|p| p.load()).sum::<f64>() / partitions.len() as f64;
        let mut overloaded = Vec::new();

        for partition in &partitions {
            let excess = partition.load() - mean_load;
            if excess > REBALANCE_TOLERANCE {
                let shed = (excess * partition.max_capacity() as f64).floor() as usize;
                partition.set_shed_budget(shed);
                overloaded.push((partition.id(), shed));
            } else {
                partition.set_shed_budget(0);
            }
        }

        if !overloaded.is_empty() {
            info!(mean_load, overloaded = ?overloaded, "⚖️ PARTITION: rebalancing requested");
        }

        RebalanceReport {
            mean_load,
            overloaded,
        }
    }

    pub fn total_active(&self) -> usize {
        self.partitions.read().iter().map(|p| p.active_count()).sum()
    }

    /// Active jobs over total capacity across all partitions
    pub fn overall_load(&self) -> f64 {
        let partitions = self.partitions.read();
        let capacity: usize = partitions.iter().map(|p| p.max_capacity()).sum();
        if capacity == 0 {
            return 0.0;
        }
        partitions.iter().map(|p| p.active_count()).sum::<usize>() as f64 / capacity as f64
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebalanceReport {
    pub mean_load: f64,
    /// (partition, jobs asked to shed)
    pub overloaded: Vec<(PartitionId, usize)>,
}
