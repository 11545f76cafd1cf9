mod common;

use common::strategies::*;
use proptest::prelude::*;
use tasker_engine::config::{EngineConfig, SelectionConfig};
use tasker_engine::models::Priority;
use tasker_engine::partition::{scoring, PartitionManager};

proptest! {
    /// Property: a partition score always lands in [0, 1], whatever the weights
    #[test]
    fn partition_score_is_clamped(
        factors in score_factors_strategy(),
        weights in weights_strategy(),
        priority in priority_strategy(),
    ) {
        let score = scoring::score(&factors, &weights, &SelectionConfig::default(), priority);
        prop_assert!((0.0..=1.0).contains(&score), "score {} out of range", score);
    }

    /// Property: priority boosts never lower a partition's score
    #[test]
    fn boosts_are_monotonic(factors in score_factors_strategy(), weights in weights_strategy()) {
        let selection = SelectionConfig::default();
        let normal = scoring::score(&factors, &weights, &selection, Priority::Normal);
        let high = scoring::score(&factors, &weights, &selection, Priority::High);
        let critical = scoring::score(&factors, &weights, &selection, Priority::Critical);
        prop_assert!(high >= normal);
        prop_assert!(critical >= high);
    }

    /// Property: an open circuit is never selected, for any priority
    #[test]
    fn open_partitions_are_never_selected(
        open in prop::collection::btree_set(0u32..6, 0..5),
        priority in priority_strategy(),
        jobs in 1usize..30,
    ) {
        let mut config = EngineConfig::default();
        config.partitions.count = 6;
        config.partitions.circuit_breaker.recovery_timeout_ms = 3_600_000;
        let manager = PartitionManager::from_config(&config);
        for id in &open {
            manager.get_partition(*id).unwrap().breaker().force_open();
        }

        let mut slots = Vec::new();
        for n in 0..jobs {
            let slot = manager.select_partition(&format!("job-{n}"), priority).unwrap();
            prop_assert!(!open.contains(&slot.partition_id()));
            slots.push(slot);
        }
    }

    /// Property: selection never reserves past a partition's capacity
    #[test]
    fn capacity_is_never_exceeded(capacity in 1usize..8, jobs in 1usize..40) {
        let mut config = EngineConfig::default();
        config.partitions.count = 3;
        config.partitions.max_capacity = capacity;
        let manager = PartitionManager::from_config(&config);

        let mut slots = Vec::new();
        for n in 0..jobs {
            match manager.select_partition(&format!("job-{n}"), Priority::Normal) {
                Ok(slot) => slots.push(slot),
                Err(e) => prop_assert_eq!(e.kind(), tasker_engine::ErrorKind::ResourceExhaustion),
            }
        }
        prop_assert_eq!(slots.len(), jobs.min(capacity * 3));
        for partition in manager.get_partitions() {
            prop_assert!(partition.active_count() <= capacity);
        }
    }
}
