//! Periodic upkeep for a running [`ExecutionEngine`]: metrics publication,
//! expired checkpoint and lock sweeps, backpressure relief, partition health,
//! snapshots and log compaction.

use crate::constants::metrics;
use crate::models::PartitionId;
use crate::orchestration::engine::ExecutionEngine;
use crate::resilience::CircuitState;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// What one maintenance cycle did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub expired_checkpoints: usize,
    pub expired_locks: usize,
    /// Partitions asked to shed load by rebalancing
    pub rebalanced: usize,
    pub backpressure_relieved: bool,
    pub marked_unhealthy: Vec<PartitionId>,
    pub restored: Vec<PartitionId>,
    pub snapshots_taken: usize,
    pub streams_compacted: usize,
}

impl ExecutionEngine {
    /// Start the background maintenance loop. Returns false if it is already
    /// running.
    #[instrument(skip(self))]
    pub fn start_maintenance(self: &Arc<Self>) -> bool {
        if self.maintenance_running.swap(true, Ordering::AcqRel) {
            warn!("🔧 MAINTENANCE: loop already running");
            return false;
        }

        let engine = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.maintenance.interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if !engine.maintenance_running.load(Ordering::Acquire) {
                            break;
                        }
                        let report = engine.run_maintenance_cycle();
                        debug!(?report, "🔧 MAINTENANCE: cycle complete");
                    }
                    _ = shutdown.notified() => {
                        info!("🔧 MAINTENANCE: loop shutting down");
                        break;
                    }
                }
            }
        });

        info!(interval_ms = interval.as_millis() as u64, "✅ MAINTENANCE: loop started");
        true
    }

    /// Run one maintenance pass immediately
    pub fn run_maintenance_cycle(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        self.publish_metrics();

        report.expired_checkpoints = self.consistency.sweep_expired();
        report.expired_locks = self.coordinator.locks().sweep_expired();
        report.rebalanced = self.partitions.rebalance().overloaded.len();

        report.backpressure_relieved = self.relieve_backpressure_if_idle();

        let health = &self.config.maintenance;
        for partition in self.partitions.get_partitions() {
            let window = partition.metrics();
            if partition.is_healthy() {
                if window.samples() >= health.min_samples
                    && window.error_rate() > health.unhealthy_error_rate
                {
                    partition.mark_unhealthy(&format!(
                        "error rate {:.2} over {} samples",
                        window.error_rate(),
                        window.samples()
                    ));
                    self.isolate_partition(partition.id());
                    report.marked_unhealthy.push(partition.id());
                }
            } else if partition.breaker().allows_traffic() {
                // The breaker's recovery timeout has passed; start over with a clean window
                partition.clear_metrics_window();
                partition.mark_healthy();
                report.restored.push(partition.id());
            }

            if partition.circuit_state() != CircuitState::Open {
                self.event_store.take_snapshot(partition.id());
                report.snapshots_taken += 1;
            }
        }

        let compacted = self
            .event_store
            .compact(self.event_store.config().retention());
        for job_id in &compacted {
            self.states.remove_job(job_id);
        }
        report.streams_compacted = compacted.len();

        if !report.marked_unhealthy.is_empty() || !report.restored.is_empty() {
            info!(
                unhealthy = ?report.marked_unhealthy,
                restored = ?report.restored,
                "🩺 MAINTENANCE: partition health changed"
            );
        }
        report
    }

    fn publish_metrics(&self) {
        let stats = self.stats();
        self.metrics
            .gauge(metrics::ACTIVE_JOBS, self.active_jobs() as f64, &[]);
        self.metrics.gauge(metrics::P95_LATENCY_MS, stats.p95_job_ms, &[]);
        self.metrics.gauge(metrics::ERROR_RATE, stats.error_rate, &[]);
        self.metrics.gauge(
            metrics::ACCEPTANCE_RATE,
            self.coordinator.backpressure().acceptance_rate(),
            &[],
        );
        self.metrics.gauge(
            metrics::PENDING_CHECKPOINTS,
            self.consistency.active_checkpoints() as f64,
            &[],
        );

        for partition in self.partitions.get_partitions() {
            let status = partition.status();
            let labels = [("partition", status.id.to_string())];
            self.metrics.gauge(metrics::PARTITION_LOAD, status.load, &labels);
            self.metrics
                .gauge(metrics::PARTITION_ERROR_RATE, status.error_rate, &labels);
            self.metrics
                .gauge(metrics::PARTITION_P95_LATENCY_MS, status.p95_latency_ms, &labels);
            self.metrics.gauge(
                metrics::PARTITION_UTILIZATION,
                status.resource_utilization,
                &labels,
            );
        }

        for pool in self.pools.statuses() {
            let labels = [("tier", pool.tier.to_string())];
            self.metrics
                .gauge(metrics::POOL_IN_USE, pool.in_use as f64, &labels);
            self.metrics
                .gauge(metrics::POOL_WAITING, pool.queue_depth as f64, &labels);
        }
    }

    /// Stop maintenance, cancel recovery probes, and close every pool to new
    /// work. In-flight jobs run to completion.
    #[instrument(skip(self))]
    pub fn shutdown(&self) {
        self.maintenance_running.store(false, Ordering::Release);
        self.shutdown.notify_waiters();
        self.pools.close();
        info!(in_flight = self.active_jobs(), "🛑 ENGINE: shutdown requested");
    }
}

#[cfg(test)]
mod tests {
    use crate::config::EngineConfig;
    use crate::constants::metrics;
    use crate::error::EngineError;
    use crate::models::{JobData, Priority};
    use crate::orchestration::metrics::InMemoryMetricsSink;
    use crate::orchestration::{ExecutionEngine, StepContext, StepRegistry};
    use crate::resilience::CircuitState;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine(sink: Arc<InMemoryMetricsSink>) -> ExecutionEngine {
        let mut config = EngineConfig::default();
        config.partitions.count = 3;
        config.maintenance.min_samples = 4;
        ExecutionEngine::builder()
            .config(config)
            .metrics_sink(sink)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_cycle_publishes_gauges_and_snapshots() {
        let sink = Arc::new(InMemoryMetricsSink::new());
        let engine = engine(sink.clone());

        let report = engine.run_maintenance_cycle();

        assert_eq!(report.snapshots_taken, 3);
        assert!(report.marked_unhealthy.is_empty());
        assert_eq!(sink.gauge_value(metrics::ACTIVE_JOBS), Some(0.0));
        let key = format!("{}{{partition=0}}", metrics::PARTITION_LOAD);
        assert_eq!(sink.gauge_value(&key), Some(0.0));
    }

    #[tokio::test]
    async fn test_failing_partition_is_marked_unhealthy_and_isolated() {
        let engine = engine(Arc::new(InMemoryMetricsSink::new()));
        let partition = engine.partitions().get_partition(1).unwrap();
        for _ in 0..4 {
            partition.record_outcome(Duration::from_millis(5), false);
        }

        let report = engine.run_maintenance_cycle();

        assert_eq!(report.marked_unhealthy, vec![1]);
        assert!(!partition.is_healthy());
        assert_eq!(partition.circuit_state(), CircuitState::Open);
        assert!(engine.get_system_status().degraded_partitions().contains(&1));
    }

    #[tokio::test]
    async fn test_backpressure_relieved_when_load_drops() {
        let engine = engine(Arc::new(InMemoryMetricsSink::new()));
        engine.apply_backpressure();
        assert!(engine.coordinator().backpressure().is_active());

        let report = engine.run_maintenance_cycle();

        assert!(report.backpressure_relieved);
        assert!(!engine.coordinator().backpressure().is_active());
    }

    #[tokio::test]
    async fn test_start_maintenance_is_idempotent() {
        let engine = Arc::new(engine(Arc::new(InMemoryMetricsSink::new())));
        assert!(engine.start_maintenance());
        assert!(!engine.start_maintenance());
        assert!(engine.get_system_status().maintenance_running);

        engine.shutdown();
        assert!(!engine.get_system_status().maintenance_running);
    }

    #[tokio::test]
    async fn test_compaction_releases_finished_jobs() {
        let mut config = EngineConfig::default();
        config.partitions.count = 2;
        config.event_store.retention_secs = 0;
        let engine = ExecutionEngine::builder()
            .config(config)
            .steps(StepRegistry::new().register_fn("noop", |_ctx: StepContext| async move {
                Ok(json!(null))
            }))
            .build()
            .unwrap();

        for n in 0..5 {
            engine
                .execute_job(JobData::new(format!("done-{n}"), Priority::High).with_step("noop"))
                .await
                .unwrap();
        }
        let tracked = |engine: &ExecutionEngine| -> usize {
            let registry = engine.state_registry();
            registry
                .partition_ids()
                .filter_map(|id| registry.machine(id).ok())
                .map(|machine| machine.job_count())
                .sum()
        };
        assert_eq!(tracked(&engine), 5);

        let report = engine.run_maintenance_cycle();
        assert_eq!(report.streams_compacted, 5);
        assert_eq!(tracked(&engine), 0);
        assert_eq!(engine.event_store().stream_count(), 0);
        assert!(engine.event_store().projection("done-0").is_none());

        // The next snapshots no longer carry the compacted jobs
        engine.run_maintenance_cycle();
        for id in 0..2 {
            let snapshot = engine.event_store().latest_snapshot(id).unwrap();
            assert!(snapshot.states.is_empty());
        }

        let err = engine
            .execute_job(JobData::new("done-3", Priority::High).with_step("noop"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateJob { .. }));
    }
}
