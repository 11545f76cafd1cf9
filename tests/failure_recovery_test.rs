//! Failure paths driven end to end through `execute_job`: pool timeouts,
//! partition isolation and evacuation, capacity exhaustion, and health
//! recovery through maintenance

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tasker_engine::events::EventType;
use tasker_engine::models::{PartitionId, Priority};
use tasker_engine::orchestration::StepRegistry;
use tasker_engine::resilience::CircuitState;
use tasker_engine::{EngineError, ErrorKind};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

async fn entered(rx: &mut UnboundedReceiver<PartitionId>) -> PartitionId {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("gate step should start")
        .expect("gate channel open")
}

#[tokio::test(start_paused = true)]
async fn test_pool_timeout_retries_then_terminates() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    info!("🧪 High-tier job outlives its one-second pool budget on every attempt");

    let mut config = test_config(2);
    config.pools.high.timeout_secs = 1;
    let steps = StepRegistry::new().register("stall", SleepStep::new(Duration::from_secs(5)));
    let engine = build_engine(config, steps);

    let started = tokio::time::Instant::now();
    let err = engine
        .execute_job(job("stalled", Priority::High, &["stall"]))
        .await
        .unwrap_err();

    // High allows two retries: three attempts, each cut off at the budget
    match &err {
        EngineError::JobFailed {
            attempts, source, ..
        } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**source, EngineError::Timeout { timeout_ms: 1_000, .. }));
        }
        other => panic!("expected JobFailed, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(5));

    let types: Vec<EventType> = engine
        .event_store()
        .read_stream("stalled")
        .await
        .unwrap()
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            EventType::Started,
            EventType::Retried,
            EventType::Retried,
            EventType::Failed,
        ]
    );
    assert!(engine.event_store().is_terminated("stalled"));

    let pool = engine.pools().pool(Priority::High).status();
    assert_eq!(pool.timed_out, 3);
    assert_eq!(pool.in_use, 0);
    assert_eq!(engine.partitions().total_active(), 0);
    assert_eq!(engine.coordinator().status().active_locks, 0);
}

#[tokio::test]
async fn test_partition_failure_isolates_and_evacuates() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (hold_a, mut a_entered) = GateStep::new();
    let (hold_b, mut b_entered) = GateStep::new();
    let steps = StepRegistry::new()
        .register("hold_a", hold_a.clone())
        .register("hold_b", hold_b.clone())
        .register("flaky", FlakyStep::new(1))
        .register_fn("echo", |ctx: tasker_engine::orchestration::StepContext| async move {
            Ok(json!({"partition_id": ctx.partition_id}))
        });

    let mut config = test_config(2);
    config.partitions.circuit_breaker.failure_threshold = 1;
    config.partitions.circuit_breaker.recovery_timeout_ms = 3_600_000;
    let engine = Arc::new(build_engine(config, steps));

    // Keep partition 1 out of selection until both jobs sit on partition 0
    let standby = engine.partitions().get_partition(1).unwrap();
    standby.mark_unhealthy("held back until both jobs land on partition 0");

    let job_a = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .execute_job(job("evac-a", Priority::High, &["hold_a", "echo"]))
                .await
        })
    };
    assert_eq!(entered(&mut a_entered).await, 0);

    let job_b = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .execute_job(job("evac-b", Priority::High, &["hold_b", "flaky"]))
                .await
        })
    };
    assert_eq!(entered(&mut b_entered).await, 0);
    standby.mark_healthy();

    // The flaky step trips partition 0's breaker; the job moves to partition 1
    hold_b.open();
    let outcome_b = job_b.await.unwrap().unwrap();
    assert_eq!(outcome_b.attempts, 2);
    assert_eq!(outcome_b.partition_id, 1);

    let failed = engine.partitions().get_partition(0).unwrap();
    assert_eq!(failed.circuit_state(), CircuitState::Open);
    assert!(engine
        .get_system_status()
        .degraded_partitions()
        .contains(&0));

    let b_events = engine.event_store().read_stream("evac-b").await.unwrap();
    let step_failed = b_events
        .iter()
        .find(|e| e.event_type == EventType::StepFailed)
        .expect("flaky failure recorded");
    assert_eq!(step_failed.partition_id, 0);
    assert_eq!(step_failed.payload["kind"], json!("PARTITION_FAILURE"));

    // Job A was mid-flight on the isolated partition and relocates before its next step
    hold_a.open();
    let outcome_a = job_a.await.unwrap().unwrap();
    assert_eq!(outcome_a.attempts, 1);
    assert_eq!(outcome_a.partition_id, 1);
    assert_eq!(outcome_a.result["partition_id"], json!(1));

    let a_events = engine.event_store().read_stream("evac-a").await.unwrap();
    let partitions: Vec<(EventType, PartitionId)> = a_events
        .iter()
        .map(|e| (e.event_type, e.partition_id))
        .collect();
    assert_eq!(
        partitions,
        vec![
            (EventType::Started, 0),
            (EventType::StepCompleted, 0),
            (EventType::StepCompleted, 1),
            (EventType::Completed, 1),
        ]
    );
    assert_eq!(failed.active_count(), 0);
}

#[tokio::test]
async fn test_capacity_exhaustion_requeues_at_low_under_backpressure() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (hold, mut hold_entered) = GateStep::new();
    let counter = CountingStep::new();
    let steps = standard_steps(&counter).register("hold", hold.clone());

    let mut config = test_config(1);
    config.partitions.max_capacity = 1;
    config.recovery.requeue_delay_ms = 10;
    config.recovery.max_requeues = 100;
    let reduced_rate = config.backpressure.reduced_acceptance_rate;
    let engine = Arc::new(build_engine(config, steps));

    let holder = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .execute_job(job("slot-holder", Priority::Normal, &["hold"]))
                .await
        })
    };
    entered(&mut hold_entered).await;

    let squeezed = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .execute_job(job("squeezed", Priority::High, &["counted"]))
                .await
        })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while !engine.coordinator().backpressure().is_active() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("capacity exhaustion should activate backpressure");

    assert_eq!(engine.coordinator().backpressure().acceptance_rate(), reduced_rate);
    let critical = engine.pools().pool(Priority::Critical);
    assert!(critical.effective_timeout() > critical.base_timeout());
    assert!(engine.stats().requeued >= 1);
    assert_eq!(counter.calls(), 0);

    hold.open();
    holder.await.unwrap().unwrap();
    let outcome = squeezed.await.unwrap().unwrap();

    assert_eq!(outcome.priority, Priority::Low);
    assert!(outcome.attempts >= 2);
    assert_eq!(counter.calls(), 1);

    // Load is back to zero, so the finished jobs lifted backpressure
    assert!(!engine.coordinator().backpressure().is_active());
    assert_eq!(critical.effective_timeout(), critical.base_timeout());
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_isolates_and_restores_failing_partition() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let counter = CountingStep::new();
    let steps = standard_steps(&counter).register("reject", RejectStep);

    let mut config = test_config(1);
    config.partitions.circuit_breaker.failure_threshold = 100;
    config.partitions.circuit_breaker.recovery_timeout_ms = 1_000;
    config.maintenance.min_samples = 4;
    let engine = build_engine(config, steps);
    let partition = engine.partitions().get_partition(0).unwrap();

    for n in 0..4 {
        let err = engine
            .execute_job(job(format!("rejected-{n}"), Priority::Critical, &["reject"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Generic);
    }
    assert_eq!(partition.circuit_state(), CircuitState::Closed);
    assert_eq!(partition.metrics().error_rate(), 1.0);

    let report = engine.run_maintenance_cycle();
    assert_eq!(report.marked_unhealthy, vec![0]);
    assert!(!partition.is_healthy());
    assert_eq!(partition.circuit_state(), CircuitState::Open);

    let err = engine
        .execute_job(job("while-isolated", Priority::Critical, &["echo"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartitionFailure);
    assert_eq!(counter.calls(), 0);

    // Before the recovery timeout nothing changes
    let report = engine.run_maintenance_cycle();
    assert!(report.restored.is_empty());

    tokio::time::advance(Duration::from_secs(1)).await;
    let report = engine.run_maintenance_cycle();
    assert_eq!(report.restored, vec![0]);
    assert!(partition.is_healthy());
    assert_eq!(partition.circuit_state(), CircuitState::HalfOpen);
    assert_eq!(partition.metrics().samples(), 0);

    let outcome = engine
        .execute_job(job("after-recovery", Priority::Critical, &["counted"]))
        .await
        .unwrap();
    assert_eq!(outcome.partition_id, 0);
    assert_eq!(partition.circuit_state(), CircuitState::Closed);
    assert!(engine.get_system_status().degraded_partitions().is_empty());
}
