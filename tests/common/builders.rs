//! Engine and job builders shared by the integration tests

use super::mock_steps::{CountingStep, SleepStep};
use serde_json::json;
use std::time::Duration;
use tasker_engine::config::EngineConfig;
use tasker_engine::models::{JobData, Priority};
use tasker_engine::orchestration::{ExecutionEngine, StepContext, StepRegistry};

/// Default configuration with a short re-queue delay
pub fn test_config(partitions: usize) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.partitions.count = partitions;
    config.recovery.requeue_delay_ms = 1;
    config
}

/// Registry with `noop`, `echo`, a counted step, and a slow step
pub fn standard_steps(counter: &CountingStep) -> StepRegistry {
    StepRegistry::new()
        .register_fn("noop", |_ctx: StepContext| async move { Ok(json!(null)) })
        .register_fn("echo", |ctx: StepContext| async move {
            Ok(json!({"job_id": ctx.job_id, "partition_id": ctx.partition_id}))
        })
        .register("counted", counter.clone())
        .register("slow", SleepStep::new(Duration::from_millis(50)))
}

pub fn build_engine(config: EngineConfig, steps: StepRegistry) -> ExecutionEngine {
    ExecutionEngine::builder()
        .config(config)
        .steps(steps)
        .build()
        .expect("test engine should build")
}

pub fn job(id: impl Into<String>, priority: Priority, steps: &[&str]) -> JobData {
    steps
        .iter()
        .fold(JobData::new(id, priority), |job, step| job.with_step(*step))
}
