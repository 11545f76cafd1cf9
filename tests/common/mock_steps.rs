//! Step collaborators with scripted behaviour

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasker_engine::models::PartitionId;
use tasker_engine::orchestration::{Step, StepContext, StepError};
use tokio::sync::{mpsc, Notify};

/// Succeeds and counts its invocations
#[derive(Debug, Clone, Default)]
pub struct CountingStep {
    calls: Arc<AtomicUsize>,
}

impl CountingStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step for CountingStep {
    async fn execute(&self, context: &StepContext) -> Result<Value, StepError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({"call": n, "step_index": context.step_index}))
    }
}

/// Sleeps, then succeeds
#[derive(Debug, Clone)]
pub struct SleepStep {
    delay: Duration,
}

impl SleepStep {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Step for SleepStep {
    async fn execute(&self, _context: &StepContext) -> Result<Value, StepError> {
        tokio::time::sleep(self.delay).await;
        Ok(json!({"slept_ms": self.delay.as_millis() as u64}))
    }
}

/// Fails the first `failures` calls, then succeeds
#[derive(Debug, Clone)]
pub struct FlakyStep {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyStep {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Step for FlakyStep {
    async fn execute(&self, _context: &StepContext) -> Result<Value, StepError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(StepError::Failed(format!("scripted failure {}", n + 1)))
        } else {
            Ok(json!("recovered"))
        }
    }
}

/// Reports the partition it runs on, then blocks until opened
#[derive(Debug, Clone)]
pub struct GateStep {
    entered: mpsc::UnboundedSender<PartitionId>,
    release: Arc<Notify>,
}

impl GateStep {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PartitionId>) {
        let (entered, rx) = mpsc::unbounded_channel();
        let step = Self {
            entered,
            release: Arc::new(Notify::new()),
        };
        (step, rx)
    }

    pub fn open(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl Step for GateStep {
    async fn execute(&self, context: &StepContext) -> Result<Value, StepError> {
        let _ = self.entered.send(context.partition_id);
        self.release.notified().await;
        Ok(json!({"gated_on": context.partition_id}))
    }
}

/// Always fails without retry
#[derive(Debug, Clone, Default)]
pub struct RejectStep;

#[async_trait]
impl Step for RejectStep {
    async fn execute(&self, _context: &StepContext) -> Result<Value, StepError> {
        Err(StepError::Permanent("rejected by downstream".to_string()))
    }
}
