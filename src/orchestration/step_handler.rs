//! # Step Collaborators
//!
//! The engine never interprets what a step does. Each step name maps to an
//! implementation of [`Step`] registered explicitly at startup; the engine
//! calls it once per step attempt and records the outcome as events.

use crate::models::{JobId, PartitionId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    /// Transient failure; the job may be retried
    #[error("{0}")]
    Failed(String),

    /// The step can never succeed for this input
    #[error("permanent: {0}")]
    Permanent(String),

    #[error("step timed out")]
    Timeout,
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Everything a step implementation sees about the job it runs for
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_id: JobId,
    pub step_name: String,
    pub step_index: usize,
    pub partition_id: PartitionId,
    pub attempt: u32,
    pub params: Value,
    pub payload: Value,
    /// Result of the most recent successful step
    pub previous_result: Option<Value>,
}

#[async_trait]
pub trait Step: Send + Sync {
    async fn execute(&self, context: &StepContext) -> Result<Value, StepError>;
}

/// Adapter turning an async closure into a [`Step`]
pub struct FnStep<F> {
    f: F,
}

impl<F> FnStep<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    async fn execute(&self, context: &StepContext) -> Result<Value, StepError> {
        (self.f)(context.clone()).await
    }
}

/// Named step implementations plus an optional fallback for unknown names
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
    fallback: Option<Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, step: impl Step + 'static) -> Self {
        self.steps.insert(name.into(), Arc::new(step));
        self
    }

    pub fn register_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        self.register(name, FnStep::new(f))
    }

    pub fn with_fallback(mut self, step: impl Step + 'static) -> Self {
        self.fallback = Some(Arc::new(step));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name) || self.fallback.is_some()
    }

    pub fn step_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.steps.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn execute(&self, context: &StepContext) -> Result<Value, StepError> {
        let step = self
            .steps
            .get(&context.step_name)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                StepError::Permanent(format!("no step registered as '{}'", context.step_name))
            })?;
        step.execute(context).await
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.step_names())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(step_name: &str) -> StepContext {
        StepContext {
            job_id: "job".to_string(),
            step_name: step_name.to_string(),
            step_index: 0,
            partition_id: 0,
            attempt: 1,
            params: json!({"to": "a@example.com"}),
            payload: Value::Null,
            previous_result: None,
        }
    }

    #[tokio::test]
    async fn test_registered_step_runs() {
        let registry = StepRegistry::new().register_fn("send_email", |ctx: StepContext| async move {
            Ok(json!({"sent_to": ctx.params["to"]}))
        });

        let result = registry.execute(&context("send_email")).await.unwrap();
        assert_eq!(result, json!({"sent_to": "a@example.com"}));
    }

    #[tokio::test]
    async fn test_unknown_step_is_permanent() {
        let registry = StepRegistry::new();
        let err = registry.execute(&context("missing")).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_fallback_handles_unknown_names() {
        let registry = StepRegistry::new()
            .with_fallback(FnStep::new(|ctx: StepContext| async move { Ok(json!(ctx.step_name)) }));
        assert!(registry.contains("anything"));
        assert_eq!(
            registry.execute(&context("anything")).await.unwrap(),
            json!("anything")
        );
    }
}
