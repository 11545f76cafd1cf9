//! # Execution Engine
//!
//! The master coordinator. Every job submitted through
//! [`ExecutionEngine::execute_job`] moves through these phases:
//!
//! ```text
//! Queued → PartitionSelected → SlotAcquired → LockAcquired → Executing
//!        → [ConsistencyPending →] Finalized | Failed
//! ```
//!
//! Resources are taken partition slot first, then pool permit, then the job's
//! distributed lock, and are released in reverse order on every exit path by
//! their guards. Failures are classified and either surfaced, re-queued (back
//! to `Queued`, possibly at a lower tier), or terminated; every outcome is
//! persisted to the job's event stream before the caller sees it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_engine::models::{JobData, Priority};
//! use tasker_engine::orchestration::{ExecutionEngine, StepContext, StepRegistry};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let steps = StepRegistry::new().register_fn("send_email", |ctx: StepContext| async move {
//!     Ok(json!({"delivered_to": ctx.params["to"]}))
//! });
//! let engine = ExecutionEngine::builder().steps(steps).build()?;
//!
//! let job = JobData::new("campaign-42", Priority::High)
//!     .with_step_params("send_email", json!({"to": "a@example.com"}));
//! let outcome = engine.execute_job(job).await?;
//! assert!(outcome.success);
//! # Ok(())
//! # }
//! ```

use crate::config::EngineConfig;
use crate::consistency::{CheckpointContext, ConsistencyManager};
use crate::constants::metrics;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::events::{
    CompletedPayload, Event, EventStore, EventStoreError, EventStream, EventType, FailedPayload,
    RetriedPayload, StartedPayload, StepCompletedPayload, StepFailedPayload,
};
use crate::events::Appender;
use crate::execution::ExecutionPools;
use crate::logging::{log_error, log_job_operation, log_partition_operation};
use crate::models::{JobData, JobId, JobOutcome, PartitionId, Priority, StepSpec};
use crate::orchestration::coordinator::{ConcurrencyCoordinator, LockOptions};
use crate::orchestration::error_classifier::{
    ErrorClassification, ErrorClassifier, ErrorContext, RecoveryAction, StandardErrorClassifier,
};
use crate::orchestration::metrics::{MetricsSink, TracingMetricsSink};
use crate::orchestration::status::{EngineStats, SystemStatus};
use crate::orchestration::step_handler::{StepContext, StepError, StepRegistry};
use crate::partition::{PartitionManager, PartitionMetrics, PartitionSlot, ResourcePartition};
use crate::resilience::CircuitState;
use crate::state_machine::{ExecutionPhase, JobLifecycle, PhaseEvent, Projector, StateRegistry};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Outcomes kept for the engine-wide error rate and p95 job latency
const JOB_METRICS_WINDOW: usize = 1_000;

#[derive(Debug)]
struct InFlightJob {
    priority: Priority,
    partition: Option<PartitionId>,
    attempt: u32,
    lifecycle: JobLifecycle,
    cancelled: Arc<AtomicBool>,
}

/// Removes the job from the in-flight table however execution ends
struct InFlightGuard {
    jobs: Arc<DashMap<JobId, InFlightJob>>,
    job_id: JobId,
    cancelled: Arc<AtomicBool>,
}

impl InFlightGuard {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.jobs.remove(&self.job_id);
    }
}

/// Per-submission bookkeeping carried across re-queues
#[derive(Debug)]
struct RunState {
    priority: Priority,
    attempt: u32,
    retries_used: u32,
    requeues_used: u32,
    partition: Option<PartitionId>,
    completed_steps: usize,
    /// Every partition holding a projection of this job
    touched: BTreeSet<PartitionId>,
}

impl RunState {
    fn new(priority: Priority) -> Self {
        Self {
            priority,
            attempt: 1,
            retries_used: 0,
            requeues_used: 0,
            partition: None,
            completed_steps: 0,
            touched: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Default)]
struct EngineCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
    cancelled: AtomicU64,
}

pub struct ExecutionEngine {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) partitions: Arc<PartitionManager>,
    pub(crate) pools: Arc<ExecutionPools>,
    pub(crate) coordinator: Arc<ConcurrencyCoordinator>,
    pub(crate) event_store: Arc<EventStore>,
    pub(crate) states: Arc<StateRegistry>,
    pub(crate) consistency: Arc<ConsistencyManager>,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    steps: StepRegistry,
    classifier: Arc<dyn ErrorClassifier>,
    in_flight: Arc<DashMap<JobId, InFlightJob>>,
    pub(crate) job_metrics: Mutex<PartitionMetrics>,
    counters: EngineCounters,
    pub(crate) shutdown: Arc<Notify>,
    pub(crate) maintenance_running: AtomicBool,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("partitions", &self.partitions.partition_count())
            .field("in_flight", &self.in_flight.len())
            .field("steps", &self.steps)
            .field("classifier", &self.classifier.classifier_name())
            .finish()
    }
}

impl ExecutionEngine {
    pub fn builder() -> ExecutionEngineBuilder {
        ExecutionEngineBuilder::default()
    }

    /// Run a job to completion or terminal failure
    #[instrument(skip(self, job), fields(job_id = %job.id, priority = %job.priority))]
    pub async fn execute_job(&self, job: JobData) -> EngineResult<JobOutcome> {
        self.validate(&job)?;

        if !self.coordinator.should_accept(job.priority) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .counter(metrics::JOBS_REJECTED, 1, &[("priority", job.priority.to_string())]);
            return Err(EngineError::AdmissionRejected {
                job_id: job.id.clone(),
                priority: job.priority,
                acceptance_rate: self.coordinator.backpressure().acceptance_rate(),
            });
        }

        let registration = self.register(&job)?;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .counter(metrics::JOBS_SUBMITTED, 1, &[("priority", job.priority.to_string())]);
        log_job_operation("submit", &job.id, None, "accepted", None);

        let started = Instant::now();
        let result = self.run_to_completion(&job, &registration).await;
        let elapsed = started.elapsed();
        drop(registration);

        self.job_metrics.lock().record(elapsed, result.is_ok());
        self.relieve_backpressure_if_idle();
        self.metrics.histogram(
            metrics::JOB_DURATION_MS,
            elapsed.as_secs_f64() * 1_000.0,
            &[("priority", job.priority.to_string())],
        );

        match &result {
            Ok(outcome) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                self.metrics.counter(metrics::JOBS_COMPLETED, 1, &[]);
                log_job_operation(
                    "complete",
                    &job.id,
                    Some(outcome.partition_id),
                    "completed",
                    None,
                );
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .counter(metrics::JOBS_FAILED, 1, &[("kind", e.kind().to_string())]);
                log_job_operation("complete", &job.id, None, "failed", Some(&e.to_string()));
            }
        }
        result
    }

    fn validate(&self, job: &JobData) -> EngineResult<()> {
        if job.id.trim().is_empty() {
            return Err(EngineError::InvalidJob {
                reason: "job id must not be empty".to_string(),
            });
        }
        if job.steps.is_empty() {
            return Err(EngineError::InvalidJob {
                reason: format!("job {} has no steps", job.id),
            });
        }
        if job.steps.len() > crate::constants::system::MAX_JOB_STEPS {
            return Err(EngineError::InvalidJob {
                reason: format!(
                    "job {} has {} steps, more than the {} allowed",
                    job.id,
                    job.steps.len(),
                    crate::constants::system::MAX_JOB_STEPS
                ),
            });
        }
        if let Some(step) = job.steps.iter().find(|s| s.name.trim().is_empty()) {
            return Err(EngineError::InvalidJob {
                reason: format!("job {} has a step without a name: {step:?}", job.id),
            });
        }
        if self.event_store.is_terminated(&job.id) {
            return Err(EngineError::DuplicateJob {
                job_id: job.id.clone(),
            });
        }
        Ok(())
    }

    /// A second submission of an in-flight id contends for the same lock
    fn register(&self, job: &JobData) -> EngineResult<InFlightGuard> {
        match self.in_flight.entry(job.id.clone()) {
            Entry::Occupied(existing) => {
                self.coordinator.locks().record_contention();
                warn!(job_id = %job.id, "🔒 LOCK: duplicate submission of in-flight job");
                Err(EngineError::LockContention {
                    key: job.id.clone(),
                    owner_partition: existing.get().partition,
                })
            }
            Entry::Vacant(slot) => {
                let cancelled = Arc::new(AtomicBool::new(false));
                slot.insert(InFlightJob {
                    priority: job.priority,
                    partition: None,
                    attempt: 1,
                    lifecycle: JobLifecycle::new(job.id.clone()),
                    cancelled: Arc::clone(&cancelled),
                });
                Ok(InFlightGuard {
                    jobs: Arc::clone(&self.in_flight),
                    job_id: job.id.clone(),
                    cancelled,
                })
            }
        }
    }

    async fn run_to_completion(
        &self,
        job: &JobData,
        registration: &InFlightGuard,
    ) -> EngineResult<JobOutcome> {
        let mut run = RunState::new(job.priority);

        loop {
            let error = match self.run_attempt(job, &mut run, registration).await {
                Ok(outcome) => return Ok(outcome),
                Err(error) => error,
            };

            self.advance(&job.id, PhaseEvent::Fail);
            let pool = self.pools.pool(run.priority);
            pool.record_failed();

            let context = ErrorContext {
                job_id: job.id.clone(),
                priority: run.priority,
                partition_id: run.partition,
                attempt_number: run.attempt,
                retries_used: run.retries_used,
                retry_limit: pool.retry_count(),
                requeues_used: run.requeues_used,
                max_requeues: self.config.recovery.max_requeues,
            };
            let classification = self.classifier.classify_error(&error, &context);
            log_error(
                "engine",
                "execute_job",
                &classification.error_message,
                Some(&format!(
                    "job_id={} attempt={} code={} action={:?}",
                    job.id, run.attempt, classification.error_code, classification.action
                )),
            );

            if classification.activate_backpressure {
                self.apply_backpressure();
            }
            if let Some(partition_id) = classification.open_circuit {
                self.isolate_partition(partition_id);
            }

            match classification.action {
                RecoveryAction::Surface => return Err(error),
                RecoveryAction::Terminate => return Err(self.terminate(job, &run, error).await),
                RecoveryAction::Requeue { priority } => {
                    if let Err(persist_error) =
                        self.requeue(job, &mut run, &classification, priority).await
                    {
                        return Err(self.terminate(job, &run, persist_error).await);
                    }
                    if let Some(delay) = classification.retry_delay {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        job: &JobData,
        run: &mut RunState,
        registration: &InFlightGuard,
    ) -> EngineResult<JobOutcome> {
        let mut slot = self.partitions.select_partition(&job.id, run.priority)?;
        let partition_id = slot.partition_id();
        run.partition = Some(partition_id);
        run.touched.insert(partition_id);
        self.note_partition(&job.id, partition_id);
        self.advance(&job.id, PhaseEvent::SelectPartition);

        let pool = self.pools.pool(run.priority);
        let _permit = pool.acquire().await?;
        self.advance(&job.id, PhaseEvent::AcquireSlot);

        let budget = pool.effective_timeout();
        let _lock = self.coordinator.lock_guard(
            &job.id,
            LockOptions::new(budget + self.config.coordinator.lock_ttl_margin())
                .with_partition(partition_id)
                .with_priority(run.priority),
        )?;
        self.advance(&job.id, PhaseEvent::AcquireLock);

        let mut stream = self
            .event_store
            .create_stream(&job.id, partition_id)
            .map_err(|e| match e {
                EventStoreError::StreamTerminated { .. } => EngineError::DuplicateJob {
                    job_id: job.id.clone(),
                },
                other => other.into(),
            })?;
        self.advance(&job.id, PhaseEvent::Execute);

        let execution = self.execute_steps(job, run, &mut slot, &mut stream, registration);
        match tokio::time::timeout(budget, execution).await {
            Ok(Ok(outcome)) => {
                pool.record_completed();
                Ok(outcome)
            }
            Ok(Err(error)) => Err(error),
            Err(_) => {
                pool.record_timeout();
                Err(EngineError::Timeout {
                    job_id: job.id.clone(),
                    timeout_ms: budget.as_millis() as u64,
                })
            }
        }
    }

    async fn execute_steps(
        &self,
        job: &JobData,
        run: &mut RunState,
        slot: &mut PartitionSlot,
        stream: &mut EventStream,
        registration: &InFlightGuard,
    ) -> EngineResult<JobOutcome> {
        // A re-queued job resumes after its last completed step
        let resumed = self.event_store.projection(&job.id);
        let resume_from = resumed.as_ref().map(|s| s.current_step).unwrap_or(0);
        let mut previous_result = resumed.and_then(|s| s.last_result);

        if job.cross_partition {
            let secondaries = self
                .partitions
                .select_secondaries(slot.partition_id(), self.config.recovery.cross_partition_fanout);
            run.touched.extend(secondaries);
        }

        if stream.len().await == 0 {
            let payload = to_payload(&StartedPayload {
                priority: run.priority,
                steps: job.steps.iter().map(|s| s.name.clone()).collect(),
                attempt: run.attempt,
            })?;
            let event = stream.emit(EventType::Started, payload).await?;
            self.project(&event, &run.touched);
        }

        for (index, step) in job.steps.iter().enumerate().skip(resume_from) {
            if registration.is_cancelled() {
                info!(job_id = %job.id, step_index = index, "🛑 ENGINE: cancelled between steps");
                return Err(EngineError::Cancelled {
                    job_id: job.id.clone(),
                });
            }
            self.relocate_if_needed(job, run, slot, stream)?;

            let partition = Arc::clone(slot.partition());
            let context = StepContext {
                job_id: job.id.clone(),
                step_name: step.name.clone(),
                step_index: index,
                partition_id: partition.id(),
                attempt: run.attempt,
                params: step.params.clone(),
                payload: job.payload.clone(),
                previous_result: previous_result.clone(),
            };

            // Results are cached until their StepCompleted event is durable, so
            // a step whose append failed is not run twice on this partition
            let cache_key = format!("{}#{index}", job.id);
            let (outcome, elapsed) = match partition.cache_get(&cache_key) {
                Some(cached) => {
                    debug!(
                        job_id = %job.id,
                        step = %step.name,
                        partition_id = partition.id(),
                        "♻️ ENGINE: reusing unpersisted step result"
                    );
                    (Ok(cached), Duration::ZERO)
                }
                None => {
                    let resources = partition.acquire_resources().await?;
                    let started = Instant::now();
                    let outcome = self.steps.execute(&context).await;
                    let elapsed = started.elapsed();
                    drop(resources);
                    partition.record_outcome(elapsed, outcome.is_ok());
                    if let Ok(result) = &outcome {
                        partition.cache_put(cache_key.clone(), result.clone());
                    }
                    (outcome, elapsed)
                }
            };

            match outcome {
                Ok(result) => {
                    let payload = to_payload(&StepCompletedPayload {
                        step_index: index,
                        step: step.name.clone(),
                        result: result.clone(),
                        attempt: run.attempt,
                    })?;
                    let event = stream.emit(EventType::StepCompleted, payload).await?;
                    partition.cache_remove(&cache_key);
                    self.project(&event, &run.touched);
                    run.completed_steps += 1;
                    previous_result = Some(result);
                }
                Err(step_error) => {
                    let error = self.step_failure(job, step, &partition, step_error, elapsed);
                    let payload = to_payload(&StepFailedPayload {
                        step_index: index,
                        step: step.name.clone(),
                        error: error.to_string(),
                        kind: error.kind(),
                        attempt: run.attempt,
                        skipped: step.optional,
                    })?;
                    let event = stream.emit(EventType::StepFailed, payload).await?;
                    self.project(&event, &run.touched);

                    if !step.optional {
                        return Err(error);
                    }
                    debug!(job_id = %job.id, step = %step.name, "⏭️ ENGINE: optional step failed, continuing");
                }
            }
        }

        let final_partition = slot.partition_id();
        if run.touched.len() > 1 {
            self.advance(&job.id, PhaseEvent::AwaitConsistency);
            let report = self
                .consistency
                .ensure_consistent(
                    &job.id,
                    CheckpointContext {
                        involved_partitions: run.touched.clone(),
                        expected_sequence: stream.len().await as u64,
                        expected_step: job.steps.len(),
                    },
                )
                .await?;
            if !report.is_consistent() {
                return Err(EngineError::ConsistencyViolation {
                    job_id: job.id.clone(),
                    partitions: report.diverging_partitions,
                });
            }
        }

        let result = previous_result.unwrap_or(Value::Null);
        let payload = to_payload(&CompletedPayload {
            result: result.clone(),
            completed_steps: run.completed_steps,
            attempts: run.attempt,
        })?;
        let event = stream.emit(EventType::Completed, payload).await?;
        self.project(&event, &run.touched);
        self.advance(&job.id, PhaseEvent::Finalize);

        Ok(JobOutcome {
            success: true,
            job_id: job.id.clone(),
            partition_id: final_partition,
            result,
            attempts: run.attempt,
            completed_steps: run.completed_steps,
            priority: run.priority,
        })
    }

    /// Map a step collaborator error onto the failure taxonomy. A failure
    /// that opened the partition's breaker is attributed to the partition.
    fn step_failure(
        &self,
        job: &JobData,
        step: &StepSpec,
        partition: &ResourcePartition,
        error: StepError,
        elapsed: Duration,
    ) -> EngineError {
        if partition.circuit_state() == CircuitState::Open {
            return EngineError::PartitionFailure {
                partition_id: partition.id(),
                reason: format!("circuit opened after step '{}' failed: {error}", step.name),
            };
        }
        match error {
            StepError::Timeout => EngineError::Timeout {
                job_id: job.id.clone(),
                timeout_ms: elapsed.as_millis() as u64,
            },
            StepError::Failed(reason) => EngineError::StepFailed {
                job_id: job.id.clone(),
                step: step.name.clone(),
                reason,
                retryable: true,
            },
            StepError::Permanent(reason) => EngineError::StepFailed {
                job_id: job.id.clone(),
                step: step.name.clone(),
                reason,
                retryable: false,
            },
        }
    }

    /// Between steps, move off a partition that has failed or that
    /// rebalancing asked to shed load
    fn relocate_if_needed(
        &self,
        job: &JobData,
        run: &mut RunState,
        slot: &mut PartitionSlot,
        stream: &mut EventStream,
    ) -> EngineResult<()> {
        let partition = Arc::clone(slot.partition());
        let failing = partition.circuit_state() == CircuitState::Open || !partition.is_healthy();
        if !failing && !partition.claim_shed() {
            return Ok(());
        }

        let from = partition.id();
        match self.partitions.migrate_slot(slot, run.priority) {
            Ok(to) => {
                stream.set_partition(to);
                run.partition = Some(to);
                run.touched.insert(to);
                self.note_partition(&job.id, to);
                log_partition_operation(
                    "migrate",
                    from,
                    "job_moved",
                    Some(&format!("job_id={} to={to}", job.id)),
                );
                Ok(())
            }
            Err(error) if failing => Err(EngineError::PartitionFailure {
                partition_id: from,
                reason: format!("no healthy partition to migrate to: {error}"),
            }),
            Err(error) => {
                debug!(job_id = %job.id, partition_id = from, error = %error, "⚖️ PARTITION: shed skipped");
                Ok(())
            }
        }
    }

    /// Push the job's projected state to the event's partition synchronously
    /// and to every other partition mirroring the job in the background
    fn project(&self, event: &Event, mirrors: &BTreeSet<PartitionId>) {
        let Some(state) = self.event_store.projection(&event.stream_id) else {
            return;
        };
        let delta = state.delta();

        if let Err(e) = self
            .states
            .update_state(event.partition_id, &event.stream_id, &delta)
        {
            warn!(job_id = %event.stream_id, error = %e, "🧭 STATE: primary projection failed");
        }

        for &mirror in mirrors.iter().filter(|&&p| p != event.partition_id) {
            let Ok(machine) = self.states.machine(mirror) else {
                continue;
            };
            let job_id = event.stream_id.clone();
            let delta = delta.clone();
            tokio::spawn(async move {
                machine.update_state(&job_id, delta).await;
            });
        }
    }

    async fn requeue(
        &self,
        job: &JobData,
        run: &mut RunState,
        classification: &ErrorClassification,
        priority: Priority,
    ) -> EngineResult<()> {
        if matches!(
            classification.kind,
            ErrorKind::ExternalSystemFailure | ErrorKind::Timeout
        ) {
            run.retries_used += 1;
        }
        run.requeues_used += 1;
        run.attempt += 1;
        run.priority = priority;

        let resume_from = self
            .event_store
            .projection(&job.id)
            .map(|s| s.current_step)
            .unwrap_or(0);
        let payload = to_payload(&RetriedPayload {
            attempt: run.attempt,
            reason: classification.error_message.clone(),
            kind: classification.kind,
            priority,
            resume_from,
        })?;
        let partition_id = self.bookkeeping_partition(job, run);
        self.record_event(&job.id, partition_id, EventType::Retried, payload, &run.touched)
            .await?;

        if let Some(mut entry) = self.in_flight.get_mut(&job.id) {
            entry.priority = priority;
            entry.attempt = run.attempt;
        }
        self.advance(&job.id, PhaseEvent::Requeue);
        self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        self.metrics.counter(
            metrics::JOBS_REQUEUED,
            1,
            &[("kind", classification.kind.to_string())],
        );
        info!(
            job_id = %job.id,
            attempt = run.attempt,
            %priority,
            resume_from,
            kind = %classification.kind,
            "🔁 ENGINE: job re-queued"
        );
        Ok(())
    }

    /// Persist the terminal failure and wrap the cause with job context
    async fn terminate(&self, job: &JobData, run: &RunState, error: EngineError) -> EngineError {
        if matches!(error, EngineError::Cancelled { .. }) {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }

        let partition_id = self.bookkeeping_partition(job, run);
        let persisted = match to_payload(&FailedPayload {
            error: error.to_string(),
            kind: error.kind(),
            attempts: run.attempt,
        }) {
            Ok(payload) => {
                self.record_event(&job.id, partition_id, EventType::Failed, payload, &run.touched)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(persist_error) = persisted {
            error!(
                job_id = %job.id,
                error = %persist_error,
                "📼 EVENTS: could not persist terminal failure"
            );
        }

        EngineError::JobFailed {
            job_id: job.id.clone(),
            attempts: run.attempt,
            partition_id: run.partition,
            source: Box::new(error),
        }
    }

    /// Append a recovery event outside an attempt. The job's lock is taken
    /// briefly so the stream still has a single writer.
    async fn record_event(
        &self,
        job_id: &str,
        partition_id: PartitionId,
        event_type: EventType,
        payload: Value,
        mirrors: &BTreeSet<PartitionId>,
    ) -> EngineResult<Option<Event>> {
        if event_type == EventType::Retried && !self.event_store.has_stream(job_id) {
            // Nothing ran yet; the retry leaves no trace to record against
            return Ok(None);
        }

        let _lock = self.coordinator.lock_guard(
            job_id,
            LockOptions::new(self.config.coordinator.lock_ttl_margin()).with_partition(partition_id),
        )?;
        let stream = match self.event_store.create_stream(job_id, partition_id) {
            Ok(stream) => stream,
            Err(EventStoreError::StreamTerminated { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if event_type == EventType::Retried && stream.len().await == 0 {
            return Ok(None);
        }

        let event = stream.emit(event_type, payload).await?;
        self.project(&event, mirrors);
        Ok(Some(event))
    }

    /// Partition to attribute out-of-attempt events to
    fn bookkeeping_partition(&self, job: &JobData, run: &RunState) -> PartitionId {
        run.partition
            .or_else(|| self.event_store.projection(&job.id).map(|s| s.partition_id))
            .unwrap_or_else(|| self.home_partition(&job.id))
    }

    fn home_partition(&self, job_id: &str) -> PartitionId {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        job_id.hash(&mut hasher);
        let count = self.partitions.partition_count().max(1) as u64;
        (hasher.finish() % count) as PartitionId
    }

    /// Reduce admission, inflate pool timeouts, and spread load
    pub(crate) fn apply_backpressure(&self) {
        let backpressure = self.coordinator.backpressure();
        if backpressure.activate() {
            self.pools
                .set_timeout_multiplier(backpressure.timeout_multiplier());
        }
        let report = self.partitions.rebalance();
        debug!(
            mean_load = report.mean_load,
            overloaded = report.overloaded.len(),
            "🚦 BACKPRESSURE: load redistribution requested"
        );
    }

    /// Lift backpressure once mean partition load falls below the relief
    /// threshold. Checked after every job and on each maintenance cycle.
    pub(crate) fn relieve_backpressure_if_idle(&self) -> bool {
        let backpressure = self.coordinator.backpressure();
        if !backpressure.is_active()
            || self.partitions.overall_load() >= backpressure.relief_threshold()
        {
            return false;
        }
        let relieved = backpressure.relieve();
        if relieved {
            self.pools.set_timeout_multiplier(1.0);
        }
        relieved
    }

    /// Open the partition's breaker, evacuate its jobs, and schedule a probe
    /// for when the recovery timeout elapses
    pub(crate) fn isolate_partition(&self, partition_id: PartitionId) {
        let Some(partition) = self.partitions.get_partition(partition_id) else {
            return;
        };
        if partition.circuit_state() != CircuitState::Open {
            partition.breaker().force_open();
        }
        let evacuating = self.partitions.migrate_jobs(partition_id);
        log_partition_operation(
            "isolate",
            partition_id,
            "circuit_open",
            Some(&format!("evacuating {} job(s)", evacuating.len())),
        );

        let recovery = partition.breaker().config().recovery_timeout();
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(recovery) => {
                    if partition.breaker().allows_traffic() {
                        info!(
                            partition_id = partition.id(),
                            state = %partition.circuit_state(),
                            "🟡 PARTITION: recovery probe admitted"
                        );
                    }
                }
                _ = shutdown.notified() => {}
            }
        });
    }

    fn advance(&self, job_id: &str, event: PhaseEvent) {
        if let Some(mut entry) = self.in_flight.get_mut(job_id) {
            if let Err(e) = entry.lifecycle.transition(event) {
                error!(job_id = %job_id, error = %e, "🔁 LIFECYCLE: rejected transition");
            }
        }
    }

    fn note_partition(&self, job_id: &str, partition_id: PartitionId) {
        if let Some(mut entry) = self.in_flight.get_mut(job_id) {
            entry.partition = Some(partition_id);
        }
    }

    /// Request cooperative cancellation; takes effect before the next step.
    /// Returns false if the job is not in flight.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        match self.in_flight.get(job_id) {
            Some(entry) => {
                entry.cancelled.store(true, Ordering::Release);
                info!(job_id = %job_id, "🛑 ENGINE: cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn job_phase(&self, job_id: &str) -> Option<ExecutionPhase> {
        self.in_flight.get(job_id).map(|entry| entry.lifecycle.phase())
    }

    pub fn active_jobs(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> EngineStats {
        let window = self.job_metrics.lock().clone();
        EngineStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            avg_job_ms: window.avg_execution_ms(),
            p95_job_ms: window.p95_latency_ms(),
            error_rate: window.error_rate(),
        }
    }

    pub fn get_system_status(&self) -> SystemStatus {
        let mut phases: BTreeMap<String, usize> = BTreeMap::new();
        for entry in self.in_flight.iter() {
            *phases.entry(entry.lifecycle.phase().to_string()).or_insert(0) += 1;
        }

        SystemStatus {
            generated_at: Utc::now(),
            version: crate::constants::system::ENGINE_VERSION.to_string(),
            maintenance_running: self.maintenance_running.load(Ordering::Acquire),
            active_jobs: self.in_flight.len(),
            phases,
            overall_load: self.partitions.overall_load(),
            partitions: self
                .partitions
                .get_partitions()
                .iter()
                .map(|p| p.status())
                .collect(),
            pools: self.pools.statuses(),
            coordinator: self.coordinator.status(),
            consistency: self.consistency.stats(),
            event_count: self.event_store.event_count(),
            stream_count: self.event_store.stream_count(),
            stats: self.stats(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn partitions(&self) -> &Arc<PartitionManager> {
        &self.partitions
    }

    pub fn pools(&self) -> &Arc<ExecutionPools> {
        &self.pools
    }

    pub fn coordinator(&self) -> &Arc<ConcurrencyCoordinator> {
        &self.coordinator
    }

    pub fn event_store(&self) -> &Arc<EventStore> {
        &self.event_store
    }

    pub fn state_registry(&self) -> &Arc<StateRegistry> {
        &self.states
    }

    pub fn consistency(&self) -> &Arc<ConsistencyManager> {
        &self.consistency
    }
}

fn to_payload<T: Serialize>(payload: &T) -> EngineResult<Value> {
    serde_json::to_value(payload).map_err(|e| EngineError::EventStore(EventStoreError::from(e)))
}

/// Assembles an [`ExecutionEngine`] from configuration and injected
/// collaborators. Anything not supplied falls back to a default built from
/// the configuration.
///
/// Backpressure is lifted as jobs finish. Partition health checks, snapshots
/// and log compaction only run from
/// [`ExecutionEngine::start_maintenance`] or
/// [`ExecutionEngine::run_maintenance_cycle`].
#[derive(Default)]
pub struct ExecutionEngineBuilder {
    config: Option<EngineConfig>,
    steps: StepRegistry,
    metrics: Option<Arc<dyn MetricsSink>>,
    event_store: Option<Arc<EventStore>>,
    classifier: Option<Arc<dyn ErrorClassifier>>,
}

impl ExecutionEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn steps(mut self, steps: StepRegistry) -> Self {
        self.steps = steps;
        self
    }

    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    pub fn event_store(mut self, store: Arc<EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    pub fn error_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn build(self) -> EngineResult<ExecutionEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let partitions = Arc::new(PartitionManager::from_config(&config));
        let states = Arc::new(StateRegistry::new(
            partitions.get_partitions().iter().map(|p| p.id()),
        ));
        let event_store = self
            .event_store
            .unwrap_or_else(|| Arc::new(EventStore::new(config.event_store.clone())));
        let consistency = Arc::new(ConsistencyManager::new(
            config.consistency.clone(),
            Arc::clone(&event_store),
            Arc::clone(&states),
        ));
        let classifier = self.classifier.unwrap_or_else(|| {
            Arc::new(StandardErrorClassifier::new(config.recovery.requeue_delay()))
        });

        info!(
            partitions = config.partitions.count,
            steps = ?self.steps.step_names(),
            classifier = classifier.classifier_name(),
            "🚀 ENGINE: execution engine built"
        );

        Ok(ExecutionEngine {
            pools: Arc::new(ExecutionPools::new(&config.pools)),
            coordinator: Arc::new(ConcurrencyCoordinator::new(config.backpressure.clone())),
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(TracingMetricsSink)),
            steps: self.steps,
            classifier,
            partitions,
            event_store,
            states,
            consistency,
            in_flight: Arc::new(DashMap::new()),
            job_metrics: Mutex::new(PartitionMetrics::new(JOB_METRICS_WINDOW)),
            counters: EngineCounters::default(),
            shutdown: Arc::new(Notify::new()),
            maintenance_running: AtomicBool::new(false),
            config: Arc::new(config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::metrics::InMemoryMetricsSink;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.partitions.count = 4;
        config.recovery.requeue_delay_ms = 1;
        config
    }

    fn echo_steps() -> StepRegistry {
        StepRegistry::new()
            .register_fn("fetch", |ctx: StepContext| async move {
                Ok(json!({"fetched": ctx.job_id}))
            })
            .register_fn("transform", |ctx: StepContext| async move {
                Ok(json!({"transformed": ctx.previous_result}))
            })
            .register_fn("deliver", |ctx: StepContext| async move {
                Ok(json!({"delivered": true, "step_index": ctx.step_index}))
            })
    }

    fn engine_with(steps: StepRegistry) -> ExecutionEngine {
        ExecutionEngine::builder()
            .config(test_config())
            .steps(steps)
            .build()
            .expect("engine should build")
    }

    fn three_step_job(id: &str, priority: Priority) -> JobData {
        JobData::new(id, priority)
            .with_step("fetch")
            .with_step("transform")
            .with_step("deliver")
    }

    #[tokio::test]
    async fn test_execute_job_runs_steps_in_order() {
        let engine = engine_with(echo_steps());

        let outcome = engine
            .execute_job(three_step_job("job-ok", Priority::Normal))
            .await
            .expect("job should succeed");

        assert!(outcome.success);
        assert_eq!(outcome.completed_steps, 3);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result, json!({"delivered": true, "step_index": 2}));

        let events = engine.event_store().read_stream("job-ok").await.unwrap();
        let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::Started,
                EventType::StepCompleted,
                EventType::StepCompleted,
                EventType::StepCompleted,
                EventType::Completed,
            ]
        );
        assert!(engine.event_store().is_terminated("job-ok"));
        assert_eq!(engine.active_jobs(), 0);
        assert_eq!(engine.partitions().total_active(), 0);
    }

    #[tokio::test]
    async fn test_resubmitting_finished_job_is_duplicate() {
        let engine = engine_with(echo_steps());
        engine
            .execute_job(three_step_job("job-dup", Priority::High))
            .await
            .unwrap();

        let err = engine
            .execute_job(three_step_job("job-dup", Priority::High))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateJob { .. }));
    }

    #[tokio::test]
    async fn test_invalid_jobs_are_rejected_before_admission() {
        let engine = engine_with(echo_steps());

        let err = engine
            .execute_job(JobData::new("no-steps", Priority::Normal))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidJob { .. }));

        let err = engine
            .execute_job(JobData::new("", Priority::Normal).with_step("fetch"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidJob { .. }));
        assert_eq!(engine.stats().submitted, 0);
    }

    #[tokio::test]
    async fn test_retryable_failure_resumes_from_failed_step() {
        let fetches = Arc::new(AtomicUsize::new(0));
        let flaky_calls = Arc::new(AtomicUsize::new(0));
        let steps = {
            let fetches = Arc::clone(&fetches);
            let flaky_calls = Arc::clone(&flaky_calls);
            StepRegistry::new()
                .register_fn("fetch", move |_ctx: StepContext| {
                    let fetches = Arc::clone(&fetches);
                    async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        Ok(json!("fetched"))
                    }
                })
                .register_fn("flaky", move |_ctx: StepContext| {
                    let flaky_calls = Arc::clone(&flaky_calls);
                    async move {
                        if flaky_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(StepError::Failed("upstream 503".to_string()))
                        } else {
                            Ok(json!("recovered"))
                        }
                    }
                })
        };
        let engine = engine_with(steps);

        let job = JobData::new("job-flaky", Priority::High)
            .with_step("fetch")
            .with_step("flaky");
        let outcome = engine.execute_job(job).await.expect("retry should succeed");

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result, json!("recovered"));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.stats().requeued, 1);

        let events = engine.event_store().read_stream("job-flaky").await.unwrap();
        let started = events
            .iter()
            .filter(|e| e.event_type == EventType::Started)
            .count();
        assert_eq!(started, 1);
        assert!(events.iter().any(|e| e.event_type == EventType::Retried));
    }

    #[tokio::test]
    async fn test_permanent_failure_terminates_with_failed_event() {
        let steps = StepRegistry::new().register_fn("reject", |_ctx: StepContext| async move {
            Err::<Value, _>(StepError::Permanent("malformed recipient".to_string()))
        });
        let engine = engine_with(steps);

        let err = engine
            .execute_job(JobData::new("job-bad", Priority::Critical).with_step("reject"))
            .await
            .unwrap_err();

        match &err {
            EngineError::JobFailed {
                attempts, source, ..
            } => {
                assert_eq!(*attempts, 1);
                assert!(matches!(
                    **source,
                    EngineError::StepFailed {
                        retryable: false,
                        ..
                    }
                ));
            }
            other => panic!("expected JobFailed, got {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::Generic);

        let events = engine.event_store().read_stream("job-bad").await.unwrap();
        assert_eq!(
            events.last().map(|e| e.event_type),
            Some(EventType::Failed)
        );
        assert!(engine.event_store().is_terminated("job-bad"));
        assert_eq!(engine.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_optional_step_failure_is_skipped() {
        let steps = echo_steps().register_fn("notify", |_ctx: StepContext| async move {
            Err::<Value, _>(StepError::Failed("webhook down".to_string()))
        });
        let engine = engine_with(steps);

        let job = JobData::new("job-optional", Priority::Normal)
            .with_step("fetch")
            .with_optional_step("notify")
            .with_step("deliver");
        let outcome = engine.execute_job(job).await.unwrap();

        assert_eq!(outcome.completed_steps, 2);
        assert_eq!(outcome.attempts, 1);
        let events = engine
            .event_store()
            .read_stream("job-optional")
            .await
            .unwrap();
        assert!(events.iter().any(|e| e.event_type == EventType::StepFailed));
    }

    #[tokio::test]
    async fn test_unknown_step_terminates_job() {
        let engine = engine_with(echo_steps());
        let err = engine
            .execute_job(JobData::new("job-unknown", Priority::Normal).with_step("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::JobFailed { .. }));
    }

    #[tokio::test]
    async fn test_admission_rejected_when_acceptance_is_zero() {
        let engine = engine_with(echo_steps());
        engine.coordinator().set_acceptance_rate(0.0);

        let err = engine
            .execute_job(three_step_job("job-throttled", Priority::Critical))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::AdmissionRejected { .. }));
        assert_eq!(engine.stats().rejected, 1);
        assert!(!engine.event_store().has_stream("job-throttled"));
    }

    #[tokio::test]
    async fn test_cross_partition_job_passes_checkpoint() {
        let engine = engine_with(echo_steps());
        let job = three_step_job("job-cross", Priority::High).cross_partition(true);

        let outcome = engine.execute_job(job).await.unwrap();

        assert!(outcome.success);
        let stats = engine.consistency().stats();
        assert_eq!(engine.consistency().active_checkpoints(), 0);
        assert_eq!(stats.created, 1);
    }

    #[tokio::test]
    async fn test_metrics_sink_receives_job_counters() {
        let sink = Arc::new(InMemoryMetricsSink::new());
        let engine = ExecutionEngine::builder()
            .config(test_config())
            .steps(echo_steps())
            .metrics_sink(sink.clone())
            .build()
            .unwrap();

        engine
            .execute_job(three_step_job("job-metered", Priority::Normal))
            .await
            .unwrap();

        assert_eq!(sink.counter_value(metrics::JOBS_COMPLETED), 1);
        let duration_key = format!("{}{{priority=normal}}", metrics::JOB_DURATION_MS);
        assert_eq!(sink.histogram_values(&duration_key).len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_returns_false() {
        let engine = engine_with(echo_steps());
        assert!(!engine.cancel_job("nope"));
        assert!(engine.job_phase("nope").is_none());
    }

    #[tokio::test]
    async fn test_system_status_reflects_completed_work() {
        let engine = engine_with(echo_steps());
        engine
            .execute_job(three_step_job("job-status", Priority::Normal))
            .await
            .unwrap();

        let status = engine.get_system_status();
        assert_eq!(status.active_jobs, 0);
        assert_eq!(status.partitions.len(), 4);
        assert_eq!(status.pools.len(), 4);
        assert_eq!(status.stats.completed, 1);
        assert_eq!(status.stream_count, 1);
        assert!(status.degraded_partitions().is_empty());
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = test_config();
        config.partitions.count = 0;
        let result = ExecutionEngine::builder().config(config).build();
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpersisted_step_result_is_reused_after_requeue() {
        let mut config = test_config();
        config.partitions.count = 1;
        config.event_store.replication_factor = 3;
        config.event_store.replica_ack_timeout_ms = 100;
        let store = Arc::new(EventStore::new(config.event_store.clone()));
        let calls = Arc::new(AtomicUsize::new(0));

        let steps = {
            let store = Arc::clone(&store);
            let calls = Arc::clone(&calls);
            StepRegistry::new().register_fn("charge", move |_ctx: StepContext| {
                let store = Arc::clone(&store);
                let calls = Arc::clone(&calls);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        // Two of three replicas miss the ack window for the next append only
                        for id in 1..3 {
                            if let Some(replica) = store.replicas().replica(id) {
                                replica.set_delay(Duration::from_secs(10));
                            }
                        }
                        let store = Arc::clone(&store);
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            for id in 1..3 {
                                if let Some(replica) = store.replicas().replica(id) {
                                    replica.set_delay(Duration::ZERO);
                                }
                            }
                        });
                    }
                    Ok(json!({"charged": true}))
                }
            })
        };
        let engine = ExecutionEngine::builder()
            .config(config)
            .steps(steps)
            .event_store(Arc::clone(&store))
            .build()
            .unwrap();

        let outcome = engine
            .execute_job(JobData::new("charge-once", Priority::Critical).with_step("charge"))
            .await
            .unwrap();

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result, json!({"charged": true}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let types: Vec<EventType> = store
            .read_stream("charge-once")
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
                EventType::StepCompleted,
                EventType::Completed,
            ]
        );
        assert_eq!(engine.partitions().get_partition(0).unwrap().cache_len(), 0);
    }

    #[tokio::test]
    async fn test_backpressure_lifts_when_jobs_finish() {
        let engine = engine_with(echo_steps());
        engine.apply_backpressure();
        assert!(engine.coordinator().backpressure().is_active());
        assert!(
            engine.pools().pool(Priority::Normal).effective_timeout()
                > engine.pools().pool(Priority::Normal).base_timeout()
        );

        // Critical work is boosted above the reduced acceptance rate
        engine
            .execute_job(three_step_job("job-relief", Priority::Critical))
            .await
            .unwrap();

        assert!(!engine.coordinator().backpressure().is_active());
        assert_eq!(engine.coordinator().backpressure().acceptance_rate(), 1.0);
        assert_eq!(
            engine.pools().pool(Priority::Normal).effective_timeout(),
            engine.pools().pool(Priority::Normal).base_timeout()
        );
    }
}
