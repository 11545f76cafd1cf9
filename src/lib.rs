#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

//! # Tasker Engine
//!
//! A partitioned, priority-aware execution engine for long-running jobs.
//!
//! ## Overview
//!
//! Jobs are ordered lists of named steps. The engine spreads them across
//! isolated resource partitions, bounds concurrency per priority tier, and
//! records every step as an event so that an interrupted job resumes where
//! it stopped and a terminal job is never run twice.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - The execution engine, coordinator, and error classifier
//! - [`partition`] - Resource partitions, health scoring, and selection
//! - [`execution`] - Priority-tiered execution pools
//! - [`concurrency`] - Async counting semaphore with FIFO waiters
//! - [`resilience`] - Per-partition circuit breakers
//! - [`events`] - Append-only event log with replication and snapshots
//! - [`state_machine`] - Job lifecycle and per-partition state projections
//! - [`consistency`] - Cross-partition checkpoint verification
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Structured error handling and the failure taxonomy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tasker_engine::models::{JobData, Priority};
//! use tasker_engine::orchestration::{ExecutionEngine, StepContext, StepRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! tasker_engine::logging::init_structured_logging();
//!
//! let steps = StepRegistry::new()
//!     .register_fn("render", |_ctx: StepContext| async move { Ok(serde_json::json!("ok")) });
//! let engine = Arc::new(ExecutionEngine::builder().steps(steps).build()?);
//! engine.start_maintenance();
//!
//! let outcome = engine
//!     .execute_job(JobData::new("job-1", Priority::Normal).with_step("render"))
//!     .await?;
//! println!("finished on partition {}", outcome.partition_id);
//!
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod concurrency;
pub mod config;
pub mod constants;
pub mod consistency;
pub mod error;
pub mod events;
pub mod execution;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod partition;
pub mod resilience;
pub mod state_machine;

pub use config::{ConfigManager, EngineConfig};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use models::{JobData, JobId, JobOutcome, PartitionId, Priority};
pub use orchestration::{ExecutionEngine, ExecutionEngineBuilder, SystemStatus};
