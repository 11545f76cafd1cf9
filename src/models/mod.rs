//! # Job Models
//!
//! Submission payloads, job records, and outcomes exchanged with callers.

pub mod job;

pub use job::{Job, JobData, JobId, JobOutcome, JobStatus, PartitionId, Priority, StepSpec};
