//! # Concurrency Primitives
//!
//! Bounded-concurrency gates shared by execution pools and partition resources.

pub mod semaphore;

pub use semaphore::{Semaphore, SemaphoreError, SemaphorePermit};
