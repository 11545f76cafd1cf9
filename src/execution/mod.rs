//! # Execution Pools
//!
//! One bounded pool per priority tier. Priority is expressed by giving each
//! tier its own semaphore rather than by reordering a shared queue.

pub mod pool;

pub use pool::{ExecutionPool, ExecutionPools, PoolStatus};
