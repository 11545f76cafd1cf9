//! # Resilience Module
//!
//! Fault isolation for partitions. Each resource partition owns one circuit
//! breaker; the partition manager refuses to route work through an open
//! circuit, and the maintenance loop probes open circuits back to health.
//!
//! ```rust
//! use tasker_engine::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//!
//! let breaker = CircuitBreaker::new("partition-0".to_string(), CircuitBreakerConfig::default());
//! for _ in 0..5 {
//!     breaker.record_failure(std::time::Duration::from_millis(3));
//! }
//! assert_eq!(breaker.state(), CircuitState::Open);
//! ```

pub mod circuit_breaker;
pub mod metrics;

pub use crate::config::CircuitBreakerConfig;
pub use circuit_breaker::{Admission, CircuitBreaker, CircuitState};
pub use metrics::CircuitBreakerMetrics;
