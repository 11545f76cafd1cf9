//! # Circuit Breaker Implementation
//!
//! Three-state breaker guarding a resource partition:
//! Closed (normal operation), Open (excluded from selection), and Half-Open
//! (accepting trial work after the recovery timeout).
//!
//! Transitions:
//! - Closed → Open after `failure_threshold` consecutive failures
//! - Open → Half-Open once `recovery_timeout` has elapsed since opening
//! - Half-Open → Closed after `success_threshold` successes
//! - Half-Open → Open on any failure
//!
//! While half-open, at most one trial admission is outstanding. It is claimed
//! with [`CircuitBreaker::try_admit`] and resolved by the next recorded outcome
//! or by [`CircuitBreaker::release_probe`].
//!
//! Time is read from `tokio::time::Instant` so paused-clock tests can drive
//! recovery deterministically.

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation
    Closed = 0,
    /// Failing; no new work is routed here
    Open = 1,
    /// Testing recovery
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open, // Default to safest state
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// How a unit of work was let through the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open trial, identified by its token
    Probe(u64),
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    config: CircuitBreakerConfig,
    metrics: Mutex<CircuitBreakerMetrics>,
    opened_at: Mutex<Option<Instant>>,
    last_failure_at: Mutex<Option<Instant>>,
    /// Token of the outstanding half-open trial; 0 when none
    probe: AtomicU64,
    next_probe: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        debug!(
            component = %name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout_ms,
            success_threshold = config.success_threshold,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            metrics: Mutex::new(CircuitBreakerMetrics::new()),
            opened_at: Mutex::new(None),
            last_failure_at: Mutex::new(None),
            probe: AtomicU64::new(0),
            next_probe: AtomicU64::new(1),
        }
    }

    /// Raw state without applying the recovery timeout
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether new work could be routed through this breaker right now.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// here. A half-open circuit reports true only while its trial slot is
    /// free; nothing is claimed.
    pub fn allows_traffic(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => self.probe.load(Ordering::Acquire) == 0,
            CircuitState::Open => {
                if self.recovery_elapsed() {
                    self.transition_to_half_open();
                    self.probe.load(Ordering::Acquire) == 0
                } else {
                    false
                }
            }
        }
    }

    /// Claim passage for one unit of work. A half-open circuit hands out a
    /// single probe until an outcome is recorded or the probe is released.
    pub fn try_admit(&self) -> Option<Admission> {
        if !self.allows_traffic() {
            return None;
        }
        if self.state() != CircuitState::HalfOpen {
            return Some(Admission::Normal);
        }

        let token = self.next_probe.fetch_add(1, Ordering::Relaxed);
        match self
            .probe
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!(component = %self.name, token, "🟡 Half-open probe admitted");
                Some(Admission::Probe(token))
            }
            Err(_) => None,
        }
    }

    /// Give back a probe that ended without a recorded outcome. A stale token
    /// leaves a newer probe in place.
    pub fn release_probe(&self, token: u64) {
        if self
            .probe
            .compare_exchange(token, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(component = %self.name, token, "Half-open probe released without outcome");
        }
    }

    pub fn probe_outstanding(&self) -> bool {
        self.probe.load(Ordering::Acquire) != 0
    }

    fn recovery_elapsed(&self) -> bool {
        match *self.opened_at.lock() {
            Some(opened) => opened.elapsed() >= self.config.recovery_timeout(),
            None => {
                warn!(component = %self.name, "Circuit open but no timestamp recorded");
                true
            }
        }
    }

    /// Time remaining until an open circuit may be probed
    pub fn remaining_open_time(&self) -> Option<Duration> {
        if self.state() != CircuitState::Open {
            return None;
        }
        let opened = (*self.opened_at.lock())?;
        Some(
            self.config
                .recovery_timeout()
                .saturating_sub(opened.elapsed()),
        )
    }

    pub fn record_success(&self, duration: Duration) {
        let mut metrics = self.metrics.lock();
        metrics.total_calls += 1;
        metrics.success_count += 1;
        metrics.total_duration += duration;

        match self.state() {
            CircuitState::HalfOpen => {
                metrics.half_open_calls += 1;
                if metrics.half_open_calls >= u64::from(self.config.success_threshold) {
                    drop(metrics);
                    self.transition_to_closed();
                } else {
                    // Trial passed; admit the next one
                    self.probe.store(0, Ordering::Release);
                }
            }
            CircuitState::Closed => {
                metrics.consecutive_failures = 0;
            }
            CircuitState::Open => {
                // In-flight work that started before the circuit opened
                debug!(component = %self.name, "Success recorded while circuit is open");
            }
        }
    }

    pub fn record_failure(&self, duration: Duration) {
        *self.last_failure_at.lock() = Some(Instant::now());

        let mut metrics = self.metrics.lock();
        metrics.total_calls += 1;
        metrics.failure_count += 1;
        metrics.consecutive_failures += 1;
        metrics.total_duration += duration;

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            consecutive_failures = metrics.consecutive_failures,
            "🔴 Operation failed"
        );

        match self.state() {
            CircuitState::Closed => {
                if metrics.consecutive_failures >= u64::from(self.config.failure_threshold) {
                    drop(metrics);
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                drop(metrics);
                self.transition_to_open();
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_closed(&self) {
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        *self.opened_at.lock() = None;
        self.probe.store(0, Ordering::Release);

        let mut metrics = self.metrics.lock();
        metrics.consecutive_failures = 0;
        metrics.half_open_calls = 0;

        info!(
            component = %self.name,
            total_calls = metrics.total_calls,
            "🟢 Circuit breaker closed (recovered)"
        );
    }

    fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        *self.opened_at.lock() = Some(Instant::now());
        self.probe.store(0, Ordering::Release);

        let mut metrics = self.metrics.lock();
        metrics.half_open_calls = 0;
        metrics.times_opened += 1;

        error!(
            component = %self.name,
            consecutive_failures = metrics.consecutive_failures,
            failure_threshold = self.config.failure_threshold,
            recovery_timeout_ms = self.config.recovery_timeout_ms,
            "🔴 Circuit breaker opened (excluded from selection)"
        );
    }

    fn transition_to_half_open(&self) {
        // Only one caller performs the transition
        if self
            .state
            .compare_exchange(
                CircuitState::Open as u8,
                CircuitState::HalfOpen as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        self.metrics.lock().half_open_calls = 0;

        info!(
            component = %self.name,
            success_threshold = self.config.success_threshold,
            "🟡 Circuit breaker half-open (testing recovery)"
        );
    }

    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        self.transition_to_open();
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.metrics.lock().consecutive_failures
    }

    pub fn last_failure_time(&self) -> Option<Instant> {
        *self.last_failure_at.lock()
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.metrics.lock().clone().finalize(self.state())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed
    }
}
