//! # Backpressure
//!
//! Global admission throttle. A request of priority `p` is admitted with
//! probability `min(1, acceptance_rate × weight(p))`.

use crate::config::BackpressureConfig;
use crate::models::Priority;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub critical: f64,
    pub high: f64,
    pub normal: f64,
    pub low: f64,
}

impl PriorityWeights {
    pub fn uniform() -> Self {
        Self {
            critical: 1.0,
            high: 1.0,
            normal: 1.0,
            low: 1.0,
        }
    }

    pub fn from_config(config: &BackpressureConfig) -> Self {
        Self {
            critical: config.critical_weight,
            high: config.high_weight,
            normal: config.normal_weight,
            low: config.low_weight,
        }
    }

    pub fn get(&self, priority: Priority) -> f64 {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    pub fn set(&mut self, priority: Priority, weight: f64) {
        let weight = weight.max(0.0);
        match priority {
            Priority::Critical => self.critical = weight,
            Priority::High => self.high = weight,
            Priority::Normal => self.normal = weight,
            Priority::Low => self.low = weight,
        }
    }
}

#[derive(Debug)]
pub struct BackpressureController {
    config: BackpressureConfig,
    acceptance_rate: RwLock<f64>,
    weights: RwLock<PriorityWeights>,
    active: AtomicBool,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            acceptance_rate: RwLock::new(config.default_acceptance_rate),
            weights: RwLock::new(PriorityWeights::uniform()),
            active: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            config,
        }
    }

    pub fn acceptance_rate(&self) -> f64 {
        *self.acceptance_rate.read()
    }

    /// Clamped to [0, 1]
    pub fn set_acceptance_rate(&self, rate: f64) {
        let rate = if rate.is_nan() { 0.0 } else { rate.clamp(0.0, 1.0) };
        *self.acceptance_rate.write() = rate;
        info!(acceptance_rate = rate, "🚦 BACKPRESSURE: acceptance rate set");
    }

    pub fn weights(&self) -> PriorityWeights {
        *self.weights.read()
    }

    /// Override the weight of each listed tier; unlisted tiers keep theirs
    pub fn adjust_priority_weights(&self, adjustments: &HashMap<Priority, f64>) {
        let mut weights = self.weights.write();
        for (priority, weight) in adjustments {
            weights.set(*priority, *weight);
        }
        info!(weights = ?*weights, "🚦 BACKPRESSURE: priority weights adjusted");
    }

    /// Admission probability for one request of `priority`
    pub fn admission_probability(&self, priority: Priority) -> f64 {
        (self.acceptance_rate() * self.weights().get(priority)).min(1.0)
    }

    pub fn should_accept(&self, priority: Priority) -> bool {
        let roll = rand::thread_rng().gen::<f64>();
        self.should_accept_with_roll(priority, roll)
    }

    /// Deterministic admission decision for a roll in [0, 1)
    pub fn should_accept_with_roll(&self, priority: Priority, roll: f64) -> bool {
        let accepted = roll < self.admission_probability(priority);
        if accepted {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// Reduce acceptance and boost critical work. Returns false if already
    /// active.
    pub fn activate(&self) -> bool {
        if self.active.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.acceptance_rate.write() = self.config.reduced_acceptance_rate;
        *self.weights.write() = PriorityWeights::from_config(&self.config);
        warn!(
            acceptance_rate = self.config.reduced_acceptance_rate,
            timeout_multiplier = self.config.timeout_multiplier,
            "🚦 BACKPRESSURE: activated"
        );
        true
    }

    /// Restore default acceptance and uniform weights
    pub fn relieve(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        *self.acceptance_rate.write() = self.config.default_acceptance_rate;
        *self.weights.write() = PriorityWeights::uniform();
        info!(
            acceptance_rate = self.config.default_acceptance_rate,
            "🚦 BACKPRESSURE: relieved"
        );
        true
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Pool timeout inflation to apply right now
    pub fn timeout_multiplier(&self) -> f64 {
        if self.is_active() {
            self.config.timeout_multiplier
        } else {
            1.0
        }
    }

    pub fn relief_threshold(&self) -> f64 {
        self.config.relief_utilization_threshold
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_accepts_everything() {
        let controller = BackpressureController::new(BackpressureConfig::default());
        for priority in Priority::ALL {
            assert_eq!(controller.admission_probability(priority), 1.0);
            assert!(controller.should_accept(priority));
        }
    }

    #[test]
    fn test_activation_weights_priorities() {
        let controller = BackpressureController::new(BackpressureConfig::default());
        assert!(controller.activate());
        assert!(!controller.activate());

        assert_eq!(controller.admission_probability(Priority::Critical), 1.0);
        assert_eq!(controller.admission_probability(Priority::Normal), 0.5);
        assert_eq!(controller.admission_probability(Priority::Low), 0.25);
        assert_eq!(controller.timeout_multiplier(), 1.5);

        assert!(controller.should_accept_with_roll(Priority::Low, 0.2));
        assert!(!controller.should_accept_with_roll(Priority::Low, 0.3));

        assert!(controller.relieve());
        assert_eq!(controller.acceptance_rate(), 1.0);
        assert_eq!(controller.weights(), PriorityWeights::uniform());
        assert_eq!(controller.timeout_multiplier(), 1.0);
    }

    #[test]
    fn test_adjust_priority_weights() {
        let controller = BackpressureController::new(BackpressureConfig::default());
        controller.set_acceptance_rate(0.4);

        let mut adjustments = HashMap::new();
        adjustments.insert(Priority::Critical, 2.0);
        adjustments.insert(Priority::Low, 0.5);
        controller.adjust_priority_weights(&adjustments);

        assert!((controller.admission_probability(Priority::Critical) - 0.8).abs() < 1e-9);
        assert!((controller.admission_probability(Priority::High) - 0.4).abs() < 1e-9);
        assert!((controller.admission_probability(Priority::Low) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_acceptance_rate_is_clamped() {
        let controller = BackpressureController::new(BackpressureConfig::default());
        controller.set_acceptance_rate(3.0);
        assert_eq!(controller.acceptance_rate(), 1.0);
        controller.set_acceptance_rate(-1.0);
        assert_eq!(controller.acceptance_rate(), 0.0);
        assert!(!controller.should_accept(Priority::Critical));
    }
}
