//! # Partition Metrics
//!
//! Execution statistics over a sliding window of recent step outcomes.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct PartitionMetrics {
    window: VecDeque<Sample>,
    window_size: usize,
    avg_execution_ms: f64,
    total_executions: u64,
    total_failures: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Sample {
    duration_ms: f64,
    success: bool,
}

impl PartitionMetrics {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
            avg_execution_ms: 0.0,
            total_executions: 0,
            total_failures: 0,
        }
    }

    pub fn record(&mut self, duration: Duration, success: bool) {
        let duration_ms = duration.as_secs_f64() * 1_000.0;

        self.avg_execution_ms = if self.total_executions == 0 {
            duration_ms
        } else {
            EWMA_ALPHA * duration_ms + (1.0 - EWMA_ALPHA) * self.avg_execution_ms
        };

        self.total_executions += 1;
        if !success {
            self.total_failures += 1;
        }

        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(Sample {
            duration_ms,
            success,
        });
    }

    /// Exponentially weighted mean step duration
    pub fn avg_execution_ms(&self) -> f64 {
        self.avg_execution_ms
    }

    /// Failure ratio over the window, 0.0 when empty
    pub fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|s| !s.success).count();
        failures as f64 / self.window.len() as f64
    }

    /// 95th percentile duration over the window (nearest-rank)
    pub fn p95_latency_ms(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let mut durations: Vec<f64> = self.window.iter().map(|s| s.duration_ms).collect();
        durations.sort_by(|a, b| a.total_cmp(b));
        let rank = ((0.95 * durations.len() as f64).ceil() as usize).max(1);
        durations[rank - 1]
    }

    pub fn samples(&self) -> usize {
        self.window.len()
    }

    pub fn total_executions(&self) -> u64 {
        self.total_executions
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    /// Forget recent outcomes; totals and the average are kept
    pub fn clear_window(&mut self) {
        self.window.clear();
    }
}
