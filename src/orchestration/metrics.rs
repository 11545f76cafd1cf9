//! # Metrics Sink
//!
//! The engine reports numeric observations to an injected sink. Export format
//! and transport belong to the sink implementation.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

pub type Labels<'a> = &'a [(&'a str, String)];

pub trait MetricsSink: Send + Sync + std::fmt::Debug {
    fn gauge(&self, name: &str, value: f64, labels: Labels<'_>);

    fn counter(&self, name: &str, increment: u64, labels: Labels<'_>);

    fn histogram(&self, name: &str, value: f64, labels: Labels<'_>);
}

/// Emits every observation as a structured tracing event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        debug!(target: "tasker_engine::metrics", metric = name, kind = "gauge", value, labels = ?labels);
    }

    fn counter(&self, name: &str, increment: u64, labels: Labels<'_>) {
        debug!(target: "tasker_engine::metrics", metric = name, kind = "counter", increment, labels = ?labels);
    }

    fn histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        debug!(target: "tasker_engine::metrics", metric = name, kind = "histogram", value, labels = ?labels);
    }
}

/// Keeps observations in memory, keyed by metric name and rendered labels
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    gauges: Mutex<HashMap<String, f64>>,
    counters: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(name: &str, labels: Labels<'_>) -> String {
        if labels.is_empty() {
            return name.to_string();
        }
        let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{name}{{{}}}", rendered.join(","))
    }

    pub fn gauge_value(&self, key: &str) -> Option<f64> {
        self.gauges.lock().get(key).copied()
    }

    pub fn counter_value(&self, key: &str) -> u64 {
        self.counters.lock().get(key).copied().unwrap_or(0)
    }

    pub fn histogram_values(&self, key: &str) -> Vec<f64> {
        self.histograms.lock().get(key).cloned().unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn gauge(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.gauges.lock().insert(Self::key(name, labels), value);
    }

    fn counter(&self, name: &str, increment: u64, labels: Labels<'_>) {
        *self.counters.lock().entry(Self::key(name, labels)).or_insert(0) += increment;
    }

    fn histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        self.histograms
            .lock()
            .entry(Self::key(name, labels))
            .or_default()
            .push(value);
    }
}
