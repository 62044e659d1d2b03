use std::collections::BTreeMap;

use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Count,
}

/// One numeric sample, submitted to `POST /metrics` in batches.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    #[serde(rename = "type")]
    pub kind: MetricKind,
    pub attributes: BTreeMap<String, String>,
    /// Milliseconds since the epoch
    pub timestamp: i64,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            value,
            kind,
            attributes: BTreeMap::new(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricKind::Gauge)
    }

    pub fn count(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, value, MetricKind::Count)
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Samples collected during a cycle, flushed once per cycle.
#[derive(Debug, Default)]
pub struct MetricsBuffer {
    pending: Vec<Metric>,
}

impl MetricsBuffer {
    pub fn push(&mut self, metric: Metric) {
        self.pending.push(metric);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn take(&mut self) -> Vec<Metric> {
        std::mem::take(&mut self.pending)
    }
}
