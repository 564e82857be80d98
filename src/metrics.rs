//! In-process labeled counters and histograms.
//!
//! The insights aggregator reads raw samples (it needs percentiles over the
//! actual latency distribution), so these are plain label-keyed maps behind
//! locks rather than an exporter-oriented metrics facade. `reset()` exists
//! for test isolation.

use std::collections::HashMap;

use parking_lot::RwLock;

/// A counter keyed by a fixed-arity label tuple.
#[derive(Debug, Default)]
pub struct Counter {
    data: RwLock<HashMap<Vec<String>, u64>>,
}

impl Counter {
    pub fn inc(&self, labels: &[&str]) {
        self.add(labels, 1);
    }

    pub fn add(&self, labels: &[&str], amount: u64) {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        *self.data.write().entry(key).or_insert(0) += amount;
    }

    pub fn get(&self, labels: &[&str]) -> u64 {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.data.read().get(&key).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<Vec<String>, u64> {
        self.data.read().clone()
    }

    fn reset(&self) {
        self.data.write().clear();
    }
}

/// A histogram keyed by a fixed-arity label tuple; stores raw observations.
#[derive(Debug, Default)]
pub struct Histogram {
    data: RwLock<HashMap<Vec<String>, Vec<f64>>>,
}

impl Histogram {
    pub fn observe(&self, labels: &[&str], value: f64) {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.data.write().entry(key).or_default().push(value);
    }

    pub fn count(&self, labels: &[&str]) -> usize {
        let key: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        self.data.read().get(&key).map(|v| v.len()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> HashMap<Vec<String>, Vec<f64>> {
        self.data.read().clone()
    }

    fn reset(&self) {
        self.data.write().clear();
    }
}

/// Process-wide metrics registry, shared behind `Arc`.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Completed attempts, labels `(tool, ok)` with ok in {"true","false"}.
    pub tool_calls_total: Counter,
    /// Attempt latency in milliseconds, label `(tool,)`.
    pub tool_latency_ms: Histogram,
    /// Steps skipped without an attempt, labels `(tool, reason)`.
    pub tool_skipped_total: Counter,
    /// Registry lookups, labels `(tool, found)`.
    pub tool_requests_total: Counter,
    /// Result-cache lookups, labels `(tool, hit)`.
    pub cache_lookups_total: Counter,
    /// Planner LLM calls, labels `(provider, ok)`.
    pub llm_calls_total: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all series. Intended for test isolation and shutdown hooks.
    pub fn reset(&self) {
        self.tool_calls_total.reset();
        self.tool_latency_ms.reset();
        self.tool_skipped_total.reset();
        self.tool_requests_total.reset();
        self.cache_lookups_total.reset();
        self.llm_calls_total.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_per_label_set() {
        let c = Counter::default();
        c.inc(&["web_fetch", "true"]);
        c.inc(&["web_fetch", "true"]);
        c.inc(&["web_fetch", "false"]);
        assert_eq!(c.get(&["web_fetch", "true"]), 2);
        assert_eq!(c.get(&["web_fetch", "false"]), 1);
        assert_eq!(c.get(&["pdf.text", "true"]), 0);
    }

    #[test]
    fn histogram_keeps_raw_samples() {
        let h = Histogram::default();
        h.observe(&["t"], 10.0);
        h.observe(&["t"], 20.0);
        assert_eq!(h.count(&["t"]), 2);
        let snap = h.snapshot();
        assert_eq!(snap[&vec!["t".to_string()]], vec![10.0, 20.0]);
    }

    #[test]
    fn reset_clears_everything() {
        let m = Metrics::new();
        m.tool_calls_total.inc(&["a", "true"]);
        m.tool_latency_ms.observe(&["a"], 5.0);
        m.reset();
        assert_eq!(m.tool_calls_total.get(&["a", "true"]), 0);
        assert_eq!(m.tool_latency_ms.count(&["a"]), 0);
    }
}
