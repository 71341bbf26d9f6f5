//! Process metrics: counters and percentile histograms.
//!
//! Histograms retain the most recent 10 000 raw values per (name, labels)
//! key; percentiles are computed on demand by sort + linear interpolation.
//! Recording is fail-open: metrics must never break the request path, so
//! every recording method is infallible and swallows internal trouble.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::Serialize;

/// Maximum raw values retained per histogram key.
const HISTOGRAM_CAPACITY: usize = 10_000;

/// Summary statistics for one histogram key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramStats {
    pub count: usize,
    pub sum: f64,
    pub avg: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
}

/// (name, sorted labels) identity for a metric series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn render(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let labels = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}{{{}}}", self.name, labels)
    }
}

/// Registry of counters and histograms.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<HashMap<MetricKey, u64>>,
    histograms: RwLock<HashMap<MetricKey, VecDeque<f64>>>,
}

impl MetricsRegistry {
    /// Fresh, empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-global registry.
    ///
    /// Components prefer an explicit `Arc<MetricsRegistry>`; the global is
    /// for recording sites with no context to thread one through.
    pub fn global() -> Arc<MetricsRegistry> {
        static GLOBAL: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MetricsRegistry::new())))
    }

    /// Add 1 to a counter.
    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.add_to_counter(name, 1, labels);
    }

    /// Add `delta` to a counter.
    pub fn add_to_counter(&self, name: &str, delta: u64, labels: &[(&str, &str)]) {
        let key = MetricKey::new(name, labels);
        *self.counters.write().entry(key).or_insert(0) += delta;
    }

    /// Record one observation into a histogram, evicting the oldest value
    /// once the buffer holds [`HISTOGRAM_CAPACITY`] samples.
    pub fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        if !value.is_finite() {
            return;
        }
        let key = MetricKey::new(name, labels);
        let mut histograms = self.histograms.write();
        let buffer = histograms.entry(key).or_default();
        if buffer.len() == HISTOGRAM_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(value);
    }

    /// Current counter value; 0 when the key has never been incremented.
    #[must_use]
    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).copied().unwrap_or(0)
    }

    /// Summary statistics for one histogram key, or `None` when empty.
    #[must_use]
    pub fn get_histogram_stats(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramStats> {
        let key = MetricKey::new(name, labels);
        let histograms = self.histograms.read();
        let buffer = histograms.get(&key)?;
        if buffer.is_empty() {
            return None;
        }

        let mut values: Vec<f64> = buffer.iter().copied().collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = values.len();
        let sum: f64 = values.iter().sum();
        Some(HistogramStats {
            count,
            sum,
            avg: sum / count as f64,
            p50: percentile(&values, 50.0),
            p95: percentile(&values, 95.0),
            p99: percentile(&values, 99.0),
            min: values[0],
            max: values[count - 1],
        })
    }

    /// All counter values keyed by rendered name.
    #[must_use]
    pub fn counters_snapshot(&self) -> HashMap<String, u64> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.render(), *v))
            .collect()
    }

    /// Stats for every non-empty histogram, keyed by rendered name.
    #[must_use]
    pub fn histograms_snapshot(&self) -> HashMap<String, HistogramStats> {
        let names: Vec<MetricKey> = self.histograms.read().keys().cloned().collect();
        names
            .into_iter()
            .filter_map(|key| {
                let labels: Vec<(&str, &str)> = key
                    .labels
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                self.get_histogram_stats(&key.name, &labels)
                    .map(|stats| (key.render(), stats))
            })
            .collect()
    }

    /// Drop all recorded values. Test helper.
    pub fn reset(&self) {
        self.counters.write().clear();
        self.histograms.write().clear();
    }
}

/// Percentile of an ascending-sorted sample via linear interpolation.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_counters_accumulate_per_label_set() {
        let registry = MetricsRegistry::new();
        registry.increment_counter("requests", &[("route", "query")]);
        registry.increment_counter("requests", &[("route", "query")]);
        registry.increment_counter("requests", &[("route", "ingest")]);

        assert_eq!(registry.get_counter("requests", &[("route", "query")]), 2);
        assert_eq!(registry.get_counter("requests", &[("route", "ingest")]), 1);
        assert_eq!(registry.get_counter("requests", &[("route", "other")]), 0);
    }

    #[test]
    fn test_label_order_does_not_split_series() {
        let registry = MetricsRegistry::new();
        registry.increment_counter("c", &[("a", "1"), ("b", "2")]);
        registry.increment_counter("c", &[("b", "2"), ("a", "1")]);
        assert_eq!(registry.get_counter("c", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn test_histogram_stats_on_fixed_sample() {
        let registry = MetricsRegistry::new();
        for v in 1..=100 {
            registry.observe_histogram("latency_ms", f64::from(v), &[]);
        }
        let stats = registry.get_histogram_stats("latency_ms", &[]).unwrap();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 100.0);
        assert!((stats.avg - 50.5).abs() < 1e-9);
        assert!((stats.p50 - 50.5).abs() < 1e-9);
        assert!((stats.p95 - 95.05).abs() < 1e-9);
        assert!((stats.p99 - 99.01).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_single_value() {
        let registry = MetricsRegistry::new();
        registry.observe_histogram("h", 42.0, &[]);
        let stats = registry.get_histogram_stats("h", &[]).unwrap();
        assert_eq!(stats.p50, 42.0);
        assert_eq!(stats.p99, 42.0);
    }

    #[test]
    fn test_histogram_buffer_is_bounded() {
        let registry = MetricsRegistry::new();
        for v in 0..(HISTOGRAM_CAPACITY + 500) {
            registry.observe_histogram("h", v as f64, &[]);
        }
        let stats = registry.get_histogram_stats("h", &[]).unwrap();
        assert_eq!(stats.count, HISTOGRAM_CAPACITY);
        // Oldest 500 samples were evicted.
        assert_eq!(stats.min, 500.0);
    }

    #[test]
    fn test_non_finite_observations_dropped() {
        let registry = MetricsRegistry::new();
        registry.observe_histogram("h", f64::NAN, &[]);
        registry.observe_histogram("h", f64::INFINITY, &[]);
        assert!(registry.get_histogram_stats("h", &[]).is_none());
    }

    #[test]
    fn test_empty_histogram_yields_none() {
        let registry = MetricsRegistry::new();
        assert!(registry.get_histogram_stats("missing", &[]).is_none());
    }

    proptest! {
        // Percentiles are a function of the sample, not of insertion order.
        #[test]
        fn test_percentiles_order_independent(mut values in prop::collection::vec(0.0f64..10_000.0, 2..200)) {
            let registry_a = MetricsRegistry::new();
            for v in &values {
                registry_a.observe_histogram("h", *v, &[]);
            }
            values.reverse();
            let registry_b = MetricsRegistry::new();
            for v in &values {
                registry_b.observe_histogram("h", *v, &[]);
            }
            let a = registry_a.get_histogram_stats("h", &[]).unwrap();
            let b = registry_b.get_histogram_stats("h", &[]).unwrap();
            prop_assert_eq!(a.p50, b.p50);
            prop_assert_eq!(a.p95, b.p95);
            prop_assert_eq!(a.p99, b.p99);
        }
    }
}
