use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Metric names shared by the server crates.
pub mod names {
    /// WebSocket connections registered into a hub (counter, labels: shard).
    pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
    /// WebSocket connections torn down (counter, labels: cause).
    pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
    /// Live connections across all hubs (gauge).
    pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
    /// Upgrades closed before registration (counter, labels: reason).
    pub const WS_HANDSHAKE_REJECTED_TOTAL: &str = "ws_handshake_rejected_total";
    /// Broadcast events processed by a hub (counter, labels: shard).
    pub const HUB_BROADCASTS_TOTAL: &str = "hub_broadcasts_total";
    /// Frames queued to members (counter, labels: shard).
    pub const HUB_DELIVERIES_TOTAL: &str = "hub_deliveries_total";
    /// Members removed because their queue was full (counter, labels: shard).
    pub const HUB_EVICTIONS_TOTAL: &str = "hub_evictions_total";
    /// Bus messages received by bridges (counter, labels: shard).
    pub const BRIDGE_MESSAGES_TOTAL: &str = "bridge_messages_total";
    /// Bus messages that failed to decode (counter, labels: shard).
    pub const BRIDGE_DECODE_ERRORS_TOTAL: &str = "bridge_decode_errors_total";
    /// Envelopes published to the bus (counter).
    pub const BUS_PUBLISHED_TOTAL: &str = "bus_published_total";
    /// Failed bus publishes (counter).
    pub const BUS_PUBLISH_ERRORS_TOTAL: &str = "bus_publish_errors_total";
    /// Failed history push/trim calls (counter).
    pub const HISTORY_PERSIST_ERRORS_TOTAL: &str = "history_persist_errors_total";
    /// History entries replayed into new clients (counter).
    pub const HISTORY_REPLAYED_TOTAL: &str = "history_replayed_total";
}

/// Type of metric.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
}

/// One metric value as exported by [`MetricsRecorder::snapshot`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub metric_type: MetricType,
}

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
    fn increment(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }
    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// In-memory gauge. Integral; connection counts never need fractions.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
    fn increment(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }
    fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metric key: name + labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        Self {
            name: name.into(),
            labels: sorted,
        }
    }

    fn label_map(&self) -> BTreeMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

/// Thread-safe metrics recorder.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        let counters = self.counters.read();
        if let Some(c) = counters.get(&key) {
            c.increment(n);
            return;
        }
        drop(counters);
        let mut counters = self.counters.write();
        let c = counters.entry(key).or_insert_with(Counter::new);
        c.increment(n);
    }

    /// Increment/decrement a gauge by delta.
    pub fn gauge_inc(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        let key = MetricKey::new(name, labels);
        let gauges = self.gauges.read();
        if let Some(g) = gauges.get(&key) {
            g.increment(delta);
            return;
        }
        drop(gauges);
        let mut gauges = self.gauges.write();
        let g = gauges.entry(key).or_insert_with(Gauge::new);
        g.increment(delta);
    }

    /// Get current value of a counter.
    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters.read().get(&key).map_or(0, |c| c.get())
    }

    /// Sum of a counter over every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .read()
            .iter()
            .filter(|(k, _)| k.name == name)
            .map(|(_, c)| c.get())
            .sum()
    }

    /// Get current value of a gauge.
    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = MetricKey::new(name, labels);
        self.gauges.read().get(&key).map_or(0, |g| g.get())
    }

    /// Current value of every metric, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples = Vec::new();

        let counters = self.counters.read();
        for (key, counter) in counters.iter() {
            samples.push(MetricSample {
                name: key.name.clone(),
                labels: key.label_map(),
                value: counter.get() as f64,
                metric_type: MetricType::Counter,
            });
        }
        drop(counters);

        let gauges = self.gauges.read();
        for (key, gauge) in gauges.iter() {
            samples.push(MetricSample {
                name: key.name.clone(),
                labels: key.label_map(),
                value: gauge.get() as f64,
                metric_type: MetricType::Gauge,
            });
        }

        samples.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_basic() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("requests", &[], 1);
        recorder.counter_inc("requests", &[], 1);
        recorder.counter_inc("requests", &[], 3);
        assert_eq!(recorder.counter_get("requests", &[]), 5);
    }

    #[test]
    fn counter_with_labels() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("evictions", &[("shard", "0")], 2);
        recorder.counter_inc("evictions", &[("shard", "1")], 1);
        assert_eq!(recorder.counter_get("evictions", &[("shard", "0")]), 2);
        assert_eq!(recorder.counter_get("evictions", &[("shard", "1")]), 1);
        assert_eq!(recorder.counter_get("evictions", &[("shard", "2")]), 0);
        assert_eq!(recorder.counter_total("evictions"), 3);
    }

    #[test]
    fn label_order_does_not_matter() {
        let recorder = MetricsRecorder::new();
        recorder.counter_inc("x", &[("a", "1"), ("b", "2")], 1);
        recorder.counter_inc("x", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(recorder.counter_get("x", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn gauge_moves_both_ways() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_inc("active", &[], 3);
        recorder.gauge_inc("active", &[], -1);
        assert_eq!(recorder.gauge_get("active", &[]), 2);
        recorder.gauge_inc("active", &[], -2);
        assert_eq!(recorder.gauge_get("active", &[]), 0);
    }

    #[test]
    fn snapshot_is_sorted_and_typed() {
        let recorder = MetricsRecorder::new();
        recorder.gauge_inc("b_gauge", &[], 4);
        recorder.counter_inc("a_counter", &[("shard", "1")], 7);

        let samples = recorder.snapshot();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name, "a_counter");
        assert_eq!(samples[0].metric_type, MetricType::Counter);
        assert_eq!(samples[0].labels.get("shard").map(String::as_str), Some("1"));
        assert_eq!(samples[1].value, 4.0);
        assert_eq!(samples[1].metric_type, MetricType::Gauge);
    }

    #[test]
    fn concurrent_increments() {
        let recorder = Arc::new(MetricsRecorder::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = Arc::clone(&recorder);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        r.counter_inc("hits", &[], 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(recorder.counter_get("hits", &[]), 8000);
    }

    #[test]
    fn metric_names_are_snake_case() {
        let all = [
            names::WS_CONNECTIONS_TOTAL,
            names::WS_DISCONNECTIONS_TOTAL,
            names::WS_CONNECTIONS_ACTIVE,
            names::WS_HANDSHAKE_REJECTED_TOTAL,
            names::HUB_BROADCASTS_TOTAL,
            names::HUB_DELIVERIES_TOTAL,
            names::HUB_EVICTIONS_TOTAL,
            names::BRIDGE_MESSAGES_TOTAL,
            names::BRIDGE_DECODE_ERRORS_TOTAL,
            names::BUS_PUBLISHED_TOTAL,
            names::BUS_PUBLISH_ERRORS_TOTAL,
            names::HISTORY_PERSIST_ERRORS_TOTAL,
            names::HISTORY_REPLAYED_TOTAL,
        ];
        for name in all {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
