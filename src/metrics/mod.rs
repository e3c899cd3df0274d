//! Metrics for quote-relay
//!
//! In-process counters, gauges and histograms with JSON and Prometheus
//! text export. The publisher, the guarded request wrapper and the broker
//! event listener record into a shared registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

type Cells = RwLock<HashMap<String, Arc<AtomicU64>>>;

/// Process-wide metrics registry
pub struct MetricsRegistry {
    counters: Cells,
    gauges: Cells,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Shared cell for `name`, created on first use
    async fn cell(cells: &Cells, name: &str) -> Arc<AtomicU64> {
        if let Some(cell) = cells.read().await.get(name) {
            return cell.clone();
        }
        cells
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    async fn read(cells: &Cells, name: &str) -> u64 {
        cells
            .read()
            .await
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn snapshot(cells: &HashMap<String, Arc<AtomicU64>>) -> HashMap<String, u64> {
        cells
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }

    pub async fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1).await;
    }

    pub async fn add_counter(&self, name: &str, value: u64) {
        Self::cell(&self.counters, name)
            .await
            .fetch_add(value, Ordering::Relaxed);
    }

    pub async fn set_gauge(&self, name: &str, value: u64) {
        Self::cell(&self.gauges, name)
            .await
            .store(value, Ordering::Relaxed);
    }

    pub async fn get_counter(&self, name: &str) -> u64 {
        Self::read(&self.counters, name).await
    }

    pub async fn get_gauge(&self, name: &str) -> u64 {
        Self::read(&self.gauges, name).await
    }

    /// Record a histogram observation
    pub async fn observe_histogram(&self, name: &str, value: f64) {
        let existing = self.histograms.read().await.get(name).cloned();
        let histogram = match existing {
            Some(h) => h,
            None => self
                .histograms
                .write()
                .await
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Histogram::default()))
                .clone(),
        };
        histogram.observe(value);
    }

    /// Number of observations recorded for a histogram
    pub async fn histogram_count(&self, name: &str) -> u64 {
        self.histograms
            .read()
            .await
            .get(name)
            .map(|h| h.count())
            .unwrap_or(0)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub async fn to_json(&self) -> serde_json::Value {
        let counters = Self::snapshot(&*self.counters.read().await);
        let gauges = Self::snapshot(&*self.gauges.read().await);
        let histograms: HashMap<String, serde_json::Value> = self
            .histograms
            .read()
            .await
            .iter()
            .map(|(name, h)| (name.clone(), h.to_json()))
            .collect();

        serde_json::json!({
            "uptime_seconds": self.uptime_seconds(),
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }

    /// Export metrics in Prometheus text format
    pub async fn to_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP quote_relay_uptime_seconds Time since service start\n");
        output.push_str("# TYPE quote_relay_uptime_seconds gauge\n");
        output.push_str(&format!(
            "quote_relay_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        for (kind, cells) in [("counter", &self.counters), ("gauge", &self.gauges)] {
            let cells = cells.read().await;
            let mut names: Vec<&String> = cells.keys().collect();
            names.sort();
            for name in names {
                let prometheus_name = prometheus_name(name);
                output.push_str(&format!("# TYPE {prometheus_name} {kind}\n"));
                output.push_str(&format!(
                    "{prometheus_name} {}\n",
                    cells[name].load(Ordering::Relaxed)
                ));
            }
        }

        for (name, histogram) in self.histograms.read().await.iter() {
            output.push_str(&histogram.to_prometheus(name));
        }

        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn prometheus_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Fixed-bucket histogram
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    /// Sum of observations in microunits
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.sum_micros
            .fetch_add((value * 1_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        if let Some(i) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn to_json(&self) -> serde_json::Value {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();

        serde_json::json!({
            "buckets": self.buckets,
            "counts": counts,
            "sum": self.sum(),
            "count": self.count(),
        })
    }

    pub fn to_prometheus(&self, name: &str) -> String {
        let name = prometheus_name(name);
        let mut output = format!("# TYPE {name} histogram\n");

        let mut cumulative = 0u64;
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!("{name}_bucket{{le=\"{bucket}\"}} {cumulative}\n"));
        }

        output.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", self.count()));
        output.push_str(&format!("{name}_sum {}\n", self.sum()));
        output.push_str(&format!("{name}_count {}\n", self.count()));
        output
    }
}

impl Default for Histogram {
    fn default() -> Self {
        // Latency in seconds
        Self::new(vec![
            0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
        ])
    }
}

/// Predefined metric names
pub mod metric_names {
    // Guarded requests
    pub const REQUESTS_ACCEPTED: &str = "relay.requests.accepted";
    pub const REQUESTS_SUPERSEDED: &str = "relay.requests.superseded";
    pub const REQUESTS_FAILED: &str = "relay.requests.failed";

    // Delta publication
    pub const DELTAS_PUBLISHED: &str = "relay.deltas.published";
    pub const DELTAS_FAILED: &str = "relay.deltas.failed";
    pub const DOCUMENTS_FLAGGED: &str = "relay.documents.flagged";
    pub const PUBLISH_CYCLES: &str = "relay.publisher.cycles";
    pub const PENDING_DOCUMENTS: &str = "relay.publisher.pending_documents";

    // Broker
    pub const BROKER_WARNINGS: &str = "relay.broker.warnings";
    pub const BROKER_RECONNECT_ATTEMPTS: &str = "relay.broker.reconnect_attempts";
    pub const BROKER_RECONNECTS: &str = "relay.broker.reconnects";
    pub const BROKER_RECONNECT_FAILURES: &str = "relay.broker.reconnect_failures";

    // Latency histograms
    pub const ENCODE_LATENCY: &str = "relay.encode.latency_seconds";
    pub const PUBLISH_LATENCY: &str = "relay.publish.latency_seconds";
}

/// Helper to time an async operation into a histogram
pub async fn timed<F, T>(metrics: &MetricsRegistry, metric_name: &str, f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = f.await;
    metrics
        .observe_histogram(metric_name, start.elapsed().as_secs_f64())
        .await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter() {
        let registry = MetricsRegistry::new();

        registry.inc_counter(metric_names::DELTAS_PUBLISHED).await;
        registry.inc_counter(metric_names::DELTAS_PUBLISHED).await;
        registry.add_counter(metric_names::DELTAS_PUBLISHED, 5).await;

        assert_eq!(registry.get_counter(metric_names::DELTAS_PUBLISHED).await, 7);
        assert_eq!(registry.get_counter("missing").await, 0);
    }

    #[tokio::test]
    async fn test_gauge() {
        let registry = MetricsRegistry::new();

        registry.set_gauge(metric_names::PENDING_DOCUMENTS, 100).await;
        assert_eq!(registry.get_gauge(metric_names::PENDING_DOCUMENTS).await, 100);

        registry.set_gauge(metric_names::PENDING_DOCUMENTS, 50).await;
        assert_eq!(registry.get_gauge(metric_names::PENDING_DOCUMENTS).await, 50);
    }

    #[tokio::test]
    async fn test_histogram() {
        let registry = MetricsRegistry::new();

        registry.observe_histogram(metric_names::ENCODE_LATENCY, 0.0002).await;
        registry.observe_histogram(metric_names::ENCODE_LATENCY, 0.05).await;
        registry.observe_histogram(metric_names::ENCODE_LATENCY, 9.0).await;

        assert_eq!(registry.histogram_count(metric_names::ENCODE_LATENCY).await, 3);

        let json = registry.to_json().await;
        let latency = &json["histograms"][metric_names::ENCODE_LATENCY];
        assert_eq!(latency["count"].as_u64(), Some(3));
        assert_eq!(latency["counts"][0].as_u64(), Some(1));
    }

    #[tokio::test]
    async fn test_prometheus_format() {
        let registry = MetricsRegistry::new();

        registry.inc_counter(metric_names::BROKER_RECONNECTS).await;
        registry.set_gauge(metric_names::PENDING_DOCUMENTS, 42).await;
        registry.observe_histogram(metric_names::PUBLISH_LATENCY, 0.01).await;

        let prometheus = registry.to_prometheus().await;
        assert!(prometheus.contains("relay_broker_reconnects 1"));
        assert!(prometheus.contains("relay_publisher_pending_documents 42"));
        assert!(prometheus.contains("relay_publish_latency_seconds_count 1"));
    }

    #[tokio::test]
    async fn test_timed_records_observation() {
        let registry = MetricsRegistry::new();
        let value = timed(&registry, metric_names::ENCODE_LATENCY, async { 7 }).await;
        assert_eq!(value, 7);
        assert_eq!(registry.histogram_count(metric_names::ENCODE_LATENCY).await, 1);
    }
}
