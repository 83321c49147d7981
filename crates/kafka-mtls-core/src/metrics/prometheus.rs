//! Prometheus metrics for the Kafka clients.

use prometheus::core::Collector;
use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Client metrics collection.
///
/// One instance is shared by the connection pool and every client built on it.
pub struct ClientMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    /// Total requests sent, by API.
    pub requests_total: IntCounterVec,

    /// Failed requests, by API and error kind.
    pub request_errors: IntCounterVec,

    /// Request round-trip latency, by API.
    pub request_duration_seconds: HistogramVec,

    /// Records acknowledged by the broker, by topic.
    pub records_produced: IntCounterVec,

    /// Produce attempts repeated after a retriable failure.
    pub produce_retries: IntCounter,

    /// Records that failed delivery for good, by topic.
    pub produce_failures: IntCounterVec,

    /// Records handed to the application by `poll`, by topic.
    pub records_consumed: IntCounterVec,

    /// Bytes of record values handed to the application, by topic.
    pub bytes_consumed: CounterVec,

    /// Successful offset commits.
    pub offset_commits: IntCounter,

    /// Broker channels opened after the first.
    pub reconnects: IntCounter,

    /// Currently open broker channels.
    pub active_broker_connections: IntGauge,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    registry
        .register(Box::new(collector.clone()))
        .expect("metric registration should succeed");
    collector
}

impl ClientMetrics {
    /// Create a new metrics collection with its own registry.
    ///
    /// # Panics
    ///
    /// Panics if metric registration fails (should not happen with unique names).
    #[must_use]
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("kafka_client_requests_total", "Total requests sent by API"),
                &["api"],
            )
            .expect("metric creation should succeed"),
        );

        let request_errors = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "kafka_client_request_errors_total",
                    "Failed requests by API and error kind",
                ),
                &["api", "kind"],
            )
            .expect("metric creation should succeed"),
        );

        let request_duration_seconds = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "kafka_client_request_duration_seconds",
                    "Request round-trip latency in seconds",
                )
                .buckets(vec![
                    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
                ]),
                &["api"],
            )
            .expect("metric creation should succeed"),
        );

        let records_produced = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "kafka_client_records_produced_total",
                    "Records acknowledged by the broker",
                ),
                &["topic"],
            )
            .expect("metric creation should succeed"),
        );

        let produce_retries = register(
            &registry,
            IntCounter::new(
                "kafka_client_produce_retries_total",
                "Produce attempts repeated after a retriable failure",
            )
            .expect("metric creation should succeed"),
        );

        let produce_failures = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "kafka_client_produce_failures_total",
                    "Records that could not be delivered",
                ),
                &["topic"],
            )
            .expect("metric creation should succeed"),
        );

        let records_consumed = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "kafka_client_records_consumed_total",
                    "Records returned to the application",
                ),
                &["topic"],
            )
            .expect("metric creation should succeed"),
        );

        let bytes_consumed = register(
            &registry,
            CounterVec::new(
                Opts::new(
                    "kafka_client_bytes_consumed_total",
                    "Record value bytes returned to the application",
                ),
                &["topic"],
            )
            .expect("metric creation should succeed"),
        );

        let offset_commits = register(
            &registry,
            IntCounter::new(
                "kafka_client_offset_commits_total",
                "Successful offset commits",
            )
            .expect("metric creation should succeed"),
        );

        let reconnects = register(
            &registry,
            IntCounter::new(
                "kafka_client_reconnects_total",
                "Broker channels re-opened after a failure",
            )
            .expect("metric creation should succeed"),
        );

        let active_broker_connections = register(
            &registry,
            IntGauge::new(
                "kafka_client_active_broker_connections",
                "Currently open broker channels",
            )
            .expect("metric creation should succeed"),
        );

        Self {
            registry,
            requests_total,
            request_errors,
            request_duration_seconds,
            records_produced,
            produce_retries,
            produce_failures,
            records_consumed,
            bytes_consumed,
            offset_commits,
            reconnects,
            active_broker_connections,
        }
    }

    /// Record a completed request and its latency.
    pub fn record_request(&self, api: &str, duration_seconds: f64) {
        self.requests_total.with_label_values(&[api]).inc();
        self.request_duration_seconds
            .with_label_values(&[api])
            .observe(duration_seconds);
    }

    /// Record a failed request.
    pub fn record_error(&self, api: &str, kind: &str) {
        self.request_errors.with_label_values(&[api, kind]).inc();
    }

    /// Record records acknowledged for a topic.
    pub fn record_produced(&self, topic: &str, count: u64) {
        self.records_produced.with_label_values(&[topic]).inc_by(count);
    }

    /// Record a produce retry.
    pub fn record_retry(&self) {
        self.produce_retries.inc();
    }

    /// Record records that failed delivery.
    pub fn record_produce_failure(&self, topic: &str, count: u64) {
        self.produce_failures.with_label_values(&[topic]).inc_by(count);
    }

    /// Record records delivered to the application.
    pub fn record_consumed(&self, topic: &str, count: u64, bytes: u64) {
        self.records_consumed.with_label_values(&[topic]).inc_by(count);
        self.bytes_consumed
            .with_label_values(&[topic])
            .inc_by(bytes as f64);
    }

    /// Record a successful offset commit.
    pub fn record_commit(&self) {
        self.offset_commits.inc();
    }

    /// Record a broker channel being opened.
    pub fn connection_opened(&self, is_reconnect: bool) {
        self.active_broker_connections.inc();
        if is_reconnect {
            self.reconnects.inc();
        }
    }

    /// Record a broker channel being closed.
    pub fn connection_closed(&self) {
        self.active_broker_connections.dec();
    }

    /// Encode metrics in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = String::new();
        encoder.encode_utf8(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

impl Default for ClientMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = ClientMetrics::new();
        assert!(metrics.encode().is_ok());
    }

    #[test]
    fn test_record_request() {
        let metrics = ClientMetrics::new();
        metrics.record_request("Metadata", 0.001);
        metrics.record_request("Produce", 0.002);

        let output = metrics.encode().unwrap();
        assert!(output.contains("kafka_client_requests_total"));
        assert!(output.contains("kafka_client_request_duration_seconds"));
    }

    #[test]
    fn test_delivery_counters() {
        let metrics = ClientMetrics::new();
        metrics.record_produced("orders", 3);
        metrics.record_retry();
        metrics.record_produce_failure("orders", 1);
        metrics.record_consumed("orders", 2, 18);

        assert_eq!(
            metrics.records_produced.with_label_values(&["orders"]).get(),
            3
        );
        assert_eq!(metrics.produce_retries.get(), 1);
        assert_eq!(
            metrics.records_consumed.with_label_values(&["orders"]).get(),
            2
        );
    }

    #[test]
    fn test_connection_gauge() {
        let metrics = ClientMetrics::new();
        metrics.connection_opened(false);
        metrics.connection_opened(true);
        metrics.connection_closed();

        assert_eq!(metrics.active_broker_connections.get(), 1);
        assert_eq!(metrics.reconnects.get(), 1);
    }
}
