//! Metrics collection for the secure producer and consumer clients.
//!
//! Provides Prometheus-compatible metrics for request rates, latency,
//! delivery outcomes, and connection churn.

pub mod prometheus;

pub use prometheus::ClientMetrics;
