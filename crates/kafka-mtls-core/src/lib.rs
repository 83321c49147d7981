//! Mutually authenticated Kafka producer and consumer.
//!
//! Both clients present a certificate from the configured keystore and only
//! talk to brokers whose certificate chains to the configured truststore.
//! They share one broker pool design: bootstrap, cached cluster metadata,
//! leader routing and group coordinator lookup.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`tls`] - Keystore and truststore loading, mutual TLS channels
//! - [`protocol`] - Pinned Kafka API versions, record batches, group payloads
//! - [`broker`] - Broker connections, metadata and the connection pool
//! - [`producer`] - Partitioning, per-partition batching, delivery acknowledgments
//! - [`consumer`] - Group membership, fetch positions and offset commits
//! - [`metrics`] - Prometheus metrics collection
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_mtls_core::{ClientConfig, Producer, ProducerRecord};
//!
//! let config = ClientConfig::from_file("client.yaml")?;
//! let producer = Producer::connect(&config).await?;
//! let ack = producer.send(ProducerRecord::text("orders", "key-0", "hello")).await?.await?;
//! producer.close().await;
//! ```

#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod protocol;
pub mod tls;

/// Test utilities for integration testing.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use broker::{BrokerPool, ClusterMetadata};
pub use config::{
    Acks, AutoOffsetReset, ClientConfig, ConsumerConfig, KafkaConfig, ProducerConfig,
    SecurityProtocol, StoreType, TlsConfig,
};
pub use consumer::{Consumer, ConsumerRecord, ConsumerState, TopicPartition};
pub use error::{ClientError, ConfigError, Result, RunError, TlsError};
pub use metrics::ClientMetrics;
pub use producer::{DeliveryAck, DeliveryFuture, Producer, ProducerRecord};
pub use tls::SecurityContext;
