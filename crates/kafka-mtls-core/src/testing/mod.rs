//! Test utilities for the secure producer and consumer.
//!
//! This module provides infrastructure for integration testing:
//!
//! - [`MockBroker`] - A lightweight Kafka broker speaking plain TCP or mutual TLS
//! - [`MockCluster`] - In-memory topic logs, groups and offsets served by mock brokers
//! - [`ClusterHarness`] - Running brokers plus a matching client configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_mtls_core::testing::ClusterHarnessBuilder;
//! use kafka_mtls_core::{Producer, ProducerRecord};
//!
//! #[tokio::test]
//! async fn test_produce() {
//!     let harness = ClusterHarnessBuilder::new().tls().topic("orders", 1).build().await;
//!     let producer = Producer::connect(&harness.client_config()).await.unwrap();
//!
//!     let ack = producer.send(ProducerRecord::text("orders", "key-0", "hello")).await.unwrap().await.unwrap();
//!     assert_eq!(ack.offset, 0);
//! }
//! ```

pub mod cluster;
pub mod harness;
pub mod mock_broker;
pub mod tls;

pub use cluster::MockCluster;
pub use harness::{client_tls_config, fixture, ClusterHarness, ClusterHarnessBuilder};
pub use mock_broker::{api_keys, BrokerCall, MockBroker, Reply, ResponseGenerator};
pub use tls::BrokerTlsAcceptor;
