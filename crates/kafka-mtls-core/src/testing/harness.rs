//! Test harness that runs an in-memory cluster behind one or more mock brokers.
//!
//! Provides a complete test environment with:
//! - Mock brokers, optionally requiring mutual TLS
//! - A shared [`MockCluster`] serving every broker
//! - A client configuration pointing at the brokers with test-friendly timings

use std::path::PathBuf;

use secrecy::SecretString;

use crate::config::{ClientConfig, SecurityProtocol, StoreType, TlsConfig};

use super::cluster::MockCluster;
use super::mock_broker::{BrokerCall, MockBroker};
use super::tls::BrokerTlsAcceptor;

/// Password of the `client.keystore.p12` fixture.
pub const CLIENT_KEYSTORE_PASSWORD: &str = "client-ks-password";

/// Password of the `client.truststore.p12` fixture.
pub const CLIENT_TRUSTSTORE_PASSWORD: &str = "client-ts-password";

/// Path of a file in the crate's certificate fixtures.
#[must_use]
pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Client TLS settings using the fixture keystore and truststore.
#[must_use]
pub fn client_tls_config() -> TlsConfig {
    TlsConfig {
        keystore_path: fixture("client.keystore.p12"),
        keystore_type: StoreType::Pkcs12,
        keystore_password: Some(SecretString::from(CLIENT_KEYSTORE_PASSWORD.to_string())),
        key_password: None,
        truststore_path: fixture("client.truststore.p12"),
        truststore_type: StoreType::Pkcs12,
        truststore_password: Some(SecretString::from(CLIENT_TRUSTSTORE_PASSWORD.to_string())),
    }
}

/// Running mock brokers in front of one in-memory cluster.
pub struct ClusterHarness {
    brokers: Vec<MockBroker>,
    /// The cluster state every broker serves.
    pub cluster: MockCluster,
    tls: bool,
}

impl ClusterHarness {
    /// One plaintext broker with no topics; unknown topics are auto-created
    /// with a single partition.
    pub async fn new() -> Self {
        ClusterHarnessBuilder::new().build().await
    }

    /// Addresses of the running brokers, in node id order.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.brokers.iter().map(|b| b.address().to_string()).collect()
    }

    /// Access a broker by its position (node id minus one).
    #[must_use]
    pub fn broker(&self, index: usize) -> &MockBroker {
        &self.brokers[index]
    }

    /// Client configuration for these brokers, with short timeouts and
    /// background metadata refresh disabled.
    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new(self.addresses());
        config.kafka.connection_timeout_ms = 2_000;
        config.kafka.request_timeout_ms = 5_000;
        config.kafka.metadata_refresh_interval_secs = 0;
        config.kafka.reconnect_backoff_ms = 10;
        config.kafka.reconnect_backoff_max_ms = 100;

        config.producer.retry_backoff_ms = 10;
        config.producer.retry_backoff_max_ms = 50;
        config.producer.close_timeout_ms = 5_000;

        config.consumer.session_timeout_ms = 3_000;
        config.consumer.heartbeat_interval_ms = 100;
        config.consumer.auto_commit_interval_ms = 100;
        config.consumer.fetch_max_wait_ms = 50;

        if self.tls {
            config.kafka.security_protocol = SecurityProtocol::Ssl;
            config.tls = Some(client_tls_config());
        } else {
            config.kafka.security_protocol = SecurityProtocol::Plaintext;
        }
        config
    }

    /// Calls received by every broker for one API.
    pub async fn calls_for_api(&self, api_key: i16) -> Vec<BrokerCall> {
        let mut calls = Vec::new();
        for broker in &self.brokers {
            calls.extend(broker.get_calls_for_api(api_key).await);
        }
        calls
    }

    /// Stop one broker so its connections drop and new ones are refused.
    pub fn stop_broker(&mut self, index: usize) {
        self.brokers[index].stop();
    }

    /// Stop every broker.
    pub fn shutdown(&mut self) {
        for broker in &mut self.brokers {
            broker.stop();
        }
    }
}

/// Builder for a [`ClusterHarness`].
pub struct ClusterHarnessBuilder {
    brokers: usize,
    tls: bool,
    topics: Vec<(String, i32)>,
    auto_create_partitions: Option<i32>,
}

impl ClusterHarnessBuilder {
    /// One plaintext broker, no topics, auto-creation with one partition.
    #[must_use]
    pub fn new() -> Self {
        Self {
            brokers: 1,
            tls: false,
            topics: Vec::new(),
            auto_create_partitions: Some(1),
        }
    }

    /// Number of brokers to start.
    #[must_use]
    pub fn brokers(mut self, count: usize) -> Self {
        self.brokers = count.max(1);
        self
    }

    /// Require mutual TLS using the fixture broker certificate and CA.
    #[must_use]
    pub fn tls(mut self) -> Self {
        self.tls = true;
        self
    }

    /// Pre-create a topic.
    #[must_use]
    pub fn topic(mut self, name: &str, partitions: i32) -> Self {
        self.topics.push((name.to_string(), partitions));
        self
    }

    /// Reject unknown topics instead of auto-creating them.
    #[must_use]
    pub fn without_auto_create(mut self) -> Self {
        self.auto_create_partitions = None;
        self
    }

    /// Start the brokers and install the cluster on each.
    ///
    /// # Panics
    ///
    /// Panics if a broker cannot bind or the TLS fixtures cannot be loaded.
    pub async fn build(self) -> ClusterHarness {
        let mut cluster = MockCluster::new();
        if let Some(partitions) = self.auto_create_partitions {
            cluster = cluster.with_auto_create(partitions);
        }
        for (name, partitions) in &self.topics {
            cluster.create_topic(name, *partitions);
        }

        let acceptor = self.tls.then(|| {
            BrokerTlsAcceptor::new(
                &fixture("broker.pem"),
                &fixture("broker.key"),
                &fixture("ca.pem"),
            )
            .expect("broker TLS fixtures should load")
        });

        let mut brokers = Vec::with_capacity(self.brokers);
        for node_id in 1..=self.brokers {
            let mut broker = MockBroker::new("127.0.0.1:0");
            if let Some(acceptor) = &acceptor {
                broker = broker.with_tls(acceptor.clone());
            }
            broker.start().await.expect("Failed to start mock broker");
            let node_id = i32::try_from(node_id).expect("broker count fits in i32");
            cluster.install(&broker, node_id).await;
            brokers.push(broker);
        }

        ClusterHarness {
            brokers,
            cluster,
            tls: self.tls,
        }
    }
}

impl Default for ClusterHarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityProtocol;

    #[tokio::test]
    async fn test_harness_creation() {
        let harness = ClusterHarness::new().await;
        assert_eq!(harness.addresses().len(), 1);

        let config = harness.client_config();
        assert_eq!(config.kafka.security_protocol, SecurityProtocol::Plaintext);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_harness_builder() {
        let harness = ClusterHarnessBuilder::new()
            .brokers(3)
            .tls()
            .topic("orders", 6)
            .build()
            .await;

        assert_eq!(harness.addresses().len(), 3);
        assert_eq!(harness.cluster.high_watermark("orders", 5), Some(0));
        let config = harness.client_config();
        assert!(config.tls.is_some());
        assert_eq!(config.kafka.security_protocol, SecurityProtocol::Ssl);
    }
}
