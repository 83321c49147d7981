//! Broker connection pool.
//!
//! Turns the bootstrap list into a set of authenticated channels, keeps the
//! cluster topology current, and routes topic-partition operations to the
//! partition leader. All reconnect policy lives here; the producer and
//! consumer never manage sockets themselves.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kafka_protocol::messages::metadata_request::MetadataRequestTopic;
use kafka_protocol::messages::{FindCoordinatorRequest, MetadataRequest, TopicName};
use kafka_protocol::protocol::StrBytes;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use super::connection::{BrokerConnection, ConnectionSettings};
use super::metadata::{ClusterMetadata, TopicMetadata};
use crate::config::{ClientConfig, KafkaConfig};
use crate::error::{ClientError, Result};
use crate::metrics::ClientMetrics;
use crate::protocol::{error_code, KafkaRequest};
use crate::tls::SecurityContext;

/// Metadata refreshes attempted while a topic is still being created.
const TOPIC_LOOKUP_ATTEMPTS: u32 = 5;

/// Manages connections to Kafka brokers.
pub struct BrokerPool {
    config: KafkaConfig,
    settings: ConnectionSettings,
    /// Connections indexed by broker ID.
    connections: DashMap<i32, Arc<BrokerConnection>>,
    /// Connection to the bootstrap server that answered last.
    bootstrap: RwLock<Option<Arc<BrokerConnection>>>,
    /// Current topology snapshot, replaced atomically on refresh.
    metadata: RwLock<Arc<ClusterMetadata>>,
    /// Topics whose metadata is kept current.
    tracked_topics: Mutex<BTreeSet<String>>,
    /// Group coordinators by group id.
    coordinators: DashMap<String, i32>,
    refresh_lock: Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for BrokerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerPool")
            .field("bootstrap_servers", &self.config.bootstrap_servers)
            .field("connections", &self.connections.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BrokerPool {
    /// Create a new pool. Nothing is connected until [`connect`](Self::connect).
    #[must_use]
    pub fn new(
        config: KafkaConfig,
        security: Option<SecurityContext>,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        let settings = ConnectionSettings {
            client_id: config.client_id.clone(),
            connect_timeout: config.connection_timeout(),
            request_timeout: config.request_timeout(),
            security: security.map(Arc::new),
            metrics,
        };

        Self {
            config,
            settings,
            connections: DashMap::new(),
            bootstrap: RwLock::new(None),
            metadata: RwLock::new(Arc::new(ClusterMetadata::default())),
            tracked_topics: Mutex::new(BTreeSet::new()),
            coordinators: DashMap::new(),
            refresh_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Build a pool from client configuration, loading TLS material when the
    /// security protocol requires it.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an invalid connection section and
    /// the credential loading error for unusable TLS material.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        config.kafka.validate()?;
        let security = if config.kafka.security_protocol.requires_tls() {
            let tls = config.tls.as_ref().ok_or(crate::error::ConfigError::MissingTls)?;
            Some(SecurityContext::from_config(tls)?)
        } else {
            None
        };
        Ok(Self::new(
            config.kafka.clone(),
            security,
            Arc::new(ClientMetrics::new()),
        ))
    }

    /// Connection settings.
    #[must_use]
    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Metrics shared by every client on this pool.
    #[must_use]
    pub fn metrics(&self) -> Arc<ClientMetrics> {
        Arc::clone(&self.settings.metrics)
    }

    /// Connect to the cluster and discover its brokers.
    ///
    /// Bootstrap servers are tried in order. An authentication or trust
    /// failure stops the walk immediately since every endpoint presents the
    /// same credential check.
    ///
    /// # Errors
    ///
    /// Returns the fatal error of the first endpoint that rejected the
    /// channel, or `UnreachableCluster` if no endpoint could be reached.
    #[instrument(skip(self), fields(servers = ?self.config.bootstrap_servers))]
    pub async fn connect(&self) -> Result<()> {
        self.ensure_open()?;
        self.bootstrap_once().await?;
        self.refresh_metadata(&[], false).await?;

        let metadata = self.metadata().await;
        info!(
            brokers = metadata.brokers().len(),
            tls = self.settings.security.is_some(),
            "connected to cluster"
        );
        Ok(())
    }

    async fn bootstrap_once(&self) -> Result<Arc<BrokerConnection>> {
        let mut tried = Vec::with_capacity(self.config.bootstrap_servers.len());

        for (idx, server) in self.config.bootstrap_servers.iter().enumerate() {
            let conn = Arc::new(BrokerConnection::new(
                -1 - idx as i32,
                server.clone(),
                self.settings.clone(),
            ));

            match conn.connect().await {
                Ok(()) => {
                    debug!(server = %server, "connected to bootstrap server");
                    *self.bootstrap.write().await = Some(Arc::clone(&conn));
                    return Ok(conn);
                }
                Err(e) if e.is_fatal() => {
                    warn!(server = %server, error = %e, "bootstrap server rejected channel");
                    return Err(e);
                }
                Err(e) => {
                    warn!(server = %server, error = %e, "failed to connect to bootstrap server");
                    tried.push(server.clone());
                }
            }
        }

        Err(ClientError::UnreachableCluster { tried })
    }

    /// Current topology snapshot.
    pub async fn metadata(&self) -> Arc<ClusterMetadata> {
        Arc::clone(&*self.metadata.read().await)
    }

    /// Fetch metadata for the tracked topics plus `topics` and swap in the
    /// new snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if no broker can answer.
    pub async fn refresh_metadata(
        &self,
        topics: &[String],
        allow_auto_create: bool,
    ) -> Result<Arc<ClusterMetadata>> {
        self.ensure_open()?;
        let _guard = self.refresh_lock.lock().await;

        let requested: Vec<String> = {
            let mut tracked = self.tracked_topics.lock().await;
            tracked.extend(topics.iter().cloned());
            tracked.iter().cloned().collect()
        };

        let mut request = MetadataRequest::default();
        request.topics = Some(
            requested
                .iter()
                .map(|name| {
                    let mut topic = MetadataRequestTopic::default();
                    topic.name = Some(TopicName::from(StrBytes::from_string(name.clone())));
                    topic
                })
                .collect(),
        );
        request.allow_auto_topic_creation = allow_auto_create;

        let response = self.call_any(&request).await?;
        let fresh = ClusterMetadata::from_response(&response);

        let snapshot = {
            let mut current = self.metadata.write().await;
            let next = Arc::new(current.merged_with(fresh));
            *current = Arc::clone(&next);
            next
        };
        self.prune_connections(&snapshot);

        debug!(
            brokers = snapshot.brokers().len(),
            topics = requested.len(),
            "metadata refreshed"
        );
        Ok(snapshot)
    }

    /// Drop channels to brokers that left the cluster or moved.
    fn prune_connections(&self, metadata: &ClusterMetadata) {
        let stale: Vec<i32> = self
            .connections
            .iter()
            .filter(|entry| {
                metadata
                    .broker(*entry.key())
                    .map_or(true, |b| b.address() != entry.value().address())
            })
            .map(|entry| *entry.key())
            .collect();

        for node_id in stale {
            if let Some((_, conn)) = self.connections.remove(&node_id) {
                debug!(broker_id = node_id, address = conn.address(), "dropping stale broker");
                tokio::spawn(async move { conn.disconnect().await });
            }
        }
    }

    /// Metadata of a topic, refreshing (and optionally auto-creating) it when unknown.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Broker` with the broker's error code when the
    /// topic does not exist or has no partitions after refreshing.
    pub async fn topic_metadata(&self, topic: &str, allow_auto_create: bool) -> Result<TopicMetadata> {
        if let Some(found) = self.metadata().await.topic(topic) {
            return Ok(found.clone());
        }

        let mut delay = Duration::from_millis(self.config.reconnect_backoff_ms);
        let mut last_code = error_code::UNKNOWN_TOPIC_OR_PARTITION;
        for attempt in 0..TOPIC_LOOKUP_ATTEMPTS {
            let snapshot = self
                .refresh_metadata(&[topic.to_string()], allow_auto_create)
                .await?;
            if let Some(found) = snapshot.topic(topic) {
                return Ok(found.clone());
            }

            last_code = snapshot
                .topic_error(topic)
                .unwrap_or(error_code::LEADER_NOT_AVAILABLE);
            if !error_code::is_retriable(last_code)
                || (last_code == error_code::UNKNOWN_TOPIC_OR_PARTITION && !allow_auto_create)
            {
                break;
            }
            debug!(topic, attempt, code = last_code, "topic not ready, retrying");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(self.config.reconnect_backoff_max_ms));
        }

        Err(ClientError::broker("Metadata", last_code))
    }

    /// The connection to the leader of a topic partition.
    ///
    /// Unknown routes trigger one metadata refresh before failing.
    ///
    /// # Errors
    ///
    /// Returns `LEADER_NOT_AVAILABLE` if the partition has no leader after
    /// refreshing, or the underlying metadata error.
    pub async fn route(&self, topic: &str, partition: i32) -> Result<Arc<BrokerConnection>> {
        self.ensure_open()?;

        let leader = match self.metadata().await.leader_for(topic, partition) {
            Some(leader) => leader,
            None => {
                let snapshot = self.refresh_metadata(&[topic.to_string()], false).await?;
                snapshot
                    .leader_for(topic, partition)
                    .ok_or_else(|| ClientError::broker("Metadata", error_code::LEADER_NOT_AVAILABLE))?
            }
        };

        self.broker(leader).await
    }

    /// A connection able to serve requests about `topic`: the leader of its
    /// lowest partition with an elected leader.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is unknown or leaderless.
    pub async fn route_topic(&self, topic: &str) -> Result<Arc<BrokerConnection>> {
        let metadata = self.topic_metadata(topic, false).await?;
        let leader = metadata
            .partitions
            .values()
            .find(|p| p.leader >= 0)
            .map(|p| p.leader)
            .ok_or_else(|| ClientError::broker("Metadata", error_code::LEADER_NOT_AVAILABLE))?;
        self.broker(leader).await
    }

    /// The connection to a broker by node id, created lazily from metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is not in the current metadata.
    pub async fn broker(&self, node_id: i32) -> Result<Arc<BrokerConnection>> {
        self.ensure_open()?;
        if let Some(conn) = self.connections.get(&node_id) {
            return Ok(Arc::clone(conn.value()));
        }

        let metadata = self.metadata().await;
        let info = metadata.broker(node_id).ok_or_else(|| ClientError::Transport {
            endpoint: format!("broker {node_id}"),
            message: "broker not in cluster metadata".to_string(),
        })?;
        Ok(self.connection_for(node_id, info.address()))
    }

    fn connection_for(&self, node_id: i32, address: String) -> Arc<BrokerConnection> {
        let entry = self.connections.entry(node_id).or_insert_with(|| {
            Arc::new(BrokerConnection::new(
                node_id,
                address.clone(),
                self.settings.clone(),
            ))
        });
        if entry.value().address() == address {
            return Arc::clone(entry.value());
        }
        drop(entry);

        let conn = Arc::new(BrokerConnection::new(node_id, address, self.settings.clone()));
        self.connections.insert(node_id, Arc::clone(&conn));
        conn
    }

    /// Any reachable broker, re-bootstrapping with backoff when every known
    /// broker is down.
    ///
    /// # Errors
    ///
    /// Returns a fatal channel error immediately, or the last bootstrap
    /// failure once the backoff is exhausted.
    pub async fn any_broker(&self) -> Result<Arc<BrokerConnection>> {
        self.ensure_open()?;

        let bootstrap = self.bootstrap.read().await.clone();
        let mut candidates: Vec<Arc<BrokerConnection>> = bootstrap.into_iter().collect();
        let metadata = self.metadata().await;
        for info in metadata.brokers() {
            candidates.push(self.connection_for(info.node_id, info.address()));
        }

        for conn in candidates {
            match conn.connect().await {
                Ok(()) => return Ok(conn),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!(address = conn.address(), error = %e, "broker unreachable"),
            }
        }

        let max = Duration::from_millis(self.config.reconnect_backoff_max_ms);
        let mut delay = Duration::from_millis(self.config.reconnect_backoff_ms);
        loop {
            match self.bootstrap_once().await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_fatal() || delay > max => return Err(e),
                Err(e) => {
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "re-bootstrapping after backoff");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    self.ensure_open()?;
                }
            }
        }
    }

    /// Send a request to any reachable broker, retrying once on a fresh
    /// channel if the first one fails in transit.
    ///
    /// # Errors
    ///
    /// Returns the request failure if the retry fails as well.
    pub async fn call_any<R: KafkaRequest>(&self, request: &R) -> Result<R::Response> {
        let conn = self.any_broker().await?;
        match conn.call(request).await {
            Err(e) if e.is_retriable() => {
                debug!(error = %e, api = R::NAME, "retrying request on another channel");
                let conn = self.any_broker().await?;
                conn.call(request).await
            }
            other => other,
        }
    }

    /// The coordinator of a consumer group, looked up once and cached.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Broker` if the lookup reports an error (for
    /// example `COORDINATOR_NOT_AVAILABLE`, which is retriable).
    pub async fn coordinator(&self, group_id: &str) -> Result<Arc<BrokerConnection>> {
        if let Some(node_id) = self.coordinators.get(group_id).map(|e| *e.value()) {
            if let Some(conn) = self.connections.get(&node_id) {
                return Ok(Arc::clone(conn.value()));
            }
        }

        let mut request = FindCoordinatorRequest::default();
        request.key = StrBytes::from_string(group_id.to_string());
        request.key_type = 0;

        let response = self.call_any(&request).await?;
        if response.error_code != error_code::NONE {
            return Err(ClientError::broker("FindCoordinator", response.error_code));
        }

        let node_id = response.node_id.0;
        let address = super::metadata::BrokerInfo::new(
            node_id,
            response.host.to_string(),
            response.port,
        )
        .address();
        debug!(group_id, node_id, address = %address, "found group coordinator");

        self.coordinators.insert(group_id.to_string(), node_id);
        Ok(self.connection_for(node_id, address))
    }

    /// Forget the cached coordinator of a group.
    pub fn invalidate_coordinator(&self, group_id: &str) {
        self.coordinators.remove(group_id);
    }

    /// Forget the routes of a topic so the next lookup refreshes them.
    pub async fn invalidate_topic(&self, topic: &str) {
        let mut current = self.metadata.write().await;
        *current = Arc::new(current.without_topic(topic));
    }

    /// Handle an error returned by a broker request on `topic`: drop stale
    /// routes so the next attempt re-discovers the leader.
    pub async fn handle_request_error(&self, topic: &str, err: &ClientError) {
        if err.needs_metadata_refresh() {
            self.invalidate_topic(topic).await;
        }
    }

    /// Number of brokers with a connection object (excluding bootstrap).
    #[must_use]
    pub fn broker_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(ClientError::Closed)
        } else {
            Ok(())
        }
    }

    /// Close every channel. Later operations fail with `ClientError::Closed`.
    /// Calling this more than once has no further effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(conn) = self.bootstrap.write().await.take() {
            conn.disconnect().await;
        }

        let connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in connections {
            conn.disconnect().await;
        }
        self.connections.clear();
        self.coordinators.clear();
        info!("broker pool closed");
    }
}
