//! Consumer client.
//!
//! A consumer subscribes under a group, owns the partitions the group leader
//! assigns it, and polls them from their leaders. Positions (next offset to
//! read) advance only when `poll` hands records to the caller, so a commit
//! never covers a record the application has not seen.
//!
//! ```text
//! Unsubscribed --subscribe--> Subscribed --poll--> Polling --close--> Closed
//! ```

pub mod assignor;
mod group;
pub mod record;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kafka_protocol::messages::fetch_request::{FetchPartition, FetchTopic};
use kafka_protocol::messages::list_offsets_request::{ListOffsetsPartition, ListOffsetsTopic};
use kafka_protocol::messages::{BrokerId, FetchRequest, ListOffsetsRequest, TopicName};
use kafka_protocol::protocol::StrBytes;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

pub use group::TopicPartition;
pub use record::ConsumerRecord;

use self::group::GroupMember;
use crate::broker::{BrokerConnection, BrokerPool, MetadataRefresher};
use crate::config::{ClientConfig, ConsumerConfig};
use crate::error::{ClientError, Result, RunError};
use crate::metrics::ClientMetrics;
use crate::protocol::error_code;
use crate::protocol::records::decode_record_set;

/// Poll timeout used by [`Consumer::run`] between shutdown checks.
const RUN_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Pause after a failed fetch round before trying again within one poll.
const FETCH_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Room left between a fetch's broker-side wait and the poll deadline, so
/// the response is read before the deadline cuts the round trip off.
const FETCH_DEADLINE_MARGIN: Duration = Duration::from_millis(20);

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unsubscribed,
    Subscribed,
    Polling,
    Closed,
}

impl ConsumerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsubscribed => "unsubscribed",
            Self::Subscribed => "subscribed",
            Self::Polling => "polling",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscribes to a topic under a consumer group and delivers its records.
///
/// Only one `poll` runs at a time per consumer; methods take `&mut self`.
pub struct Consumer {
    pool: Arc<BrokerPool>,
    owns_pool: bool,
    config: ConsumerConfig,
    group: GroupMember,
    state: ConsumerState,
    topics: Vec<String>,
    /// Next offset to deliver, per assigned partition.
    positions: BTreeMap<TopicPartition, i64>,
    /// Assigned partitions still waiting for a starting position.
    unpositioned: BTreeSet<TopicPartition>,
    /// Offsets as of the last successful commit.
    committed: BTreeMap<TopicPartition, i64>,
    last_commit: Instant,
    refresh_shutdown: Option<watch::Sender<bool>>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("group_id", &self.config.group_id)
            .field("state", &self.state)
            .field("topics", &self.topics)
            .field("positions", &self.positions)
            .finish()
    }
}

impl Consumer {
    /// Connect a consumer with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns configuration, credential, or connection errors. Authentication
    /// and trust failures are returned without retrying.
    #[instrument(skip(config), fields(servers = ?config.kafka.bootstrap_servers))]
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(BrokerPool::from_config(config)?);
        pool.connect().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        MetadataRefresher::new(
            Arc::clone(&pool),
            config.kafka.metadata_refresh_interval_secs,
            shutdown_rx,
        )
        .spawn();

        let mut consumer = Self::build(pool, config.consumer.clone(), true);
        consumer.refresh_shutdown = Some(shutdown_tx);
        info!(group_id = %config.consumer.group_id, "consumer connected");
        Ok(consumer)
    }

    /// A consumer on an already connected, shared pool. Closing the consumer
    /// leaves the pool open.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid consumer settings.
    pub fn with_pool(pool: Arc<BrokerPool>, config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(pool, config, false))
    }

    fn build(pool: Arc<BrokerPool>, config: ConsumerConfig, owns_pool: bool) -> Self {
        Self {
            group: GroupMember::new(Arc::clone(&pool), config.clone()),
            pool,
            owns_pool,
            config,
            state: ConsumerState::Unsubscribed,
            topics: Vec::new(),
            positions: BTreeMap::new(),
            unpositioned: BTreeSet::new(),
            committed: BTreeMap::new(),
            last_commit: Instant::now(),
            refresh_shutdown: None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Metrics recorded by this consumer's connection pool.
    #[must_use]
    pub fn metrics(&self) -> Arc<ClientMetrics> {
        self.pool.metrics()
    }

    /// Partitions currently owned by this consumer, sorted.
    #[must_use]
    pub fn assignment(&self) -> Vec<TopicPartition> {
        let owned: BTreeSet<&TopicPartition> =
            self.positions.keys().chain(&self.unpositioned).collect();
        owned.into_iter().cloned().collect()
    }

    /// Next offset `poll` will deliver for a partition.
    #[must_use]
    pub fn position(&self, topic: &str, partition: i32) -> Option<i64> {
        self.positions.get(&(topic.to_string(), partition)).copied()
    }

    fn require_state(&self, operation: &'static str, allowed: &[ConsumerState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ClientError::InvalidState {
                operation,
                state: self.state.as_str(),
            })
        }
    }

    /// Subscribe to `topic` and join the consumer group.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Subscription` if the topic does not exist and
    /// cannot be auto-created, `InvalidState` if already subscribed or closed,
    /// and connection errors from the group join.
    #[instrument(skip(self), fields(group_id = %self.config.group_id))]
    pub async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.require_state("subscribe", &[ConsumerState::Unsubscribed])?;

        self.pool
            .topic_metadata(topic, self.config.allow_auto_create_topics)
            .await
            .map_err(|e| match e {
                ClientError::Broker { .. } => ClientError::Subscription {
                    topic: topic.to_string(),
                    message: e.to_string(),
                },
                other => other,
            })?;

        self.topics = vec![topic.to_string()];
        self.rejoin().await?;
        self.state = ConsumerState::Subscribed;
        info!(topic, partitions = ?self.assignment(), "subscribed");
        Ok(())
    }

    /// Join (or rejoin) the group and reset positions for the new assignment.
    async fn rejoin(&mut self) -> Result<()> {
        let assignment = self.group.join(&self.topics).await?;
        let owned: BTreeSet<TopicPartition> = assignment
            .into_iter()
            .flat_map(|(topic, partitions)| partitions.into_iter().map(move |p| (topic.clone(), p)))
            .collect();

        self.positions.clear();
        self.committed.clear();
        self.unpositioned = owned;
        self.initialize_positions().await
    }

    /// Start unpositioned partitions from the group's committed offsets,
    /// falling back to the reset policy. Partitions leave the pending set one
    /// by one, so an interrupted call resumes where it stopped.
    async fn initialize_positions(&mut self) -> Result<()> {
        if self.unpositioned.is_empty() {
            return Ok(());
        }

        let partitions: Vec<TopicPartition> = self.unpositioned.iter().cloned().collect();
        let committed = self.group.fetch_committed(&partitions).await?;
        for (tp, offset) in committed {
            if self.unpositioned.remove(&tp) {
                self.positions.insert(tp.clone(), offset);
                self.committed.insert(tp, offset);
            }
        }

        while let Some(tp) = self.unpositioned.first().cloned() {
            let offset = self.reset_offset(&tp.0, tp.1).await?;
            debug!(topic = %tp.0, partition = tp.1, offset, "no committed offset, using reset policy");
            self.unpositioned.remove(&tp);
            self.positions.insert(tp, offset);
        }
        Ok(())
    }

    /// Earliest or latest offset of a partition, per `auto_offset_reset`.
    async fn reset_offset(&self, topic: &str, partition: i32) -> Result<i64> {
        let mut p = ListOffsetsPartition::default();
        p.partition_index = partition;
        p.current_leader_epoch = -1;
        p.timestamp = self.config.auto_offset_reset.list_offsets_timestamp();

        let mut t = ListOffsetsTopic::default();
        t.name = TopicName::from(StrBytes::from_string(topic.to_string()));
        t.partitions = vec![p];

        let mut request = ListOffsetsRequest::default();
        request.replica_id = BrokerId(-1);
        request.topics = vec![t];

        let conn = self.pool.route(topic, partition).await?;
        let response = conn.call(&request).await?;
        let answer = response
            .topics
            .iter()
            .flat_map(|t| t.partitions.iter())
            .find(|p| p.partition_index == partition)
            .ok_or_else(|| ClientError::protocol("list offsets response missing partition"))?;

        if answer.error_code != error_code::NONE {
            let err = ClientError::broker("ListOffsets", answer.error_code);
            self.pool.handle_request_error(topic, &err).await;
            return Err(err);
        }
        Ok(answer.offset)
    }

    /// Wait up to `timeout` for records and return them ordered by topic,
    /// partition and offset.
    ///
    /// Returns an empty batch when nothing arrives in time. Every step,
    /// including a pending group rejoin and a due auto-commit, is cut off at
    /// the deadline; whatever was cut off is picked up by the next poll.
    /// Transient fetch failures are retried within the timeout.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` before `subscribe` or after `close`, and fatal
    /// connection or group errors.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Vec<ConsumerRecord>> {
        self.require_state(
            "poll",
            &[ConsumerState::Subscribed, ConsumerState::Polling],
        )?;
        self.state = ConsumerState::Polling;
        let deadline = Instant::now() + timeout;

        if self.group.needs_rejoin() {
            if self.config.enable_auto_commit {
                match timeout_at(deadline, self.commit_positions()).await {
                    Ok(Err(e)) => debug!(error = %e, "commit before rejoin failed"),
                    Ok(Ok(())) => {}
                    Err(_) => return Ok(Vec::new()),
                }
            }
            info!(group_id = %self.config.group_id, "rejoining group");
            match timeout_at(deadline, self.rejoin()).await {
                Ok(result) => result?,
                Err(_) => {
                    debug!("rejoin still in progress at poll deadline");
                    return Ok(Vec::new());
                }
            }
        } else if !self.unpositioned.is_empty() {
            match timeout_at(deadline, self.initialize_positions()).await {
                Ok(Err(e)) if e.is_fatal() => return Err(e),
                Ok(Err(e)) => debug!(error = %e, "positioning assigned partitions failed"),
                Ok(Ok(())) => {}
                Err(_) => return Ok(Vec::new()),
            }
        }

        if self.config.enable_auto_commit
            && self.last_commit.elapsed() >= Duration::from_millis(self.config.auto_commit_interval_ms)
        {
            match timeout_at(deadline, self.commit_positions()).await {
                Ok(Err(e)) if e.is_fatal() => return Err(e),
                Ok(Err(e)) => warn!(error = %e, "auto commit failed"),
                Ok(Ok(())) => {}
                Err(_) => {
                    debug!("auto commit still in flight at poll deadline, retrying next poll");
                    return Ok(Vec::new());
                }
            }
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining <= FETCH_DEADLINE_MARGIN {
                tokio::time::sleep_until(deadline).await;
                return Ok(Vec::new());
            }
            let max_wait = (remaining - FETCH_DEADLINE_MARGIN)
                .min(Duration::from_millis(self.config.fetch_max_wait_ms));

            match timeout_at(deadline, self.fetch_round(max_wait)).await {
                Ok(Ok(records)) if !records.is_empty() => return Ok(records),
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.is_fatal() || matches!(e, ClientError::Closed) => return Err(e),
                Ok(Err(e)) => {
                    debug!(error = %e, "fetch round failed");
                    let pause = FETCH_RETRY_PAUSE.min(deadline.saturating_duration_since(Instant::now()));
                    tokio::time::sleep(pause).await;
                }
                Err(_) => return Ok(Vec::new()),
            }

            if Instant::now() >= deadline || self.group.needs_rejoin() {
                return Ok(Vec::new());
            }
        }
    }

    /// Fetch once from every assigned partition's leader.
    async fn fetch_round(&mut self, max_wait: Duration) -> Result<Vec<ConsumerRecord>> {
        if self.positions.is_empty() {
            tokio::time::sleep(max_wait).await;
            return Ok(Vec::new());
        }

        let mut by_leader: HashMap<i32, (Arc<BrokerConnection>, Vec<(TopicPartition, i64)>)> =
            HashMap::new();
        let mut last_err = None;
        for (tp, position) in &self.positions {
            match self.pool.route(&tp.0, tp.1).await {
                Ok(conn) => by_leader
                    .entry(conn.broker_id())
                    .or_insert_with(|| (Arc::clone(&conn), Vec::new()))
                    .1
                    .push((tp.clone(), *position)),
                Err(e) if e.is_fatal() || matches!(e, ClientError::Closed) => return Err(e),
                Err(e) => {
                    self.pool.handle_request_error(&tp.0, &e).await;
                    last_err = Some(e);
                }
            }
        }
        if by_leader.is_empty() {
            return Err(last_err.unwrap_or(ClientError::Closed));
        }

        let max_wait_ms = i32::try_from(max_wait.as_millis()).unwrap_or(i32::MAX);
        let fetches = by_leader.into_values().map(|(conn, partitions)| {
            let request = self.fetch_request(&partitions, max_wait_ms);
            async move { (conn.call(&request).await, partitions) }
        });
        let responses = join_all(fetches).await;

        let mut records = Vec::new();
        let mut failure = None;
        for (result, partitions) in responses {
            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    for (tp, _) in &partitions {
                        self.pool.handle_request_error(&tp.0, &e).await;
                    }
                    failure = Some(e);
                    continue;
                }
            };

            for topic in response.responses {
                let name = topic.topic.to_string();
                for data in topic.partitions {
                    let tp = (name.clone(), data.partition_index);
                    let Some(position) = self.positions.get(&tp).copied() else {
                        continue;
                    };
                    match data.error_code {
                        error_code::NONE => {
                            let Some(set) = data.records else { continue };
                            for record in decode_record_set(set)? {
                                // Batches may start before the requested offset.
                                if record.offset < position {
                                    continue;
                                }
                                records.push(ConsumerRecord {
                                    topic: name.clone(),
                                    partition: data.partition_index,
                                    offset: record.offset,
                                    key: record.key,
                                    value: record.value,
                                    timestamp: record.timestamp,
                                });
                            }
                        }
                        error_code::OFFSET_OUT_OF_RANGE => {
                            let reset = self.reset_offset(&tp.0, tp.1).await?;
                            warn!(
                                topic = %tp.0,
                                partition = tp.1,
                                position,
                                reset,
                                "offset out of range, resetting"
                            );
                            self.positions.insert(tp, reset);
                        }
                        code => {
                            let err = ClientError::broker("Fetch", code);
                            self.pool.handle_request_error(&tp.0, &err).await;
                            if error_code::requires_rejoin(code) {
                                self.group.mark_rejoin();
                            }
                            debug!(topic = %tp.0, partition = tp.1, error = %err, "fetch error");
                        }
                    }
                }
            }
        }

        if records.is_empty() {
            if let Some(e) = failure {
                return Err(e);
            }
        }
        Ok(self.deliver(records))
    }

    fn fetch_request(&self, partitions: &[(TopicPartition, i64)], max_wait_ms: i32) -> FetchRequest {
        let mut by_topic: BTreeMap<&str, Vec<FetchPartition>> = BTreeMap::new();
        for ((topic, partition), offset) in partitions {
            let mut p = FetchPartition::default();
            p.partition = *partition;
            p.current_leader_epoch = -1;
            p.fetch_offset = *offset;
            p.log_start_offset = -1;
            p.partition_max_bytes = self.config.fetch_max_bytes;
            by_topic.entry(topic.as_str()).or_default().push(p);
        }

        let mut request = FetchRequest::default();
        request.replica_id = BrokerId(-1);
        request.max_wait_ms = max_wait_ms;
        request.min_bytes = 1;
        request.max_bytes = self.config.fetch_max_bytes;
        request.session_epoch = -1;
        request.topics = by_topic
            .into_iter()
            .map(|(topic, partitions)| {
                let mut t = FetchTopic::default();
                t.topic = TopicName::from(StrBytes::from_string(topic.to_string()));
                t.partitions = partitions;
                t
            })
            .collect();
        request
    }

    /// Order, cap and hand out fetched records, advancing positions past
    /// exactly what is returned.
    fn deliver(&mut self, mut records: Vec<ConsumerRecord>) -> Vec<ConsumerRecord> {
        records.sort_by(|a, b| {
            (a.topic.as_str(), a.partition, a.offset).cmp(&(b.topic.as_str(), b.partition, b.offset))
        });
        records.dedup_by(|a, b| a.topic == b.topic && a.partition == b.partition && a.offset == b.offset);
        records.truncate(self.config.max_poll_records);

        let metrics = self.pool.metrics();
        for record in &records {
            self.positions
                .insert((record.topic.clone(), record.partition), record.offset + 1);
            let bytes = record.value.as_ref().map_or(0, |v| v.len()) as u64;
            metrics.record_consumed(&record.topic, 1, bytes);
        }
        records
    }

    /// Commit positions that changed since the last commit.
    async fn commit_positions(&mut self) -> Result<()> {
        let pending: BTreeMap<TopicPartition, i64> = self
            .positions
            .iter()
            .filter(|(tp, offset)| self.committed.get(*tp) != Some(*offset))
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect();

        if pending.is_empty() {
            self.last_commit = Instant::now();
            return Ok(());
        }
        // Stamped only once the attempt finishes, so an abandoned commit is
        // due again on the next poll.
        let result = self.group.commit(&pending).await;
        self.last_commit = Instant::now();
        result?;
        self.committed.extend(pending);
        Ok(())
    }

    /// Commit the current position (next offset to read) of every assigned
    /// partition.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` before `subscribe` or after `close`, and the
    /// coordinator's error if the commit is rejected.
    pub async fn commit(&mut self) -> Result<()> {
        self.require_state(
            "commit",
            &[ConsumerState::Subscribed, ConsumerState::Polling],
        )?;
        self.commit_positions().await
    }

    /// Move the position of an assigned partition. The next `poll` delivers
    /// from `offset`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the partition is not assigned to this
    /// consumer or the consumer is not subscribed.
    pub fn seek(&mut self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.require_state("seek", &[ConsumerState::Subscribed, ConsumerState::Polling])?;
        let tp = (topic.to_string(), partition);
        if self.unpositioned.remove(&tp) {
            debug!(topic, partition, to = offset, "seek before first position");
            self.positions.insert(tp, offset);
            return Ok(());
        }
        match self.positions.get_mut(&tp) {
            Some(position) => {
                debug!(topic, partition, from = *position, to = offset, "seek");
                *position = offset;
                Ok(())
            }
            None => Err(ClientError::InvalidState {
                operation: "seek",
                state: "not assigned the partition",
            }),
        }
    }

    /// The group's committed offset for a partition, if any.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` after `close`, or the coordinator's error.
    pub async fn committed(&self, topic: &str, partition: i32) -> Result<Option<i64>> {
        self.require_state(
            "committed",
            &[
                ConsumerState::Unsubscribed,
                ConsumerState::Subscribed,
                ConsumerState::Polling,
            ],
        )?;
        let tp = (topic.to_string(), partition);
        let committed = self.group.fetch_committed(std::slice::from_ref(&tp)).await?;
        Ok(committed.get(&tp).copied())
    }

    /// Poll and hand every record to `handler` until `shutdown` turns true.
    ///
    /// The shutdown signal is checked between bounded polls. If the handler
    /// fails, every partition is rewound to its first record not yet handled,
    /// so no unhandled record is ever committed, and the error is returned
    /// as [`RunError::Handler`]. With auto-commit disabled, positions are
    /// committed after each fully handled batch.
    ///
    /// # Errors
    ///
    /// Returns `RunError::Client` for consumer failures and
    /// `RunError::Handler` for the first handler failure.
    pub async fn run<F, Fut, E>(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        mut handler: F,
    ) -> std::result::Result<(), RunError<E>>
    where
        F: FnMut(ConsumerRecord) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
    {
        while !*shutdown.borrow_and_update() {
            let records = self.poll(RUN_POLL_TIMEOUT).await?;
            if records.is_empty() {
                continue;
            }

            for (idx, record) in records.iter().enumerate() {
                if let Err(e) = handler(record.clone()).await {
                    self.rewind(&records[idx..])?;
                    return Err(RunError::Handler(e));
                }
            }

            if !self.config.enable_auto_commit {
                self.commit().await?;
            }
        }

        debug!("run loop stopped by shutdown signal");
        Ok(())
    }

    /// Move each partition back to its first record in `unhandled`.
    fn rewind(&mut self, unhandled: &[ConsumerRecord]) -> Result<()> {
        let mut seen = BTreeSet::new();
        for record in unhandled {
            if seen.insert((record.topic.as_str(), record.partition)) {
                self.seek(&record.topic, record.partition, record.offset)?;
            }
        }
        Ok(())
    }

    /// Commit (with auto-commit on), leave the group and release the pool.
    /// Every later operation fails with `InvalidState`. Idempotent.
    pub async fn close(&mut self) {
        if self.state == ConsumerState::Closed {
            return;
        }

        if self.config.enable_auto_commit && self.state != ConsumerState::Unsubscribed {
            if let Err(e) = self.commit_positions().await {
                warn!(error = %e, "final commit failed");
            }
        }
        self.group.leave().await;

        if let Some(shutdown) = &self.refresh_shutdown {
            let _ = shutdown.send(true);
        }
        if self.owns_pool {
            self.pool.close().await;
        }

        self.positions.clear();
        self.unpositioned.clear();
        self.state = ConsumerState::Closed;
        info!(group_id = %self.group.group_id(), "consumer closed");
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if self.state != ConsumerState::Closed {
            warn!(
                group_id = %self.config.group_id,
                generation_id = self.group.generation_id(),
                "consumer dropped without close; delivered offsets may not be committed"
            );
            if let Some(shutdown) = &self.refresh_shutdown {
                let _ = shutdown.send(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KafkaConfig;
    use crate::metrics::ClientMetrics;
    use bytes::Bytes;

    fn consumer() -> Consumer {
        let pool = Arc::new(BrokerPool::new(
            KafkaConfig::new(vec!["localhost:9092".to_string()]),
            None,
            Arc::new(ClientMetrics::new()),
        ));
        Consumer::with_pool(pool, ConsumerConfig::default()).unwrap()
    }

    fn record(partition: i32, offset: i64) -> ConsumerRecord {
        ConsumerRecord {
            topic: "orders".to_string(),
            partition,
            offset,
            key: None,
            value: Some(Bytes::from_static(b"v")),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_poll_before_subscribe_is_invalid() {
        let mut consumer = consumer();
        let err = consumer.poll(Duration::ZERO).await.unwrap_err();
        assert_eq!(
            err,
            ClientError::InvalidState {
                operation: "poll",
                state: "unsubscribed"
            }
        );
    }

    #[tokio::test]
    async fn test_close_twice_then_poll_is_invalid() {
        let mut consumer = consumer();
        consumer.close().await;
        consumer.close().await;
        assert_eq!(consumer.state(), ConsumerState::Closed);

        let err = consumer.poll(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { state: "closed", .. }));
        assert!(matches!(
            consumer.subscribe("orders").await,
            Err(ClientError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_deliver_orders_caps_and_advances() {
        let mut consumer = consumer();
        consumer.config.max_poll_records = 3;
        consumer.positions.insert(("orders".to_string(), 0), 0);
        consumer.positions.insert(("orders".to_string(), 1), 0);

        let delivered = consumer.deliver(vec![
            record(1, 0),
            record(0, 1),
            record(0, 0),
            record(1, 1),
        ]);

        let order: Vec<(i32, i64)> = delivered.iter().map(|r| (r.partition, r.offset)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0)]);
        assert_eq!(consumer.position("orders", 0), Some(2));
        assert_eq!(consumer.position("orders", 1), Some(1));
    }

    #[test]
    fn test_rewind_to_first_unhandled_per_partition() {
        let mut consumer = consumer();
        consumer.state = ConsumerState::Polling;
        consumer.positions.insert(("orders".to_string(), 0), 5);
        consumer.positions.insert(("orders".to_string(), 1), 9);

        consumer
            .rewind(&[record(0, 3), record(0, 4), record(1, 8)])
            .unwrap();
        assert_eq!(consumer.position("orders", 0), Some(3));
        assert_eq!(consumer.position("orders", 1), Some(8));
    }

    #[test]
    fn test_seek_unassigned_partition() {
        let mut consumer = consumer();
        consumer.state = ConsumerState::Subscribed;
        assert!(matches!(
            consumer.seek("orders", 4, 0),
            Err(ClientError::InvalidState { operation: "seek", .. })
        ));
    }
}
