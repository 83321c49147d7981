//! Consumer group membership.
//!
//! Join and sync with the coordinator, keep the session alive with a
//! heartbeat task, and commit or read offsets under the current generation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kafka_protocol::messages::join_group_request::JoinGroupRequestProtocol;
use kafka_protocol::messages::leave_group_request::MemberIdentity;
use kafka_protocol::messages::offset_commit_request::{
    OffsetCommitRequestPartition, OffsetCommitRequestTopic,
};
use kafka_protocol::messages::offset_fetch_request::OffsetFetchRequestTopic;
use kafka_protocol::messages::sync_group_request::SyncGroupRequestAssignment;
use kafka_protocol::messages::{
    GroupId, HeartbeatRequest, JoinGroupRequest, LeaveGroupRequest, OffsetCommitRequest,
    OffsetFetchRequest, SyncGroupRequest, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::assignor::range_assign;
use crate::broker::BrokerPool;
use crate::config::ConsumerConfig;
use crate::error::{ClientError, Result};
use crate::protocol::{
    decode_assignment, decode_subscription, encode_assignment, encode_subscription, error_code,
    KafkaRequest, CONSUMER_PROTOCOL_TYPE, RANGE_ASSIGNOR,
};

/// Join attempts before a rebalance failure is surfaced.
const MAX_JOIN_ATTEMPTS: u32 = 10;

/// A topic partition.
pub type TopicPartition = (String, i32);

/// This consumer's membership in its group.
pub(crate) struct GroupMember {
    pool: Arc<BrokerPool>,
    config: ConsumerConfig,
    member_id: String,
    generation_id: i32,
    rejoin: Arc<AtomicBool>,
    heartbeat: Option<CancellationToken>,
}

impl GroupMember {
    pub fn new(pool: Arc<BrokerPool>, config: ConsumerConfig) -> Self {
        Self {
            pool,
            config,
            member_id: String::new(),
            generation_id: -1,
            rejoin: Arc::new(AtomicBool::new(false)),
            heartbeat: None,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.config.group_id
    }

    pub fn generation_id(&self) -> i32 {
        self.generation_id
    }

    /// Whether the coordinator asked this member to rejoin.
    pub fn needs_rejoin(&self) -> bool {
        self.rejoin.load(Ordering::Acquire)
    }

    pub fn mark_rejoin(&self) {
        self.rejoin.store(true, Ordering::Release);
    }

    fn group(&self) -> GroupId {
        GroupId::from(StrBytes::from_string(self.config.group_id.clone()))
    }

    /// Send a request to the group coordinator, forgetting the coordinator if
    /// the channel fails.
    async fn coordinator_call<R: KafkaRequest>(&self, request: &R) -> Result<R::Response> {
        let conn = self.pool.coordinator(&self.config.group_id).await?;
        let result = conn.call(request).await;
        if let Err(e) = &result {
            if e.is_retriable() {
                self.pool.invalidate_coordinator(&self.config.group_id);
            }
        }
        result
    }

    /// Map a group error code, updating coordinator and rejoin state.
    fn check(&self, api: &'static str, code: i16) -> Result<()> {
        if code == error_code::NONE {
            Ok(())
        } else {
            Err(self.group_error(api, code))
        }
    }

    fn group_error(&self, api: &'static str, code: i16) -> ClientError {
        if error_code::invalidates_coordinator(code) {
            self.pool.invalidate_coordinator(&self.config.group_id);
        }
        if error_code::requires_rejoin(code) {
            self.mark_rejoin();
        }
        ClientError::broker(api, code)
    }

    /// Join the group and return this member's assignment.
    ///
    /// # Errors
    ///
    /// Returns the last join error once the attempts are exhausted, or any
    /// non-retriable error immediately.
    #[instrument(skip(self), fields(group_id = %self.config.group_id))]
    pub async fn join(&mut self, topics: &[String]) -> Result<Vec<(String, Vec<i32>)>> {
        self.stop_heartbeat();
        let mut backoff = Duration::from_millis(100);
        let mut last_err = None;

        for attempt in 1..=MAX_JOIN_ATTEMPTS {
            match self.join_once(topics).await {
                Ok(assignment) => {
                    self.rejoin.store(false, Ordering::Release);
                    self.spawn_heartbeat();
                    info!(
                        generation_id = self.generation_id,
                        member_id = %self.member_id,
                        partitions = ?assignment,
                        "joined consumer group"
                    );
                    return Ok(assignment);
                }
                Err(ClientError::Broker { code, .. }) if code == error_code::MEMBER_ID_REQUIRED => {
                    // The member id was stored by join_once; rejoin at once.
                    continue;
                }
                Err(e) if e.is_retriable() || rebalancing(&e) => {
                    debug!(attempt, error = %e, "join attempt failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(2));
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| ClientError::broker("JoinGroup", error_code::REBALANCE_IN_PROGRESS)))
    }

    async fn join_once(&mut self, topics: &[String]) -> Result<Vec<(String, Vec<i32>)>> {
        let mut protocol = JoinGroupRequestProtocol::default();
        protocol.name = StrBytes::from_static_str(RANGE_ASSIGNOR);
        protocol.metadata = encode_subscription(topics)?;

        let mut request = JoinGroupRequest::default();
        request.group_id = self.group();
        request.session_timeout_ms = clamp_ms(self.config.session_timeout_ms);
        request.rebalance_timeout_ms = clamp_ms(self.config.rebalance_timeout_ms);
        request.member_id = StrBytes::from_string(self.member_id.clone());
        request.protocol_type = StrBytes::from_static_str(CONSUMER_PROTOCOL_TYPE);
        request.protocols = vec![protocol];

        let response = self.coordinator_call(&request).await?;
        match response.error_code {
            error_code::NONE => {}
            error_code::MEMBER_ID_REQUIRED => {
                self.member_id = response.member_id.to_string();
                return Err(ClientError::broker("JoinGroup", response.error_code));
            }
            code => {
                if code == error_code::UNKNOWN_MEMBER_ID {
                    self.member_id.clear();
                }
                return Err(self.group_error("JoinGroup", code));
            }
        }

        self.member_id = response.member_id.to_string();
        self.generation_id = response.generation_id;
        let is_leader = response.leader.to_string() == self.member_id;

        let assignments = if is_leader {
            let members: Vec<(String, Bytes)> = response
                .members
                .iter()
                .map(|m| (m.member_id.to_string(), m.metadata.clone()))
                .collect();
            self.leader_assignments(members).await?
        } else {
            Vec::new()
        };

        let mut sync = SyncGroupRequest::default();
        sync.group_id = self.group();
        sync.generation_id = self.generation_id;
        sync.member_id = StrBytes::from_string(self.member_id.clone());
        sync.assignments = assignments;

        let response = self.coordinator_call(&sync).await?;
        self.check("SyncGroup", response.error_code)?;
        decode_assignment(response.assignment)
    }

    /// Compute every member's range assignment as the elected leader.
    async fn leader_assignments(
        &self,
        members: Vec<(String, Bytes)>,
    ) -> Result<Vec<SyncGroupRequestAssignment>> {
        let mut subscriptions = BTreeMap::new();
        for (member_id, metadata) in members {
            subscriptions.insert(member_id, decode_subscription(metadata)?);
        }

        let mut partitions = BTreeMap::new();
        for topic in subscriptions.values().flatten() {
            if partitions.contains_key(topic) {
                continue;
            }
            match self.pool.topic_metadata(topic, false).await {
                Ok(metadata) => {
                    partitions.insert(topic.clone(), metadata.partition_ids());
                }
                Err(e) => warn!(topic = %topic, error = %e, "cannot assign unknown topic"),
            }
        }

        let plan = range_assign(&subscriptions, &partitions);
        debug!(members = plan.len(), "computed range assignment as group leader");

        plan.into_iter()
            .map(|(member_id, owned)| {
                let mut assignment = SyncGroupRequestAssignment::default();
                assignment.member_id = StrBytes::from_string(member_id);
                assignment.assignment = encode_assignment(&owned)?;
                Ok(assignment)
            })
            .collect()
    }

    fn spawn_heartbeat(&mut self) {
        let token = CancellationToken::new();
        self.heartbeat = Some(token.clone());

        let pool = Arc::clone(&self.pool);
        let rejoin = Arc::clone(&self.rejoin);
        let period = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));

        let mut request = HeartbeatRequest::default();
        request.group_id = self.group();
        request.generation_id = self.generation_id;
        request.member_id = StrBytes::from_string(self.member_id.clone());
        let group_id = self.config.group_id.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let result = match pool.coordinator(&group_id).await {
                    Ok(conn) => conn.call(&request).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(response) if response.error_code == error_code::NONE => {}
                    Ok(response) if error_code::requires_rejoin(response.error_code) => {
                        info!(
                            group_id = %group_id,
                            code = error_code::name(response.error_code),
                            "group rebalancing, rejoin required"
                        );
                        rejoin.store(true, Ordering::Release);
                        break;
                    }
                    Ok(response) => {
                        if error_code::invalidates_coordinator(response.error_code) {
                            pool.invalidate_coordinator(&group_id);
                        }
                        debug!(code = error_code::name(response.error_code), "heartbeat rejected");
                    }
                    Err(ClientError::Closed) => break,
                    Err(e) => {
                        pool.invalidate_coordinator(&group_id);
                        debug!(error = %e, "heartbeat failed");
                    }
                }
            }
        });
    }

    pub fn stop_heartbeat(&mut self) {
        if let Some(token) = self.heartbeat.take() {
            token.cancel();
        }
    }

    /// Commit `offsets` (next offset to read per partition) under the current generation.
    ///
    /// # Errors
    ///
    /// Returns the first partition error the coordinator reported.
    pub async fn commit(&self, offsets: &BTreeMap<TopicPartition, i64>) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut by_topic: BTreeMap<&str, Vec<OffsetCommitRequestPartition>> = BTreeMap::new();
        for ((topic, partition), offset) in offsets {
            let mut p = OffsetCommitRequestPartition::default();
            p.partition_index = *partition;
            p.committed_offset = *offset;
            by_topic.entry(topic.as_str()).or_default().push(p);
        }

        let mut request = OffsetCommitRequest::default();
        request.group_id = self.group();
        request.generation_id_or_member_epoch = self.generation_id;
        request.member_id = StrBytes::from_string(self.member_id.clone());
        request.topics = by_topic
            .into_iter()
            .map(|(topic, partitions)| {
                let mut t = OffsetCommitRequestTopic::default();
                t.name = TopicName::from(StrBytes::from_string(topic.to_string()));
                t.partitions = partitions;
                t
            })
            .collect();

        let response = self.coordinator_call(&request).await?;
        for topic in &response.topics {
            for partition in &topic.partitions {
                self.check("OffsetCommit", partition.error_code)?;
            }
        }

        self.pool.metrics().record_commit();
        debug!(partitions = offsets.len(), "offsets committed");
        Ok(())
    }

    /// Committed offsets of the group; partitions without one are absent.
    ///
    /// # Errors
    ///
    /// Returns a broker error if the coordinator rejects the request.
    pub async fn fetch_committed(
        &self,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>> {
        let mut by_topic: BTreeMap<&str, Vec<i32>> = BTreeMap::new();
        for (topic, partition) in partitions {
            by_topic.entry(topic.as_str()).or_default().push(*partition);
        }

        let mut request = OffsetFetchRequest::default();
        request.group_id = self.group();
        request.topics = Some(
            by_topic
                .into_iter()
                .map(|(topic, indexes)| {
                    let mut t = OffsetFetchRequestTopic::default();
                    t.name = TopicName::from(StrBytes::from_string(topic.to_string()));
                    t.partition_indexes = indexes;
                    t
                })
                .collect(),
        );

        let response = self.coordinator_call(&request).await?;
        self.check("OffsetFetch", response.error_code)?;

        let mut committed = HashMap::new();
        for topic in &response.topics {
            for partition in &topic.partitions {
                if partition.error_code != error_code::NONE {
                    self.check("OffsetFetch", partition.error_code)?;
                }
                if partition.committed_offset >= 0 {
                    committed.insert(
                        (topic.name.to_string(), partition.partition_index),
                        partition.committed_offset,
                    );
                }
            }
        }
        Ok(committed)
    }

    /// Leave the group so its partitions are reassigned without waiting for
    /// the session to expire. Failures are logged, not returned.
    pub async fn leave(&mut self) {
        self.stop_heartbeat();
        if self.member_id.is_empty() {
            return;
        }

        let mut member = MemberIdentity::default();
        member.member_id = StrBytes::from_string(self.member_id.clone());

        let mut request = LeaveGroupRequest::default();
        request.group_id = self.group();
        request.members = vec![member];

        match self.coordinator_call(&request).await {
            Ok(response) if response.error_code == error_code::NONE => {
                debug!(member_id = %self.member_id, "left consumer group");
            }
            Ok(response) => warn!(
                code = error_code::name(response.error_code),
                "leave group rejected"
            ),
            Err(e) => warn!(error = %e, "failed to leave group"),
        }

        self.member_id.clear();
        self.generation_id = -1;
    }
}

impl Drop for GroupMember {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}

fn rebalancing(err: &ClientError) -> bool {
    matches!(err, ClientError::Broker { code, .. } if error_code::requires_rejoin(*code))
}

fn clamp_ms(ms: u64) -> i32 {
    i32::try_from(ms).unwrap_or(i32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KafkaConfig;
    use crate::metrics::ClientMetrics;

    fn member() -> GroupMember {
        let pool = Arc::new(BrokerPool::new(
            KafkaConfig::new(vec!["localhost:9092".to_string()]),
            None,
            Arc::new(ClientMetrics::new()),
        ));
        GroupMember::new(pool, ConsumerConfig::default())
    }

    #[test]
    fn test_rebalance_codes_mark_rejoin() {
        let member = member();
        assert!(!member.needs_rejoin());

        let err = member
            .check("Heartbeat", error_code::REBALANCE_IN_PROGRESS)
            .unwrap_err();
        assert!(matches!(err, ClientError::Broker { api: "Heartbeat", .. }));
        assert!(member.needs_rejoin());
    }

    #[test]
    fn test_none_is_ok() {
        let member = member();
        assert!(member.check("OffsetCommit", error_code::NONE).is_ok());
        assert!(!member.needs_rejoin());
    }

    #[tokio::test]
    async fn test_empty_commit_is_noop() {
        let member = member();
        assert!(member.commit(&BTreeMap::new()).await.is_ok());
    }
}
