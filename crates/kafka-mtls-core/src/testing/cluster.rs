//! An in-memory Kafka cluster served through [`MockBroker`]s.
//!
//! The cluster keeps topic logs, consumer groups and committed offsets in
//! one shared state. Each installed broker answers the APIs the clients
//! speak at their pinned versions, so producer, consumer and group code run
//! end to end without a real cluster.
//!
//! Partition `p` is led by the `p % n`th broker (by node id) unless moved
//! with [`MockCluster::set_leader`]. The broker with the lowest node id
//! coordinates every group.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use kafka_protocol::messages::fetch_response::{FetchableTopicResponse, PartitionData};
use kafka_protocol::messages::join_group_response::JoinGroupResponseMember;
use kafka_protocol::messages::leave_group_response::MemberResponse;
use kafka_protocol::messages::list_offsets_response::{
    ListOffsetsPartitionResponse, ListOffsetsTopicResponse,
};
use kafka_protocol::messages::metadata_response::{
    MetadataResponseBroker, MetadataResponsePartition, MetadataResponseTopic,
};
use kafka_protocol::messages::offset_commit_response::{
    OffsetCommitResponsePartition, OffsetCommitResponseTopic,
};
use kafka_protocol::messages::offset_fetch_response::{
    OffsetFetchResponsePartition, OffsetFetchResponseTopic,
};
use kafka_protocol::messages::produce_response::{
    PartitionProduceResponse, TopicProduceResponse,
};
use kafka_protocol::messages::{
    BrokerId, FetchRequest, FetchResponse, FindCoordinatorRequest, FindCoordinatorResponse,
    HeartbeatRequest, HeartbeatResponse, JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest,
    LeaveGroupResponse, ListOffsetsRequest, ListOffsetsResponse, MetadataRequest,
    MetadataResponse, OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest,
    OffsetFetchResponse, ProduceRequest, ProduceResponse, RequestHeader, SyncGroupRequest,
    SyncGroupResponse, TopicName,
};
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use tracing::{debug, warn};

use super::mock_broker::{api_keys, BrokerCall, MockBroker, Reply};
use crate::error::Result;
use crate::protocol::error_code;
use crate::protocol::records::{assign_offsets, decode_record_set, IncomingRecord};
use crate::protocol::{KafkaRequest, RANGE_ASSIGNOR};

/// Shared in-memory cluster state. Cloning yields another handle to the same cluster.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

#[derive(Default)]
struct ClusterState {
    brokers: BTreeMap<i32, (String, i32)>,
    topics: BTreeMap<String, Vec<PartitionLog>>,
    auto_create_partitions: Option<i32>,
    groups: BTreeMap<String, GroupState>,
    committed: BTreeMap<(String, String, i32), i64>,
    produce_failures: VecDeque<i16>,
    next_member: u64,
}

#[derive(Default)]
struct PartitionLog {
    leader: Option<i32>,
    batches: Vec<StoredBatch>,
    high_watermark: i64,
}

struct StoredBatch {
    next_offset: i64,
    data: Bytes,
}

#[derive(Default)]
struct GroupState {
    generation: i32,
    leader: Option<String>,
    pending: BTreeSet<String>,
    members: BTreeMap<String, MemberState>,
    assignments: BTreeMap<String, Bytes>,
    assigned_generation: i32,
}

struct MemberState {
    metadata: Bytes,
    generation: i32,
}

fn lock(state: &Mutex<ClusterState>) -> MutexGuard<'_, ClusterState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn topic_name(name: &str) -> TopicName {
    TopicName::from(StrBytes::from_string(name.to_string()))
}

impl MockCluster {
    /// An empty cluster with no brokers and no topics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `topic` with `partitions` partitions, replacing any existing log.
    #[must_use]
    pub fn with_topic(self, topic: &str, partitions: i32) -> Self {
        self.create_topic(topic, partitions);
        self
    }

    /// Create unknown topics with `partitions` partitions when a metadata
    /// request allows auto-creation.
    #[must_use]
    pub fn with_auto_create(self, partitions: i32) -> Self {
        lock(&self.state).auto_create_partitions = Some(partitions);
        self
    }

    /// Create `topic` with `partitions` partitions, replacing any existing log.
    pub fn create_topic(&self, topic: &str, partitions: i32) {
        lock(&self.state).create_topic(topic, partitions);
    }

    /// Move leadership of a partition to `node_id`.
    pub fn set_leader(&self, topic: &str, partition: i32, node_id: i32) {
        let mut state = lock(&self.state);
        if let Some(log) = state.partition_mut(topic, partition) {
            log.leader = Some(node_id);
        }
    }

    /// Fail the next `count` partition appends with `code`.
    pub fn fail_next_produces(&self, count: usize, code: i16) {
        lock(&self.state)
            .produce_failures
            .extend(std::iter::repeat(code).take(count));
    }

    /// The offset the next appended record will receive.
    #[must_use]
    pub fn high_watermark(&self, topic: &str, partition: i32) -> Option<i64> {
        let state = lock(&self.state);
        state.partition(topic, partition).map(|log| log.high_watermark)
    }

    /// Every record appended to a partition, in offset order.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a stored batch does not decode.
    pub fn records(&self, topic: &str, partition: i32) -> Result<Vec<IncomingRecord>> {
        let data = {
            let state = lock(&self.state);
            let mut data = BytesMut::new();
            if let Some(log) = state.partition(topic, partition) {
                for batch in &log.batches {
                    data.extend_from_slice(&batch.data);
                }
            }
            data.freeze()
        };
        decode_record_set(data)
    }

    /// The offset a group committed for a partition.
    #[must_use]
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        lock(&self.state)
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Number of members currently in a group.
    #[must_use]
    pub fn group_size(&self, group: &str) -> usize {
        lock(&self.state)
            .groups
            .get(group)
            .map_or(0, |g| g.members.len())
    }

    /// Serve this cluster through `broker` as node `node_id`.
    ///
    /// The broker must already be started so its bound address can be
    /// advertised in metadata.
    pub async fn install(&self, broker: &MockBroker, node_id: i32) {
        lock(&self.state).brokers.insert(node_id, broker.host_port());

        let state = Arc::clone(&self.state);
        broker
            .register_handler(
                api_keys::METADATA,
                Arc::new(move |call| {
                    serve::<MetadataRequest>(call, |req| lock(&state).metadata(&req))
                }),
            )
            .await;

        let state = Arc::clone(&self.state);
        broker
            .register_handler(
                api_keys::PRODUCE,
                Arc::new(move |call| {
                    let Some(req) = decode::<ProduceRequest>(call) else {
                        return Reply::Silent;
                    };
                    let response = lock(&state).produce(node_id, &req);
                    if req.acks == 0 {
                        Reply::Silent
                    } else {
                        frame(call, &response)
                    }
                }),
            )
            .await;

        let state = Arc::clone(&self.state);
        broker
            .register_handler(
                api_keys::FETCH,
                Arc::new(move |call| {
                    let Some(req) = decode::<FetchRequest>(call) else {
                        return Reply::Silent;
                    };
                    let (response, has_data) = lock(&state).fetch(node_id, &req);
                    match frame(call, &response) {
                        Reply::Frame(bytes) if !has_data && req.max_wait_ms > 0 => {
                            let wait = Duration::from_millis(u64::try_from(req.max_wait_ms).unwrap_or(0));
                            Reply::Delayed(wait, bytes)
                        }
                        reply => reply,
                    }
                }),
            )
            .await;

        let state = Arc::clone(&self.state);
        broker
            .register_handler(
                api_keys::LIST_OFFSETS,
                Arc::new(move |call| {
                    serve::<ListOffsetsRequest>(call, |req| lock(&state).list_offsets(node_id, &req))
                }),
            )
            .await;

        let state = Arc::clone(&self.state);
        broker
            .register_handler(
                api_keys::FIND_COORDINATOR,
                Arc::new(move |call| {
                    serve::<FindCoordinatorRequest>(call, |_| lock(&state).find_coordinator())
                }),
            )
            .await;

        let state = Arc::clone(&self.state);
        broker
            .register_handler(
                api_keys::JOIN_GROUP,
                Arc::new(move |call| {
                    serve::<JoinGroupRequest>(call, |req| lock(&state).join_group(node_id, &req))
                }),
            )
            .await;

        let state = Arc::clone(&self.state);
        broker
            .register_handler(
                api_keys::SYNC_GROUP,
                Arc::new(move |call| {
                    serve::<SyncGroupRequest>(call, |req| lock(&state).sync_group(node_id, &req))
                }),
            )
            .await;

        let state = Arc::clone(&self.state);
        broker
            .register_handler(
                api_keys::HEARTBEAT,
                Arc::new(move |call| {
                    serve::<HeartbeatRequest>(call, |req| lock(&state).heartbeat(node_id, &req))
                }),
            )
            .await;

        let state = Arc::clone(&self.state);
        broker
            .register_handler(
                api_keys::LEAVE_GROUP,
                Arc::new(move |call| {
                    serve::<LeaveGroupRequest>(call, |req| lock(&state).leave_group(node_id, &req))
                }),
            )
            .await;

        let state = Arc::clone(&self.state);
        broker
            .register_handler(
                api_keys::OFFSET_COMMIT,
                Arc::new(move |call| {
                    serve::<OffsetCommitRequest>(call, |req| {
                        lock(&state).offset_commit(node_id, &req)
                    })
                }),
            )
            .await;

        let state = Arc::clone(&self.state);
        broker
            .register_handler(
                api_keys::OFFSET_FETCH,
                Arc::new(move |call| {
                    serve::<OffsetFetchRequest>(call, |req| lock(&state).offset_fetch(node_id, &req))
                }),
            )
            .await;

        debug!(node_id, address = %broker.address(), "mock cluster installed on broker");
    }
}

/// Decode the request carried by `call` at the version it was sent with.
fn decode<R: KafkaRequest + Decodable>(call: &BrokerCall) -> Option<R> {
    let mut buf = call.request_bytes.clone();
    let decoded = RequestHeader::decode(&mut buf, R::header_version(call.api_version))
        .and_then(|_| R::decode(&mut buf, call.api_version));
    match decoded {
        Ok(request) => Some(request),
        Err(e) => {
            warn!(api = R::NAME, error = %e, "mock cluster cannot decode request");
            None
        }
    }
}

/// Encode a response body behind its correlation id.
fn frame<T: Encodable>(call: &BrokerCall, response: &T) -> Reply {
    let mut buf = BytesMut::new();
    buf.put_i32(call.correlation_id);
    match response.encode(&mut buf, call.api_version) {
        Ok(()) => Reply::Frame(buf.freeze()),
        Err(e) => {
            warn!(api_key = call.api_key, error = %e, "mock cluster cannot encode response");
            Reply::Silent
        }
    }
}

fn serve<R>(call: &BrokerCall, handle: impl FnOnce(R) -> R::Response) -> Reply
where
    R: KafkaRequest + Decodable,
    R::Response: Encodable,
{
    match decode::<R>(call) {
        Some(request) => frame(call, &handle(request)),
        None => Reply::Silent,
    }
}

impl ClusterState {
    fn create_topic(&mut self, topic: &str, partitions: i32) {
        let logs = (0..partitions.max(1)).map(|_| PartitionLog::default()).collect();
        self.topics.insert(topic.to_string(), logs);
        debug!(topic, partitions, "mock cluster created topic");
    }

    fn partition(&self, topic: &str, partition: i32) -> Option<&PartitionLog> {
        let index = usize::try_from(partition).ok()?;
        self.topics.get(topic)?.get(index)
    }

    fn partition_mut(&mut self, topic: &str, partition: i32) -> Option<&mut PartitionLog> {
        let index = usize::try_from(partition).ok()?;
        self.topics.get_mut(topic)?.get_mut(index)
    }

    fn leader_of(&self, log: &PartitionLog, partition: i32) -> i32 {
        if let Some(leader) = log.leader {
            return leader;
        }
        let ids: Vec<i32> = self.brokers.keys().copied().collect();
        if ids.is_empty() {
            return -1;
        }
        let index = usize::try_from(partition).unwrap_or(0) % ids.len();
        ids[index]
    }

    fn coordinator_id(&self) -> Option<i32> {
        self.brokers.keys().next().copied()
    }

    /// Resolve a partition this node leads, or the error a broker would return.
    fn led_partition(
        &self,
        node_id: i32,
        topic: &str,
        partition: i32,
    ) -> std::result::Result<&PartitionLog, i16> {
        let log = self
            .partition(topic, partition)
            .ok_or(error_code::UNKNOWN_TOPIC_OR_PARTITION)?;
        if self.leader_of(log, partition) == node_id {
            Ok(log)
        } else {
            Err(error_code::NOT_LEADER_OR_FOLLOWER)
        }
    }

    fn metadata(&mut self, req: &MetadataRequest) -> MetadataResponse {
        let mut response = MetadataResponse::default();
        response.cluster_id = Some(StrBytes::from_static_str("mock-cluster"));
        response.controller_id = BrokerId(self.coordinator_id().unwrap_or(-1));
        response.brokers = self
            .brokers
            .iter()
            .map(|(id, (host, port))| {
                let mut broker = MetadataResponseBroker::default();
                broker.node_id = BrokerId(*id);
                broker.host = StrBytes::from_string(host.clone());
                broker.port = *port;
                broker
            })
            .collect();

        let names: Vec<String> = match &req.topics {
            None => self.topics.keys().cloned().collect(),
            Some(topics) => topics
                .iter()
                .filter_map(|t| t.name.as_ref().map(|n| n.to_string()))
                .collect(),
        };

        for name in names {
            let mut topic = MetadataResponseTopic::default();
            topic.name = Some(topic_name(&name));

            let Some(logs) = self.topics.get(&name) else {
                topic.error_code = match self.auto_create_partitions {
                    Some(partitions) if req.allow_auto_topic_creation => {
                        self.create_topic(&name, partitions);
                        error_code::LEADER_NOT_AVAILABLE
                    }
                    _ => error_code::UNKNOWN_TOPIC_OR_PARTITION,
                };
                response.topics.push(topic);
                continue;
            };

            topic.partitions = logs
                .iter()
                .zip(0i32..)
                .map(|(log, index)| {
                    let leader = self.leader_of(log, index);
                    let mut partition = MetadataResponsePartition::default();
                    partition.partition_index = index;
                    partition.leader_id = BrokerId(leader);
                    partition.leader_epoch = 0;
                    partition.replica_nodes = vec![BrokerId(leader)];
                    partition.isr_nodes = vec![BrokerId(leader)];
                    if leader < 0 {
                        partition.error_code = error_code::LEADER_NOT_AVAILABLE;
                    }
                    partition
                })
                .collect();
            response.topics.push(topic);
        }
        response
    }

    fn produce(&mut self, node_id: i32, req: &ProduceRequest) -> ProduceResponse {
        let mut response = ProduceResponse::default();
        for topic in &req.topic_data {
            let name = topic.name.to_string();
            let mut topic_response = TopicProduceResponse::default();
            topic_response.name = topic.name.clone();

            for data in &topic.partition_data {
                let mut partition = PartitionProduceResponse::default();
                partition.index = data.index;
                partition.base_offset = -1;
                partition.log_append_time_ms = -1;
                match self.append(node_id, &name, data.index, data.records.as_ref()) {
                    Ok(base_offset) => {
                        partition.base_offset = base_offset;
                        partition.log_start_offset = 0;
                    }
                    Err(code) => partition.error_code = code,
                }
                topic_response.partition_responses.push(partition);
            }
            response.responses.push(topic_response);
        }
        response
    }

    fn append(
        &mut self,
        node_id: i32,
        topic: &str,
        partition: i32,
        records: Option<&Bytes>,
    ) -> std::result::Result<i64, i16> {
        if let Some(code) = self.produce_failures.pop_front() {
            debug!(topic, partition, code = error_code::name(code), "injected produce failure");
            return Err(code);
        }
        let base = self.led_partition(node_id, topic, partition)?.high_watermark;
        let records = records.ok_or(error_code::INVALID_RECORD)?;
        let (data, next_offset) =
            assign_offsets(records, base).map_err(|_| error_code::CORRUPT_MESSAGE)?;

        let log = self
            .partition_mut(topic, partition)
            .ok_or(error_code::UNKNOWN_TOPIC_OR_PARTITION)?;
        log.batches.push(StoredBatch { next_offset, data });
        log.high_watermark = next_offset;
        Ok(base)
    }

    /// Build a fetch response; the flag tells whether it carries records or errors.
    fn fetch(&self, node_id: i32, req: &FetchRequest) -> (FetchResponse, bool) {
        let mut response = FetchResponse::default();
        let mut has_data = false;

        for topic in &req.topics {
            let name = topic.topic.to_string();
            let mut topic_response = FetchableTopicResponse::default();
            topic_response.topic = topic.topic.clone();

            for fetch in &topic.partitions {
                let mut data = PartitionData::default();
                data.partition_index = fetch.partition;
                data.high_watermark = -1;
                data.last_stable_offset = -1;
                data.log_start_offset = -1;
                data.preferred_read_replica = BrokerId(-1);

                let read = self.read(
                    node_id,
                    &name,
                    fetch.partition,
                    fetch.fetch_offset,
                    fetch.partition_max_bytes,
                );
                match read {
                    Ok((high_watermark, records)) => {
                        data.high_watermark = high_watermark;
                        data.last_stable_offset = high_watermark;
                        data.log_start_offset = 0;
                        if records.is_some() {
                            has_data = true;
                        }
                        data.records = records;
                    }
                    Err(code) => {
                        has_data = true;
                        data.error_code = code;
                    }
                }
                topic_response.partitions.push(data);
            }
            response.responses.push(topic_response);
        }
        (response, has_data)
    }

    /// Whole batches holding offsets at or after `offset`, at least one
    /// batch and then up to `max_bytes`.
    fn read(
        &self,
        node_id: i32,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: i32,
    ) -> std::result::Result<(i64, Option<Bytes>), i16> {
        let log = self.led_partition(node_id, topic, partition)?;
        if offset < 0 || offset > log.high_watermark {
            return Err(error_code::OFFSET_OUT_OF_RANGE);
        }

        let limit = usize::try_from(max_bytes).unwrap_or(0);
        let mut out = BytesMut::new();
        for batch in log.batches.iter().filter(|b| b.next_offset > offset) {
            if !out.is_empty() && out.len() + batch.data.len() > limit {
                break;
            }
            out.extend_from_slice(&batch.data);
        }
        let records = (!out.is_empty()).then(|| out.freeze());
        Ok((log.high_watermark, records))
    }

    fn list_offsets(&self, node_id: i32, req: &ListOffsetsRequest) -> ListOffsetsResponse {
        let mut response = ListOffsetsResponse::default();
        for topic in &req.topics {
            let name = topic.name.to_string();
            let mut topic_response = ListOffsetsTopicResponse::default();
            topic_response.name = topic.name.clone();

            for request in &topic.partitions {
                let mut partition = ListOffsetsPartitionResponse::default();
                partition.partition_index = request.partition_index;
                partition.timestamp = -1;
                partition.offset = -1;
                match self.led_partition(node_id, &name, request.partition_index) {
                    // -2 asks for the earliest offset; nothing is ever truncated.
                    Ok(_) if request.timestamp == -2 => partition.offset = 0,
                    Ok(log) => partition.offset = log.high_watermark,
                    Err(code) => partition.error_code = code,
                }
                topic_response.partitions.push(partition);
            }
            response.topics.push(topic_response);
        }
        response
    }

    fn find_coordinator(&self) -> FindCoordinatorResponse {
        let mut response = FindCoordinatorResponse::default();
        match self.coordinator_id().and_then(|id| Some((id, self.brokers.get(&id)?))) {
            Some((id, (host, port))) => {
                response.node_id = BrokerId(id);
                response.host = StrBytes::from_string(host.clone());
                response.port = *port;
            }
            None => {
                response.error_code = error_code::COORDINATOR_NOT_AVAILABLE;
                response.node_id = BrokerId(-1);
                response.port = -1;
            }
        }
        response
    }

    fn check_coordinator(&self, node_id: i32) -> std::result::Result<(), i16> {
        if self.coordinator_id() == Some(node_id) {
            Ok(())
        } else {
            Err(error_code::NOT_COORDINATOR)
        }
    }

    fn join_group(&mut self, node_id: i32, req: &JoinGroupRequest) -> JoinGroupResponse {
        let mut response = JoinGroupResponse::default();
        response.generation_id = -1;
        response.protocol_name = Some(StrBytes::from_static_str(RANGE_ASSIGNOR));

        if let Err(code) = self.check_coordinator(node_id) {
            response.error_code = code;
            return response;
        }

        let group_id = req.group_id.to_string();
        let requested = req.member_id.to_string();
        if requested.is_empty() {
            self.next_member += 1;
            let member_id = format!("member-{}", self.next_member);
            self.groups
                .entry(group_id)
                .or_default()
                .pending
                .insert(member_id.clone());
            response.member_id = StrBytes::from_string(member_id);
            response.error_code = error_code::MEMBER_ID_REQUIRED;
            return response;
        }

        let Some(metadata) = req
            .protocols
            .iter()
            .find(|p| p.name.to_string() == RANGE_ASSIGNOR)
            .map(|p| p.metadata.clone())
        else {
            response.error_code = error_code::INCONSISTENT_GROUP_PROTOCOL;
            return response;
        };

        let group = self.groups.entry(group_id.clone()).or_default();
        let known = group.members.contains_key(&requested);
        if !known && !group.pending.remove(&requested) {
            response.error_code = error_code::UNKNOWN_MEMBER_ID;
            return response;
        }
        if !known {
            group.generation += 1;
            group.assignments.clear();
        }
        if group
            .leader
            .as_ref()
            .map_or(true, |leader| !group.members.contains_key(leader))
        {
            group.leader = Some(requested.clone());
        }
        group.members.insert(
            requested.clone(),
            MemberState {
                metadata,
                generation: group.generation,
            },
        );

        let leader = group.leader.clone().unwrap_or_default();
        response.generation_id = group.generation;
        response.leader = StrBytes::from_string(leader.clone());
        response.member_id = StrBytes::from_string(requested.clone());
        if leader == requested {
            response.members = group
                .members
                .iter()
                .map(|(id, member)| {
                    let mut m = JoinGroupResponseMember::default();
                    m.member_id = StrBytes::from_string(id.clone());
                    m.metadata = member.metadata.clone();
                    m
                })
                .collect();
        }
        debug!(
            group_id = %group_id,
            member_id = %requested,
            generation = group.generation,
            "mock cluster member joined"
        );
        response
    }

    fn sync_group(&mut self, node_id: i32, req: &SyncGroupRequest) -> SyncGroupResponse {
        let mut response = SyncGroupResponse::default();
        if let Err(code) = self.check_coordinator(node_id) {
            response.error_code = code;
            return response;
        }

        let member_id = req.member_id.to_string();
        let Some(group) = self.groups.get_mut(&req.group_id.to_string()) else {
            response.error_code = error_code::UNKNOWN_MEMBER_ID;
            return response;
        };
        if !group.members.contains_key(&member_id) {
            response.error_code = error_code::UNKNOWN_MEMBER_ID;
            return response;
        }
        if req.generation_id != group.generation {
            response.error_code = error_code::ILLEGAL_GENERATION;
            return response;
        }

        if group.leader.as_deref() == Some(member_id.as_str()) && !req.assignments.is_empty() {
            group.assignments = req
                .assignments
                .iter()
                .map(|a| (a.member_id.to_string(), a.assignment.clone()))
                .collect();
            group.assigned_generation = group.generation;
        }
        if group.assigned_generation != group.generation {
            response.error_code = error_code::REBALANCE_IN_PROGRESS;
            return response;
        }

        response.assignment = group.assignments.get(&member_id).cloned().unwrap_or_default();
        response
    }

    fn heartbeat(&mut self, node_id: i32, req: &HeartbeatRequest) -> HeartbeatResponse {
        let mut response = HeartbeatResponse::default();
        response.error_code = match self.check_coordinator(node_id) {
            Err(code) => code,
            Ok(()) => self.member_status(
                &req.group_id.to_string(),
                &req.member_id.to_string(),
                req.generation_id,
            ),
        };
        response
    }

    /// NONE when the member belongs to the group's current generation.
    fn member_status(&self, group_id: &str, member_id: &str, generation: i32) -> i16 {
        let Some(group) = self.groups.get(group_id) else {
            return error_code::UNKNOWN_MEMBER_ID;
        };
        let Some(member) = group.members.get(member_id) else {
            return error_code::UNKNOWN_MEMBER_ID;
        };
        if member.generation != group.generation {
            error_code::REBALANCE_IN_PROGRESS
        } else if generation != group.generation {
            error_code::ILLEGAL_GENERATION
        } else {
            error_code::NONE
        }
    }

    fn leave_group(&mut self, node_id: i32, req: &LeaveGroupRequest) -> LeaveGroupResponse {
        let mut response = LeaveGroupResponse::default();
        if let Err(code) = self.check_coordinator(node_id) {
            response.error_code = code;
            return response;
        }

        let group = self.groups.entry(req.group_id.to_string()).or_default();
        let mut removed = false;
        for identity in &req.members {
            let member_id = identity.member_id.to_string();
            let mut member = MemberResponse::default();
            member.member_id = identity.member_id.clone();
            if group.members.remove(&member_id).is_some() {
                removed = true;
            } else {
                member.error_code = error_code::UNKNOWN_MEMBER_ID;
            }
            response.members.push(member);
        }

        if removed {
            group.generation += 1;
            group.assignments.clear();
            if group
                .leader
                .as_ref()
                .map_or(true, |leader| !group.members.contains_key(leader))
            {
                group.leader = group.members.keys().next().cloned();
            }
        }
        response
    }

    fn offset_commit(&mut self, node_id: i32, req: &OffsetCommitRequest) -> OffsetCommitResponse {
        let group_id = req.group_id.to_string();
        let code = match self.check_coordinator(node_id) {
            Err(code) => code,
            // Generation -1 without a member id is a standalone commit.
            Ok(()) if req.generation_id_or_member_epoch < 0 && req.member_id.is_empty() => {
                error_code::NONE
            }
            Ok(()) => self.member_status(
                &group_id,
                &req.member_id.to_string(),
                req.generation_id_or_member_epoch,
            ),
        };

        let mut response = OffsetCommitResponse::default();
        for topic in &req.topics {
            let name = topic.name.to_string();
            let mut topic_response = OffsetCommitResponseTopic::default();
            topic_response.name = topic.name.clone();
            for partition in &topic.partitions {
                if code == error_code::NONE {
                    self.committed.insert(
                        (group_id.clone(), name.clone(), partition.partition_index),
                        partition.committed_offset,
                    );
                }
                let mut partition_response = OffsetCommitResponsePartition::default();
                partition_response.partition_index = partition.partition_index;
                partition_response.error_code = code;
                topic_response.partitions.push(partition_response);
            }
            response.topics.push(topic_response);
        }
        response
    }

    fn offset_fetch(&self, node_id: i32, req: &OffsetFetchRequest) -> OffsetFetchResponse {
        let mut response = OffsetFetchResponse::default();
        if let Err(code) = self.check_coordinator(node_id) {
            response.error_code = code;
            return response;
        }

        let group_id = req.group_id.to_string();
        let requested: Vec<(String, Vec<i32>)> = match &req.topics {
            Some(topics) => topics
                .iter()
                .map(|t| (t.name.to_string(), t.partition_indexes.clone()))
                .collect(),
            None => {
                let mut all: BTreeMap<String, Vec<i32>> = BTreeMap::new();
                for (group, topic, partition) in self.committed.keys() {
                    if *group == group_id {
                        all.entry(topic.clone()).or_default().push(*partition);
                    }
                }
                all.into_iter().collect()
            }
        };

        for (name, partitions) in requested {
            let mut topic = OffsetFetchResponseTopic::default();
            topic.name = topic_name(&name);
            topic.partitions = partitions
                .into_iter()
                .map(|index| {
                    let mut partition = OffsetFetchResponsePartition::default();
                    partition.partition_index = index;
                    partition.committed_leader_epoch = -1;
                    partition.metadata = Some(StrBytes::from_static_str(""));
                    partition.committed_offset = self
                        .committed
                        .get(&(group_id.clone(), name.clone(), index))
                        .copied()
                        .unwrap_or(-1);
                    partition
                })
                .collect();
            response.topics.push(topic);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::records::{encode_batch, OutgoingRecord};
    use kafka_protocol::messages::fetch_request::{FetchPartition, FetchTopic};
    use kafka_protocol::messages::produce_request::{PartitionProduceData, TopicProduceData};

    fn cluster() -> MockCluster {
        let cluster = MockCluster::new().with_topic("orders", 2);
        lock(&cluster.state)
            .brokers
            .insert(1, ("127.0.0.1".to_string(), 9092));
        cluster
    }

    fn produce_request(topic: &str, partition: i32, values: &[&str]) -> ProduceRequest {
        let records: Vec<OutgoingRecord> = values
            .iter()
            .map(|v| OutgoingRecord {
                key: None,
                value: Some(Bytes::copy_from_slice(v.as_bytes())),
                timestamp: 0,
            })
            .collect();

        let mut data = PartitionProduceData::default();
        data.index = partition;
        data.records = Some(encode_batch(&records).unwrap());
        let mut topic_data = TopicProduceData::default();
        topic_data.name = topic_name(topic);
        topic_data.partition_data = vec![data];

        let mut request = ProduceRequest::default();
        request.acks = -1;
        request.topic_data = vec![topic_data];
        request
    }

    fn fetch_request(topic: &str, partition: i32, offset: i64) -> FetchRequest {
        let mut p = FetchPartition::default();
        p.partition = partition;
        p.fetch_offset = offset;
        p.partition_max_bytes = 1024 * 1024;
        let mut t = FetchTopic::default();
        t.topic = topic_name(topic);
        t.partitions = vec![p];
        let mut request = FetchRequest::default();
        request.topics = vec![t];
        request
    }

    #[test]
    fn test_append_assigns_offsets() {
        let cluster = cluster();
        let mut state = lock(&cluster.state);

        let first = state.produce(1, &produce_request("orders", 0, &["a", "b"]));
        assert_eq!(first.responses[0].partition_responses[0].base_offset, 0);
        let second = state.produce(1, &produce_request("orders", 0, &["c"]));
        assert_eq!(second.responses[0].partition_responses[0].base_offset, 2);
        drop(state);

        assert_eq!(cluster.high_watermark("orders", 0), Some(3));
        let offsets: Vec<i64> = cluster
            .records("orders", 0)
            .unwrap()
            .iter()
            .map(|r| r.offset)
            .collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[test]
    fn test_injected_failures_are_consumed_in_order() {
        let cluster = cluster();
        cluster.fail_next_produces(1, error_code::NOT_LEADER_OR_FOLLOWER);
        let mut state = lock(&cluster.state);

        let failed = state.produce(1, &produce_request("orders", 0, &["a"]));
        assert_eq!(
            failed.responses[0].partition_responses[0].error_code,
            error_code::NOT_LEADER_OR_FOLLOWER
        );
        let ok = state.produce(1, &produce_request("orders", 0, &["a"]));
        assert_eq!(ok.responses[0].partition_responses[0].error_code, error_code::NONE);
    }

    #[test]
    fn test_fetch_from_position_and_out_of_range() {
        let cluster = cluster();
        let mut state = lock(&cluster.state);
        state.produce(1, &produce_request("orders", 1, &["a", "b"]));

        let (response, has_data) = state.fetch(1, &fetch_request("orders", 1, 1));
        assert!(has_data);
        let data = &response.responses[0].partitions[0];
        assert_eq!(data.high_watermark, 2);
        assert!(data.records.is_some());

        let (response, has_data) = state.fetch(1, &fetch_request("orders", 1, 2));
        assert!(!has_data);
        assert!(response.responses[0].partitions[0].records.is_none());

        let (response, _) = state.fetch(1, &fetch_request("orders", 1, 9));
        assert_eq!(
            response.responses[0].partitions[0].error_code,
            error_code::OFFSET_OUT_OF_RANGE
        );
    }

    #[test]
    fn test_non_leader_rejects_produce() {
        let cluster = cluster();
        cluster.set_leader("orders", 0, 2);
        let mut state = lock(&cluster.state);
        let response = state.produce(1, &produce_request("orders", 0, &["a"]));
        assert_eq!(
            response.responses[0].partition_responses[0].error_code,
            error_code::NOT_LEADER_OR_FOLLOWER
        );
    }

    #[test]
    fn test_auto_create_reports_leader_not_available_first() {
        let cluster = cluster().with_auto_create(3);
        let mut state = lock(&cluster.state);

        let mut topic = kafka_protocol::messages::metadata_request::MetadataRequestTopic::default();
        topic.name = Some(topic_name("fresh"));
        let mut request = MetadataRequest::default();
        request.topics = Some(vec![topic]);
        request.allow_auto_topic_creation = true;

        let first = state.metadata(&request);
        assert_eq!(first.topics[0].error_code, error_code::LEADER_NOT_AVAILABLE);
        let second = state.metadata(&request);
        assert_eq!(second.topics[0].error_code, error_code::NONE);
        assert_eq!(second.topics[0].partitions.len(), 3);
    }
}
