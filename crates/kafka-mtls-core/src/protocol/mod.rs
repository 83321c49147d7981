//! Wire-level plumbing shared by the producer, consumer, and connection pool.
//!
//! Every request the clients send is pinned to one non-flexible API version,
//! so response headers are always a bare 4-byte correlation id.

pub mod error_code;
pub mod records;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{
    ApiKey, ConsumerProtocolAssignment, ConsumerProtocolSubscription, FetchRequest, FetchResponse,
    FindCoordinatorRequest, FindCoordinatorResponse, HeartbeatRequest, HeartbeatResponse,
    JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest, LeaveGroupResponse,
    ListOffsetsRequest, ListOffsetsResponse, MetadataRequest, MetadataResponse,
    OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest, OffsetFetchResponse,
    ProduceRequest, ProduceResponse, RequestHeader, SyncGroupRequest, SyncGroupResponse,
};
use kafka_protocol::protocol::{Decodable, Encodable, HeaderVersion, StrBytes};

use crate::error::{ClientError, Result};

/// A request type together with the API version the clients speak for it.
pub trait KafkaRequest: Encodable + HeaderVersion + Send + Sync {
    /// API key carried in the request header.
    const API_KEY: ApiKey;
    /// Pinned API version.
    const VERSION: i16;
    /// Human-readable API name for logs and metrics.
    const NAME: &'static str;
    /// Response type decoded at the same version.
    type Response: Decodable;
}

macro_rules! kafka_request {
    ($req:ty, $resp:ty, $key:ident, $version:expr) => {
        impl KafkaRequest for $req {
            const API_KEY: ApiKey = ApiKey::$key;
            const VERSION: i16 = $version;
            const NAME: &'static str = stringify!($key);
            type Response = $resp;
        }
    };
}

kafka_request!(MetadataRequest, MetadataResponse, Metadata, 8);
kafka_request!(ProduceRequest, ProduceResponse, Produce, 7);
kafka_request!(FetchRequest, FetchResponse, Fetch, 11);
kafka_request!(ListOffsetsRequest, ListOffsetsResponse, ListOffsets, 5);
kafka_request!(FindCoordinatorRequest, FindCoordinatorResponse, FindCoordinator, 2);
kafka_request!(JoinGroupRequest, JoinGroupResponse, JoinGroup, 5);
kafka_request!(SyncGroupRequest, SyncGroupResponse, SyncGroup, 3);
kafka_request!(HeartbeatRequest, HeartbeatResponse, Heartbeat, 3);
kafka_request!(LeaveGroupRequest, LeaveGroupResponse, LeaveGroup, 3);
kafka_request!(OffsetCommitRequest, OffsetCommitResponse, OffsetCommit, 7);
kafka_request!(OffsetFetchRequest, OffsetFetchResponse, OffsetFetch, 5);

/// Encode a request header and body into one frame payload (without length prefix).
///
/// # Errors
///
/// Returns `ClientError::Protocol` if either part fails to encode.
pub fn encode_request<R: KafkaRequest>(
    request: &R,
    correlation_id: i32,
    client_id: &str,
) -> Result<BytesMut> {
    let mut header = RequestHeader::default();
    header.request_api_key = R::API_KEY as i16;
    header.request_api_version = R::VERSION;
    header.correlation_id = correlation_id;
    header.client_id = Some(StrBytes::from_string(client_id.to_string()));

    let mut buf = BytesMut::new();
    header
        .encode(&mut buf, R::header_version(R::VERSION))
        .map_err(|e| ClientError::protocol(format!("failed to encode {} header: {e}", R::NAME)))?;
    request
        .encode(&mut buf, R::VERSION)
        .map_err(|e| ClientError::protocol(format!("failed to encode {} request: {e}", R::NAME)))?;
    Ok(buf)
}

/// Decode a response body after its correlation id has been stripped.
///
/// # Errors
///
/// Returns `ClientError::Protocol` if the body does not decode.
pub fn decode_response<R: KafkaRequest>(mut body: Bytes) -> Result<R::Response> {
    R::Response::decode(&mut body, R::VERSION)
        .map_err(|e| ClientError::protocol(format!("failed to decode {} response: {e}", R::NAME)))
}

/// Name of the partition assignment strategy this client advertises.
pub const RANGE_ASSIGNOR: &str = "range";

/// Protocol type for consumer groups.
pub const CONSUMER_PROTOCOL_TYPE: &str = "consumer";

const CONSUMER_PROTOCOL_VERSION: i16 = 0;

/// Encode the member metadata sent in JoinGroup: the subscribed topics.
///
/// # Errors
///
/// Returns `ClientError::Protocol` if encoding fails.
pub fn encode_subscription(topics: &[String]) -> Result<Bytes> {
    let mut subscription = ConsumerProtocolSubscription::default();
    subscription.topics = topics
        .iter()
        .map(|t| StrBytes::from_string(t.clone()).into())
        .collect();

    let mut buf = BytesMut::new();
    buf.put_i16(CONSUMER_PROTOCOL_VERSION);
    subscription
        .encode(&mut buf, CONSUMER_PROTOCOL_VERSION)
        .map_err(|e| ClientError::protocol(format!("failed to encode subscription: {e}")))?;
    Ok(buf.freeze())
}

/// Decode a member's subscribed topics from its JoinGroup metadata.
///
/// # Errors
///
/// Returns `ClientError::Protocol` if the metadata is malformed.
pub fn decode_subscription(mut metadata: Bytes) -> Result<Vec<String>> {
    let version = read_version(&mut metadata, "subscription")?;
    let subscription = ConsumerProtocolSubscription::decode(&mut metadata, version)
        .map_err(|e| ClientError::protocol(format!("failed to decode subscription: {e}")))?;
    Ok(subscription.topics.iter().map(|t| t.to_string()).collect())
}

/// Encode a member assignment for SyncGroup.
///
/// # Errors
///
/// Returns `ClientError::Protocol` if encoding fails.
pub fn encode_assignment(partitions: &[(String, Vec<i32>)]) -> Result<Bytes> {
    use kafka_protocol::messages::consumer_protocol_assignment::TopicPartition;

    let mut assignment = ConsumerProtocolAssignment::default();
    assignment.assigned_partitions = partitions
        .iter()
        .map(|(topic, ids)| {
            let mut tp = TopicPartition::default();
            tp.topic = StrBytes::from_string(topic.clone()).into();
            tp.partitions = ids.clone();
            tp
        })
        .collect();

    let mut buf = BytesMut::new();
    buf.put_i16(CONSUMER_PROTOCOL_VERSION);
    assignment
        .encode(&mut buf, CONSUMER_PROTOCOL_VERSION)
        .map_err(|e| ClientError::protocol(format!("failed to encode assignment: {e}")))?;
    Ok(buf.freeze())
}

/// Decode the assignment handed back by SyncGroup.
///
/// An empty payload means the member was assigned nothing.
///
/// # Errors
///
/// Returns `ClientError::Protocol` if the payload is malformed.
pub fn decode_assignment(mut payload: Bytes) -> Result<Vec<(String, Vec<i32>)>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let version = read_version(&mut payload, "assignment")?;
    let assignment = ConsumerProtocolAssignment::decode(&mut payload, version)
        .map_err(|e| ClientError::protocol(format!("failed to decode assignment: {e}")))?;
    Ok(assignment
        .assigned_partitions
        .iter()
        .map(|tp| (tp.topic.to_string(), tp.partitions.clone()))
        .collect())
}

fn read_version(buf: &mut Bytes, what: &str) -> Result<i16> {
    if buf.remaining() < 2 {
        return Err(ClientError::protocol(format!("{what} too short")));
    }
    Ok(buf.get_i16())
}
