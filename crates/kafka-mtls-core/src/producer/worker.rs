//! In-order delivery for one topic partition.
//!
//! Every partition gets a worker task draining an mpsc queue. The worker
//! groups whatever is queued into one record batch, sends it, and answers
//! each record's delivery handle before taking the next batch, so records on
//! one partition are appended in send order.

use std::sync::Arc;
use std::time::Duration;

use kafka_protocol::messages::produce_request::{PartitionProduceData, TopicProduceData};
use kafka_protocol::messages::{ProduceRequest, TopicName};
use kafka_protocol::protocol::StrBytes;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::delivery::DeliveryAck;
use crate::broker::BrokerPool;
use crate::config::{Acks, ProducerConfig};
use crate::error::{ClientError, Result};
use crate::protocol::error_code;
use crate::protocol::records::{encode_batch, OutgoingRecord};

/// A record waiting in a partition queue.
pub(crate) struct PendingRecord {
    pub record: OutgoingRecord,
    pub encoded_size: usize,
    pub reply: oneshot::Sender<Result<DeliveryAck>>,
}

/// State shared by the producer handle and its workers.
pub(crate) struct Shared {
    pub pool: Arc<BrokerPool>,
    pub config: ProducerConfig,
    /// Records accepted by `send` and not yet resolved.
    pub in_flight: watch::Sender<usize>,
    pub cancel: CancellationToken,
}

impl Shared {
    fn settle(&self, count: usize) {
        self.in_flight.send_modify(|n| *n = n.saturating_sub(count));
    }
}

pub(crate) struct PartitionWorker {
    topic: String,
    partition: i32,
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<PendingRecord>,
    carry: Option<PendingRecord>,
}

impl PartitionWorker {
    pub fn new(
        topic: String,
        partition: i32,
        shared: Arc<Shared>,
        rx: mpsc::UnboundedReceiver<PendingRecord>,
    ) -> Self {
        Self {
            topic,
            partition,
            shared,
            rx,
            carry: None,
        }
    }

    pub async fn run(mut self) {
        debug!(topic = %self.topic, partition = self.partition, "partition worker started");

        loop {
            let first = match self.carry.take() {
                Some(pending) => pending,
                None => {
                    tokio::select! {
                        biased;
                        () = self.shared.cancel.cancelled() => break,
                        next = self.rx.recv() => match next {
                            Some(pending) => pending,
                            None => break,
                        },
                    }
                }
            };

            let batch = self.collect_batch(first);
            self.deliver(batch).await;
        }

        // Anything still queued was never sent.
        self.rx.close();
        let mut abandoned = self.carry.take().into_iter().collect::<Vec<_>>();
        while let Ok(pending) = self.rx.try_recv() {
            abandoned.push(pending);
        }
        if !abandoned.is_empty() {
            warn!(
                topic = %self.topic,
                partition = self.partition,
                count = abandoned.len(),
                "failing queued records on close"
            );
            self.fail(abandoned, &ClientError::Closed);
        }
        debug!(topic = %self.topic, partition = self.partition, "partition worker stopped");
    }

    /// Take queued records up to the batch size and request size limits.
    fn collect_batch(&mut self, first: PendingRecord) -> Vec<PendingRecord> {
        let mut size = first.encoded_size;
        let mut batch = vec![first];

        while batch.len() < self.shared.config.batch_size {
            let Ok(next) = self.rx.try_recv() else {
                break;
            };
            if size + next.encoded_size > self.shared.config.max_request_size {
                self.carry = Some(next);
                break;
            }
            size += next.encoded_size;
            batch.push(next);
        }
        batch
    }

    async fn deliver(&self, batch: Vec<PendingRecord>) {
        let records: Vec<OutgoingRecord> = batch.iter().map(|p| p.record.clone()).collect();
        let encoded = match encode_batch(&records) {
            Ok(encoded) => encoded,
            Err(e) => {
                self.fail(batch, &self.produce_error(0, &e));
                return;
            }
        };

        let max_retries = self.shared.config.max_retries;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.produce_once(encoded.clone()).await {
                Ok(base_offset) => {
                    self.succeed(batch, base_offset);
                    return;
                }
                Err(e) if e.is_retriable() && attempt <= max_retries => {
                    self.shared.pool.metrics().record_retry();
                    self.shared.pool.handle_request_error(&self.topic, &e).await;
                    let delay = retry_delay(
                        attempt - 1,
                        self.shared.config.retry_backoff_ms,
                        self.shared.config.retry_backoff_max_ms,
                    );
                    debug!(
                        topic = %self.topic,
                        partition = self.partition,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying produce"
                    );
                    tokio::select! {
                        () = self.shared.cancel.cancelled() => {
                            self.fail(batch, &ClientError::Closed);
                            return;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(
                        topic = %self.topic,
                        partition = self.partition,
                        attempts = attempt,
                        error = %e,
                        "produce failed"
                    );
                    let err = if e.is_fatal() {
                        e
                    } else {
                        self.produce_error(attempt, &e)
                    };
                    self.fail(batch, &err);
                    return;
                }
            }
        }
    }

    /// One produce round trip. Returns the base offset the broker assigned.
    async fn produce_once(&self, records: bytes::Bytes) -> Result<i64> {
        let conn = self.shared.pool.route(&self.topic, self.partition).await?;

        let mut partition_data = PartitionProduceData::default();
        partition_data.index = self.partition;
        partition_data.records = Some(records);

        let mut topic_data = TopicProduceData::default();
        topic_data.name = TopicName::from(StrBytes::from_string(self.topic.clone()));
        topic_data.partition_data = vec![partition_data];

        let mut request = ProduceRequest::default();
        request.acks = self.shared.config.acks.as_i16();
        request.timeout_ms = i32::try_from(self.shared.config.request_timeout_ms).unwrap_or(i32::MAX);
        request.topic_data = vec![topic_data];

        if self.shared.config.acks == Acks::None {
            conn.send_oneway(&request).await?;
            return Ok(-1);
        }

        let response = conn.call(&request).await?;
        let partition = response
            .responses
            .iter()
            .flat_map(|t| t.partition_responses.iter())
            .find(|p| p.index == self.partition)
            .ok_or_else(|| ClientError::protocol("produce response missing partition"))?;

        if partition.error_code != error_code::NONE {
            return Err(ClientError::broker("Produce", partition.error_code));
        }
        Ok(partition.base_offset)
    }

    fn succeed(&self, batch: Vec<PendingRecord>, base_offset: i64) {
        let count = batch.len();
        for (pending, delta) in batch.into_iter().zip(0i64..) {
            let offset = if base_offset < 0 { -1 } else { base_offset + delta };
            let _ = pending.reply.send(Ok(DeliveryAck {
                topic: self.topic.clone(),
                partition: self.partition,
                offset,
            }));
        }
        self.shared
            .pool
            .metrics()
            .record_produced(&self.topic, count as u64);
        self.shared.settle(count);
    }

    fn fail(&self, batch: Vec<PendingRecord>, err: &ClientError) {
        let count = batch.len();
        for pending in batch {
            let _ = pending.reply.send(Err(err.clone()));
        }
        self.shared
            .pool
            .metrics()
            .record_produce_failure(&self.topic, count as u64);
        self.shared.settle(count);
    }

    fn produce_error(&self, attempts: u32, cause: &ClientError) -> ClientError {
        ClientError::Produce {
            topic: self.topic.clone(),
            partition: self.partition,
            attempts,
            reason: cause.to_string(),
        }
    }
}

/// Delay before retry number `retry` (0-based): `base * 2^retry`, capped at
/// `max`, with +/-25% jitter.
pub(crate) fn retry_delay(retry: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << retry.min(20));
    let capped = exp.min(max_ms) as f64;
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((capped * jitter) as u64)
}
