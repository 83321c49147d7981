//! Integration tests for the producer: partitioning, ordering, retries and
//! acknowledgment modes against the in-memory cluster.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::join_all;

use kafka_mtls_core::protocol::error_code;
use kafka_mtls_core::testing::{api_keys, ClusterHarness, ClusterHarnessBuilder};
use kafka_mtls_core::{Acks, ClientError, Producer, ProducerRecord};

#[tokio::test]
async fn test_send_returns_partition_and_offset() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let producer = Producer::connect(&harness.client_config()).await.unwrap();

    let ack = producer
        .send(ProducerRecord::text("orders", "key-0", "message-0"))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(ack.topic, "orders");
    assert_eq!(ack.partition, 0);
    assert_eq!(ack.offset, 0);

    let stored = harness.cluster.records("orders", 0).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].key.as_deref(), Some(&b"key-0"[..]));
    assert_eq!(stored[0].value.as_deref(), Some(&b"message-0"[..]));
    producer.close().await;
}

#[tokio::test]
async fn test_records_keep_send_order_within_partition() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let producer = Producer::connect(&harness.client_config()).await.unwrap();

    let mut deliveries = Vec::new();
    for i in 0..20 {
        let record = ProducerRecord::text("orders", &format!("key-{i}"), &format!("message-{i}"))
            .with_partition(0);
        deliveries.push(producer.send(record).await.unwrap());
    }

    let offsets: Vec<i64> = join_all(deliveries)
        .await
        .into_iter()
        .map(|ack| ack.unwrap().offset)
        .collect();
    assert_eq!(offsets, (0..20).collect::<Vec<i64>>());

    let values: Vec<String> = harness
        .cluster
        .records("orders", 0)
        .unwrap()
        .into_iter()
        .map(|r| String::from_utf8(r.value.unwrap().to_vec()).unwrap())
        .collect();
    let expected: Vec<String> = (0..20).map(|i| format!("message-{i}")).collect();
    assert_eq!(values, expected);
    producer.close().await;
}

#[tokio::test]
async fn test_same_key_lands_on_same_partition() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 4).build().await;
    let producer = Producer::connect(&harness.client_config()).await.unwrap();

    let mut partitions = HashSet::new();
    for i in 0..3 {
        let ack = producer
            .send(ProducerRecord::text("orders", "customer-42", &format!("event-{i}")))
            .await
            .unwrap()
            .await
            .unwrap();
        partitions.insert(ack.partition);
    }
    assert_eq!(partitions.len(), 1);
    producer.close().await;
}

#[tokio::test]
async fn test_keyless_records_spread_round_robin() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 3).build().await;
    let producer = Producer::connect(&harness.client_config()).await.unwrap();

    let mut partitions = HashSet::new();
    for i in 0..3 {
        let record = ProducerRecord::new("orders", None, Some(format!("event-{i}").into()));
        let ack = producer.send(record).await.unwrap().await.unwrap();
        partitions.insert(ack.partition);
    }
    assert_eq!(partitions.len(), 3);
    producer.close().await;
}

#[tokio::test]
async fn test_retriable_failures_are_retried_until_success() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let config = harness.client_config();
    let retries = config.producer.max_retries;
    harness
        .cluster
        .fail_next_produces(retries as usize, error_code::NOT_LEADER_OR_FOLLOWER);
    let producer = Producer::connect(&config).await.unwrap();

    let ack = producer
        .send(ProducerRecord::text("orders", "key-0", "message-0"))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(ack.offset, 0);
    assert_eq!(
        harness.calls_for_api(api_keys::PRODUCE).await.len(),
        retries as usize + 1
    );
    producer.close().await;
}

#[tokio::test]
async fn test_retry_budget_exhaustion_reports_attempts() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let config = harness.client_config();
    let retries = config.producer.max_retries;
    harness
        .cluster
        .fail_next_produces(retries as usize + 1, error_code::NOT_LEADER_OR_FOLLOWER);
    let producer = Producer::connect(&config).await.unwrap();

    let result = producer
        .send(ProducerRecord::text("orders", "key-0", "message-0"))
        .await
        .unwrap()
        .await;
    match result {
        Err(ClientError::Produce {
            topic,
            partition,
            attempts,
            ..
        }) => {
            assert_eq!(topic, "orders");
            assert_eq!(partition, 0);
            assert_eq!(attempts, retries + 1);
        }
        other => panic!("expected Produce error, got {other:?}"),
    }
    assert_eq!(harness.cluster.high_watermark("orders", 0), Some(0));
    producer.close().await;
}

#[tokio::test]
async fn test_non_retriable_failure_is_not_retried() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    harness
        .cluster
        .fail_next_produces(1, error_code::MESSAGE_TOO_LARGE);
    let producer = Producer::connect(&harness.client_config()).await.unwrap();

    let err = producer
        .send(ProducerRecord::text("orders", "key-0", "message-0"))
        .await
        .unwrap()
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Produce { attempts: 1, .. }));
    assert_eq!(harness.calls_for_api(api_keys::PRODUCE).await.len(), 1);
    producer.close().await;
}

#[tokio::test]
async fn test_oversized_record_rejected_before_sending() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let mut config = harness.client_config();
    config.producer.max_request_size = 256;
    let producer = Producer::connect(&config).await.unwrap();

    let value = "x".repeat(1024);
    let err = producer
        .send(ProducerRecord::text("orders", "key-0", &value))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Produce { attempts: 0, .. }));
    assert!(harness.calls_for_api(api_keys::PRODUCE).await.is_empty());
    producer.close().await;
}

#[tokio::test]
async fn test_send_follows_leader_move() {
    let harness = ClusterHarnessBuilder::new()
        .brokers(2)
        .topic("orders", 1)
        .build()
        .await;
    let producer = Producer::connect(&harness.client_config()).await.unwrap();

    let first = producer
        .send(ProducerRecord::text("orders", "key-0", "before"))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(first.offset, 0);

    harness.cluster.set_leader("orders", 0, 2);
    let second = producer
        .send(ProducerRecord::text("orders", "key-0", "after"))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(second.offset, 1);

    assert_eq!(
        harness.broker(0).get_calls_for_api(api_keys::PRODUCE).await.len(),
        2
    );
    assert_eq!(
        harness.broker(1).get_calls_for_api(api_keys::PRODUCE).await.len(),
        1
    );
    producer.close().await;
}

#[tokio::test]
async fn test_acks_none_resolves_without_offset() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let mut config = harness.client_config();
    config.producer.acks = Acks::None;
    let producer = Producer::connect(&config).await.unwrap();

    let ack = producer
        .send(ProducerRecord::text("orders", "key-0", "fire-and-forget"))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(ack.offset, -1);

    let appended = async {
        while harness.cluster.high_watermark("orders", 0) != Some(1) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), appended)
        .await
        .unwrap();
    producer.close().await;
}

#[tokio::test]
async fn test_flush_resolves_every_pending_record() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 2).build().await;
    let producer = Producer::connect(&harness.client_config()).await.unwrap();

    let mut deliveries = Vec::new();
    for i in 0..10 {
        let record = ProducerRecord::text("orders", &format!("key-{i}"), &format!("message-{i}"));
        deliveries.push(producer.send(record).await.unwrap());
    }
    producer.flush().await.unwrap();
    assert_eq!(producer.in_flight(), 0);

    for delivery in deliveries {
        delivery.await.unwrap();
    }
    let total = harness.cluster.high_watermark("orders", 0).unwrap()
        + harness.cluster.high_watermark("orders", 1).unwrap();
    assert_eq!(total, 10);
    producer.close().await;
}

#[tokio::test]
async fn test_send_after_close_fails() {
    let harness = ClusterHarness::new().await;
    let producer = Producer::connect(&harness.client_config()).await.unwrap();

    producer.close().await;
    producer.close().await;
    assert!(producer.is_closed());

    let err = producer
        .send(ProducerRecord::text("orders", "key-0", "late"))
        .await
        .unwrap_err();
    assert_eq!(err, ClientError::Closed);
}

#[tokio::test]
async fn test_unknown_topic_is_auto_created() {
    let harness = ClusterHarness::new().await;
    let producer = Producer::connect(&harness.client_config()).await.unwrap();

    let ack = producer
        .send(ProducerRecord::text("fresh", "key-0", "first"))
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!((ack.partition, ack.offset), (0, 0));
    producer.close().await;
}
