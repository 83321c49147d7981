//! Integration tests for the consumer: group membership, positions, commits
//! and the handler-driven run loop.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use kafka_mtls_core::testing::{api_keys, ClusterHarness, ClusterHarnessBuilder, Reply};
use kafka_mtls_core::{
    AutoOffsetReset, ClientConfig, ClientError, Consumer, ConsumerRecord, ConsumerState, Producer,
    ProducerRecord, RunError,
};

async fn produce(config: &ClientConfig, topic: &str, count: usize) {
    let producer = Producer::connect(config).await.unwrap();
    for i in 0..count {
        producer
            .send(ProducerRecord::text(topic, &format!("key-{i}"), &format!("message-{i}")).with_partition(0))
            .await
            .unwrap()
            .await
            .unwrap();
    }
    producer.close().await;
}

/// Poll until `count` records arrived or five seconds passed.
async fn poll_until(consumer: &mut Consumer, count: usize) -> Vec<ConsumerRecord> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut records = Vec::new();
    while records.len() < count && Instant::now() < deadline {
        records.extend(consumer.poll(Duration::from_millis(200)).await.unwrap());
    }
    records
}

fn consumer_config(harness: &ClusterHarness, group: &str) -> ClientConfig {
    let mut config = harness.client_config();
    config.consumer.group_id = group.to_string();
    config.consumer.auto_offset_reset = AutoOffsetReset::Earliest;
    config
}

#[tokio::test]
async fn test_poll_delivers_in_offset_order() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let config = consumer_config(&harness, "g1");
    produce(&config, "orders", 5).await;

    let mut consumer = Consumer::connect(&config).await.unwrap();
    consumer.subscribe("orders").await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Subscribed);
    assert_eq!(consumer.assignment(), vec![("orders".to_string(), 0)]);

    let records = poll_until(&mut consumer, 5).await;
    let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    assert_eq!(records[3].key_str(), Some("key-3"));
    assert_eq!(records[3].value_str(), Some("message-3"));
    assert_eq!(consumer.position("orders", 0), Some(5));
    assert_eq!(consumer.state(), ConsumerState::Polling);
    consumer.close().await;
}

#[tokio::test]
async fn test_poll_returns_empty_when_idle() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let mut consumer = Consumer::connect(&consumer_config(&harness, "g1")).await.unwrap();
    consumer.subscribe("orders").await.unwrap();

    let started = Instant::now();
    let records = consumer.poll(Duration::from_millis(150)).await.unwrap();
    assert!(records.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(150));
    consumer.close().await;
}

#[tokio::test]
async fn test_latest_reset_skips_existing_records() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let mut config = consumer_config(&harness, "g-latest");
    produce(&config, "orders", 3).await;
    config.consumer.auto_offset_reset = AutoOffsetReset::Latest;

    let mut consumer = Consumer::connect(&config).await.unwrap();
    consumer.subscribe("orders").await.unwrap();
    assert_eq!(consumer.position("orders", 0), Some(3));
    assert!(consumer.poll(Duration::from_millis(100)).await.unwrap().is_empty());
    consumer.close().await;
}

#[tokio::test]
async fn test_manual_commit_and_resume() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let mut config = consumer_config(&harness, "g-manual");
    config.consumer.enable_auto_commit = false;
    produce(&config, "orders", 3).await;

    let mut consumer = Consumer::connect(&config).await.unwrap();
    consumer.subscribe("orders").await.unwrap();
    assert_eq!(consumer.committed("orders", 0).await.unwrap(), None);

    assert_eq!(poll_until(&mut consumer, 3).await.len(), 3);
    consumer.commit().await.unwrap();
    assert_eq!(consumer.committed("orders", 0).await.unwrap(), Some(3));
    assert_eq!(harness.cluster.committed("g-manual", "orders", 0), Some(3));
    consumer.close().await;

    produce(&config, "orders", 1).await;
    let mut resumed = Consumer::connect(&config).await.unwrap();
    resumed.subscribe("orders").await.unwrap();
    assert_eq!(resumed.position("orders", 0), Some(3));
    let records = poll_until(&mut resumed, 1).await;
    assert_eq!(records[0].offset, 3);
    resumed.close().await;
}

#[tokio::test]
async fn test_seek_moves_next_fetch() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let config = consumer_config(&harness, "g-seek");
    produce(&config, "orders", 5).await;

    let mut consumer = Consumer::connect(&config).await.unwrap();
    consumer.subscribe("orders").await.unwrap();
    consumer.seek("orders", 0, 3).unwrap();

    let records = poll_until(&mut consumer, 2).await;
    let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
    assert_eq!(offsets, vec![3, 4]);

    let err = consumer.seek("orders", 7, 0).unwrap_err();
    assert!(matches!(err, ClientError::InvalidState { .. }));
    consumer.close().await;
}

#[tokio::test]
async fn test_handler_failure_rewinds_to_failed_record() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let config = consumer_config(&harness, "g-handler");
    produce(&config, "orders", 5).await;

    let mut consumer = Consumer::connect(&config).await.unwrap();
    consumer.subscribe("orders").await.unwrap();

    let handled = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&handled);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = consumer
        .run(shutdown_rx, move |record| {
            let seen = Arc::clone(&seen);
            async move {
                if record.offset == 2 {
                    return Err(format!("cannot handle offset {}", record.offset));
                }
                seen.lock().unwrap().push(record.offset);
                Ok(())
            }
        })
        .await;

    match result {
        Err(RunError::Handler(message)) => assert_eq!(message, "cannot handle offset 2"),
        other => panic!("expected handler error, got {other:?}"),
    }
    assert_eq!(*handled.lock().unwrap(), vec![0, 1]);
    assert_eq!(consumer.position("orders", 0), Some(2));

    consumer.close().await;
    assert_eq!(harness.cluster.committed("g-handler", "orders", 0), Some(2));

    let mut fresh = Consumer::connect(&config).await.unwrap();
    fresh.subscribe("orders").await.unwrap();
    let records = poll_until(&mut fresh, 1).await;
    assert_eq!(records[0].offset, 2);
    fresh.close().await;
}

#[tokio::test]
async fn test_run_stops_on_shutdown_signal() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let config = consumer_config(&harness, "g-run");
    produce(&config, "orders", 3).await;

    let mut consumer = Consumer::connect(&config).await.unwrap();
    consumer.subscribe("orders").await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let handled = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&handled);
    let result = consumer
        .run(shutdown_rx, move |_record| {
            let counter = Arc::clone(&counter);
            let shutdown_tx = Arc::clone(&shutdown_tx);
            async move {
                let mut count = counter.lock().unwrap();
                *count += 1;
                if *count == 3 {
                    let _ = shutdown_tx.send(true);
                }
                Ok::<(), String>(())
            }
        })
        .await;

    assert!(result.is_ok());
    assert_eq!(*handled.lock().unwrap(), 3);
    consumer.close().await;
    assert_eq!(harness.cluster.committed("g-run", "orders", 0), Some(3));
}

#[tokio::test]
async fn test_stalled_auto_commit_does_not_hold_poll_past_timeout() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let config = consumer_config(&harness, "g-stall");
    produce(&config, "orders", 1).await;

    let mut consumer = Consumer::connect(&config).await.unwrap();
    consumer.subscribe("orders").await.unwrap();
    assert_eq!(poll_until(&mut consumer, 1).await.len(), 1);

    harness
        .broker(0)
        .register_handler(api_keys::OFFSET_COMMIT, Arc::new(|_| Reply::Silent))
        .await;
    tokio::time::sleep(Duration::from_millis(config.consumer.auto_commit_interval_ms + 50)).await;

    let started = Instant::now();
    let records = consumer.poll(Duration::from_millis(100)).await.unwrap();
    assert!(records.is_empty());
    assert!(
        started.elapsed() < Duration::from_millis(1_000),
        "poll took {:?}",
        started.elapsed()
    );
    assert_ne!(harness.cluster.committed("g-stall", "orders", 0), Some(1));

    // With the coordinator answering again, the abandoned commit goes out on
    // a later poll.
    harness.cluster.install(harness.broker(0), 1).await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.cluster.committed("g-stall", "orders", 0) != Some(1) && Instant::now() < deadline {
        consumer.poll(Duration::from_millis(100)).await.unwrap();
    }
    assert_eq!(harness.cluster.committed("g-stall", "orders", 0), Some(1));
    consumer.close().await;
}

#[tokio::test]
async fn test_lifecycle_states() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 1).build().await;
    let mut consumer = Consumer::connect(&consumer_config(&harness, "g1")).await.unwrap();
    assert_eq!(consumer.state(), ConsumerState::Unsubscribed);

    let err = consumer.poll(Duration::from_millis(10)).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidState { operation: "poll", .. }));

    consumer.subscribe("orders").await.unwrap();
    let err = consumer.subscribe("orders").await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidState { operation: "subscribe", .. }));

    consumer.close().await;
    consumer.close().await;
    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert_eq!(harness.cluster.group_size("g1"), 0);

    assert!(matches!(
        consumer.poll(Duration::from_millis(10)).await,
        Err(ClientError::InvalidState { .. })
    ));
    assert!(matches!(
        consumer.subscribe("orders").await,
        Err(ClientError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_subscribe_to_missing_topic_fails() {
    let harness = ClusterHarnessBuilder::new().without_auto_create().build().await;
    let mut consumer = Consumer::connect(&consumer_config(&harness, "g1")).await.unwrap();

    match consumer.subscribe("missing").await {
        Err(ClientError::Subscription { topic, .. }) => assert_eq!(topic, "missing"),
        other => panic!("expected Subscription error, got {other:?}"),
    }
    assert_eq!(consumer.state(), ConsumerState::Unsubscribed);
    consumer.close().await;
}

#[tokio::test]
async fn test_group_members_split_partitions() {
    let harness = ClusterHarnessBuilder::new().topic("orders", 2).build().await;
    let config = consumer_config(&harness, "g-split");

    let mut first = Consumer::connect(&config).await.unwrap();
    first.subscribe("orders").await.unwrap();
    assert_eq!(first.assignment().len(), 2);

    let mut second = Consumer::connect(&config).await.unwrap();
    // The first member learns of the rebalance through its heartbeat and
    // rejoins from poll while the second one is joining.
    let keep_polling = async {
        let deadline = Instant::now() + Duration::from_secs(10);
        while first.assignment().len() != 1 && Instant::now() < deadline {
            first.poll(Duration::from_millis(100)).await.unwrap();
        }
    };
    let (_, joined) = tokio::join!(keep_polling, second.subscribe("orders"));
    joined.unwrap();

    let mut owned: Vec<_> = first
        .assignment()
        .into_iter()
        .chain(second.assignment())
        .collect();
    owned.sort();
    assert_eq!(
        owned,
        vec![("orders".to_string(), 0), ("orders".to_string(), 1)]
    );
    assert_eq!(harness.cluster.group_size("g-split"), 2);

    first.close().await;
    second.close().await;
}
