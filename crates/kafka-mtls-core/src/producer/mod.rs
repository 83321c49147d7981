//! Producer client.
//!
//! `send` picks a partition, queues the record on that partition's worker and
//! hands back a [`DeliveryFuture`]. Workers batch, retry and resolve the
//! futures; `flush` and `close` wait on the shared in-flight counter.

pub mod delivery;
pub mod partitioner;
pub mod record;
mod worker;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use delivery::{DeliveryAck, DeliveryFuture};
pub use partitioner::Partitioner;
pub use record::ProducerRecord;

use self::worker::{PartitionWorker, PendingRecord, Shared};
use crate::broker::{BrokerPool, MetadataRefresher};
use crate::config::{ClientConfig, ProducerConfig};
use crate::error::{ClientError, Result};
use crate::metrics::ClientMetrics;
use crate::protocol::records::{encoded_size, OutgoingRecord};

struct WorkerHandle {
    tx: mpsc::UnboundedSender<PendingRecord>,
    task: JoinHandle<()>,
}

/// Publishes records with acknowledgment and bounded retries.
///
/// Call [`close`](Self::close) before dropping: it flushes outstanding sends
/// within `close_timeout_ms` and fails whatever is left.
pub struct Producer {
    shared: Arc<Shared>,
    workers: DashMap<(String, i32), WorkerHandle>,
    partitioner: Partitioner,
    closed: AtomicBool,
    owns_pool: bool,
    refresh_shutdown: Option<watch::Sender<bool>>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("acks", &self.shared.config.acks)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Producer {
    /// Connect a producer with its own connection pool.
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

        let mut producer = Self::build(pool, config.producer.clone(), true);
        producer.refresh_shutdown = Some(shutdown_tx);
        info!(acks = ?config.producer.acks, "producer connected");
        Ok(producer)
    }

    /// A producer on an already connected, shared pool. Closing the producer
    /// leaves the pool open.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid producer settings.
    pub fn with_pool(pool: Arc<BrokerPool>, config: ProducerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(pool, config, false))
    }

    fn build(pool: Arc<BrokerPool>, config: ProducerConfig, owns_pool: bool) -> Self {
        let (in_flight, _) = watch::channel(0usize);
        Self {
            shared: Arc::new(Shared {
                pool,
                config,
                in_flight,
                cancel: CancellationToken::new(),
            }),
            workers: DashMap::new(),
            partitioner: Partitioner::new(),
            closed: AtomicBool::new(false),
            owns_pool,
            refresh_shutdown: None,
        }
    }

    /// Submit a record. The returned future resolves to the broker's
    /// acknowledgment or to the final failure.
    ///
    /// # Errors
    ///
    /// Fails before enqueuing when the producer is closed, the topic cannot be
    /// resolved, the explicit partition does not exist, or the encoded record
    /// exceeds `max_request_size`.
    pub async fn send(&self, record: ProducerRecord) -> Result<DeliveryFuture> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }

        let ProducerRecord {
            topic,
            key,
            value,
            partition,
        } = record;

        let metadata = self
            .shared
            .pool
            .topic_metadata(&topic, true)
            .await
            .map_err(|e| match e {
                ClientError::Broker { .. } => ClientError::Produce {
                    topic: topic.clone(),
                    partition: partition.unwrap_or(-1),
                    attempts: 1,
                    reason: e.to_string(),
                },
                other => other,
            })?;

        let partition =
            self.partitioner
                .partition(key.as_deref(), partition, metadata.partition_count());
        if !metadata.partitions.contains_key(&partition) {
            return Err(ClientError::Produce {
                topic,
                partition,
                attempts: 0,
                reason: format!(
                    "topic has {} partition(s)",
                    metadata.partition_count()
                ),
            });
        }

        let outgoing = OutgoingRecord {
            key,
            value,
            timestamp: now_millis(),
        };
        let size = encoded_size(&outgoing)?;
        if size > self.shared.config.max_request_size {
            return Err(ClientError::Produce {
                topic,
                partition,
                attempts: 0,
                reason: format!(
                    "record of {size} bytes exceeds max_request_size {}",
                    self.shared.config.max_request_size
                ),
            });
        }

        let (reply, rx) = oneshot::channel();
        let pending = PendingRecord {
            record: outgoing,
            encoded_size: size,
            reply,
        };

        self.shared.in_flight.send_modify(|n| *n += 1);
        if self.enqueue(topic, partition, pending).is_err() {
            self.shared
                .in_flight
                .send_modify(|n| *n = n.saturating_sub(1));
            return Err(ClientError::Closed);
        }
        Ok(DeliveryFuture::new(rx))
    }

    fn enqueue(&self, topic: String, partition: i32, pending: PendingRecord) -> std::result::Result<(), ()> {
        let entry = self
            .workers
            .entry((topic.clone(), partition))
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = PartitionWorker::new(topic, partition, Arc::clone(&self.shared), rx);
                WorkerHandle {
                    tx,
                    task: tokio::spawn(worker.run()),
                }
            });
        entry.tx.send(pending).map_err(|_| ())
    }

    /// Records submitted and not yet resolved.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        *self.shared.in_flight.borrow()
    }

    /// Wait until every submitted record has been acknowledged or failed.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Closed` if the producer shut down while waiting.
    pub async fn flush(&self) -> Result<()> {
        let mut rx = self.shared.in_flight.subscribe();
        rx.wait_for(|n| *n == 0)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Closed)
    }

    /// Metrics recorded by this producer's connection pool.
    #[must_use]
    pub fn metrics(&self) -> Arc<ClientMetrics> {
        self.shared.pool.metrics()
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flush within `close_timeout_ms`, stop the workers and release the
    /// pool if this producer owns it. Records still queued when the grace
    /// period ends fail with `ClientError::Closed`. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let grace = Duration::from_millis(self.shared.config.close_timeout_ms);
        if tokio::time::timeout(grace, self.flush()).await.is_err() {
            warn!(
                in_flight = self.in_flight(),
                timeout_ms = self.shared.config.close_timeout_ms,
                "close timed out waiting for deliveries"
            );
        }

        self.shared.cancel.cancel();
        let keys: Vec<_> = self.workers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.workers.remove(&key) {
                drop(handle.tx);
                if let Err(e) = handle.task.await {
                    warn!(topic = %key.0, partition = key.1, error = %e, "partition worker panicked");
                }
            }
        }

        if let Some(shutdown) = &self.refresh_shutdown {
            let _ = shutdown.send(true);
        }
        if self.owns_pool {
            self.shared.pool.close().await;
        }
        debug!("producer closed");
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if !self.is_closed() {
            let in_flight = self.in_flight();
            if in_flight > 0 {
                warn!(in_flight, "producer dropped without close; pending records will fail");
            } else {
                warn!("producer dropped without close");
            }
            self.shared.cancel.cancel();
            if let Some(shutdown) = &self.refresh_shutdown {
                let _ = shutdown.send(true);
            }
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KafkaConfig;
    use crate::metrics::ClientMetrics;

    fn detached_producer() -> Producer {
        let pool = Arc::new(BrokerPool::new(
            KafkaConfig::new(vec!["localhost:9092".to_string()]),
            None,
            Arc::new(ClientMetrics::new()),
        ));
        Producer::with_pool(pool, ProducerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let producer = detached_producer();
        producer.close().await;
        producer.close().await;

        let result = producer.send(ProducerRecord::text("orders", "k", "v")).await;
        assert!(matches!(result, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_flush_with_nothing_in_flight() {
        let producer = detached_producer();
        assert_eq!(producer.in_flight(), 0);
        tokio::time::timeout(Duration::from_millis(100), producer.flush())
            .await
            .expect("flush should return immediately")
            .unwrap();
        producer.close().await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let pool = Arc::new(BrokerPool::new(
            KafkaConfig::new(vec!["localhost:9092".to_string()]),
            None,
            Arc::new(ClientMetrics::new()),
        ));
        let config = ProducerConfig {
            batch_size: 0,
            ..ProducerConfig::default()
        };
        assert!(matches!(
            Producer::with_pool(pool, config),
            Err(ClientError::Config { .. })
        ));
    }
}
