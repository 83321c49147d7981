//! Background metadata refresh task.
//!
//! Periodically re-fetches metadata for every tracked topic so leader moves
//! and broker changes are picked up without waiting for a request to fail.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::pool::BrokerPool;

/// Background task that periodically refreshes the pool's metadata snapshot.
pub struct MetadataRefresher {
    broker_pool: Arc<BrokerPool>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl MetadataRefresher {
    /// Create a new metadata refresher.
    ///
    /// An `interval_secs` of 0 disables refreshing.
    #[must_use]
    pub fn new(
        broker_pool: Arc<BrokerPool>,
        interval_secs: u64,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker_pool,
            interval: Duration::from_secs(interval_secs),
            shutdown_rx,
        }
    }

    /// Spawn the refresh loop onto the runtime.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the refresh loop until shutdown is signalled or the pool closes.
    pub async fn run(mut self) {
        if self.interval.is_zero() {
            info!("metadata refresh disabled (interval=0)");
            return;
        }

        info!(
            interval_secs = self.interval.as_secs(),
            "starting background metadata refresh"
        );

        let mut interval = tokio::time::interval(self.interval);
        // The first tick completes immediately; the pool has just fetched metadata.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.broker_pool.is_closed() {
                        break;
                    }
                    self.refresh().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("metadata refresher shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn refresh(&self) {
        debug!("refreshing cluster metadata");
        match self.broker_pool.refresh_metadata(&[], false).await {
            Ok(snapshot) => debug!(
                brokers = snapshot.brokers().len(),
                "metadata refresh complete"
            ),
            Err(e) => warn!(error = %e, "failed to refresh metadata"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KafkaConfig;
    use crate::metrics::ClientMetrics;

    fn pool() -> Arc<BrokerPool> {
        Arc::new(BrokerPool::new(
            KafkaConfig::new(vec!["localhost:9092".to_string()]),
            None,
            Arc::new(ClientMetrics::new()),
        ))
    }

    #[tokio::test]
    async fn test_disabled_when_interval_zero() {
        let (_tx, rx) = watch::channel(false);
        let refresher = MetadataRefresher::new(pool(), 0, rx);

        let result = tokio::time::timeout(Duration::from_millis(100), refresher.run()).await;
        assert!(result.is_ok(), "should complete immediately when disabled");
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let handle = MetadataRefresher::new(pool(), 60, rx).spawn();

        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "should stop after shutdown signal");
    }
}
