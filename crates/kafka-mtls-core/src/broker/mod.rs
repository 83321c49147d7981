//! Broker connection management.
//!
//! This module provides:
//! - Plain and mutually authenticated TLS channels to brokers
//! - Request/response correlation over a single channel
//! - A pool that bootstraps, tracks topology and routes to partition leaders
//! - Background metadata refresh

pub mod connection;
pub mod metadata;
pub mod metadata_refresh;
pub mod pool;
pub mod stream;

pub use connection::{BrokerConnection, ConnectionSettings};
pub use metadata::{BrokerInfo, ClusterMetadata, PartitionMetadata, TopicMetadata};
pub use metadata_refresh::MetadataRefresher;
pub use pool::BrokerPool;
pub use stream::BrokerStream;
