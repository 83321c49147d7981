//! Cluster topology as learned from Metadata responses.

use std::collections::{BTreeMap, HashMap};

use kafka_protocol::messages::MetadataResponse;

use crate::protocol::error_code;

/// Information about a Kafka broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerInfo {
    /// The broker node ID.
    pub node_id: i32,
    /// The broker hostname.
    pub host: String,
    /// The broker port.
    pub port: i32,
}

impl BrokerInfo {
    /// Create a new broker info.
    #[must_use]
    pub fn new(node_id: i32, host: String, port: i32) -> Self {
        Self {
            node_id,
            host,
            port,
        }
    }

    /// The `host:port` address of the broker.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Leadership of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub partition: i32,
    /// Leader node id, `-1` while no leader is elected.
    pub leader: i32,
    pub error_code: i16,
}

/// Partitions of one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub name: String,
    pub error_code: i16,
    pub partitions: BTreeMap<i32, PartitionMetadata>,
}

impl TopicMetadata {
    /// Number of partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Partition ids in ascending order.
    #[must_use]
    pub fn partition_ids(&self) -> Vec<i32> {
        self.partitions.keys().copied().collect()
    }
}

/// A consistent snapshot of brokers and topic leadership.
///
/// Snapshots are replaced wholesale by the pool, never edited in place, so a
/// reader always sees one complete version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterMetadata {
    brokers: HashMap<i32, BrokerInfo>,
    topics: HashMap<String, TopicMetadata>,
}

impl ClusterMetadata {
    /// Build a snapshot from a Metadata response.
    #[must_use]
    pub fn from_response(response: &MetadataResponse) -> Self {
        let brokers = response
            .brokers
            .iter()
            .map(|b| {
                let info = BrokerInfo::new(b.node_id.0, b.host.to_string(), b.port);
                (info.node_id, info)
            })
            .collect();

        let topics = response
            .topics
            .iter()
            .filter_map(|t| {
                let name = t.name.as_ref()?.to_string();
                let partitions = t
                    .partitions
                    .iter()
                    .map(|p| {
                        (
                            p.partition_index,
                            PartitionMetadata {
                                partition: p.partition_index,
                                leader: p.leader_id.0,
                                error_code: p.error_code,
                            },
                        )
                    })
                    .collect();
                Some((
                    name.clone(),
                    TopicMetadata {
                        name,
                        error_code: t.error_code,
                        partitions,
                    },
                ))
            })
            .collect();

        Self { brokers, topics }
    }

    /// A new snapshot combining `newer` with the topics of `self` that `newer`
    /// does not describe. Brokers always come from `newer`.
    #[must_use]
    pub fn merged_with(&self, newer: Self) -> Self {
        let mut topics = newer.topics;
        for (name, topic) in &self.topics {
            topics.entry(name.clone()).or_insert_with(|| topic.clone());
        }
        Self {
            brokers: newer.brokers,
            topics,
        }
    }

    /// A copy without the given topic, forcing the next lookup to refresh it.
    #[must_use]
    pub fn without_topic(&self, topic: &str) -> Self {
        let mut copy = self.clone();
        copy.topics.remove(topic);
        copy
    }

    /// Look up a broker.
    #[must_use]
    pub fn broker(&self, node_id: i32) -> Option<&BrokerInfo> {
        self.brokers.get(&node_id)
    }

    /// All known brokers, ordered by node id.
    #[must_use]
    pub fn brokers(&self) -> Vec<&BrokerInfo> {
        let mut brokers: Vec<_> = self.brokers.values().collect();
        brokers.sort_by_key(|b| b.node_id);
        brokers
    }

    /// Look up a topic that exists without error.
    #[must_use]
    pub fn topic(&self, name: &str) -> Option<&TopicMetadata> {
        self.topics
            .get(name)
            .filter(|t| t.error_code == error_code::NONE && !t.partitions.is_empty())
    }

    /// Error the broker reported for a topic, if it reported one.
    #[must_use]
    pub fn topic_error(&self, name: &str) -> Option<i16> {
        self.topics
            .get(name)
            .map(|t| t.error_code)
            .filter(|code| *code != error_code::NONE)
    }

    /// Names of every described topic.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.keys().cloned().collect()
    }

    /// Leader node of a partition, if one is elected.
    #[must_use]
    pub fn leader_for(&self, topic: &str, partition: i32) -> Option<i32> {
        self.topic(topic)?
            .partitions
            .get(&partition)
            .map(|p| p.leader)
            .filter(|leader| *leader >= 0)
    }

    /// Number of partitions of a topic.
    #[must_use]
    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.topic(topic).map(TopicMetadata::partition_count)
    }
}
