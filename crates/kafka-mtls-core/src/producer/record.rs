use bytes::Bytes;

/// A record to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    /// Target partition; chosen by the partitioner when `None`.
    pub partition: Option<i32>,
}

impl ProducerRecord {
    /// A record with raw key and value bytes.
    #[must_use]
    pub fn new(topic: impl Into<String>, key: Option<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key,
            value,
            partition: None,
        }
    }

    /// A record with UTF-8 text key and value.
    #[must_use]
    pub fn text(topic: impl Into<String>, key: &str, value: &str) -> Self {
        Self::new(
            topic,
            Some(Bytes::copy_from_slice(key.as_bytes())),
            Some(Bytes::copy_from_slice(value.as_bytes())),
        )
    }

    /// Pin the record to a partition.
    #[must_use]
    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_record() {
        let record = ProducerRecord::text("orders", "key-0", "message-X").with_partition(2);
        assert_eq!(record.key.as_deref(), Some(&b"key-0"[..]));
        assert_eq!(record.value.as_deref(), Some(&b"message-X"[..]));
        assert_eq!(record.partition, Some(2));
    }
}
