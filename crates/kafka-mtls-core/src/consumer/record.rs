use bytes::Bytes;

/// A record delivered by `poll`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    /// Creation or log-append time in milliseconds since the epoch.
    pub timestamp: i64,
}

impl ConsumerRecord {
    /// The key as UTF-8 text, if present and valid.
    #[must_use]
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    /// The value as UTF-8 text, if present and valid.
    #[must_use]
    pub fn value_str(&self) -> Option<&str> {
        self.value.as_deref().and_then(|v| std::str::from_utf8(v).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_views() {
        let record = ConsumerRecord {
            topic: "orders".to_string(),
            partition: 0,
            offset: 0,
            key: Some(Bytes::from_static(b"key-0")),
            value: Some(Bytes::from_static(&[0xff, 0xfe])),
            timestamp: 0,
        };
        assert_eq!(record.key_str(), Some("key-0"));
        assert_eq!(record.value_str(), None);
    }
}
