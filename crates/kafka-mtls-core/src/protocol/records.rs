//! Record batch encoding for produce requests and decoding for fetch responses.

use bytes::{Buf, Bytes, BytesMut};
use kafka_protocol::records::{
    Compression, Record, RecordBatchDecoder, RecordBatchEncoder, RecordEncodeOptions,
    TimestampType,
};
use tracing::debug;

use crate::error::{ClientError, Result};

/// Offset and length fields that precede every batch in a record set.
const BATCH_HEADER_LEN: usize = 12;

/// A key/value pair ready to be written into a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub timestamp: i64,
}

/// A record read back from a fetch response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRecord {
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

/// Encode records into a single v2 record batch with relative offsets from 0.
///
/// # Errors
///
/// Returns `ClientError::Protocol` if encoding fails.
pub fn encode_batch(records: &[OutgoingRecord]) -> Result<Bytes> {
    let records: Vec<Record> = records
        .iter()
        .zip(0i64..)
        .map(|(record, offset)| Record {
            transactional: false,
            control: false,
            partition_leader_epoch: -1,
            producer_id: -1,
            producer_epoch: -1,
            timestamp_type: TimestampType::Creation,
            offset,
            sequence: -1,
            timestamp: record.timestamp,
            key: record.key.clone(),
            value: record.value.clone(),
            headers: Default::default(),
        })
        .collect();

    let options = RecordEncodeOptions {
        version: 2,
        compression: Compression::None,
    };

    let mut buf = BytesMut::new();
    RecordBatchEncoder::encode(&mut buf, &records, &options)
        .map_err(|e| ClientError::protocol(format!("failed to encode record batch: {e}")))?;
    Ok(buf.freeze())
}

/// Size of a single record once encoded on its own in a batch.
///
/// # Errors
///
/// Returns `ClientError::Protocol` if encoding fails.
pub fn encoded_size(record: &OutgoingRecord) -> Result<usize> {
    encode_batch(std::slice::from_ref(record)).map(|b| b.len())
}

/// Decode every complete batch in a fetched record set.
///
/// A fetch may end with a partial batch when it hits the byte limit; that tail
/// is dropped and fetched again from the next position. Control records are
/// skipped.
///
/// # Errors
///
/// Returns `ClientError::Protocol` if a complete batch fails to decode.
pub fn decode_record_set(mut data: Bytes) -> Result<Vec<IncomingRecord>> {
    let mut decoded = Vec::new();

    while data.remaining() >= BATCH_HEADER_LEN {
        let batch_len = i32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let batch_len = usize::try_from(batch_len)
            .map_err(|_| ClientError::protocol(format!("negative batch length {batch_len}")))?;
        let total = BATCH_HEADER_LEN + batch_len;
        if data.remaining() < total {
            debug!(
                remaining = data.remaining(),
                needed = total,
                "dropping truncated trailing batch"
            );
            break;
        }

        let mut batch = data.split_to(total);
        let set = RecordBatchDecoder::decode(&mut batch)
            .map_err(|e| ClientError::protocol(format!("failed to decode record batch: {e}")))?;
        decoded.extend(
            set.records
                .into_iter()
                .filter(|record| !record.control)
                .map(|record| IncomingRecord {
                    offset: record.offset,
                    timestamp: record.timestamp,
                    key: record.key,
                    value: record.value,
                }),
        );
    }

    Ok(decoded)
}

/// Rewrite the base offset of every batch in `data`, starting at `base`.
///
/// The broker assigns offsets on append; the in-memory cluster used in tests
/// does the same through this helper. Returns the offset after the last record.
///
/// # Errors
///
/// Returns `ClientError::Protocol` if the data is not a sequence of complete batches.
#[cfg(any(test, feature = "testing"))]
pub fn assign_offsets(data: &[u8], base: i64) -> Result<(Bytes, i64)> {
    let mut out = BytesMut::from(data);
    let mut pos = 0usize;
    let mut next = base;

    while pos < out.len() {
        if out.len() - pos < BATCH_HEADER_LEN + 49 {
            return Err(ClientError::protocol("truncated record batch"));
        }
        let batch_len = i32::from_be_bytes([
            out[pos + 8],
            out[pos + 9],
            out[pos + 10],
            out[pos + 11],
        ]);
        let batch_len = usize::try_from(batch_len)
            .map_err(|_| ClientError::protocol(format!("negative batch length {batch_len}")))?;
        let end = pos + BATCH_HEADER_LEN + batch_len;
        if end > out.len() {
            return Err(ClientError::protocol("truncated record batch"));
        }

        // lastOffsetDelta sits after partitionLeaderEpoch(4) magic(1) crc(4) attributes(2)
        let delta_at = pos + BATCH_HEADER_LEN + 11;
        let last_delta = i32::from_be_bytes([
            out[delta_at],
            out[delta_at + 1],
            out[delta_at + 2],
            out[delta_at + 3],
        ]);

        out[pos..pos + 8].copy_from_slice(&next.to_be_bytes());
        next += i64::from(last_delta) + 1;
        pos = end;
    }

    Ok((out.freeze(), next))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, value: &str) -> OutgoingRecord {
        OutgoingRecord {
            key: Some(Bytes::copy_from_slice(key.as_bytes())),
            value: Some(Bytes::copy_from_slice(value.as_bytes())),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_batch_preserves_order() {
        let batch = encode_batch(&[record("k0", "a"), record("k1", "b"), record("k2", "c")]).unwrap();
        let decoded = decode_record_set(batch).unwrap();

        let values: Vec<_> = decoded.iter().map(|r| r.value.clone().unwrap()).collect();
        assert_eq!(values, vec!["a", "b", "c"]);
        let offsets: Vec<_> = decoded.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[test]
    fn test_assign_offsets_rebases_batches() {
        let first = encode_batch(&[record("a", "1"), record("b", "2")]).unwrap();
        let second = encode_batch(&[record("c", "3")]).unwrap();

        let (first, next) = assign_offsets(&first, 10).unwrap();
        assert_eq!(next, 12);
        let (second, next) = assign_offsets(&second, next).unwrap();
        assert_eq!(next, 13);

        let mut log = BytesMut::new();
        log.extend_from_slice(&first);
        log.extend_from_slice(&second);
        let decoded = decode_record_set(log.freeze()).unwrap();
        let offsets: Vec<_> = decoded.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![10, 11, 12]);
    }

    #[test]
    fn test_truncated_tail_is_dropped() {
        let first = encode_batch(&[record("a", "1")]).unwrap();
        let second = encode_batch(&[record("b", "2")]).unwrap();
        let (second, _) = assign_offsets(&second, 1).unwrap();

        let mut log = BytesMut::new();
        log.extend_from_slice(&first);
        log.extend_from_slice(&second[..second.len() - 5]);

        let decoded = decode_record_set(log.freeze()).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].offset, 0);
    }

    #[test]
    fn test_empty_record_set() {
        assert!(decode_record_set(Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn test_encoded_size_grows_with_value() {
        let small = encoded_size(&record("k", "v")).unwrap();
        let large = encoded_size(&record("k", &"v".repeat(1000))).unwrap();
        assert!(large > small + 900);
    }
}
