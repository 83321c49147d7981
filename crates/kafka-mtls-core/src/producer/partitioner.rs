//! Partition selection for records without an explicit partition.
//!
//! Keyed records hash with murmur2 exactly like the Java client, so a key
//! lands on the same partition regardless of which client produced it.

use std::sync::atomic::{AtomicU32, Ordering};

const SEED: u32 = 0x9747_b28c;
const M: u32 = 0x5bd1_e995;
const R: u32 = 24;

/// Kafka's murmur2 hash.
#[must_use]
pub fn murmur2(data: &[u8]) -> i32 {
    let mut h = SEED ^ data.len() as u32;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h as i32
}

/// Chooses partitions: explicit, then key hash, then round-robin.
#[derive(Debug, Default)]
pub struct Partitioner {
    next: AtomicU32,
}

impl Partitioner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Partition for a record on a topic with `partition_count` partitions.
    ///
    /// `partition_count` must be non-zero.
    pub fn partition(&self, key: Option<&[u8]>, explicit: Option<i32>, partition_count: usize) -> i32 {
        if let Some(partition) = explicit {
            return partition;
        }
        let count = partition_count.max(1) as u32;
        match key {
            Some(key) => ((murmur2(key) as u32 & 0x7fff_ffff) % count) as i32,
            None => (self.next.fetch_add(1, Ordering::Relaxed) % count) as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur2_matches_java_client() {
        assert_eq!(murmur2(b"21"), -973_932_308);
        assert_eq!(murmur2(b"foobar"), -790_332_482);
        assert_eq!(murmur2(b"a-little-bit-long-string"), -985_981_536);
        assert_eq!(murmur2(b"a-little-bit-longer-string"), -1_486_304_829);
        assert_eq!(
            murmur2(b"lkjh234lh9fiuh90y23oiuhsafujhadof229phr9h19h89h8"),
            -58_897_971
        );
        assert_eq!(murmur2(b"abc"), 479_470_107);
    }

    #[test]
    fn test_explicit_partition_wins() {
        let partitioner = Partitioner::new();
        assert_eq!(partitioner.partition(Some(b"key-0"), Some(2), 3), 2);
    }

    #[test]
    fn test_keyed_is_stable() {
        let partitioner = Partitioner::new();
        let first = partitioner.partition(Some(b"key-0"), None, 6);
        for _ in 0..10 {
            assert_eq!(partitioner.partition(Some(b"key-0"), None, 6), first);
        }
        assert!((0..6).contains(&first));
    }

    #[test]
    fn test_keyless_round_robin() {
        let partitioner = Partitioner::new();
        let chosen: Vec<i32> = (0..6).map(|_| partitioner.partition(None, None, 3)).collect();
        assert_eq!(chosen, vec![0, 1, 2, 0, 1, 2]);
    }

    proptest::proptest! {
        #[test]
        fn prop_partition_in_range(key in proptest::collection::vec(proptest::num::u8::ANY, 0..64), count in 1usize..128) {
            let partitioner = Partitioner::new();
            let partition = partitioner.partition(Some(&key), None, count);
            proptest::prop_assert!(partition >= 0 && (partition as usize) < count);
        }
    }
}
