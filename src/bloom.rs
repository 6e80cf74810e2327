//! Fixed-rate bloom filters used as compact tombstone storage.
//!
//! A filter is sized once from a target false-positive probability and an
//! expected element count; after that only bits are set, never cleared.
//! Two filters built from the same `(rate, capacity)` pair therefore always
//! have identical bit-array lengths, which is what makes the bitwise-OR
//! `combine` well defined across replicas.
//!
//! Cardinality is recovered from the fraction of set bits rather than
//! tracked exactly, since a combine may set bits for elements this replica
//! never saw.

use serde::Deserialize;
use serde::Serialize;

/// Default target false-positive probability for tombstone filters.
pub const FALSE_POSITIVE_RATE: f64 = 0.000_000_01;

/// Default expected element count for a fresh filter.
pub const EXPECTED_ELEMENTS: usize = 2000;

/// A bloom filter with `k` hash rounds over an `m`-bit array.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BloomFilter {
    k: u32,
    m: u64,
    capacity: usize,
    estimated: f64,
    bits: Vec<u8>,
}

/// Derive the `k` bit indexes for an item by re-finalizing a blake3 digest
/// seeded with each round index in turn.
fn indexes(k: u32, m: u64, item: &[u8]) -> impl Iterator<Item = u64> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(item);
    return (0..k).map(move |round| {
        hasher.update(&[round as u8]);
        let digest = hasher.finalize();
        let word = u128::from_le_bytes(digest.as_bytes()[..16].try_into().expect("digest is 32 bytes"));
        (word % m as u128) as u64
    });
}

impl BloomFilter {
    /// Create a filter sized for `capacity` elements at the default rate.
    pub fn new(capacity: usize) -> BloomFilter {
        return BloomFilter::with_rate(FALSE_POSITIVE_RATE, capacity);
    }

    /// Create a filter sized for `capacity` elements at false-positive
    /// probability `rate`: `k = ceil(-log2 p)`, `m = ceil(-n ln p / (ln 2)^2)`.
    pub fn with_rate(rate: f64, capacity: usize) -> BloomFilter {
        let ln2 = std::f64::consts::LN_2;
        let k = (-rate.ln() / ln2).ceil() as u32;
        let m = (-(capacity as f64) * rate.ln() / (ln2 * ln2)).ceil() as u64;
        return BloomFilter {
            k,
            m,
            capacity,
            estimated: 0.0,
            bits: vec![0; 1 + (m >> 3) as usize],
        };
    }

    /// The element count this filter was sized for.
    pub fn capacity(&self) -> usize {
        return self.capacity;
    }

    /// Running cardinality estimate: counted on `add`, re-derived from the
    /// ones fraction after `combine`.
    pub fn estimated_len(&self) -> f64 {
        return self.estimated;
    }

    fn get_bit(&self, index: u64) -> bool {
        return (self.bits[(index >> 3) as usize] >> (index & 0x7)) & 0x1 == 1;
    }

    fn set_bit(&mut self, index: u64) {
        self.bits[(index >> 3) as usize] |= 1 << (index & 0x7);
    }

    /// Set the `k` derived bits for `item`.
    pub fn add(&mut self, item: &[u8]) {
        self.estimated += 1.0;
        for index in indexes(self.k, self.m, item) {
            self.set_bit(index);
        }
    }

    /// True iff all `k` derived bits are set. No false negatives.
    pub fn lookup(&self, item: &[u8]) -> bool {
        return indexes(self.k, self.m, item).all(|index| self.get_bit(index));
    }

    /// Estimate cardinality from the fraction of set bits:
    /// `-(m/k) * ln(1 - ones/m)`.
    pub fn estimate(&self) -> f64 {
        let ones: u64 = self.bits.iter().map(|byte| byte.count_ones() as u64).sum();
        return -(self.m as f64 / self.k as f64) * (1.0 - ones as f64 / self.m as f64).ln();
    }

    /// Bitwise-OR another filter of the same geometry into this one.
    ///
    /// The result can report a higher estimate than either input; exceeding
    /// the configured capacity degrades the false-positive rate but leaves
    /// the filter usable, so it is logged rather than surfaced as an error.
    pub fn combine(&mut self, other: &BloomFilter) {
        assert_eq!(self.m, other.m, "combined filters must share a bit-array length");
        for (byte, theirs) in self.bits.iter_mut().zip(&other.bits) {
            *byte |= theirs;
        }
        self.estimated = self.estimate();
        if self.estimated > self.capacity as f64 {
            tracing::warn!(
                estimated = self.estimated,
                capacity = self.capacity,
                "bloom filter overflow",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_bytes(n: u64) -> [u8; 8] {
        return n.to_le_bytes();
    }

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::new(1000);
        for n in 0..1000u64 {
            filter.add(&tag_bytes(n));
        }
        for n in 0..1000u64 {
            assert!(filter.lookup(&tag_bytes(n)));
        }
    }

    #[test]
    fn false_positive_rate_near_target() {
        let mut filter = BloomFilter::with_rate(0.01, 500);
        for n in 0..500u64 {
            filter.add(&tag_bytes(n));
        }
        let mut hits = 0;
        for n in 10_000..30_000u64 {
            if filter.lookup(&tag_bytes(n)) {
                hits += 1;
            }
        }
        // Sized for 1%; 20k probes should stay well inside 3x of that.
        assert!(hits < 600, "false positive rate too high: {hits}/20000");
    }

    #[test]
    fn estimate_tracks_distinct_adds() {
        let mut filter = BloomFilter::new(EXPECTED_ELEMENTS);
        for n in 0..200u64 {
            filter.add(&tag_bytes(n));
        }
        let estimate = filter.estimate();
        assert!((180.0..220.0).contains(&estimate), "estimate was {estimate}");
    }

    #[test]
    fn combine_unions_both_sides() {
        let mut left = BloomFilter::new(1000);
        let mut right = BloomFilter::new(1000);
        for n in 0..100u64 {
            left.add(&tag_bytes(n));
        }
        for n in 100..200u64 {
            right.add(&tag_bytes(n));
        }
        left.combine(&right);
        for n in 0..200u64 {
            assert!(left.lookup(&tag_bytes(n)));
        }
    }

    #[test]
    fn combine_overflow_leaves_filter_usable() {
        let mut left = BloomFilter::with_rate(0.01, 50);
        let mut right = BloomFilter::with_rate(0.01, 50);
        for n in 0..50u64 {
            left.add(&tag_bytes(n));
        }
        for n in 50..100u64 {
            right.add(&tag_bytes(n));
        }
        left.combine(&right);
        assert!(left.estimated_len() > 50.0);
        for n in 0..100u64 {
            assert!(left.lookup(&tag_bytes(n)));
        }
    }
}
