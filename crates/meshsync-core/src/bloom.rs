//! Bloom filters used for set reconciliation and rate limiting.
//!
//! Two variants: an add-only filter that travels on the wire inside sync
//! requests, and a small counting filter (4-bit saturating counters) used
//! locally for repeat detection and per-address rate limits.
//!
//! False positives are possible and accounted for by the reconciliation
//! protocol; false negatives are not.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const HASH_COUNT: usize = 3;

fn key_positions(key: &[u8], nbits: usize) -> [usize; HASH_COUNT] {
    // One blake3 digest gives us four independent 64-bit words; we use three.
    let digest = blake3::hash(key);
    let bytes = digest.as_bytes();
    let mut positions = [0usize; HASH_COUNT];
    for (i, pos) in positions.iter_mut().enumerate() {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
        *pos = (u64::from_le_bytes(word) % nbits as u64) as usize;
    }
    positions
}

/// Add-only bloom filter advertising "what I have" to a peer.
///
/// Dimensions are validated on deserialization: a filter arriving off the
/// wire must satisfy the same invariants the constructor establishes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BloomFilterWire")]
pub struct BloomFilter {
    bits: Vec<u8>,
    nbits: usize,
    entries: usize,
}

/// Unvalidated wire form of [`BloomFilter`].
#[derive(Deserialize)]
struct BloomFilterWire {
    bits: Vec<u8>,
    nbits: usize,
    entries: usize,
}

impl TryFrom<BloomFilterWire> for BloomFilter {
    type Error = CoreError;

    fn try_from(wire: BloomFilterWire) -> std::result::Result<Self, Self::Error> {
        if wire.nbits < 8 {
            return Err(CoreError::InvalidLength {
                what: "bloom filter width",
                expected: 8,
                got: wire.nbits,
            });
        }
        if wire.bits.len() != wire.nbits.div_ceil(8) {
            return Err(CoreError::InvalidLength {
                what: "bloom filter bits",
                expected: wire.nbits.div_ceil(8),
                got: wire.bits.len(),
            });
        }
        Ok(Self {
            bits: wire.bits,
            nbits: wire.nbits,
            entries: wire.entries,
        })
    }
}

impl BloomFilter {
    /// Create a filter with at least `nbits` bits.
    pub fn new(nbits: usize) -> Self {
        let nbits = nbits.max(8);
        Self {
            bits: vec![0u8; nbits.div_ceil(8)],
            nbits,
            entries: 0,
        }
    }

    /// Create an empty zero-bit placeholder (construction failed upstream).
    pub fn empty() -> Self {
        Self::new(8)
    }

    /// Number of keys added.
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Filter width in bits.
    pub fn len_bits(&self) -> usize {
        self.nbits
    }

    /// Serialized size in bytes.
    pub fn len_bytes(&self) -> usize {
        self.bits.len()
    }

    /// Add a key.
    pub fn add(&mut self, key: &[u8]) {
        for pos in key_positions(key, self.nbits) {
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
        self.entries += 1;
    }

    /// Test membership. May return false positives, never false negatives.
    pub fn contains(&self, key: &[u8]) -> bool {
        key_positions(key, self.nbits)
            .iter()
            .all(|&pos| self.bits[pos / 8] & (1 << (pos % 8)) != 0)
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bloom({} bits, {} entries)", self.nbits, self.entries)
    }
}

/// Counting bloom filter with 4-bit saturating counters.
///
/// `add` returns the smallest counter touched, which approximates (from
/// below) how many times the key has been added. Cleared wholesale on a
/// timer rather than removing individual keys.
#[derive(Clone)]
pub struct CountingBloomFilter {
    counters: Vec<u8>, // two 4-bit counters per byte
    slots: usize,
}

impl CountingBloomFilter {
    /// Create a filter with `slots` counters.
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(16);
        Self {
            counters: vec![0u8; slots.div_ceil(2)],
            slots,
        }
    }

    fn get_slot(&self, slot: usize) -> u8 {
        let byte = self.counters[slot / 2];
        if slot % 2 == 0 {
            byte & 0x0f
        } else {
            byte >> 4
        }
    }

    fn bump_slot(&mut self, slot: usize) -> u8 {
        let current = self.get_slot(slot);
        if current < 0x0f {
            let byte = &mut self.counters[slot / 2];
            if slot % 2 == 0 {
                *byte = (*byte & 0xf0) | (current + 1);
            } else {
                *byte = (*byte & 0x0f) | ((current + 1) << 4);
            }
            current + 1
        } else {
            current
        }
    }

    /// Add a key and return its approximate occurrence count.
    pub fn add(&mut self, key: &[u8]) -> u8 {
        let mut min = u8::MAX;
        for pos in key_positions(key, self.slots) {
            min = min.min(self.bump_slot(pos));
        }
        min
    }

    /// Approximate occurrence count without adding.
    pub fn count(&self, key: &[u8]) -> u8 {
        key_positions(key, self.slots)
            .iter()
            .map(|&pos| self.get_slot(pos))
            .min()
            .unwrap_or(0)
    }

    /// Reset every counter.
    pub fn clear(&mut self) {
        self.counters.iter_mut().for_each(|b| *b = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut bloom = BloomFilter::new(1280);
        let keys: Vec<Vec<u8>> = (0u32..100).map(|i| i.to_le_bytes().to_vec()).collect();
        for key in &keys {
            bloom.add(key);
        }
        for key in &keys {
            assert!(bloom.contains(key));
        }
        assert_eq!(bloom.entry_count(), 100);
    }

    #[test]
    fn test_absent_keys_mostly_absent() {
        let mut bloom = BloomFilter::new(1280);
        for i in 0u32..64 {
            bloom.add(&i.to_le_bytes());
        }
        let false_positives = (1000u32..2000)
            .filter(|i| bloom.contains(&i.to_le_bytes()))
            .count();
        // ~10 bits/key keeps the false positive rate around 1%.
        assert!(false_positives < 100, "fp={false_positives}");
    }

    #[test]
    fn test_counting_increments() {
        let mut bloom = CountingBloomFilter::new(1024);
        for expected in 1..=5u8 {
            assert_eq!(bloom.add(b"addr"), expected);
        }
        assert_eq!(bloom.count(b"addr"), 5);
        bloom.clear();
        assert_eq!(bloom.count(b"addr"), 0);
    }

    #[test]
    fn test_counting_saturates() {
        let mut bloom = CountingBloomFilter::new(64);
        for _ in 0..40 {
            bloom.add(b"x");
        }
        assert_eq!(bloom.count(b"x"), 0x0f);
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut bloom = BloomFilter::new(640);
        bloom.add(b"one");
        bloom.add(b"two");

        let mut buf = Vec::new();
        ciborium::into_writer(&bloom, &mut buf).unwrap();
        let back: BloomFilter = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(bloom, back);
        assert!(back.contains(b"one"));
    }

    #[derive(Serialize)]
    struct RawBloom {
        bits: Vec<u8>,
        nbits: usize,
        entries: usize,
    }

    fn decode_raw(raw: &RawBloom) -> Result<BloomFilter, ciborium::de::Error<std::io::Error>> {
        let mut buf = Vec::new();
        ciborium::into_writer(raw, &mut buf).unwrap();
        ciborium::from_reader(buf.as_slice())
    }

    #[test]
    fn test_decode_rejects_zero_width() {
        let raw = RawBloom {
            bits: vec![0u8; 8],
            nbits: 0,
            entries: 0,
        };
        assert!(decode_raw(&raw).is_err());
    }

    #[test]
    fn test_decode_rejects_width_past_buffer() {
        let raw = RawBloom {
            bits: vec![0xff],
            nbits: 1024,
            entries: 1,
        };
        assert!(decode_raw(&raw).is_err());
    }

    #[test]
    fn test_decode_accepts_consistent_dimensions() {
        let raw = RawBloom {
            bits: vec![0u8; 80],
            nbits: 640,
            entries: 0,
        };
        let bloom = decode_raw(&raw).unwrap();
        assert_eq!(bloom.len_bits(), 640);
        assert!(!bloom.contains(b"anything"));
    }
}
