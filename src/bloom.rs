//! Fixed-geometry Bloom filter backing the decaying duplicate filter.
//!
//! One SHA-256 digest per entry supplies every probe index: with the
//! default geometry of 2^23 bits and 11 probes, 11 x 23 = 253 of the
//! digest's 256 bits are consumed. The filter never resizes.

use sha2::{Digest, Sha256};

/// Precomputed probe key for one entry.
pub(crate) type BloomKey = [u8; 32];

/// Digest an entry once so membership tests and inserts share the work.
pub(crate) fn key(entry: &[u8]) -> BloomKey {
    Sha256::digest(entry).into()
}

pub(crate) struct BloomFilter {
    bits: Vec<u64>,
    m_log2: u32,
    hashes: u32,
    inserted: usize,
}

impl BloomFilter {
    /// Filter over `2^m_log2` bits probed at `hashes` positions per entry.
    pub fn new(m_log2: u32, hashes: u32) -> Self {
        assert!((6..=28).contains(&m_log2), "unsupported filter geometry");
        // every probe must draw its bits from within the 256-bit digest
        assert!(hashes >= 1 && hashes * m_log2 <= 256);
        Self {
            bits: vec![0u64; 1usize << (m_log2 - 6)],
            m_log2,
            hashes,
            inserted: 0,
        }
    }

    fn index(&self, key: &BloomKey, probe: u32) -> usize {
        let bit = probe as usize * self.m_log2 as usize;
        let byte = bit / 8;
        let mut window = 0u64;
        for i in 0..4 {
            if let Some(b) = key.get(byte + i) {
                window |= (*b as u64) << (8 * i);
            }
        }
        ((window >> (bit % 8)) & ((1u64 << self.m_log2) - 1)) as usize
    }

    /// Set the entry's probe bits.
    pub fn insert(&mut self, key: &BloomKey) {
        for probe in 0..self.hashes {
            let idx = self.index(key, probe);
            self.bits[idx >> 6] |= 1u64 << (idx & 63);
        }
        self.inserted += 1;
    }

    /// Whether all of the entry's probe bits are set.
    pub fn contains(&self, key: &BloomKey) -> bool {
        (0..self.hashes).all(|probe| {
            let idx = self.index(key, probe);
            self.bits[idx >> 6] & (1u64 << (idx & 63)) != 0
        })
    }

    /// Zero the bit array and the insert counter.
    pub fn clear(&mut self) {
        self.bits.fill(0);
        self.inserted = 0;
    }

    /// Number of inserts since the last clear.
    pub fn inserted(&self) -> usize {
        self.inserted
    }

    /// Theoretical false-positive probability at the current load,
    /// `(1 - e^(-k*n/m))^k`.
    pub fn false_positive_estimate(&self) -> f64 {
        if self.inserted == 0 {
            return 0.0;
        }
        let k = self.hashes as f64;
        let n = self.inserted as f64;
        let m = (1u64 << self.m_log2) as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }
}
