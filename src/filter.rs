//! Time-decaying probabilistic duplicate detector.
//!
//! Two Bloom filter generations rotate every `duration_ms`: inserts write
//! both generations, queries test their union, and rotation discards the
//! older one. An entry inserted at time `t` therefore tests as present for
//! all of `[t, t + duration_ms)`, possibly until `t + 2*duration_ms`, and
//! never after. Fixed footprint, roughly 1 MiB per generation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::RngCore;
use tracing::debug;

use crate::bloom::{self, BloomFilter};
use crate::error::FilterError;
use crate::timer::{TimedEvent, TimerHandle, TimerService};

// Geometry shared by both generations: 2^23 bits, 11 probes. Sized for
// about 10^6 insertions per window at a false-positive rate well under
// 10^-6; oversized filters degrade gracefully rather than resize.
const FILTER_M_LOG2: u32 = 23;
const FILTER_HASHES: u32 = 11;

/// Width short entries are padded to before hashing.
const EXTENDED_LEN: usize = 32;

struct Generations {
    current: BloomFilter,
    previous: BloomFilter,
    current_duplicates: u64,
}

/// Rotating two-generation Bloom filter with a bounded membership window.
pub struct DecayingBloomFilter {
    generations: Mutex<Generations>,
    duration_ms: u64,
    entry_bytes: usize,
    // Fixed random pads for widening short entries; drawn once at
    // construction so the widening is deterministic per filter instance.
    extenders: Vec<Vec<u8>>,
    keep_decaying: AtomicBool,
    timer: Arc<TimerService>,
    decay_handle: Mutex<Option<TimerHandle>>,
}

impl DecayingBloomFilter {
    /// Create a filter whose entries last at least `duration_ms` and at
    /// most twice that, and arm its rotation on `timer`.
    ///
    /// `entry_bytes` fixes the width `add` accepts. Entries shorter than
    /// 32 bytes are widened by concatenating the entry with itself XORed
    /// against each extender, truncated to 32 bytes.
    pub fn new(timer: Arc<TimerService>, duration_ms: u64, entry_bytes: usize) -> Arc<Self> {
        assert!(duration_ms > 0, "decay period must be nonzero");
        assert!(entry_bytes > 0, "entry width must be nonzero");

        let num_extenders = ((EXTENDED_LEN + entry_bytes - 1) / entry_bytes).saturating_sub(1);
        let mut rng = rand::thread_rng();
        let extenders = (0..num_extenders)
            .map(|_| {
                let mut pad = vec![0u8; entry_bytes];
                rng.fill_bytes(&mut pad);
                pad
            })
            .collect();

        let filter = Arc::new(Self {
            generations: Mutex::new(Generations {
                current: BloomFilter::new(FILTER_M_LOG2, FILTER_HASHES),
                previous: BloomFilter::new(FILTER_M_LOG2, FILTER_HASHES),
                current_duplicates: 0,
            }),
            duration_ms,
            entry_bytes,
            extenders,
            keep_decaying: AtomicBool::new(true),
            timer: Arc::clone(&timer),
            decay_handle: Mutex::new(None),
        });

        let event = Arc::new(DecayEvent {
            filter: Arc::downgrade(&filter),
        });
        *filter.decay_handle.lock() = Some(timer.schedule_every(event, duration_ms));
        filter
    }

    /// Rotation period in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Entry width this filter accepts.
    pub fn entry_bytes(&self) -> usize {
        self.entry_bytes
    }

    /// Insert `entry` and report whether it was already present (likely).
    ///
    /// Duplicates are not re-inserted, so a repeated entry still ages out
    /// on the schedule set by its first insertion.
    pub fn add(&self, entry: &[u8]) -> Result<bool, FilterError> {
        if entry.len() != self.entry_bytes {
            return Err(FilterError::WrongEntryLength {
                got: entry.len(),
                expected: self.entry_bytes,
            });
        }
        Ok(self.test_and_maybe_insert(entry, true))
    }

    /// `add` for fixed-width numeric entries.
    ///
    /// The value is reinterpreted as `u64` (two's complement, so negatives
    /// normalize and no negative zero exists) and truncated to its low
    /// `entry_bytes` little-endian bytes; wider configurations zero-pad.
    /// Values that agree on the low `entry_bytes * 8` bits collide by
    /// design.
    pub fn add_long(&self, entry: i64) -> bool {
        self.fold_long(entry, true)
    }

    /// Membership test for numeric entries, without inserting. Uses the
    /// same fold as [`add_long`](Self::add_long).
    pub fn is_known(&self, entry: i64) -> bool {
        self.fold_long(entry, false)
    }

    /// Empty both generations and reset the duplicate counter.
    pub fn clear(&self) {
        let mut generations = self.generations.lock();
        generations.current.clear();
        generations.previous.clear();
        generations.current_duplicates = 0;
    }

    /// Disarm the rotation. The filter keeps answering queries but no
    /// longer ages entries out.
    pub fn stop_decaying(&self) {
        self.keep_decaying.store(false, Ordering::SeqCst);
        if let Some(handle) = self.decay_handle.lock().take() {
            self.timer.cancel(handle);
        }
    }

    /// Duplicates observed since the last rotation.
    pub fn current_duplicate_count(&self) -> u64 {
        self.generations.lock().current_duplicates
    }

    /// Inserts held across both generations.
    pub fn inserted_count(&self) -> usize {
        let generations = self.generations.lock();
        generations.current.inserted() + generations.previous.inserted()
    }

    /// Estimated false-positive probability at the current load.
    pub fn false_positive_rate(&self) -> f64 {
        self.generations.lock().current.false_positive_estimate()
    }

    fn fold_long(&self, entry: i64, insert_if_new: bool) -> bool {
        let raw = (entry as u64).to_le_bytes();
        if self.entry_bytes <= raw.len() {
            self.test_and_maybe_insert(&raw[..self.entry_bytes], insert_if_new)
        } else {
            let mut wide = vec![0u8; self.entry_bytes];
            wide[..raw.len()].copy_from_slice(&raw);
            self.test_and_maybe_insert(&wide, insert_if_new)
        }
    }

    fn test_and_maybe_insert(&self, entry: &[u8], insert_if_new: bool) -> bool {
        let key = if self.extenders.is_empty() {
            bloom::key(entry)
        } else {
            bloom::key(&self.extend(entry))
        };

        let mut generations = self.generations.lock();
        let seen =
            generations.current.contains(&key) || generations.previous.contains(&key);
        if seen {
            generations.current_duplicates += 1;
            return true;
        }
        if insert_if_new {
            // both generations, so the entry survives an imminent rotation
            // and gets the full `[duration, 2*duration)` lifetime
            generations.current.insert(&key);
            generations.previous.insert(&key);
        }
        false
    }

    fn extend(&self, entry: &[u8]) -> [u8; EXTENDED_LEN] {
        let mut out = [0u8; EXTENDED_LEN];
        out[..self.entry_bytes].copy_from_slice(entry);
        for (i, extender) in self.extenders.iter().enumerate() {
            let start = self.entry_bytes * (i + 1);
            for j in 0..self.entry_bytes {
                let pos = start + j;
                if pos >= EXTENDED_LEN {
                    break;
                }
                out[pos] = entry[j] ^ extender[j];
            }
        }
        out
    }

    fn rotate(&self) {
        let inserted;
        let duplicates;
        {
            let mut generations = self.generations.lock();
            inserted = generations.current.inserted();
            duplicates = generations.current_duplicates;
            let Generations {
                current, previous, ..
            } = &mut *generations;
            std::mem::swap(current, previous);
            generations.current.clear();
            generations.current_duplicates = 0;
        }
        debug!(inserted, duplicates, "rotated duplicate filter generations");
    }
}

struct DecayEvent {
    filter: Weak<DecayingBloomFilter>,
}

impl TimedEvent for DecayEvent {
    fn time_reached(&self) {
        let Some(filter) = self.filter.upgrade() else {
            return;
        };
        // stop_decaying may race the firing; the flag settles it
        if filter.keep_decaying.load(Ordering::SeqCst) {
            filter.rotate();
        }
    }
}
