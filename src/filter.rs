//! Mergeable Bloom filter
//!
//! Every table filter is sized from the same configured key count, so the
//! filter of a compaction output is the bitwise OR of its inputs' filters
//! instead of a rebuild over every surviving key.

use std::sync::atomic::{AtomicU64, Ordering};

use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::config::FilterConfig;
use crate::error::{NvmError, Result};

const HASH_SEED: u64 = 0xbc9f_1d34;

/// Bitmaps below this size answer "no" for everything
const MIN_USEFUL_BITS: usize = 16;

#[inline]
fn filter_hash(key: &[u8]) -> u32 {
    xxh3_64_with_seed(key, HASH_SEED) as u32
}

pub struct MergeableFilter {
    probes: u32,
    bits: usize,
    words: Box<[AtomicU64]>,
    staged: Vec<Vec<u8>>,
}

impl MergeableFilter {
    pub fn new(bits_per_key: usize, keys_per_table: usize) -> Self {
        let bits = (keys_per_table.saturating_mul(bits_per_key)).max(64);
        let num_words = (bits + 63) / 64;
        let bits = num_words * 64;

        // ln(2) * bits_per_key minimises the false positive rate
        let probes = ((bits_per_key as f64) * std::f64::consts::LN_2).round() as u32;
        let probes = probes.clamp(1, 30);

        Self {
            probes,
            bits,
            words: (0..num_words).map(|_| AtomicU64::new(0)).collect(),
            staged: Vec::new(),
        }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(config.bits_per_key, config.keys_per_table)
    }

    /// Stage a key; bits are set by [`finish`](Self::finish)
    pub fn add_key(&mut self, key: &[u8]) {
        self.staged.push(key.to_vec());
    }

    /// Fold every staged key into the bitmap
    pub fn finish(&mut self) {
        let staged = std::mem::take(&mut self.staged);
        for key in &staged {
            self.insert_hash(filter_hash(key));
        }
    }

    fn insert_hash(&self, mut h: u32) {
        let delta = h.rotate_right(17) | 1;
        for _ in 0..self.probes {
            let pos = h as usize % self.bits;
            self.words[pos / 64].fetch_or(1 << (pos % 64), Ordering::Relaxed);
            h = h.wrapping_add(delta);
        }
    }

    pub fn may_contain(&self, key: &[u8]) -> bool {
        if self.bits < MIN_USEFUL_BITS {
            return false;
        }
        let mut h = filter_hash(key);
        let delta = h.rotate_right(17) | 1;
        for _ in 0..self.probes {
            let pos = h as usize % self.bits;
            if self.words[pos / 64].load(Ordering::Relaxed) & (1 << (pos % 64)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }

    /// Union `other` into this filter.
    ///
    /// Only filters built from the same sizing can be merged.
    pub fn merge(&self, other: &MergeableFilter) -> Result<()> {
        if self.bits != other.bits {
            return Err(NvmError::FilterMismatch {
                expected: self.bits,
                actual: other.bits,
            });
        }
        for (dst, src) in self.words.iter().zip(other.words.iter()) {
            dst.fetch_or(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    pub fn probes(&self) -> u32 {
        self.probes
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.words.len() * 8 + self.staged.iter().map(|k| k.len()).sum::<usize>()
    }
}

impl std::fmt::Debug for MergeableFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeableFilter")
            .field("bits", &self.bits)
            .field("probes", &self.probes)
            .field("staged", &self.staged.len())
            .finish()
    }
}
