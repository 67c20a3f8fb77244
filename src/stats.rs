//! Elastic buffer counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated with relaxed atomics
#[derive(Debug, Default)]
pub struct BufferStats {
    pub flushes: AtomicU64,
    pub compactions: AtomicU64,
    pub splices: AtomicU64,
    pub last_table_merges: AtomicU64,
    pub gets: AtomicU64,
    pub tables_probed: AtomicU64,
    pub hits: AtomicU64,
    pub tombstone_hits: AtomicU64,
}

/// Point-in-time copy of [`BufferStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub flushes: u64,
    pub compactions: u64,
    pub splices: u64,
    pub last_table_merges: u64,
    pub gets: u64,
    pub tables_probed: u64,
    pub hits: u64,
    pub tombstone_hits: u64,
    /// Tables registered per level at snapshot time
    pub level_files: Vec<usize>,
    /// Bytes registered per level at snapshot time
    pub level_bytes: Vec<usize>,
}

impl BufferStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, level_files: Vec<usize>, level_bytes: Vec<usize>) -> StatsSnapshot {
        StatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
            splices: self.splices.load(Ordering::Relaxed),
            last_table_merges: self.last_table_merges.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            tables_probed: self.tables_probed.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            tombstone_hits: self.tombstone_hits.load(Ordering::Relaxed),
            level_files,
            level_bytes,
        }
    }
}

impl StatsSnapshot {
    /// Fraction of lookups answered by the buffer
    pub fn hit_rate(&self) -> f64 {
        if self.gets == 0 {
            0.0
        } else {
            (self.hits + self.tombstone_hits) as f64 / self.gets as f64
        }
    }
}
