//! MemTable - young write buffer over a lock-free skip list
//!
//! Writes land here first. The skip list lives in one DRAM block reserved
//! up front (memtable budget plus headroom); once usage crosses the budget
//! the owner flushes it with [`Table::from_memtable`](crate::table::Table::from_memtable).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::comparator::InternalKeyComparator;
use crate::config::Config;
use crate::error::{NvmError, Result};
use crate::skiplist::{Iter, SkipList};
use crate::table::{lookup, GetResult};
use crate::types::{encode_entry, LookupKey, SequenceNumber, ValueType};

pub struct MemTable {
    list: SkipList,
    /// Usage at which the memtable should be flushed
    max_size: usize,
    /// Highest sequence number written
    max_sequence: AtomicU64,
}

impl MemTable {
    pub fn new(comparator: InternalKeyComparator, config: &Config) -> Self {
        let capacity = config.buffer.memtable_size + config.arena.young_headroom;
        Self {
            list: SkipList::young(comparator, capacity, config.numa.dram_node),
            max_size: config.buffer.memtable_size,
            max_sequence: AtomicU64::new(0),
        }
    }

    /// Add one write. Callers serialise writers.
    ///
    /// Fails with [`NvmError::WriteBufferFull`] when the reserved block
    /// cannot take the entry; the caller should flush and retry on a fresh
    /// memtable.
    pub fn add(&self, sequence: SequenceNumber, value_type: ValueType, key: &[u8], value: &[u8]) -> Result<()> {
        let entry = encode_entry(sequence, value_type, key, value);
        if self.list.max_node_size(entry.len()) > self.list.remaining() {
            return Err(NvmError::WriteBufferFull);
        }
        self.list.insert(&entry);
        self.max_sequence.fetch_max(sequence, Ordering::Relaxed);
        Ok(())
    }

    pub fn get(&self, key: &LookupKey) -> GetResult {
        lookup(&self.list, key)
    }

    /// Iterate over encoded entries in order
    pub fn iter(&self) -> Iter<'_> {
        self.list.iter()
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.list.memory_usage()
    }

    /// Check if memtable is full
    pub fn should_flush(&self) -> bool {
        self.approximate_memory_usage() >= self.max_size
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn max_sequence(&self) -> SequenceNumber {
        self.max_sequence.load(Ordering::Relaxed)
    }

    pub(crate) fn list(&self) -> &SkipList {
        &self.list
    }
}
