//! Frozen and last-tier tables
//!
//! A [`Table`] is one skip list plus an optional mergeable filter. Tables
//! are shared as `Arc<Table>`: the elastic buffer, readers and compaction
//! each hold a clone, and the last clone dropped releases the memory.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::budget::NvmBudget;
use crate::comparator::InternalKeyComparator;
use crate::config::Config;
use crate::error::{NvmError, Result};
use crate::filter::MergeableFilter;
use crate::memtable::MemTable;
use crate::skiplist::{Cursor, ListKind, Placement, SkipList};
use crate::types::{get_length_prefixed, put_varint32, EntryRef, LookupKey, SequenceNumber, ValueType};

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of a point lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetResult {
    /// Newest visible version is a value
    Found(Vec<u8>),
    /// Newest visible version is a tombstone
    Deleted,
    /// No visible version here; older tables must be asked
    Absent,
}

impl GetResult {
    pub fn is_absent(&self) -> bool {
        matches!(self, GetResult::Absent)
    }
}

/// Seek `key` in `list` and classify the entry found
pub(crate) fn lookup(list: &SkipList, key: &LookupKey) -> GetResult {
    let mut iter = list.iter();
    iter.seek(key.memtable_key());
    if !iter.valid() {
        return GetResult::Absent;
    }

    // The seek already skipped versions newer than the lookup sequence;
    // only the user key needs checking
    let parsed = match EntryRef::decode(iter.entry()).and_then(|view| Some((view, view.parsed()?))) {
        Some(parsed) => parsed,
        None => return GetResult::Absent,
    };
    let (view, ikey) = parsed;
    if list.comparator().compare_user_keys(ikey.user_key, key.user_key()).is_ne() {
        return GetResult::Absent;
    }
    match ikey.value_type {
        ValueType::Value => GetResult::Found(view.value.to_vec()),
        ValueType::Deletion => GetResult::Deleted,
    }
}

pub struct Table {
    id: u64,
    list: SkipList,
    filter: Option<MergeableFilter>,
    /// Cleared once entries not covered by the filter were merged in
    filter_valid: AtomicBool,
}

impl Table {
    /// Flush a young memtable into a frozen table on PM
    pub fn from_memtable(mem: &MemTable, budget: Arc<NvmBudget>, config: &Config) -> Self {
        let mut filter = config
            .filter
            .enabled
            .then(|| MergeableFilter::from_config(&config.filter));
        let list = SkipList::freeze(mem.list(), config.arena.block_size, budget, filter.as_mut());
        let table = Self::with_list(list, filter);
        debug!(
            table = table.id,
            entries = table.len(),
            bytes = table.approximate_memory_usage(),
            "flushed memtable"
        );
        table
    }

    /// Empty resident last-tier table
    pub fn new_last_tier(comparator: InternalKeyComparator, budget: Arc<NvmBudget>) -> Self {
        Self::with_list(SkipList::last_tier(comparator, budget), None)
    }

    fn with_list(list: SkipList, filter: Option<MergeableFilter>) -> Self {
        Self {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            list,
            filter,
            filter_valid: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_last_tier(&self) -> bool {
        self.list.kind() == ListKind::LastTier
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn has_filter(&self) -> bool {
        self.filter.is_some() && self.filter_valid.load(Ordering::Acquire)
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        self.list.comparator()
    }

    /// Look up the newest version of `key` visible at its sequence number
    pub fn get(&self, key: &LookupKey) -> GetResult {
        if let Some(filter) = &self.filter {
            if self.filter_valid.load(Ordering::Acquire) && !filter.may_contain(key.user_key()) {
                return GetResult::Absent;
            }
        }
        lookup(&self.list, key)
    }

    fn merge_filter(&self, other: &Table) -> Result<()> {
        let Some(filter) = &self.filter else {
            return Ok(());
        };
        match &other.filter {
            Some(theirs) if other.filter_valid.load(Ordering::Acquire) => filter.merge(theirs),
            _ => {
                // The partner's keys never went through a filter
                self.filter_valid.store(false, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Merge `other` into this table.
    ///
    /// A missing partner is reported as corruption for the caller to deal
    /// with; nothing is modified in that case.
    pub fn compact(&self, other: Option<&Table>, snapshot: SequenceNumber) -> Result<()> {
        let other = other.ok_or_else(|| NvmError::Corruption("compaction has no partner table".into()))?;
        if self.is_last_tier() {
            self.list.last_table_compact(&other.list, snapshot);
        } else {
            self.merge_filter(other)?;
            self.list.compact(&other.list, snapshot);
        }
        Ok(())
    }

    /// Attach a table whose user-key range is disjoint from this one's
    pub fn splice(&self, other: &Table, placement: Placement) -> Result<()> {
        if self.is_last_tier() {
            return Err(NvmError::Corruption("cannot splice into the last-tier table".into()));
        }
        self.merge_filter(other)?;
        self.list.splice(&other.list, placement);
        Ok(())
    }

    /// Internal key of the first entry
    pub fn smallest_key(&self) -> Option<Vec<u8>> {
        self.list.smallest().and_then(|entry| internal_key_of(&entry))
    }

    /// Internal key of the last entry
    pub fn largest_key(&self) -> Option<Vec<u8>> {
        self.list.largest().and_then(|entry| internal_key_of(&entry))
    }

    /// Arena bytes, or accumulated node bytes for the last tier
    pub fn approximate_memory_usage(&self) -> usize {
        self.list.memory_usage()
    }

    pub fn iter(self: &Arc<Self>) -> TableIterator {
        TableIterator {
            cursor: Cursor::new(),
            table: Arc::clone(self),
            scratch: Vec::new(),
        }
    }
}

fn internal_key_of(entry: &[u8]) -> Option<Vec<u8>> {
    EntryRef::decode(entry).map(|view| view.internal_key.to_vec())
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("list", &self.list)
            .field("filter", &self.filter)
            .finish()
    }
}

/// Iterator over `(internal_key, value)` pairs of one table.
///
/// Owns a reference to the table, so it stays valid after the table is
/// dropped from the elastic buffer.
pub struct TableIterator {
    cursor: Cursor,
    table: Arc<Table>,
    scratch: Vec<u8>,
}

impl TableIterator {
    pub fn valid(&self) -> bool {
        self.cursor.valid()
    }

    pub fn key(&self) -> &[u8] {
        match get_length_prefixed(self.cursor.entry()) {
            Some((key, _)) => key,
            None => panic!("corrupted entry in table {}", self.table.id),
        }
    }

    pub fn value(&self) -> &[u8] {
        match EntryRef::decode(self.cursor.entry()) {
            Some(view) => view.value,
            None => panic!("corrupted entry in table {}", self.table.id),
        }
    }

    /// Position at the first entry at or after internal key `target`
    pub fn seek(&mut self, target: &[u8]) {
        self.scratch.clear();
        put_varint32(&mut self.scratch, target.len() as u32);
        self.scratch.extend_from_slice(target);
        self.cursor.seek(&self.table.list, &self.scratch);
    }

    pub fn seek_to_first(&mut self) {
        self.cursor.seek_to_first(&self.table.list)
    }

    pub fn seek_to_last(&mut self) {
        self.cursor.seek_to_last(&self.table.list)
    }

    pub fn next(&mut self) {
        self.cursor.next(&self.table.list)
    }

    pub fn prev(&mut self) {
        self.cursor.prev(&self.table.list)
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }
}
