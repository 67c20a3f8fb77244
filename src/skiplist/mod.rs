//! Lock-free skip list in three tiers
//!
//! One structure serves every stage an entry passes through:
//!
//! - **Young**: mutable, nodes in a DRAM [`Arena`], accepts inserts.
//! - **Frozen**: produced once from a young list by [`SkipList::freeze`]:
//!   the arena is copied onto a PM node and every pointer is rebased.
//!   Frozen lists grow only by compaction.
//! - **Last tier**: nodes allocated one by one on PM so obsolete versions
//!   can be freed individually.
//!
//! There is one writer at a time per list (enforced by an internal mutex)
//! and any number of lock-free readers. Links are published with release
//! stores and read with acquire loads, so a reader that sees a node also
//! sees its initialised header and entry.
//!
//! While compaction moves a node between lists it is published through the
//! destination's *inserting marker*; readers treat the marked node as
//! present (see [`Iter::seek`] and [`Iter::next`]).

mod compact;
mod iter;
mod node;

pub use compact::Placement;
pub(crate) use iter::Cursor;
pub use iter::Iter;
pub use node::{LAST_TIER_MAX_HEIGHT, MAX_HEIGHT};

use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::epoch;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::arena::{Arena, UsageCounter};
use crate::budget::NvmBudget;
use crate::comparator::InternalKeyComparator;
use crate::numa::NodeId;

use node::{Node, NodeHeap, NodeStorage, MAX_TOWER};

const BRANCHING: u32 = 4;
const RNG_SEED: u64 = 0xdead_beef;

type Splice = [*mut Node; MAX_TOWER];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Young,
    Frozen,
    LastTier,
}

struct Writer {
    rng: SmallRng,
    storage: NodeStorage,
}

impl Writer {
    fn new(storage: NodeStorage) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(RNG_SEED),
            storage,
        }
    }

    fn random_height(&mut self, limit: usize) -> usize {
        let mut height = 1;
        while height < limit && self.rng.gen_range(0..BRANCHING) == 0 {
            height += 1;
        }
        height
    }
}

pub struct SkipList {
    kind: ListKind,
    comparator: InternalKeyComparator,
    head: *mut Node,
    height_limit: usize,
    max_height: AtomicUsize,
    /// First node, or `head` when empty
    smallest: AtomicPtr<Node>,
    /// Last node per level, or `head` when the level is empty
    largest: Box<[AtomicPtr<Node>]>,
    /// Node being moved in by compaction
    inserting: AtomicPtr<Node>,
    len: AtomicUsize,
    usage: UsageCounter,
    writer: Mutex<Writer>,
}

// Safety: nodes are reached through raw pointers whose memory is owned by
// `writer.storage`; mutation is serialised by the writer mutex and links
// are atomics.
unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl SkipList {
    fn with_storage(
        kind: ListKind,
        comparator: InternalKeyComparator,
        mut storage: NodeStorage,
        height_limit: usize,
    ) -> Self {
        let head = storage.alloc_node(&[], height_limit);
        Self::assemble(kind, comparator, storage, head, height_limit)
    }

    fn assemble(
        kind: ListKind,
        comparator: InternalKeyComparator,
        storage: NodeStorage,
        head: *mut Node,
        height_limit: usize,
    ) -> Self {
        Self {
            kind,
            comparator,
            head,
            height_limit,
            max_height: AtomicUsize::new(1),
            smallest: AtomicPtr::new(head),
            largest: (0..height_limit).map(|_| AtomicPtr::new(head)).collect(),
            inserting: AtomicPtr::new(ptr::null_mut()),
            len: AtomicUsize::new(0),
            usage: storage.usage_counter(),
            writer: Mutex::new(Writer::new(storage)),
        }
    }

    /// Young list over a DRAM arena reserving `capacity` bytes
    pub fn young(comparator: InternalKeyComparator, capacity: usize, dram_node: NodeId) -> Self {
        let arena = Arena::mutable(capacity, dram_node);
        Self::with_storage(ListKind::Young, comparator, NodeStorage::Arena(arena), MAX_HEIGHT)
    }

    /// Empty last-tier list whose nodes are charged to `budget`
    pub fn last_tier(comparator: InternalKeyComparator, budget: Arc<NvmBudget>) -> Self {
        let heap = NodeHeap::new(budget);
        Self::with_storage(
            ListKind::LastTier,
            comparator,
            NodeStorage::Heap(heap),
            LAST_TIER_MAX_HEIGHT,
        )
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.comparator
    }

    #[inline]
    pub fn max_height(&self) -> usize {
        self.max_height.load(Ordering::Relaxed)
    }

    /// Number of entries linked at level 0
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        unsafe { Node::next(self.head, 0).is_null() }
    }

    /// Bytes held by the list's storage
    pub fn memory_usage(&self) -> usize {
        self.usage.get()
    }

    /// Room left in a young list's arena block
    pub fn remaining(&self) -> usize {
        self.writer.lock().storage.arena().remaining()
    }

    /// Worst-case bytes one insert of `entry_len` bytes takes
    pub fn max_node_size(&self, entry_len: usize) -> usize {
        Node::size_for(self.height_limit) + entry_len + crate::arena::ALIGN
    }

    /// Insert `entry`. Only young and last-tier lists accept inserts.
    ///
    /// # Panics
    ///
    /// When an equal entry is already present, or the list is frozen.
    pub fn insert(&self, entry: &[u8]) {
        assert!(self.kind != ListKind::Frozen, "frozen skip lists only change by compaction");
        let mut writer = self.writer.lock();
        let mut prev = [self.head; MAX_TOWER];
        self.insert_locked(&mut writer, entry, &mut prev);
    }

    fn insert_locked(&self, writer: &mut Writer, entry: &[u8], prev: &mut Splice) -> *mut Node {
        let found = self.find_greater_or_equal(entry, Some(&mut *prev));
        assert!(
            found.is_null() || self.comparator.compare(entry, unsafe { Node::entry(found) }) != CmpOrdering::Equal,
            "duplicate skip list entry"
        );

        let height = writer.random_height(self.height_limit);
        self.raise_max_height(height, prev);

        let node = writer.storage.alloc_node(entry, height);
        unsafe { self.link(node, prev) };
        node
    }

    fn raise_max_height(&self, height: usize, prev: &mut Splice) {
        let max = self.max_height();
        if height > max {
            for slot in prev.iter_mut().take(height).skip(max) {
                *slot = self.head;
            }
            // Readers seeing the new height before the links just find
            // null at the new levels and drop down
            self.max_height.store(height, Ordering::Relaxed);
        }
    }

    /// Link `node` after `prev` bottom-up and update the bounds
    unsafe fn link(&self, node: *mut Node, prev: &Splice) {
        let height = Node::height(node);
        for level in 0..height {
            Node::set_next_relaxed(node, level, Node::next_relaxed(prev[level], level));
            Node::set_next(prev[level], level, node);
        }
        if prev[0] == self.head {
            self.smallest.store(node, Ordering::Release);
        }
        for level in 0..height {
            if Node::next_relaxed(node, level).is_null() {
                self.largest[level].store(node, Ordering::Release);
            }
        }
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Unlink `node`; `prev[i]` must precede it on every level it spans
    unsafe fn unlink(&self, node: *mut Node, prev: &Splice) {
        for level in 0..Node::height(node) {
            debug_assert_eq!(Node::next_relaxed(prev[level], level), node);
            Node::set_next(prev[level], level, Node::next(node, level));
        }
        self.len.fetch_sub(1, Ordering::Relaxed);
    }

    /// True when `node` sorts strictly before `entry`
    #[inline]
    fn key_is_after_node(&self, entry: &[u8], node: *mut Node) -> bool {
        !node.is_null()
            && self.comparator.compare(unsafe { Node::entry(node) }, entry) == CmpOrdering::Less
    }

    /// First node at or after `entry`; fills `prev` with the predecessors
    pub(crate) fn find_greater_or_equal(&self, entry: &[u8], mut prev: Option<&mut Splice>) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { Node::next(x, level) };
            if self.key_is_after_node(entry, next) {
                x = next;
            } else {
                if let Some(prev) = prev.as_mut() {
                    prev[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Last node before `entry`, or `head`
    pub(crate) fn find_less_than(&self, entry: &[u8]) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { Node::next(x, level) };
            if next.is_null()
                || self.comparator.compare(unsafe { Node::entry(next) }, entry) != CmpOrdering::Less
            {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    /// Last node of the list, or `head`
    pub(crate) fn find_last(&self) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { Node::next(x, level) };
            if next.is_null() {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    pub fn contains(&self, entry: &[u8]) -> bool {
        let _guard = epoch::pin();
        let x = self.find_greater_or_equal(entry, None);
        !x.is_null() && self.comparator.compare(entry, unsafe { Node::entry(x) }) == CmpOrdering::Equal
    }

    /// Recompute `smallest` and every `largest[level]` from the links
    pub(crate) fn refresh_bounds(&self) {
        unsafe {
            let first = Node::next(self.head, 0);
            self.smallest
                .store(if first.is_null() { self.head } else { first }, Ordering::Release);

            let mut x = self.head;
            for level in (0..self.height_limit).rev() {
                loop {
                    let next = Node::next(x, level);
                    if next.is_null() {
                        break;
                    }
                    x = next;
                }
                self.largest[level].store(x, Ordering::Release);
            }
        }
    }

    fn bound_entry(&self, node: *mut Node) -> Option<Vec<u8>> {
        if node == self.head {
            None
        } else {
            Some(unsafe { Node::entry(node) }.to_vec())
        }
    }

    /// Copy of the first entry
    pub fn smallest(&self) -> Option<Vec<u8>> {
        let _guard = epoch::pin();
        self.bound_entry(self.smallest.load(Ordering::Acquire))
    }

    /// Copy of the last entry
    pub fn largest(&self) -> Option<Vec<u8>> {
        let _guard = epoch::pin();
        self.bound_entry(self.largest[0].load(Ordering::Acquire))
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self)
    }

    #[inline]
    pub(crate) fn head(&self) -> *mut Node {
        self.head
    }

    #[inline]
    pub(crate) fn inserting(&self) -> *mut Node {
        self.inserting.load(Ordering::Acquire)
    }
}

/// Advance `prev` past the node following `prev[0]` on the levels it spans
pub(crate) unsafe fn pre_next(prev: &mut Splice, height: usize) {
    let node = Node::next(prev[0], 0);
    for level in 0..height {
        if Node::next(prev[level], level) == node {
            prev[level] = node;
        } else {
            break;
        }
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        let writer = self.writer.get_mut();
        if let NodeStorage::Heap(heap) = &writer.storage {
            // No readers remain: every one holds a reference to the list
            unsafe {
                let mut x = self.head;
                while !x.is_null() {
                    let next = Node::next_relaxed(x, 0);
                    heap.free_now(x);
                    x = next;
                }
            }
        }
    }
}

impl std::fmt::Debug for SkipList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkipList")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("max_height", &self.max_height())
            .field("memory_usage", &self.memory_usage())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::{encode_entry, ValueType};

    pub(crate) fn entries(list: &SkipList) -> Vec<Vec<u8>> {
        let mut it = list.iter();
        it.seek_to_first();
        let mut out = Vec::new();
        while it.valid() {
            out.push(it.entry().to_vec());
            it.next();
        }
        out
    }

    fn entry(key: &str, seq: u64) -> Vec<u8> {
        encode_entry(seq, ValueType::Value, key.as_bytes(), b"v")
    }

    #[test]
    fn test_empty_list() {
        let list = SkipList::young(InternalKeyComparator::default(), 4096, 0);
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert!(!list.contains(&entry("a", 1)));
        assert_eq!(list.smallest(), None);
        assert_eq!(list.largest(), None);

        let mut it = list.iter();
        it.seek_to_first();
        assert!(!it.valid());
        it.seek_to_last();
        assert!(!it.valid());
    }

    #[test]
    fn test_insert_and_contains() {
        let list = SkipList::young(InternalKeyComparator::default(), 1 << 20, 0);
        for i in (0..200).rev() {
            list.insert(&entry(&format!("key{:04}", i), 1));
        }
        assert_eq!(list.len(), 200);
        for i in 0..200 {
            assert!(list.contains(&entry(&format!("key{:04}", i), 1)));
        }
        assert!(!list.contains(&entry("key0000", 2)));
        assert_eq!(list.smallest(), Some(entry("key0000", 1)));
        assert_eq!(list.largest(), Some(entry("key0199", 1)));
    }

    #[test]
    fn test_versions_newest_first() {
        let list = SkipList::young(InternalKeyComparator::default(), 1 << 16, 0);
        list.insert(&entry("k", 1));
        list.insert(&entry("k", 3));
        list.insert(&entry("j", 2));
        list.insert(&entry("k", 2));

        assert_eq!(
            entries(&list),
            vec![entry("j", 2), entry("k", 3), entry("k", 2), entry("k", 1)]
        );
    }

    #[test]
    #[should_panic(expected = "duplicate skip list entry")]
    fn test_duplicate_insert_panics() {
        let list = SkipList::young(InternalKeyComparator::default(), 1 << 16, 0);
        list.insert(&entry("k", 1));
        list.insert(&entry("k", 1));
    }

    #[test]
    fn test_last_tier_insert_and_drop_returns_budget() {
        let budget = Arc::new(NvmBudget::new(&Config::small().numa));
        {
            let list = SkipList::last_tier(InternalKeyComparator::default(), budget.clone());
            for i in 0..50 {
                list.insert(&entry(&format!("{:03}", i), 9));
            }
            assert_eq!(list.len(), 50);
            assert!(list.memory_usage() > 0);
            assert!(budget.allocated() > 0);
        }
        assert_eq!(budget.allocated(), 0);
    }

    #[test]
    fn test_prev_walks_backwards() {
        let list = SkipList::young(InternalKeyComparator::default(), 1 << 16, 0);
        for key in ["a", "b", "c"] {
            list.insert(&entry(key, 1));
        }
        let mut it = list.iter();
        it.seek_to_last();
        assert_eq!(it.entry(), entry("c", 1).as_slice());
        it.prev();
        assert_eq!(it.entry(), entry("b", 1).as_slice());
        it.prev();
        it.prev();
        assert!(!it.valid());
    }

    #[test]
    fn test_concurrent_readers_during_inserts() {
        let list = Arc::new(SkipList::young(InternalKeyComparator::default(), 8 << 20, 0));
        let writer = {
            let list = list.clone();
            std::thread::spawn(move || {
                for i in 0..5_000 {
                    list.insert(&entry(&format!("key{:06}", i), 1));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let list = list.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let seen = entries(&list);
                        assert!(seen.windows(2).all(|w| w[0] < w[1]));
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(entries(&list).len(), 5_000);
    }
}
