//! Skip list node layout and node storage
//!
//! ```text
//! ┌──────────────────────────┐
//! │ key ptr | len | height   │ header
//! ├──────────────────────────┤
//! │ next[0] .. next[h-1]     │ AtomicPtr<Node> tower
//! ├──────────────────────────┤
//! │ entry bytes              │ len
//! └──────────────────────────┘
//! ```
//!
//! The key pointer points at the entry bytes behind the tower. Freezing
//! copies whole arenas and relocates that pointer along with the links.
//! Nodes are only ever touched through raw pointers so accesses to the
//! tower keep the provenance of the allocation that holds it.

use std::collections::HashMap;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam::epoch::{self, Guard};
use parking_lot::Mutex;
use tracing::trace;

use crate::arena::{Arena, UsageCounter};
use crate::budget::NvmBudget;
use crate::numa::{page_round, NodeId, Region, PAGE_SIZE};

/// Tower limit for arena-backed (young and frozen) lists
pub const MAX_HEIGHT: usize = 22;

/// Tower limit for the last-tier list
pub const LAST_TIER_MAX_HEIGHT: usize = 32;

/// Capacity of predecessor arrays
pub(crate) const MAX_TOWER: usize = LAST_TIER_MAX_HEIGHT;

const NODE_ALIGN: usize = mem::align_of::<Node>();

#[repr(C)]
pub(crate) struct Node {
    key: *const u8,
    len: u32,
    height: u16,
}

impl Node {
    /// Bytes taken by the header and a tower of `height` links
    #[inline]
    pub(crate) const fn size_for(height: usize) -> usize {
        mem::size_of::<Node>() + height * mem::size_of::<AtomicPtr<Node>>()
    }

    #[inline]
    unsafe fn tower(node: *const Node) -> *const AtomicPtr<Node> {
        (node as *const u8).add(mem::size_of::<Node>()) as *const AtomicPtr<Node>
    }

    /// Lay out a node at `mem`, copy `entry` behind its tower and null
    /// every link. `mem` must hold `size_for(height) + entry.len()` bytes.
    pub(crate) unsafe fn init(mem: *mut u8, entry: &[u8], height: usize) -> *mut Node {
        debug_assert!(height >= 1 && height <= MAX_TOWER);
        debug_assert_eq!(mem as usize % mem::align_of::<Node>(), 0);

        let key = mem.add(Self::size_for(height));
        ptr::copy_nonoverlapping(entry.as_ptr(), key, entry.len());

        let node = mem as *mut Node;
        node.write(Node {
            key,
            len: entry.len() as u32,
            height: height as u16,
        });
        let tower = Self::tower(node) as *mut AtomicPtr<Node>;
        for level in 0..height {
            tower.add(level).write(AtomicPtr::new(ptr::null_mut()));
        }
        node
    }

    #[inline]
    pub(crate) unsafe fn height(node: *const Node) -> usize {
        (*node).height as usize
    }

    #[inline]
    pub(crate) unsafe fn entry<'a>(node: *const Node) -> &'a [u8] {
        std::slice::from_raw_parts((*node).key, (*node).len as usize)
    }

    #[inline]
    pub(crate) unsafe fn key_ptr(node: *const Node) -> *const u8 {
        (*node).key
    }

    #[inline]
    pub(crate) unsafe fn set_key_ptr(node: *mut Node, key: *const u8) {
        (*node).key = key;
    }

    /// Total bytes of the node including its entry
    #[inline]
    pub(crate) unsafe fn footprint(node: *const Node) -> usize {
        Self::size_for(Self::height(node)) + (*node).len as usize
    }

    #[inline]
    pub(crate) unsafe fn next(node: *const Node, level: usize) -> *mut Node {
        debug_assert!(level < Self::height(node));
        (*Self::tower(node).add(level)).load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) unsafe fn set_next(node: *const Node, level: usize, x: *mut Node) {
        debug_assert!(level < Self::height(node));
        (*Self::tower(node).add(level)).store(x, Ordering::Release);
    }

    #[inline]
    pub(crate) unsafe fn next_relaxed(node: *const Node, level: usize) -> *mut Node {
        (*Self::tower(node).add(level)).load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) unsafe fn set_next_relaxed(node: *const Node, level: usize, x: *mut Node) {
        (*Self::tower(node).add(level)).store(x, Ordering::Relaxed);
    }
}

/// One node-bound page (or run of pages for an oversized node) of the
/// last tier. The budget charge is returned when the page is dropped.
struct HeapPage {
    region: Region,
    budget: Arc<NvmBudget>,
}

impl Drop for HeapPage {
    fn drop(&mut self) {
        self.budget.record_free(self.region.size(), self.region.node());
    }
}

struct PageSlot {
    page: Arc<HeapPage>,
    live: usize,
}

#[derive(Default)]
struct HeapState {
    pages: HashMap<usize, PageSlot>,
    // Base of the page small nodes are carved from, 0 when none
    current: usize,
    bump: usize,
    remaining: usize,
}

/// Node-by-node storage of the last tier.
///
/// Small nodes are bump allocated from page-sized regions bound to the
/// node the budget picked when the page was charged; oversized nodes get
/// a region of their own. Pages are looked up by address when a node is
/// released and go back to the budget, on the node they were charged to,
/// once their last node is gone.
pub(crate) struct NodeHeap {
    budget: Arc<NvmBudget>,
    usage: UsageCounter,
    state: Mutex<HeapState>,
}

impl NodeHeap {
    pub(crate) fn new(budget: Arc<NvmBudget>) -> Self {
        Self {
            budget,
            usage: UsageCounter::default(),
            state: Mutex::new(HeapState::default()),
        }
    }

    fn new_page(&self, size: usize) -> Arc<HeapPage> {
        let node = self.budget.record_alloc(size);
        let region = Region::alloc(size, PAGE_SIZE, node, self.budget.bind_memory());
        trace!(size, node, "new last-tier page");
        Arc::new(HeapPage {
            region,
            budget: self.budget.clone(),
        })
    }

    pub(crate) fn alloc(&self, bytes: usize) -> *mut u8 {
        let mut state = self.state.lock();
        self.usage.add(bytes);

        if bytes > PAGE_SIZE / 4 {
            let page = self.new_page(page_round(bytes));
            let base = page.region.as_ptr();
            state.pages.insert(base as usize, PageSlot { page, live: 1 });
            return base;
        }

        let aligned = (bytes + NODE_ALIGN - 1) & !(NODE_ALIGN - 1);
        if aligned > state.remaining {
            let page = self.new_page(PAGE_SIZE);
            let base = page.region.as_ptr() as usize;
            state.pages.insert(base, PageSlot { page, live: 0 });
            let previous = std::mem::replace(&mut state.current, base);
            state.bump = base;
            state.remaining = PAGE_SIZE;
            // A page whose nodes all went away while it was current
            if let Some(page) = Self::take_if_empty(&mut *state, previous) {
                epoch::pin().defer(move || drop(page));
            }
        }

        let mem = state.bump;
        state.bump += aligned;
        state.remaining -= aligned;
        let current = state.current;
        if let Some(slot) = state.pages.get_mut(&current) {
            slot.live += 1;
        }
        mem as *mut u8
    }

    fn take_if_empty(state: &mut HeapState, base: usize) -> Option<Arc<HeapPage>> {
        let empty = matches!(state.pages.get(&base), Some(slot) if slot.live == 0);
        if empty && base != state.current {
            state.pages.remove(&base).map(|slot| slot.page)
        } else {
            None
        }
    }

    /// Drop `node` from its page's live count. Returns the page once it
    /// holds no live node and is no longer carved from.
    fn release(&self, node: *mut Node, bytes: usize) -> Option<Arc<HeapPage>> {
        let base = node as usize & !(PAGE_SIZE - 1);
        let mut state = self.state.lock();
        match state.pages.get_mut(&base) {
            Some(slot) => slot.live -= 1,
            None => panic!("node {:p} does not belong to this heap", node),
        }
        self.usage.sub(bytes);
        Self::take_if_empty(&mut *state, base)
    }

    /// Release an unlinked node once no pinned reader can still see it
    pub(crate) unsafe fn retire(&self, node: *mut Node, guard: &Guard) {
        let bytes = Node::footprint(node);
        if let Some(page) = self.release(node, bytes) {
            guard.defer(move || drop(page));
        }
    }

    /// Free a node no reader can reach
    pub(crate) unsafe fn free_now(&self, node: *mut Node) {
        let bytes = Node::footprint(node);
        drop(self.release(node, bytes));
    }

    pub(crate) fn usage_counter(&self) -> UsageCounter {
        self.usage.clone()
    }

    /// Nodes the heap's pages are bound to
    #[cfg(test)]
    fn page_nodes(&self) -> Vec<NodeId> {
        self.state.lock().pages.values().map(|slot| slot.page.region.node()).collect()
    }
}

/// Where a list's nodes come from
pub(crate) enum NodeStorage {
    Arena(Arena),
    Heap(NodeHeap),
}

impl NodeStorage {
    pub(crate) fn alloc_node(&mut self, entry: &[u8], height: usize) -> *mut Node {
        let bytes = Node::size_for(height) + entry.len();
        let mem = match self {
            NodeStorage::Arena(arena) => arena.allocate_aligned(bytes).as_ptr(),
            NodeStorage::Heap(heap) => heap.alloc(bytes),
        };
        unsafe { Node::init(mem, entry, height) }
    }

    pub(crate) fn arena_mut(&mut self) -> &mut Arena {
        match self {
            NodeStorage::Arena(arena) => arena,
            NodeStorage::Heap(_) => panic!("last-tier list has no arena"),
        }
    }

    pub(crate) fn arena(&self) -> &Arena {
        match self {
            NodeStorage::Arena(arena) => arena,
            NodeStorage::Heap(_) => panic!("last-tier list has no arena"),
        }
    }

    pub(crate) fn heap(&self) -> &NodeHeap {
        match self {
            NodeStorage::Heap(heap) => heap,
            NodeStorage::Arena(_) => panic!("arena-backed list has no node heap"),
        }
    }

    pub(crate) fn usage_counter(&self) -> UsageCounter {
        match self {
            NodeStorage::Arena(arena) => arena.usage_counter(),
            NodeStorage::Heap(heap) => heap.usage_counter(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NumaConfig;

    #[test]
    fn test_node_layout() {
        assert_eq!(Node::size_for(1), mem::size_of::<Node>() + 8);
        let mut storage = NodeStorage::Arena(Arena::mutable(4096, 0));
        let node = storage.alloc_node(b"entry", 3);
        unsafe {
            assert_eq!(Node::height(node), 3);
            assert_eq!(Node::entry(node), b"entry");
            assert!(Node::next(node, 2).is_null());
            assert_eq!(Node::footprint(node), Node::size_for(3) + 5);
        }
    }

    fn numa_config(secondary: Option<NodeId>) -> NumaConfig {
        NumaConfig {
            primary_node: 0,
            secondary_node: secondary,
            dram_node: 0,
            capacity_bytes: Some(3 * PAGE_SIZE),
            reserved_bytes: 0,
            bind_memory: false,
        }
    }

    #[test]
    fn test_heap_packs_small_nodes_into_pages() {
        let budget = Arc::new(NvmBudget::new(&numa_config(None)));
        let mut storage = NodeStorage::Heap(NodeHeap::new(budget.clone()));
        let nodes: Vec<_> = (0..20).map(|_| storage.alloc_node(b"entry", 4)).collect();
        assert_eq!(budget.allocated(), PAGE_SIZE);
        assert_eq!(budget.free_space(), 2 * PAGE_SIZE);
        for node in &nodes {
            assert_eq!(*node as usize % NODE_ALIGN, 0);
        }

        let big = storage.alloc_node(&[7u8; 2000], 1);
        assert_eq!(big as usize % PAGE_SIZE, 0);
        assert_eq!(budget.allocated(), 2 * PAGE_SIZE);

        let heap = storage.heap();
        unsafe {
            assert_eq!(Node::entry(big).len(), 2000);
            heap.free_now(big);
            for node in nodes {
                heap.free_now(node);
            }
        }
        // The page small nodes are carved from stays until the heap goes
        assert_eq!(budget.allocated(), PAGE_SIZE);
        assert_eq!(heap.usage_counter().get(), 0);
        drop(storage);
        assert_eq!(budget.allocated(), 0);
        assert_eq!(budget.free_space(), 3 * PAGE_SIZE);
    }

    #[test]
    fn test_heap_pages_follow_failover() {
        let budget = Arc::new(NvmBudget::new(&numa_config(Some(1))));
        let heap = NodeHeap::new(budget.clone());
        let mut storage = NodeStorage::Heap(heap);

        // Three oversized nodes fill the primary, the fourth lands on node 1
        let nodes: Vec<_> = (0..4).map(|_| storage.alloc_node(&[1u8; 3000], 1)).collect();
        assert!(budget.has_failed_over());
        let mut bound = storage.heap().page_nodes();
        bound.sort_unstable();
        assert_eq!(bound, vec![0, 0, 0, 1]);

        unsafe {
            for node in nodes {
                storage.heap().free_now(node);
            }
        }
        assert!(storage.heap().page_nodes().is_empty());
        assert_eq!(budget.allocated(), 0);
    }
}
