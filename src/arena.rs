//! Arena allocator for skip list nodes
//!
//! Two regimes share one type:
//!
//! - `Mutable`: the young memtable's single DRAM block, reserved up front.
//!   Node addresses must stay put while lock-free readers walk the list, so
//!   the block is never moved; running past it is fatal.
//! - `Tiered`: persistent-memory block lists. Small requests bump inside
//!   fixed-size blocks, requests over a quarter block get their own block.
//!   Every block is charged to the shared [`NvmBudget`].
//!
//! [`Arena::freeze`] turns a finished mutable arena into a tiered one whose
//! first block is a byte copy on the budget's current node, and
//! [`Arena::receive_arena`] moves a donor's blocks into a survivor during
//! compaction.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::budget::NvmBudget;
use crate::numa::{NodeId, Region};

/// Alignment of `allocate_aligned` results
pub const ALIGN: usize = if std::mem::size_of::<*const u8>() > 8 {
    std::mem::size_of::<*const u8>()
} else {
    8
};

const YOUNG_BLOCK_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaKind {
    /// Single growable-by-reservation DRAM block (young memtable)
    Mutable,
    /// PM block list (frozen and compacted tables)
    Tiered,
}

/// One block of arena memory.
///
/// Blocks are reference counted so a donor arena and its receiver can both
/// keep them reachable; the memory goes back to its node when the last
/// holder drops.
struct Block {
    region: Region,
    budget: Option<Arc<NvmBudget>>,
}

impl Block {
    fn base(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    fn size(&self) -> usize {
        self.region.size()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if let Some(budget) = &self.budget {
            budget.record_free(self.region.size(), self.region.node());
        }
    }
}

/// Shared view of an arena's usage counter, readable without locking
#[derive(Debug, Clone, Default)]
pub struct UsageCounter(Arc<AtomicUsize>);

impl UsageCounter {
    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn add(&self, bytes: usize) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn sub(&self, bytes: usize) {
        self.0.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[inline]
    fn set(&self, bytes: usize) {
        self.0.store(bytes, Ordering::Relaxed);
    }
}

pub struct Arena {
    kind: ArenaKind,
    blocks: Vec<Arc<Block>>,
    alloc_ptr: *mut u8,
    alloc_remaining: usize,
    /// Mutable: bytes handed out. Tiered: sum of block sizes.
    usage: UsageCounter,
    block_size: usize,
    budget: Option<Arc<NvmBudget>>,
    transferred: bool,
}

// Safety: the raw cursor only points into blocks this arena keeps alive;
// callers serialise allocation through `&mut self`.
unsafe impl Send for Arena {}

impl Arena {
    /// Create the young arena with one DRAM block of `capacity` bytes
    pub fn mutable(capacity: usize, dram_node: NodeId) -> Self {
        assert!(capacity > 0, "young arena needs a non-zero reservation");
        let region = Region::alloc(capacity, YOUNG_BLOCK_ALIGN, dram_node, false);
        let alloc_ptr = region.as_ptr();
        Self {
            kind: ArenaKind::Mutable,
            blocks: vec![Arc::new(Block { region, budget: None })],
            alloc_ptr,
            alloc_remaining: capacity,
            usage: UsageCounter::default(),
            block_size: capacity,
            budget: None,
            transferred: false,
        }
    }

    /// Create an empty PM arena
    pub fn tiered(block_size: usize, budget: Arc<NvmBudget>) -> Self {
        Self {
            kind: ArenaKind::Tiered,
            blocks: Vec::new(),
            alloc_ptr: std::ptr::null_mut(),
            alloc_remaining: 0,
            usage: UsageCounter::default(),
            block_size,
            budget: Some(budget),
            transferred: false,
        }
    }

    /// Clone a finished mutable arena into one contiguous PM block.
    ///
    /// Relative offsets are preserved exactly, which is what lets the skip
    /// list rebase its pointers afterwards. The clone accepts further
    /// allocations in the tiered regime.
    pub fn freeze(source: &Arena, block_size: usize, budget: Arc<NvmBudget>) -> Self {
        assert_eq!(source.kind, ArenaKind::Mutable, "only young arenas can be frozen");
        assert_eq!(source.blocks.len(), 1, "young arena must hold exactly one block");

        let used = source.used_bytes();
        assert!(used > 0, "freezing an arena with nothing allocated");

        let node = budget.record_alloc(used);
        let region = Region::alloc(used, ALIGN, node, budget.bind_memory());
        unsafe {
            std::ptr::copy_nonoverlapping(source.base(), region.as_ptr(), used);
        }
        debug!(bytes = used, node, "froze young arena");

        let arena = Self {
            kind: ArenaKind::Tiered,
            blocks: vec![Arc::new(Block { region, budget: Some(budget.clone()) })],
            alloc_ptr: std::ptr::null_mut(),
            alloc_remaining: 0,
            usage: UsageCounter::default(),
            block_size,
            budget: Some(budget),
            transferred: false,
        };
        arena.usage.set(used + std::mem::size_of::<*const u8>());
        arena
    }

    /// Allocate `bytes` with no alignment guarantee
    #[inline]
    pub fn allocate(&mut self, bytes: usize) -> NonNull<u8> {
        // Zero-byte requests have no sensible answer and are never needed
        assert!(bytes > 0, "zero-byte arena allocation");
        debug_assert!(!self.transferred, "allocation from a transferred arena");

        if bytes <= self.alloc_remaining {
            let result = self.alloc_ptr;
            self.alloc_ptr = unsafe { self.alloc_ptr.add(bytes) };
            self.alloc_remaining -= bytes;
            if self.kind == ArenaKind::Mutable {
                self.usage.add(bytes);
            }
            return unsafe { NonNull::new_unchecked(result) };
        }
        self.alloc_slow(bytes)
    }

    /// Allocate `bytes` aligned to [`ALIGN`]
    pub fn allocate_aligned(&mut self, bytes: usize) -> NonNull<u8> {
        assert!(bytes > 0, "zero-byte arena allocation");
        debug_assert!(!self.transferred, "allocation from a transferred arena");

        let current_mod = self.alloc_ptr as usize & (ALIGN - 1);
        let slop = if current_mod == 0 { 0 } else { ALIGN - current_mod };
        let needed = bytes + slop;

        let result = if needed <= self.alloc_remaining && !self.alloc_ptr.is_null() {
            let result = unsafe { self.alloc_ptr.add(slop) };
            self.alloc_ptr = unsafe { self.alloc_ptr.add(needed) };
            self.alloc_remaining -= needed;
            if self.kind == ArenaKind::Mutable {
                self.usage.add(needed);
            }
            unsafe { NonNull::new_unchecked(result) }
        } else {
            // Fresh blocks are always aligned
            self.alloc_slow(bytes)
        };
        debug_assert_eq!(result.as_ptr() as usize & (ALIGN - 1), 0);
        result
    }

    #[cold]
    fn alloc_slow(&mut self, bytes: usize) -> NonNull<u8> {
        match self.kind {
            ArenaKind::Mutable => panic!(
                "young arena exhausted: {} bytes requested, {} of {} reserved bytes left",
                bytes,
                self.alloc_remaining,
                self.block_size
            ),
            ArenaKind::Tiered => {
                if bytes > self.block_size / 4 {
                    // Large objects get their own block so the current
                    // block's leftover space is not wasted
                    return self.new_block(bytes);
                }
                let block = self.new_block(self.block_size);
                self.alloc_ptr = unsafe { block.as_ptr().add(bytes) };
                self.alloc_remaining = self.block_size - bytes;
                block
            }
        }
    }

    fn new_block(&mut self, size: usize) -> NonNull<u8> {
        let budget = match &self.budget {
            Some(budget) => budget.clone(),
            None => panic!("tiered arena without a budget"),
        };
        let node = budget.record_alloc(size);
        let region = Region::alloc(size, ALIGN, node, budget.bind_memory());
        let base = region.as_ptr();
        trace!(size, node, blocks = self.blocks.len() + 1, "new arena block");

        self.blocks.push(Arc::new(Block { region, budget: Some(budget) }));
        self.usage.add(size + std::mem::size_of::<*const u8>());
        unsafe { NonNull::new_unchecked(base) }
    }

    /// Adopt every block of `donor`.
    ///
    /// The donor is marked transferred: it keeps its block handles so
    /// readers still walking it stay valid, but it no longer owns or
    /// accounts for the memory and must not allocate again.
    pub fn receive_arena(&mut self, donor: &mut Arena) {
        assert!(!std::ptr::eq(self, donor), "arena cannot receive itself");
        let received: usize = donor.blocks.iter().map(|b| b.size()).sum();
        self.blocks.extend(donor.blocks.iter().cloned());
        self.usage.add(received + donor.blocks.len() * std::mem::size_of::<*const u8>());
        donor.set_transferred();
    }

    pub fn set_transferred(&mut self) {
        self.transferred = true;
        self.alloc_ptr = std::ptr::null_mut();
        self.alloc_remaining = 0;
        self.usage.set(0);
    }

    pub fn is_transferred(&self) -> bool {
        self.transferred
    }

    /// Estimate of memory held by this arena
    #[inline]
    pub fn memory_usage(&self) -> usize {
        self.usage.get()
    }

    pub fn usage_counter(&self) -> UsageCounter {
        self.usage.clone()
    }

    /// Bytes bumped out of the young block, including alignment slop
    pub fn used_bytes(&self) -> usize {
        match self.kind {
            ArenaKind::Mutable => self.block_size - self.alloc_remaining,
            ArenaKind::Tiered => self.blocks.iter().map(|b| b.size()).sum(),
        }
    }

    /// Bytes left in the current block
    pub fn remaining(&self) -> usize {
        self.alloc_remaining
    }

    /// Start of the first block
    pub fn base(&self) -> *mut u8 {
        assert!(!self.blocks.is_empty(), "arena has no blocks");
        self.blocks[0].base()
    }

    pub fn kind(&self) -> ArenaKind {
        self.kind
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn budget() -> Arc<NvmBudget> {
        Arc::new(NvmBudget::new(&Config::small().numa))
    }

    #[test]
    fn test_mutable_alloc() {
        let mut arena = Arena::mutable(4096, 0);

        let ptr1 = arena.allocate(100);
        let ptr2 = arena.allocate(100);

        assert_ne!(ptr1, ptr2);
        assert_eq!(arena.memory_usage(), 200);
        assert_eq!(arena.used_bytes(), 200);
    }

    #[test]
    fn test_aligned_alloc_counts_slop() {
        let mut arena = Arena::mutable(4096, 0);
        arena.allocate(3);
        let ptr = arena.allocate_aligned(16);
        assert_eq!(ptr.as_ptr() as usize % ALIGN, 0);
        assert_eq!(arena.memory_usage(), ALIGN + 16);
    }

    #[test]
    #[should_panic(expected = "young arena exhausted")]
    fn test_mutable_exhaustion_is_fatal() {
        let mut arena = Arena::mutable(128, 0);
        arena.allocate(100);
        arena.allocate(100);
    }

    #[test]
    #[should_panic(expected = "zero-byte")]
    fn test_zero_byte_alloc_rejected() {
        let mut arena = Arena::mutable(128, 0);
        arena.allocate(0);
    }

    #[test]
    fn test_tiered_large_alloc_gets_own_block() {
        let budget = budget();
        let mut arena = Arena::tiered(4096, budget.clone());

        arena.allocate(100);
        assert_eq!(arena.block_count(), 1);
        let remaining = arena.remaining();

        // More than a quarter block: dedicated block, cursor untouched
        arena.allocate(2000);
        assert_eq!(arena.block_count(), 2);
        assert_eq!(arena.remaining(), remaining);
        assert_eq!(budget.allocated(), 2 * 4096);
    }

    #[test]
    fn test_freeze_copies_used_prefix() {
        let mut young = Arena::mutable(4096, 0);
        let ptr = young.allocate(11);
        unsafe { std::ptr::copy_nonoverlapping(b"hello world".as_ptr(), ptr.as_ptr(), 11) };

        let frozen = Arena::freeze(&young, 4096, budget());
        assert_eq!(frozen.kind(), ArenaKind::Tiered);
        let copied = unsafe { std::slice::from_raw_parts(frozen.base(), 11) };
        assert_eq!(copied, b"hello world");
    }

    #[test]
    fn test_receive_arena_shares_blocks() {
        let budget = budget();
        let mut survivor = Arena::tiered(4096, budget.clone());
        let mut donor = Arena::tiered(4096, budget.clone());
        survivor.allocate(10);
        let ptr = donor.allocate(10);
        unsafe { ptr.as_ptr().write(42) };

        survivor.receive_arena(&mut donor);
        assert!(donor.is_transferred());
        assert_eq!(donor.memory_usage(), 0);
        assert_eq!(survivor.block_count(), 2);

        // Dropping the donor frees nothing: the survivor still holds the block
        drop(donor);
        assert_eq!(budget.allocated(), 2 * 4096);
        assert_eq!(unsafe { ptr.as_ptr().read() }, 42);

        drop(survivor);
        assert_eq!(budget.allocated(), 0);
    }
}
