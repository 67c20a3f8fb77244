//! Freeze and the three compaction algorithms
//!
//! All of them walk the source list once at level 0 and keep an array of
//! per-level predecessors on each side, so no node is searched for twice
//! on the side it is being removed from.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::epoch;
use parking_lot::MutexGuard;
use tracing::debug;

use super::node::{Node, NodeStorage, MAX_TOWER};
use super::{pre_next, ListKind, SkipList, Splice, Writer};
use crate::arena::Arena;
use crate::budget::NvmBudget;
use crate::comparator::EntryOrder;
use crate::filter::MergeableFilter;
use crate::types::{EntryRef, SequenceNumber};

/// Which end of the receiving list a disjoint list is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Every entry of the donor sorts before the receiver's
    Front,
    /// Every entry of the donor sorts after the receiver's
    Back,
}

/// Relocate `p` from the arena at `old_base` into the copy at `new_base`
#[inline]
unsafe fn rebase<T>(p: *const T, old_base: *const u8, new_base: *mut u8) -> *mut T {
    if p.is_null() {
        return std::ptr::null_mut();
    }
    new_base.offset((p as *const u8).offset_from(old_base)) as *mut T
}

impl SkipList {
    /// Turn a finished young list into a frozen list on the budget's
    /// current PM node.
    ///
    /// The young arena is byte-copied, then every node's key pointer and
    /// links are relocated into the copy. With a filter, every user key is
    /// staged and folded in once at the end.
    pub fn freeze(
        young: &SkipList,
        block_size: usize,
        budget: Arc<NvmBudget>,
        mut filter: Option<&mut MergeableFilter>,
    ) -> SkipList {
        assert_eq!(young.kind, ListKind::Young, "only young lists can be frozen");
        let writer = young.writer.lock();
        let source = writer.storage.arena();
        let arena = Arena::freeze(source, block_size, budget);

        let old_base = source.base() as *const u8;
        let new_base = arena.base();

        let head = unsafe { rebase(young.head, old_base, new_base) };
        let mut node = head;
        while !node.is_null() {
            unsafe {
                Node::set_key_ptr(node, rebase(Node::key_ptr(node), old_base, new_base));
                for level in 0..Node::height(node) {
                    let next = Node::next_relaxed(node, level);
                    Node::set_next_relaxed(node, level, rebase(next, old_base, new_base));
                }
                if node != head {
                    if let (Some(filter), Some(view)) = (filter.as_mut(), EntryRef::decode(Node::entry(node))) {
                        filter.add_key(view.user_key());
                    }
                }
                node = Node::next_relaxed(node, 0);
            }
        }
        if let Some(filter) = filter {
            filter.finish();
        }

        let frozen = SkipList::assemble(
            ListKind::Frozen,
            young.comparator.clone(),
            NodeStorage::Arena(arena),
            head,
            young.height_limit,
        );
        frozen.max_height.store(young.max_height(), Ordering::Relaxed);
        frozen.len.store(young.len(), Ordering::Relaxed);
        frozen.refresh_bounds();

        debug!(entries = frozen.len(), bytes = frozen.memory_usage(), "froze young skip list");
        frozen
    }

    fn assert_compactable(&self, other: &SkipList) {
        assert!(!std::ptr::eq(self, other), "skip list cannot compact with itself");
        assert_eq!(self.kind, ListKind::Frozen, "compaction target must be frozen");
        assert_eq!(other.kind, ListKind::Frozen, "compaction source must be frozen");
    }

    fn lock_pair<'a>(
        &'a self,
        other: &'a SkipList,
    ) -> (MutexGuard<'a, Writer>, MutexGuard<'a, Writer>) {
        let mine = self.writer.lock();
        let theirs = other.writer.lock();
        assert!(
            !theirs.storage.arena().is_transferred(),
            "compaction source was already consumed"
        );
        (mine, theirs)
    }

    /// Drop same-user-key successors of `newest` that no snapshot can see.
    ///
    /// `prev` holds the predecessors of `newest`'s successor. Every node
    /// unlinked is passed to `removed`.
    unsafe fn drop_obsolete_after(
        &self,
        mut newest: *mut Node,
        prev: &mut Splice,
        snapshot: SequenceNumber,
        mut removed: impl FnMut(*mut Node),
    ) {
        loop {
            let next = Node::next(newest, 0);
            if next.is_null() {
                return;
            }
            match self.comparator.order(Node::entry(newest), Node::entry(next), snapshot) {
                EntryOrder::SameUserKey { older_obsolete: true } => {
                    self.unlink(next, prev);
                    removed(next);
                }
                EntryOrder::SameUserKey { older_obsolete: false } => {
                    newest = next;
                    pre_next(prev, Node::height(newest));
                }
                _ => return,
            }
        }
    }

    /// Merge the overlapping, newer `other` into this list.
    ///
    /// Nodes move one at a time: each is published as the inserting marker,
    /// unlinked from `other` and linked here. Older versions made invisible
    /// by the moved node are unlinked on either side, on the donor side
    /// before the node itself leaves. Afterwards this
    /// list's arena owns `other`'s blocks.
    pub fn compact(&self, other: &SkipList, snapshot: SequenceNumber) {
        self.assert_compactable(other);
        let (mut mine, mut theirs) = self.lock_pair(other);

        let mut src_prev: Splice = [other.head; MAX_TOWER];
        let mut dst_prev: Splice = [self.head; MAX_TOWER];
        let mut moved = 0usize;
        let mut dropped = 0usize;
        let mut skipped = 0usize;

        unsafe {
            let mut x = Node::next(other.head, 0);
            while !x.is_null() {
                // Versions of x's key that x hides leave `other` first, so
                // `other` never answers with one of them once x is gone
                let mut after = src_prev;
                pre_next(&mut after, Node::height(x));
                other.drop_obsolete_after(x, &mut after, snapshot, |_| skipped += 1);

                self.inserting.store(x, Ordering::Release);

                other.unlink(x, &src_prev);

                let at = self.find_greater_or_equal(Node::entry(x), Some(&mut dst_prev));
                assert!(
                    at.is_null() || self.comparator.compare(Node::entry(at), Node::entry(x)).is_ne(),
                    "duplicate skip list entry"
                );
                self.raise_max_height(Node::height(x), &mut dst_prev);
                self.link(x, &dst_prev);
                moved += 1;

                pre_next(&mut dst_prev, Node::height(x));
                self.drop_obsolete_after(x, &mut dst_prev, snapshot, |_| dropped += 1);

                self.inserting.store(std::ptr::null_mut(), Ordering::Release);

                x = Node::next(src_prev[0], 0);
            }
        }

        self.refresh_bounds();
        other.refresh_bounds();
        let donor = theirs.storage.arena_mut();
        mine.storage.arena_mut().receive_arena(donor);

        debug!(moved, dropped, skipped, snapshot, "overlapping skip list compaction");
    }

    /// Attach the disjoint `other` in front of or behind this list.
    ///
    /// Relinks only the per-level ends, so the cost is the tower height.
    /// The caller guarantees the key ranges do not overlap.
    pub fn splice(&self, other: &SkipList, placement: Placement) {
        self.assert_compactable(other);
        let (mut mine, mut theirs) = self.lock_pair(other);

        let height = other.max_height();
        unsafe {
            match placement {
                Placement::Front => {
                    for level in 0..height {
                        let tail = other.largest[level].load(Ordering::Acquire);
                        Node::set_next(tail, level, Node::next(self.head, level));
                        Node::set_next(self.head, level, Node::next(other.head, level));
                    }
                }
                Placement::Back => {
                    for level in 0..height {
                        let tail = self.largest[level].load(Ordering::Acquire);
                        Node::set_next(tail, level, Node::next(other.head, level));
                    }
                }
            }
        }
        if height > self.max_height() {
            self.max_height.store(height, Ordering::Relaxed);
        }
        self.len.fetch_add(other.len(), Ordering::Relaxed);
        self.refresh_bounds();

        let donor = theirs.storage.arena_mut();
        mine.storage.arena_mut().receive_arena(donor);

        debug!(entries = other.len(), ?placement, "spliced disjoint skip list");
    }

    /// Merge `other` into this last-tier list.
    ///
    /// Surviving entries are deep-copied into individually allocated
    /// nodes; `other` is left untouched. Old versions made obsolete are
    /// unlinked and handed to epoch reclamation.
    pub fn last_table_compact(&self, other: &SkipList, snapshot: SequenceNumber) {
        assert!(!std::ptr::eq(self, other), "skip list cannot compact with itself");
        assert_eq!(self.kind, ListKind::LastTier, "last-table compaction needs the last tier");

        let mut mine = self.writer.lock();
        let _theirs = other.writer.lock();
        let guard = epoch::pin();

        let mut prev: Splice = [self.head; MAX_TOWER];
        let mut copied = 0usize;
        let mut freed = 0usize;

        unsafe {
            let mut x = Node::next(other.head, 0);
            while !x.is_null() {
                let y = self.insert_locked(&mut mine, Node::entry(x), &mut prev);
                copied += 1;
                pre_next(&mut prev, Node::height(y));

                let heap = mine.storage.heap();
                self.drop_obsolete_after(y, &mut prev, snapshot, |node| {
                    heap.retire(node, &guard);
                    freed += 1;
                });

                let mut newer = x;
                x = Node::next(x, 0);
                while !x.is_null()
                    && self.comparator.order(Node::entry(newer), Node::entry(x), snapshot)
                        == (EntryOrder::SameUserKey { older_obsolete: true })
                {
                    newer = x;
                    x = Node::next(x, 0);
                }
            }
        }
        guard.flush();
        self.refresh_bounds();

        debug!(copied, freed, snapshot, bytes = self.memory_usage(), "last-table compaction");
    }
}
