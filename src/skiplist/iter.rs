//! Skip list iteration
//!
//! A [`Cursor`] is a position plus an epoch guard; the guard keeps
//! last-tier nodes unlinked by a concurrent compaction alive until the
//! cursor lets go of them. [`Iter`] pairs a cursor with a borrowed list.

use crossbeam::epoch::{self, Guard};
use crossbeam::utils::Backoff;

use super::node::Node;
use super::SkipList;

pub(crate) struct Cursor {
    node: *mut Node,
    _guard: Guard,
}

impl Cursor {
    pub(crate) fn new() -> Self {
        Self {
            node: std::ptr::null_mut(),
            _guard: epoch::pin(),
        }
    }

    #[inline]
    pub(crate) fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Encoded entry under the cursor
    pub(crate) fn entry(&self) -> &[u8] {
        assert!(self.valid(), "entry() on an invalid cursor");
        unsafe { Node::entry(self.node) }
    }

    pub(crate) fn next(&mut self, list: &SkipList) {
        assert!(self.valid(), "next() on an invalid cursor");
        // A node half way through a move may have its links rewritten;
        // wait until the move is complete
        let backoff = Backoff::new();
        while !list.inserting().is_null() {
            backoff.snooze();
        }
        self.node = unsafe { Node::next(self.node, 0) };
    }

    pub(crate) fn prev(&mut self, list: &SkipList) {
        assert!(self.valid(), "prev() on an invalid cursor");
        let node = list.find_less_than(unsafe { Node::entry(self.node) });
        self.node = if node == list.head() { std::ptr::null_mut() } else { node };
    }

    pub(crate) fn seek(&mut self, list: &SkipList, target: &[u8]) {
        self.node = list.find_greater_or_equal(target, None);

        // A node being moved in may precede the result (a newer version of
        // the same user key) without being reachable yet
        let marked = list.inserting();
        if !marked.is_null() && !list.key_is_after_node(target, marked) {
            let marked_entry = unsafe { Node::entry(marked) };
            if self.node.is_null()
                || list
                    .comparator()
                    .same_key_newer(marked_entry, unsafe { Node::entry(self.node) })
            {
                self.node = marked;
            }
        }
    }

    pub(crate) fn seek_to_first(&mut self, list: &SkipList) {
        self.node = unsafe { Node::next(list.head(), 0) };
    }

    pub(crate) fn seek_to_last(&mut self, list: &SkipList) {
        let node = list.find_last();
        self.node = if node == list.head() { std::ptr::null_mut() } else { node };
    }
}

/// Bidirectional iterator over a borrowed list.
///
/// Holds an epoch guard, so it stays on the thread that created it.
pub struct Iter<'a> {
    list: &'a SkipList,
    cursor: Cursor,
}

impl<'a> Iter<'a> {
    pub(super) fn new(list: &'a SkipList) -> Self {
        Self {
            list,
            cursor: Cursor::new(),
        }
    }

    pub fn valid(&self) -> bool {
        self.cursor.valid()
    }

    /// Encoded entry at the current position
    pub fn entry(&self) -> &[u8] {
        self.cursor.entry()
    }

    pub fn next(&mut self) {
        self.cursor.next(self.list)
    }

    pub fn prev(&mut self) {
        self.cursor.prev(self.list)
    }

    /// Position at the first entry at or after `target`
    pub fn seek(&mut self, target: &[u8]) {
        self.cursor.seek(self.list, target)
    }

    pub fn seek_to_first(&mut self) {
        self.cursor.seek_to_first(self.list)
    }

    pub fn seek_to_last(&mut self) {
        self.cursor.seek_to_last(self.list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::InternalKeyComparator;
    use crate::types::{encode_entry, LookupKey, ValueType};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn test_seek_lands_on_visible_version() {
        let list = SkipList::young(InternalKeyComparator::default(), 1 << 16, 0);
        list.insert(&encode_entry(5, ValueType::Value, b"k", b"new"));
        list.insert(&encode_entry(2, ValueType::Value, b"k", b"old"));
        list.insert(&encode_entry(1, ValueType::Value, b"m", b"x"));

        let mut it = list.iter();
        it.seek(LookupKey::new(b"k", 3).memtable_key());
        assert_eq!(it.entry(), encode_entry(2, ValueType::Value, b"k", b"old").as_slice());

        it.seek(LookupKey::new(b"k", 9).memtable_key());
        assert_eq!(it.entry(), encode_entry(5, ValueType::Value, b"k", b"new").as_slice());

        it.seek(LookupKey::new(b"z", 9).memtable_key());
        assert!(!it.valid());
    }

    #[test]
    fn test_seek_and_next_around_node_in_flight() {
        let list = SkipList::young(InternalKeyComparator::default(), 1 << 16, 0);
        list.insert(&encode_entry(2, ValueType::Value, b"k", b"old"));
        list.insert(&encode_entry(1, ValueType::Value, b"m", b"x"));

        // A newer version half way through a move: it already points at
        // its successor but no predecessor links to it yet
        let moving = encode_entry(5, ValueType::Value, b"k", b"new");
        let node = list.writer.lock().storage.alloc_node(&moving, 1);
        let successor = list.find_greater_or_equal(LookupKey::new(b"k", 3).memtable_key(), None);
        unsafe { Node::set_next(node, 0, successor) };
        list.inserting.store(node, Ordering::Release);

        let mut it = list.iter();
        it.seek(LookupKey::new(b"k", 9).memtable_key());
        assert_eq!(it.entry(), moving.as_slice());

        // Targets the moving node sorts before never land on it
        it.seek(LookupKey::new(b"k", 3).memtable_key());
        assert_eq!(it.entry(), encode_entry(2, ValueType::Value, b"k", b"old").as_slice());
        it.seek(LookupKey::new(b"l", 9).memtable_key());
        assert_eq!(it.entry(), encode_entry(1, ValueType::Value, b"m", b"x").as_slice());

        it.seek(LookupKey::new(b"k", 9).memtable_key());
        std::thread::scope(|s| {
            s.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                list.inserting.store(std::ptr::null_mut(), Ordering::Release);
            });
            // Blocks until the move is published
            it.next();
        });
        assert!(list.inserting().is_null());
        assert_eq!(it.entry(), encode_entry(2, ValueType::Value, b"k", b"old").as_slice());
        it.next();
        assert_eq!(it.entry(), encode_entry(1, ValueType::Value, b"m", b"x").as_slice());
        it.next();
        assert!(!it.valid());
    }
}
