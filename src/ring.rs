//! Growable FIFO ring placed on one NUMA node
//!
//! Holds the per-level table metadata of the elastic buffer. Slots live in
//! a node-bound [`Region`]; when the ring fills up it moves into a region
//! twice the size.

use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};

use crate::numa::{NodeId, Region};

pub const DEFAULT_RING_CAPACITY: usize = 512;

pub struct NumaRing<T> {
    region: Region,
    capacity: usize,
    head: usize,
    len: usize,
    node: NodeId,
    bind: bool,
    _marker: PhantomData<T>,
}

// Safety: the ring owns its elements exactly like a Vec<T>
unsafe impl<T: Send> Send for NumaRing<T> {}
unsafe impl<T: Sync> Sync for NumaRing<T> {}

fn slots_region<T>(capacity: usize, node: NodeId, bind: bool) -> Region {
    let bytes = capacity * mem::size_of::<MaybeUninit<T>>().max(1);
    Region::alloc(bytes, mem::align_of::<T>(), node, bind)
}

impl<T> NumaRing<T> {
    pub fn new(capacity: usize, node: NodeId, bind: bool) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        Self {
            region: slots_region::<T>(capacity, node, bind),
            capacity,
            head: 0,
            len: 0,
            node,
            bind,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn slot(&self, physical: usize) -> *mut MaybeUninit<T> {
        debug_assert!(physical < self.capacity);
        unsafe { (self.region.as_ptr() as *mut MaybeUninit<T>).add(physical) }
    }

    #[inline]
    fn physical(&self, logical: usize) -> usize {
        (self.head + logical) % self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Grow to at least `capacity` slots, keeping FIFO order
    pub fn reserve(&mut self, capacity: usize) {
        if capacity <= self.capacity {
            return;
        }
        let region = slots_region::<T>(capacity, self.node, self.bind);
        let dst = region.as_ptr() as *mut MaybeUninit<T>;
        for i in 0..self.len {
            unsafe {
                let src = self.slot(self.physical(i));
                std::ptr::copy_nonoverlapping(src, dst.add(i), 1);
            }
        }
        // Elements were moved bitwise; the old region is freed without drops
        self.region = region;
        self.capacity = capacity;
        self.head = 0;
    }

    pub fn push_back(&mut self, value: T) {
        if self.len == self.capacity {
            self.reserve(self.capacity * 2);
        }
        let at = self.physical(self.len);
        unsafe { (*self.slot(at)).write(value) };
        self.len += 1;
    }

    /// Remove and return the oldest element. Panics when empty.
    pub fn pop_front(&mut self) -> T {
        assert!(!self.is_empty(), "pop_front on an empty ring");
        let value = unsafe { (*self.slot(self.head)).assume_init_read() };
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
        value
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        Some(unsafe { (*self.slot(self.physical(index))).assume_init_ref() })
    }

    pub fn front(&self) -> Option<&T> {
        self.get(0)
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator + '_ {
        (0..self.len).map(move |i| unsafe { (*self.slot(self.physical(i))).assume_init_ref() })
    }
}

impl<T> std::ops::Index<usize> for NumaRing<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => panic!("ring index {} out of bounds (len {})", index, self.len),
        }
    }
}

impl<T> Drop for NumaRing<T> {
    fn drop(&mut self) {
        while !self.is_empty() {
            drop(self.pop_front());
        }
    }
}
