//! NUMA-bound memory regions
//!
//! Persistent memory shows up as CPU-less NUMA nodes, so "allocate on PM"
//! means "allocate and bind to that node". Binding is best effort: on
//! machines without the node (or off Linux) the region stays wherever the
//! global allocator put it.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use tracing::trace;

/// Identifier of a NUMA node
pub type NodeId = i32;

pub(crate) const PAGE_SIZE: usize = 4096;

/// Round `bytes` up to whole pages
#[inline]
pub fn page_round(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}

/// A raw allocation owned by one NUMA node
pub struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
    node: NodeId,
}

// Safety: Region is plain owned memory; synchronisation is the user's job
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocate `size` bytes aligned to `align` on `node`.
    ///
    /// Allocation failure aborts through `handle_alloc_error`.
    pub fn alloc(size: usize, align: usize, node: NodeId, bind: bool) -> Self {
        assert!(size > 0, "zero-sized region");
        // Page alignment lets mbind(2) cover the region exactly
        let align = if bind && size >= PAGE_SIZE { align.max(PAGE_SIZE) } else { align };
        let layout = match Layout::from_size_align(size, align) {
            Ok(layout) => layout,
            Err(e) => panic!("invalid region layout ({} bytes, align {}): {}", size, align, e),
        };

        let raw = unsafe { alloc(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        };

        if bind && size >= PAGE_SIZE {
            bind_to_node(ptr.as_ptr(), size, node);
        }

        trace!(size, node, "allocated region");
        Self { ptr, layout, node }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(target_os = "linux")]
fn bind_to_node(ptr: *mut u8, size: usize, node: NodeId) {
    const MPOL_BIND: libc::c_long = 2;

    if !(0..64).contains(&node) {
        return;
    }
    let mask: [libc::c_ulong; 1] = [1 << node];
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr as *mut libc::c_void,
            size as libc::c_ulong,
            MPOL_BIND,
            mask.as_ptr(),
            (mask.len() * 64 + 1) as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if rc != 0 {
        trace!(node, size, "mbind failed, region left unbound");
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_node(_ptr: *mut u8, _size: usize, _node: NodeId) {}

/// Total memory of `node` in bytes, from sysfs
pub fn node_capacity(node: NodeId) -> std::io::Result<usize> {
    let path = format!("/sys/devices/system/node/node{}/meminfo", node);
    let content = std::fs::read_to_string(path)?;
    parse_mem_total(&content).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("no MemTotal for node {}", node),
        )
    })
}

// "Node 2 MemTotal:       12345678 kB"
fn parse_mem_total(meminfo: &str) -> Option<usize> {
    meminfo
        .lines()
        .find(|line| line.contains("MemTotal:"))
        .and_then(|line| {
            let mut fields = line.split_whitespace().rev();
            let unit = fields.next()?;
            let value: usize = fields.next()?.parse().ok()?;
            Some(if unit == "kB" { value * 1024 } else { value })
        })
}
