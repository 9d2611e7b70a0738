//! NUMA-aware memory pool.
//!
//! The pool maps one anonymous region per NUMA node at construction time
//! and hands out bump-allocated extents as opaque [`ArenaRef`] handles.
//! On Linux each region is bound to its node with `mbind()`; on other
//! platforms a single node 0 is assumed.
//!
//! Rows are written into an extent exactly once, before the handle is
//! published to the index, and are immutable afterwards. Readers therefore
//! never observe a concurrent writer on the same extent.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{StoreError, StoreResult};

/// Alignment used for region mapping.
pub const PAGE_SIZE: usize = 4096;

/// Opaque handle to an extent in the pool.
///
/// A handle is only meaningful to the pool that issued it. Every access
/// through the pool re-validates the handle against the node's mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaRef {
    /// NUMA node the extent lives on.
    pub node: u32,
    /// Byte offset from the start of the node's region.
    pub offset: u64,
    /// Extent length in bytes.
    pub len: u64,
}

/// Memory pool partitioned across the available NUMA nodes.
pub struct NumaMemoryPool {
    nodes: Vec<NodeArena>,
    node_ids: Vec<u32>,
}

struct NodeArena {
    id: u32,
    region: MmapRegion,
    used: AtomicUsize,
}

struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the region is raw anonymous memory; all concurrent access is
// coordinated by the pool (bump allocation + write-before-publish).
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            let result = libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            debug_assert_eq!(result, 0, "munmap failed");
        }
    }
}

/// Round up to the nearest multiple of `align`.
#[inline]
fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Total physical memory on this machine in bytes.
#[cfg(unix)]
pub fn total_system_memory() -> usize {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages <= 0 || page_size <= 0 {
        return 0;
    }
    (pages as usize).saturating_mul(page_size as usize)
}

#[cfg(not(unix))]
pub fn total_system_memory() -> usize {
    8 * 1024 * 1024 * 1024
}

impl NumaMemoryPool {
    /// Create a pool of `total_bytes`, split evenly across the available
    /// NUMA nodes and rounded up to page granularity per node.
    pub fn new(total_bytes: usize) -> io::Result<Self> {
        if total_bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot allocate zero bytes",
            ));
        }

        let node_ids = detect_numa_nodes();
        if node_ids.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no numa nodes available",
            ));
        }

        let per_node = round_up(total_bytes.div_ceil(node_ids.len()), PAGE_SIZE);
        let mut nodes = Vec::with_capacity(node_ids.len());
        for &id in &node_ids {
            let region = map_region(per_node)?;
            if let Err(e) = bind_to_node(region.ptr.as_ptr(), per_node, id) {
                // Binding is a placement optimization; allocation still works
                // with the default policy.
                tracing::warn!("failed to bind {per_node} bytes to numa node {id}: {e}");
            }
            nodes.push(NodeArena {
                id,
                region,
                used: AtomicUsize::new(0),
            });
        }

        tracing::debug!(
            "numa memory pool mapped {} bytes across {} node(s)",
            per_node * node_ids.len(),
            node_ids.len()
        );

        Ok(Self { nodes, node_ids })
    }

    /// The NUMA node ids this pool allocates from.
    pub fn available_nodes(&self) -> &[u32] {
        &self.node_ids
    }

    /// Total mapped capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.nodes.iter().map(|n| n.region.len).sum()
    }

    /// Bytes currently handed out.
    pub fn bytes_used(&self) -> usize {
        self.nodes.iter().map(|n| n.used.load(Ordering::Relaxed)).sum()
    }

    /// Reserve `len` bytes, preferring `node` and falling over to the other
    /// nodes when it is full. Returns `None` when every node is exhausted.
    pub fn allocate(&self, node: u32, len: usize) -> Option<ArenaRef> {
        let start = self
            .nodes
            .iter()
            .position(|n| n.id == node)
            .unwrap_or_default();
        for i in 0..self.nodes.len() {
            let arena = &self.nodes[(start + i) % self.nodes.len()];
            if let Some(offset) = arena.reserve(len) {
                return Some(ArenaRef {
                    node: arena.id,
                    offset: offset as u64,
                    len: len as u64,
                });
            }
        }
        None
    }

    /// Fill a freshly reserved extent from `parts`, in order.
    ///
    /// The caller must be the allocator of `r` and must not have published
    /// the handle yet; the extent is immutable once published.
    pub fn write(&self, r: ArenaRef, parts: &[&[u8]]) -> StoreResult<()> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if total as u64 != r.len {
            return Err(StoreError::OutOfBounds);
        }
        let base = self.extent_ptr(r)?;
        let mut written = 0usize;
        for part in parts {
            unsafe {
                std::ptr::copy_nonoverlapping(part.as_ptr(), base.add(written), part.len());
            }
            written += part.len();
        }
        Ok(())
    }

    /// Copy a published extent into `dst`, which must be exactly `r.len`
    /// bytes long.
    pub fn copy_into(&self, r: ArenaRef, dst: &mut [u8]) -> StoreResult<()> {
        if dst.len() as u64 != r.len {
            return Err(StoreError::BufferTooSmall);
        }
        let base = self.extent_ptr(r)?;
        unsafe {
            std::ptr::copy_nonoverlapping(base, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Validate a handle and resolve it to a raw pointer into the node region.
    fn extent_ptr(&self, r: ArenaRef) -> StoreResult<*mut u8> {
        let arena = self
            .nodes
            .iter()
            .find(|n| n.id == r.node)
            .ok_or(StoreError::OutOfBounds)?;
        let end = r.offset.checked_add(r.len).ok_or(StoreError::OutOfBounds)?;
        if end > arena.region.len as u64 {
            return Err(StoreError::OutOfBounds);
        }
        Ok(unsafe { arena.region.ptr.as_ptr().add(r.offset as usize) })
    }
}

impl NodeArena {
    fn reserve(&self, len: usize) -> Option<usize> {
        let cap = self.region.len;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(len).filter(|&end| end <= cap)
            })
            .ok()
    }
}

/// Discover NUMA node ids from sysfs. Falls back to a single node 0 when
/// the topology is not exposed.
#[cfg(target_os = "linux")]
fn detect_numa_nodes() -> Vec<u32> {
    let mut nodes = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix("node") {
                if let Ok(id) = rest.parse::<u32>() {
                    nodes.push(id);
                }
            }
        }
    }
    if nodes.is_empty() {
        nodes.push(0);
    }
    nodes.sort_unstable();
    nodes
}

#[cfg(not(target_os = "linux"))]
fn detect_numa_nodes() -> Vec<u32> {
    vec![0]
}

/// Map an anonymous region with a THP hint.
fn map_region(len: usize) -> io::Result<MmapRegion> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    #[cfg(target_os = "linux")]
    unsafe {
        // MADV_HUGEPAGE = 14
        let _ = libc::madvise(ptr, len, 14);
    }

    Ok(MmapRegion {
        ptr: unsafe { NonNull::new_unchecked(ptr as *mut u8) },
        len,
    })
}

/// Bind a mapped region to a specific NUMA node with `MPOL_BIND`.
#[cfg(target_os = "linux")]
fn bind_to_node(ptr: *mut u8, size: usize, node: u32) -> io::Result<()> {
    // MPOL_BIND = 2: Allocate on specific nodes only
    const MPOL_BIND: libc::c_int = 2;
    // MPOL_MF_MOVE: Move existing pages to comply with policy
    const MPOL_MF_MOVE: libc::c_uint = 1 << 1;

    let mut nodemask: libc::c_ulong = 1 << node;

    let result = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            ptr as *mut libc::c_void,
            size,
            MPOL_BIND,
            &mut nodemask as *mut libc::c_ulong,
            // maxnode must exceed the highest set bit
            (node + 2) as libc::c_ulong,
            MPOL_MF_MOVE,
        )
    };

    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_to_node(_ptr: *mut u8, _size: usize, _node: u32) -> io::Result<()> {
    Ok(())
}
