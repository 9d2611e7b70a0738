//! Caller-owned destination buffer for batch fetch.
//!
//! [`FetchBuffer`] is the memory a batch fetch writes into. Workers receive
//! [`BufferRegion`] handles — bounds-checked (offset, length) views — never
//! raw addresses. The page-rounded offset table computed by the dispatcher
//! guarantees concurrent writers hold disjoint regions; the buffer contents
//! are undefined until `batch_fetch` returns.

use std::sync::Arc;

use crate::error::{CacheError, CacheResult};

/// Fixed-size destination buffer shared with the worker queues.
pub struct FetchBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the buffer is plain bytes. Writers are handed disjoint regions by
// the dispatcher and readers only look at the contents once no fetch is in
// flight.
unsafe impl Send for FetchBuffer {}
unsafe impl Sync for FetchBuffer {}

impl FetchBuffer {
    /// Allocate a zeroed buffer of `len` bytes.
    pub fn new(len: usize) -> Arc<Self> {
        let boxed: Box<[u8]> = vec![0u8; len].into_boxed_slice();
        let ptr = Box::into_raw(boxed) as *mut u8;
        Arc::new(Self { ptr, len })
    }

    /// Buffer length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Claim a writable region of the buffer.
    ///
    /// The handle keeps the buffer alive; regions handed to concurrent
    /// writers must not overlap.
    pub fn region(buffer: &Arc<Self>, offset: usize, len: usize) -> CacheResult<BufferRegion> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| CacheError::SizeMismatch("region offset overflow".to_string()))?;
        if end > buffer.len {
            return Err(CacheError::SizeMismatch(format!(
                "region [{offset}, {end}) out of bounds for buffer of {} bytes",
                buffer.len
            )));
        }
        Ok(BufferRegion {
            buffer: Arc::clone(buffer),
            offset,
            len,
        })
    }

    /// Write the batch offset table at the head of the buffer.
    pub fn write_offset_table(&self, offsets: &[i64]) -> CacheResult<()> {
        let table_len = offsets.len() * 8;
        if table_len > self.len {
            return Err(CacheError::SizeMismatch(format!(
                "offset table of {table_len} bytes exceeds buffer of {} bytes",
                self.len
            )));
        }
        for (i, &offset) in offsets.iter().enumerate() {
            let bytes = offset.to_le_bytes();
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(i * 8), 8);
            }
        }
        Ok(())
    }

    /// Read back the offset table for a batch of `rows` rows.
    pub fn offset_table(&self, rows: usize) -> CacheResult<Vec<i64>> {
        let table_len = (rows + 1) * 8;
        if table_len > self.len {
            return Err(CacheError::SizeMismatch(format!(
                "offset table of {table_len} bytes exceeds buffer of {} bytes",
                self.len
            )));
        }
        Ok(self.as_slice()[..table_len]
            .chunks_exact(8)
            .map(|chunk| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(chunk);
                i64::from_le_bytes(bytes)
            })
            .collect())
    }

    /// View the buffer contents. Only meaningful once no fetch is in flight.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for FetchBuffer {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr, self.len,
            )));
        }
    }
}

/// Bounds-checked writable view of one row's destination region.
pub struct BufferRegion {
    buffer: Arc<FetchBuffer>,
    offset: usize,
    len: usize,
}

impl BufferRegion {
    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run `f` with mutable access to the region's bytes.
    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        // The region was bounds-checked at construction and is disjoint from
        // every other live region by the dispatcher's layout.
        let slice = unsafe {
            std::slice::from_raw_parts_mut(self.buffer.ptr.add(self.offset), self.len)
        };
        f(slice)
    }
}
