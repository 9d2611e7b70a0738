//! Destination buffer layout for batch fetch.
//!
//! A batch of N rows lands in one caller-supplied buffer: an offset table
//! of N+1 little-endian `i64`s followed by the row regions. Each region is
//! rounded up to 4 KiB so workers writing adjacent rows never touch the
//! same cache line or page.

/// Region alignment in the destination buffer.
pub const FETCH_ALIGN: u64 = 4096;

/// Round a row size up to the region alignment.
#[inline]
pub fn round_up_4k(size: u64) -> u64 {
    (size + (FETCH_ALIGN - 1)) & !(FETCH_ALIGN - 1)
}

/// Compute the offset table for a batch.
///
/// `offsets[0]` is the byte length of the table itself; `offsets[i + 1]`
/// is `offsets[i]` plus the page-rounded size of row `i`. Row `i`'s bytes
/// land at `[offsets[i], offsets[i] + sizes[i])`.
pub fn offset_table(sizes: &[u64]) -> Vec<i64> {
    let mut offsets = Vec::with_capacity(sizes.len() + 1);
    let mut cursor = ((sizes.len() + 1) * 8) as i64;
    offsets.push(cursor);
    for &size in sizes {
        cursor += round_up_4k(size) as i64;
        offsets.push(cursor);
    }
    offsets
}

/// Total destination bytes a batch needs: the end of the last region.
pub fn required_size(offsets: &[i64]) -> usize {
    offsets.last().map(|&end| end as usize).unwrap_or(0)
}
