//! Row fetch execution on worker queues.

use protocol_rowcache::FetchSubRequest;
use row_store::StoreError;

use crate::buffer::BufferRegion;
use crate::error::{CacheError, CacheResult};
use crate::service::Shared;

/// Execute one fetch sub-request into its destination region.
///
/// Rows that were memory-resident at preparation time are copied straight
/// from the pool extent named by the locator snapshot, skipping a second
/// index lookup. Everything else is re-read from the store by key, and the
/// byte count must match the size recorded in the descriptor.
pub(crate) fn fetch_row(shared: &Shared, payload: &[u8], region: &BufferRegion) -> CacheResult<()> {
    let (request, _) = FetchSubRequest::parse(payload)?;
    let _rw = shared.lock.read();

    if let Some(source) = request.source {
        region.with_mut(|dst| shared.store.read_resident(source, dst))?;
        return Ok(());
    }

    let bytes_read = match region.with_mut(|dst| shared.store.read(request.key, dst)) {
        Ok(n) => n,
        Err(StoreError::KeyNotFound) => 0,
        Err(e) => return Err(e.into()),
    };
    if bytes_read as u64 != request.size {
        return Err(CacheError::SizeMismatch(format!(
            "unexpected length, read {bytes_read} but expected {} for key {}",
            request.size, request.key
        )));
    }

    Ok(())
}
