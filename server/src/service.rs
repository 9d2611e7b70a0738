//! The phase-aware row cache service.
//!
//! One [`CacheService`] instance owns a NUMA memory pool, a row store, and
//! a pool of fetch workers. Clients ingest rows during the build phase (or
//! freely, for mappable datasets), then fetch them in bulk: a batch fetch
//! fans one request out across the worker queues and fans the results back
//! into a single caller-owned buffer.
//!
//! A single reader/writer lock guards every store-adjacent operation.
//! Ingestion, schema access, fetch preparation, and per-row fetch execution
//! take the shared form and may overlap; phase transitions take the
//! exclusive form. The miss-report cache sits behind its own mutex so a
//! long gap scan never blocks cache traffic.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, warn};

use protocol_rowcache::{BatchDescriptor, FetchSubRequest, RowHeader};
use row_store::{
    MemoryStore, NumaMemoryPool, RowId, RowStore, StoreError, StoreStat, total_system_memory,
};

use crate::buffer::FetchBuffer;
use crate::config::Config;
use crate::error::{CacheError, CacheResult};
use crate::executor;
use crate::layout;
use crate::metrics;
use crate::state::ServiceState;
use crate::workers::{FetchWork, WorkerPool};

const MEGABYTE: u64 = 1024 * 1024;

/// Snapshot returned by [`CacheService::get_stat`].
#[derive(Debug, Clone)]
pub struct ServiceStat {
    /// Store statistics (key range, cached counts, memory usage).
    pub stat: StoreStat,
    /// Current lifecycle state.
    pub state: ServiceState,
}

pub(crate) struct Inner {
    pub(crate) state: ServiceState,
    pub(crate) schema: Option<Bytes>,
}

/// State shared with fetch work running on the worker queues.
pub(crate) struct Shared {
    pub(crate) lock: RwLock<Inner>,
    pub(crate) store: Box<dyn RowStore>,
}

/// A row cache service instance.
pub struct CacheService {
    shared: Arc<Shared>,
    workers: WorkerPool,
    next_id: AtomicI64,
    generate_id: bool,
    numa_affinity: bool,
    key_miss_results: Mutex<Option<Vec<RowId>>>,
}

impl CacheService {
    /// Bring up a service instance: NUMA pool, row store, worker queues.
    ///
    /// Fails when the memory pool cannot be established; the service never
    /// becomes available in that case.
    pub fn new(config: &Config) -> CacheResult<Self> {
        let total = total_system_memory();
        let pool_bytes = if config.service.memory_size_mb > 0 {
            let requested = config.service.memory_size_mb * MEGABYTE;
            if requested as usize > total {
                warn!("requested cache size {requested} exceeds system memory {total}");
            }
            requested as usize
        } else {
            (total as f64 * config.service.memory_cap_ratio as f64) as usize
        };

        let pool = Arc::new(NumaMemoryPool::new(pool_bytes).map_err(|e| {
            CacheError::Unexpected(format!("unable to bring up numa memory pool: {e}"))
        })?);
        let nodes = pool.available_nodes().to_vec();
        let store = MemoryStore::new(pool, config.service.spill_root.as_deref())?;

        let workers = WorkerPool::spawn(
            config.queues(),
            config.workers.slots_per_queue,
            &nodes,
            config.workers.numa_affinity,
        );

        let state = if config.service.generate_id {
            ServiceState::BuildPhase
        } else {
            ServiceState::None
        };

        Ok(Self {
            shared: Arc::new(Shared {
                lock: RwLock::new(Inner {
                    state,
                    schema: None,
                }),
                store: Box::new(store),
            }),
            workers,
            next_id: AtomicI64::new(0),
            generate_id: config.service.generate_id,
            numa_affinity: config.workers.numa_affinity,
            key_miss_results: Mutex::new(None),
        })
    }

    /// Cache one row given as a header part plus its column parts.
    ///
    /// `parts[0]` must parse as a [`RowHeader`]; the remaining parts are the
    /// column payloads, one per declared column, with matching sizes. All
    /// parts are handed to the store as one atomic insert. Re-inserting an
    /// existing id succeeds and keeps the first content.
    pub fn cache_row(&self, parts: &[&[u8]]) -> CacheResult<RowId> {
        let inner = self.shared.lock.read();
        self.check_write_allowed(&inner)?;

        let header_part = parts
            .first()
            .ok_or_else(|| CacheError::Unexpected("missing row header buffer".to_string()))?;
        let (header, _) = RowHeader::parse(header_part)?;
        let row_id = self.assign_row_id(&header)?;

        if parts.len() != header.column_sizes.len() + 1 {
            return Err(CacheError::SizeMismatch(format!(
                "column count does not match, expected {} buffers but got {}",
                header.column_sizes.len() + 1,
                parts.len()
            )));
        }
        for (column, (&declared, part)) in
            header.column_sizes.iter().zip(&parts[1..]).enumerate()
        {
            if part.len() as u64 != declared {
                return Err(CacheError::SizeMismatch(format!(
                    "column {column} is {} bytes but the header declares {declared}",
                    part.len()
                )));
            }
        }

        self.insert_row(row_id, parts)?;
        Ok(row_id)
    }

    /// Cache one row already assembled as a single contiguous buffer
    /// (header followed by column payloads).
    ///
    /// Skips the multi-part reassembly; used when the caller has already
    /// laid out one contiguous region.
    pub fn fast_cache_row(&self, buf: &[u8]) -> CacheResult<RowId> {
        let inner = self.shared.lock.read();
        self.check_write_allowed(&inner)?;

        let row_id = if self.generate_id {
            self.next_row_id()
        } else {
            let (header, _) = RowHeader::parse(buf)?;
            self.validate_client_id(header.row_id)?
        };

        self.insert_row(row_id, &[buf])?;
        Ok(row_id)
    }

    /// Cache the dataset schema. The first writer wins; later calls are
    /// logged and ignored.
    pub fn cache_schema(&self, schema: &[u8]) -> CacheResult<()> {
        let mut inner = self.shared.lock.write();
        if inner.schema.is_none() {
            inner.schema = Some(Bytes::copy_from_slice(schema));
        } else {
            debug!("caching schema already done");
        }
        Ok(())
    }

    /// Fetch the cached schema.
    pub fn fetch_schema(&self) -> CacheResult<Bytes> {
        let inner = self.shared.lock.read();
        if inner.state == ServiceState::BuildPhase {
            return Err(CacheError::InvalidState(
                "can't fetch schema until the build phase is done".to_string(),
            ));
        }
        let schema = inner
            .schema
            .clone()
            .ok_or_else(|| CacheError::NotFound("no schema has been cached".to_string()))?;
        metrics::SCHEMA_FETCHES.increment();
        Ok(schema)
    }

    /// Store statistics plus the current service state.
    pub fn get_stat(&self) -> ServiceStat {
        let inner = self.shared.lock.read();
        ServiceStat {
            stat: self.shared.store.get_stat(false),
            state: inner.state,
        }
    }

    /// Append `[min_key, max_key, missing ids...]` to `out`, locating the
    /// keys that never got cached.
    ///
    /// Computed once per service lifetime and memoized. Uses its own mutex,
    /// so a slow gap scan never blocks cache traffic.
    pub fn find_keys_miss(&self, out: &mut Vec<RowId>) {
        let mut cached = self.key_miss_results.lock();
        let results = cached.get_or_insert_with(|| {
            let stat = self.shared.store.get_stat(true);
            let mut results = Vec::with_capacity(stat.gaps.len() + 2);
            results.push(stat.min_key);
            results.push(stat.max_key);
            results.extend_from_slice(&stat.gaps);
            results
        });
        out.extend_from_slice(results);
    }

    /// Build the batch descriptor for a fetch: one data locator per row id,
    /// in request order. Pure index lookups, run under the shared lock.
    ///
    /// Ids that were never cached yield zero-size locators, which the fetch
    /// skips.
    pub fn pre_batch_fetch(
        &self,
        connection_id: u64,
        row_ids: &[RowId],
    ) -> CacheResult<BatchDescriptor> {
        let _inner = self.shared.lock.read();
        let rows = row_ids
            .iter()
            .map(|&id| self.shared.store.get_data_locator(id))
            .collect();
        Ok(BatchDescriptor {
            connection_id,
            rows,
        })
    }

    /// Fan a batch out to the worker queues and wait for every sub-request.
    ///
    /// The destination layout is an offset table of N+1 `i64`s followed by
    /// the row regions, each rounded up to 4 KiB so concurrent workers never
    /// write the same page. Workers are chosen by the row's NUMA node when
    /// affinity is enabled, at random otherwise; request slots come from the
    /// queues round-robin starting at a random offset. The shared lock is
    /// released before waiting — fetch can be slow and must not block
    /// writers or other readers.
    ///
    /// Sub-requests are awaited in dispatch order. The first non-interrupted
    /// error becomes the batch result; every slot is returned to its pool
    /// regardless of outcome.
    pub fn batch_fetch(
        &self,
        descriptor: &BatchDescriptor,
        out: &Arc<FetchBuffer>,
    ) -> CacheResult<()> {
        let guard = self.shared.lock.read();
        if guard.state == ServiceState::BuildPhase {
            return Err(CacheError::InvalidState(
                "can't accept cache request in fetch phase".to_string(),
            ));
        }
        metrics::BATCH_FETCHES.increment();

        let sizes: Vec<u64> = descriptor.rows.iter().map(|row| row.size).collect();
        let offsets = layout::offset_table(&sizes);
        let required = layout::required_size(&offsets);
        if out.len() < required {
            return Err(CacheError::SizeMismatch(format!(
                "destination buffer is {} bytes but the batch needs {required}",
                out.len()
            )));
        }
        out.write_offset_table(&offsets)?;

        let num_queues = self.workers.num_queues();
        let mut queue_id = rand::rng().random_range(0..num_queues);
        let mut tags = Vec::with_capacity(descriptor.rows.len());
        for (i, row) in descriptor.rows.iter().enumerate() {
            if row.size == 0 {
                continue;
            }
            let region = FetchBuffer::region(out, offsets[i] as usize, row.size as usize)?;
            let worker_id = if self.numa_affinity {
                self.workers.worker_for_node(row.node_id)
            } else {
                self.workers.random_worker()
            };
            let tag = self.workers.get_free_request_tag(queue_id % num_queues)?;
            queue_id += 1;

            let request = FetchSubRequest {
                key: row.key,
                size: row.size,
                source: row.source,
                dest_offset: offsets[i] as u64,
            };
            let mut payload = BytesMut::with_capacity(request.encoded_len());
            request.encode(&mut payload);
            let payload = payload.freeze();

            let shared = Arc::clone(&self.shared);
            let work: FetchWork =
                Box::new(move || executor::fetch_row(&shared, &payload, &region));
            self.workers.push_request(worker_id, tag, work)?;
            metrics::FETCH_SUBREQUESTS.increment();
            tags.push(tag);
        }

        // Fetch may block on spilled rows; don't hold the lock while waiting.
        drop(guard);

        let mut rc = Ok(());
        for tag in tags {
            if let Err(e) = self.workers.wait(tag) {
                if !e.is_interrupted() && rc.is_ok() {
                    rc = Err(e);
                }
            }
            self.workers.return_request_tag(tag);
        }
        if rc.is_err() {
            metrics::FETCH_ERRORS.increment();
        }
        rc
    }

    /// Flip a build-phase service into the terminal fetch phase and drop
    /// the store's internal write locking.
    pub fn build_phase_done(&self) -> CacheResult<()> {
        if !self.has_build_phase() {
            return Err(CacheError::InvalidState(
                "not a cache that has a build phase".to_string(),
            ));
        }
        let mut inner = self.shared.lock.write();
        inner.state = ServiceState::FetchPhase;
        self.shared.store.set_locking(false);
        Ok(())
    }

    /// Turn write mode off (`false`) or back on (`true`) for services
    /// without a build phase.
    ///
    /// Turning writes off disables store locking and makes every subsequent
    /// ingestion fail with an out-of-memory error until writes are turned
    /// back on. A toggle matching the current mode is a no-op.
    pub fn toggle_write_mode(&self, on: bool) -> CacheResult<()> {
        let mut inner = self.shared.lock.write();
        if self.has_build_phase() {
            return Err(CacheError::InvalidState(
                "not applicable to non-mappable dataset".to_string(),
            ));
        }
        if inner.state == ServiceState::None && !on {
            inner.state = ServiceState::NoLocking;
            self.shared.store.set_locking(false);
            warn!("locking mode is switched off");
        } else if inner.state == ServiceState::NoLocking && on {
            inner.state = ServiceState::None;
            self.shared.store.set_locking(true);
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        self.shared.lock.read().state
    }

    /// Spill file location, when spill is configured.
    pub fn spill_path(&self) -> Option<PathBuf> {
        self.shared.store.spill_path().map(Path::to_path_buf)
    }

    fn has_build_phase(&self) -> bool {
        self.generate_id
    }

    fn check_write_allowed(&self, inner: &Inner) -> CacheResult<()> {
        match inner.state {
            ServiceState::FetchPhase => Err(CacheError::InvalidState(
                "can't accept cache request in fetch phase".to_string(),
            )),
            // Backpressure: once store locking is off, writes are refused
            // rather than risking unsynchronized mutation.
            ServiceState::NoLocking => Err(CacheError::OutOfMemory),
            _ => Ok(()),
        }
    }

    fn assign_row_id(&self, header: &RowHeader) -> CacheResult<RowId> {
        if self.generate_id {
            Ok(self.next_row_id())
        } else {
            self.validate_client_id(header.row_id)
        }
    }

    fn next_row_id(&self) -> RowId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id % 1000 == 0 {
            debug!("number of rows cached: {}", id + 1);
        }
        id
    }

    fn validate_client_id(&self, id: RowId) -> CacheResult<RowId> {
        if id < 0 {
            return Err(CacheError::Unexpected(format!(
                "expected non-negative row id: {id}"
            )));
        }
        Ok(id)
    }

    fn insert_row(&self, row_id: RowId, parts: &[&[u8]]) -> CacheResult<()> {
        match self.shared.store.insert(row_id, parts) {
            Ok(()) => {
                metrics::ROWS_CACHED.increment();
                Ok(())
            }
            Err(StoreError::DuplicateKey) => {
                metrics::ROWS_DUPLICATE.increment();
                debug!("ignoring duplicate key {row_id}");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
