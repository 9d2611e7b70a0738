//! Ordered row index.
//!
//! [`RowStore`] is the contract the cache service consumes: atomic
//! multi-part insert, keyed point read, data locators for batch fetch,
//! key-space statistics, and a locking toggle. [`MemoryStore`] is the
//! bundled engine: a `BTreeMap` index over extents in the
//! [`NumaMemoryPool`], spilling to an append-only file when the pool is
//! exhausted.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::error::{StoreError, StoreResult};
use crate::numa::{ArenaRef, NumaMemoryPool};

/// Row identifier. Client-supplied ids must be non-negative.
pub type RowId = i64;

/// Where a requested row currently lives.
///
/// `size == 0` with no source handle means the key is not present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLocator {
    /// Row key.
    pub key: RowId,
    /// NUMA node the row is resident on (0 for spilled or absent rows).
    pub node_id: u32,
    /// Stored size in bytes.
    pub size: u64,
    /// Pool handle when the row is memory-resident.
    pub source: Option<ArenaRef>,
}

/// Key-space statistics.
///
/// `max_key < min_key` indicates an empty store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStat {
    pub min_key: RowId,
    pub max_key: RowId,
    /// Rows resident in the memory pool.
    pub num_mem_cached: u64,
    /// Rows spilled to disk.
    pub num_disk_cached: u64,
    /// Bytes handed out by the memory pool.
    pub memory_usage: u64,
    /// Sorted ids missing between `min_key` and `max_key`. Only populated
    /// when requested.
    pub gaps: Vec<RowId>,
}

/// Contract between the cache service and its storage engine.
pub trait RowStore: Send + Sync {
    /// Insert `parts` as one atomic row keyed by `id`. The parts are
    /// logically concatenated. Duplicate ids fail with
    /// [`StoreError::DuplicateKey`] and leave the first insert in place.
    fn insert(&self, id: RowId, parts: &[&[u8]]) -> StoreResult<()>;

    /// Copy the row's bytes into `dst`, returning the byte count.
    fn read(&self, key: RowId, dst: &mut [u8]) -> StoreResult<usize>;

    /// Copy a memory-resident extent without consulting the index.
    fn read_resident(&self, src: ArenaRef, dst: &mut [u8]) -> StoreResult<()>;

    /// Locate a row for batch fetch. Absent keys yield a zero-size locator.
    fn get_data_locator(&self, key: RowId) -> DataLocator;

    /// Key-space statistics; gap computation is opt-in.
    fn get_stat(&self, want_gaps: bool) -> StoreStat;

    /// Toggle the engine's internal write locking.
    fn set_locking(&self, on: bool);

    /// Spill file location, when spill is configured.
    fn spill_path(&self) -> Option<&Path>;
}

enum RowLocation {
    Memory(ArenaRef),
    Spilled { offset: u64, len: u64 },
}

impl RowLocation {
    fn len(&self) -> u64 {
        match self {
            RowLocation::Memory(r) => r.len,
            RowLocation::Spilled { len, .. } => *len,
        }
    }
}

/// Append-only overflow file for rows that do not fit in the pool.
struct SpillFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl SpillFile {
    fn create(root: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(root)?;
        let path = root.join("rows.spill");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn append(&self, parts: &[&[u8]]) -> StoreResult<(u64, u64)> {
        let mut file = self.file.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        let mut len = 0u64;
        for part in parts {
            file.write_all(part)?;
            len += part.len() as u64;
        }
        Ok((offset, len))
    }

    fn read_at(&self, offset: u64, dst: &mut [u8]) -> StoreResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(dst)?;
        Ok(())
    }
}

/// Bundled row store: ordered in-memory index over pool extents with
/// optional disk spill.
pub struct MemoryStore {
    pool: Arc<NumaMemoryPool>,
    index: RwLock<BTreeMap<RowId, RowLocation>>,
    spill: Option<SpillFile>,
    locking: AtomicBool,
    next_node: AtomicUsize,
}

impl MemoryStore {
    /// Create a store over `pool`. When `spill_root` is given, rows that no
    /// longer fit in the pool land in an append-only file beneath it.
    pub fn new(pool: Arc<NumaMemoryPool>, spill_root: Option<&Path>) -> StoreResult<Self> {
        let spill = match spill_root {
            Some(root) => Some(SpillFile::create(root)?),
            None => None,
        };
        Ok(Self {
            pool,
            index: RwLock::new(BTreeMap::new()),
            spill,
            locking: AtomicBool::new(true),
            next_node: AtomicUsize::new(0),
        })
    }

    fn preferred_node(&self) -> u32 {
        let nodes = self.pool.available_nodes();
        nodes[self.next_node.fetch_add(1, Ordering::Relaxed) % nodes.len()]
    }
}

impl RowStore for MemoryStore {
    fn insert(&self, id: RowId, parts: &[&[u8]]) -> StoreResult<()> {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let mut index = self.index.write();
        if index.contains_key(&id) {
            return Err(StoreError::DuplicateKey);
        }

        let location = match self.pool.allocate(self.preferred_node(), total) {
            Some(extent) => {
                self.pool.write(extent, parts)?;
                RowLocation::Memory(extent)
            }
            None => match &self.spill {
                Some(spill) => {
                    let (offset, len) = spill.append(parts)?;
                    RowLocation::Spilled { offset, len }
                }
                None => return Err(StoreError::OutOfMemory),
            },
        };

        index.insert(id, location);
        Ok(())
    }

    fn read(&self, key: RowId, dst: &mut [u8]) -> StoreResult<usize> {
        let index = self.index.read();
        let location = index.get(&key).ok_or(StoreError::KeyNotFound)?;
        let len = location.len() as usize;
        if dst.len() < len {
            return Err(StoreError::BufferTooSmall);
        }
        match location {
            RowLocation::Memory(extent) => self.pool.copy_into(*extent, &mut dst[..len])?,
            RowLocation::Spilled { offset, .. } => {
                let spill = self.spill.as_ref().ok_or(StoreError::KeyNotFound)?;
                spill.read_at(*offset, &mut dst[..len])?;
            }
        }
        Ok(len)
    }

    fn read_resident(&self, src: ArenaRef, dst: &mut [u8]) -> StoreResult<()> {
        self.pool.copy_into(src, dst)
    }

    fn get_data_locator(&self, key: RowId) -> DataLocator {
        let index = self.index.read();
        match index.get(&key) {
            Some(RowLocation::Memory(extent)) => DataLocator {
                key,
                node_id: extent.node,
                size: extent.len,
                source: Some(*extent),
            },
            Some(RowLocation::Spilled { len, .. }) => DataLocator {
                key,
                node_id: 0,
                size: *len,
                source: None,
            },
            None => DataLocator {
                key,
                node_id: 0,
                size: 0,
                source: None,
            },
        }
    }

    fn get_stat(&self, want_gaps: bool) -> StoreStat {
        let index = self.index.read();
        let mut stat = StoreStat {
            min_key: 0,
            max_key: -1,
            num_mem_cached: 0,
            num_disk_cached: 0,
            memory_usage: self.pool.bytes_used() as u64,
            gaps: Vec::new(),
        };

        let (first, last) = match (index.keys().next(), index.keys().next_back()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => return stat,
        };
        stat.min_key = first;
        stat.max_key = last;

        for location in index.values() {
            match location {
                RowLocation::Memory(_) => stat.num_mem_cached += 1,
                RowLocation::Spilled { .. } => stat.num_disk_cached += 1,
            }
        }

        if want_gaps {
            let mut expected = first;
            for &key in index.keys() {
                while expected < key {
                    stat.gaps.push(expected);
                    expected += 1;
                }
                expected = key + 1;
            }
        }

        stat
    }

    fn set_locking(&self, on: bool) {
        self.locking.store(on, Ordering::Release);
        tracing::debug!("store locking set to {on}");
    }

    fn spill_path(&self) -> Option<&Path> {
        self.spill.as_ref().map(|s| s.path.as_path())
    }
}
