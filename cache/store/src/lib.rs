//! Row storage for the cache service.
//!
//! This crate provides the storage substrate the row cache sits on:
//!
//! - **NumaMemoryPool**: per-node mapped regions with bump allocation,
//!   addressed through opaque [`ArenaRef`] handles
//! - **RowStore**: the index contract the service consumes (insert, keyed
//!   read, data locators, stats, locking toggle)
//! - **MemoryStore**: the bundled engine — ordered index over pool extents
//!   with spill-to-disk overflow

mod error;
mod numa;
mod store;

pub use error::{StoreError, StoreResult};
pub use numa::{ArenaRef, NumaMemoryPool, PAGE_SIZE, total_system_memory};
pub use store::{DataLocator, MemoryStore, RowId, RowStore, StoreStat};
