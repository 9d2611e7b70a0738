//! Phase-aware row cache service.
//!
//! A write-once/read-many row cache for data-loading pipelines: rows are
//! ingested once per logical session, then served in bulk by fanning batch
//! fetches across a fixed pool of NUMA-affine worker queues.

pub mod affinity;
pub mod buffer;
pub mod config;
pub mod error;
pub mod layout;
pub mod logging;
pub mod metrics;
pub mod service;
pub mod state;
pub mod workers;

mod executor;

pub use buffer::FetchBuffer;
pub use config::Config;
pub use error::{CacheError, CacheResult};
pub use service::{CacheService, ServiceStat};
pub use state::ServiceState;
