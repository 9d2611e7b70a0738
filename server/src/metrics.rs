//! Cache service metrics.

use metriken::{Counter, metric};

#[metric(
    name = "rows_cached",
    description = "Total rows accepted into the cache"
)]
pub static ROWS_CACHED: Counter = Counter::new();

#[metric(
    name = "rows_duplicate",
    description = "Duplicate-key inserts ignored"
)]
pub static ROWS_DUPLICATE: Counter = Counter::new();

#[metric(name = "batch_fetches", description = "Total batch fetch calls")]
pub static BATCH_FETCHES: Counter = Counter::new();

#[metric(
    name = "fetch_subrequests",
    description = "Per-row fetches dispatched to worker queues"
)]
pub static FETCH_SUBREQUESTS: Counter = Counter::new();

#[metric(
    name = "fetch_errors",
    description = "Batch fetches that returned an error"
)]
pub static FETCH_ERRORS: Counter = Counter::new();

#[metric(name = "schema_fetches", description = "Schema fetch calls served")]
pub static SCHEMA_FETCHES: Counter = Counter::new();
