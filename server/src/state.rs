//! Service lifecycle states.

use std::fmt;

/// Lifecycle state of a cache service instance.
///
/// Services that generate their own row ids move through a one-way
/// `BuildPhase` -> `FetchPhase` transition. Services backed by mappable
/// datasets stay in `None`, where reads and writes interleave under normal
/// locking, and may be toggled into `NoLocking` for read performance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// No build/fetch distinction; writes and reads interleave freely.
    None,
    /// Accepting writes; fetch is not allowed yet.
    BuildPhase,
    /// Terminal state for build-phase services; no further writes.
    FetchPhase,
    /// Store locking disabled; writes are refused until toggled back.
    NoLocking,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::BuildPhase => write!(f, "build phase"),
            Self::FetchPhase => write!(f, "fetch phase"),
            Self::NoLocking => write!(f, "no locking"),
        }
    }
}
