//! Error types for the cache service.

use std::fmt;

use protocol_rowcache::ParseError;
use row_store::StoreError;

/// Errors returned across the cache service boundary.
///
/// Duplicate-key results from the store never appear here; ingestion
/// swallows them by design.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The operation is not legal in the service's current phase or
    /// lock mode.
    InvalidState(String),

    /// Memory pool exhausted, request slot pool exhausted, or a deliberate
    /// refusal to write once locking has been turned off.
    OutOfMemory,

    /// Column count or fetched byte count does not match what was declared.
    SizeMismatch(String),

    /// The requested item has never been cached.
    NotFound(String),

    /// The request was cut short by shutdown. Benign for batch aggregation.
    Interrupted,

    /// Malformed wire message or unexpected internal failure.
    Unexpected(String),
}

impl CacheError {
    /// Whether this error is an interruption rather than a real failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::SizeMismatch(msg) => write!(f, "size mismatch: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::Unexpected(msg) => write!(f, "unexpected error: {msg}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::OutOfMemory => Self::OutOfMemory,
            StoreError::KeyNotFound => Self::NotFound("key not found".to_string()),
            StoreError::BufferTooSmall | StoreError::OutOfBounds => {
                Self::SizeMismatch(e.to_string())
            }
            StoreError::DuplicateKey | StoreError::Io(_) => Self::Unexpected(e.to_string()),
        }
    }
}

impl From<ParseError> for CacheError {
    fn from(e: ParseError) -> Self {
        Self::Unexpected(e.to_string())
    }
}

/// Result type for cache service operations.
pub type CacheResult<T> = Result<T, CacheError>;
