//! Error types for row store operations.

use std::fmt;

/// Errors that can occur while storing or retrieving rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Key already exists in the index. The stored content is whatever
    /// was inserted first.
    DuplicateKey,

    /// Key not present in the index.
    KeyNotFound,

    /// No memory available in the pool and no spill file configured.
    OutOfMemory,

    /// Destination buffer is smaller than the stored row.
    BufferTooSmall,

    /// Arena handle does not fall within the pool's allocated range.
    OutOfBounds,

    /// Spill file I/O failure.
    Io(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateKey => write!(f, "key already exists"),
            Self::KeyNotFound => write!(f, "key not found"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::BufferTooSmall => write!(f, "destination buffer too small"),
            Self::OutOfBounds => write!(f, "arena handle out of bounds"),
            Self::Io(msg) => write!(f, "spill io error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Result type for row store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", StoreError::DuplicateKey), "key already exists");
        assert_eq!(format!("{}", StoreError::KeyNotFound), "key not found");
        assert_eq!(format!("{}", StoreError::OutOfMemory), "out of memory");
        assert_eq!(
            format!("{}", StoreError::BufferTooSmall),
            "destination buffer too small"
        );
        assert_eq!(
            format!("{}", StoreError::Io("boom".to_string())),
            "spill io error: boom"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: StoreError = io.into();
        assert!(matches!(err, StoreError::Io(_)));
    }

    #[test]
    fn test_error_is_error_trait() {
        fn assert_error<E: std::error::Error>() {}
        assert_error::<StoreError>();
    }
}
