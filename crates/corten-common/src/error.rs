//! Error types for CortenDB.

use thiserror::Error;

/// Result type alias using CortenError.
pub type Result<T> = std::result::Result<T, CortenError>;

/// Errors that can occur in CortenDB operations.
#[derive(Debug, Error)]
pub enum CortenError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No frame could be evicted to make room for a page.
    #[error("buffer is full")]
    BufferFull,

    #[error("Page size mismatch: expected {expected}, got {actual}")]
    PageSizeMismatch { expected: usize, actual: usize },
}

impl CortenError {
    /// Returns true if this error indicates a full buffer pool.
    pub fn is_buffer_full(&self) -> bool {
        matches!(self, CortenError::BufferFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: CortenError = io_err.into();
        assert!(matches!(err, CortenError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_buffer_full_display() {
        let err = CortenError::BufferFull;
        assert_eq!(err.to_string(), "buffer is full");
        assert!(err.is_buffer_full());
    }

    #[test]
    fn test_page_size_mismatch_display() {
        let err = CortenError::PageSizeMismatch {
            expected: 1024,
            actual: 4096,
        };
        assert_eq!(err.to_string(), "Page size mismatch: expected 1024, got 4096");
        assert!(!err.is_buffer_full());
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(CortenError::BufferFull)
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CortenError>();
    }
}
