//! Error types for TernDB.

use thiserror::Error;

/// Result type alias using TernError.
pub type Result<T> = std::result::Result<T, TernError>;

/// Errors that can occur in TernDB operations.
#[derive(Debug, Error)]
pub enum TernError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Buffer pool errors
    #[error("Buffer pool exhausted, no evictable frame")]
    PoolExhausted,

    #[error("Page {page_id} is in use, pin count above one")]
    PageInUse { page_id: u64 },

    // Page errors
    #[error("Page {page_id} corrupted: checksum mismatch")]
    Corruption { page_id: u64 },

    // B+ tree errors
    #[error("Key not found")]
    KeyNotFound,

    #[error("Tree {0} is not open")]
    TreeNotOpen(u64),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TernError {
    /// Returns true for the not-found outcome of a lookup, which callers
    /// routinely branch on rather than propagate.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TernError::KeyNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let tern_err: TernError = io_err.into();
        assert!(matches!(tern_err, TernError::Io(_)));
        assert!(tern_err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_corruption_display() {
        let err = TernError::Corruption { page_id: 42 };
        assert_eq!(err.to_string(), "Page 42 corrupted: checksum mismatch");
    }

    #[test]
    fn test_page_in_use_display() {
        let err = TernError::PageInUse { page_id: 7 };
        assert_eq!(err.to_string(), "Page 7 is in use, pin count above one");
    }

    #[test]
    fn test_key_not_found_is_not_found() {
        assert!(TernError::KeyNotFound.is_not_found());
        assert!(!TernError::PoolExhausted.is_not_found());
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(TernError::TreeNotOpen(3))
        }

        assert!(returns_ok().is_ok());
        assert_eq!(returns_err().unwrap_err().to_string(), "Tree 3 is not open");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TernError>();
    }
}
