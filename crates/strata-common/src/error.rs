//! Error types for strata.

use crate::block::{Bid, DiskId};
use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in strata operations.
///
/// Structural invariant violations (unfixing an unpinned cache entry,
/// unregistering an unknown iterator, evicting a pinned node) are not
/// represented here; they abort through `panic!`.
#[derive(Debug, Error)]
pub enum StrataError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An asynchronous request failed. Stored as text because the failure is
    /// observed by whichever thread waits on the request, possibly several.
    #[error("{op} of {bid} failed: {reason}")]
    RequestFailed {
        op: &'static str,
        bid: Bid,
        reason: String,
    },

    #[error("File not open: {0}")]
    FileNotOpen(u32),

    // Block allocation errors
    #[error("Out of space on disk {disk}: {requested} bytes requested")]
    OutOfSpace { disk: DiskId, requested: u64 },

    #[error("Block not allocated: {0}")]
    BlockNotAllocated(Bid),

    #[error("No disks configured")]
    NoDisks,

    // Cache errors
    #[error("Node cache full, every resident entry is pinned")]
    CacheFull,

    #[error("Node cache too small: {required} entries required, {available} available")]
    CacheTooSmall { required: usize, available: usize },

    // B-tree errors
    #[error("Bulk input is not sorted and duplicate free at position {position}")]
    UnsortedInput { position: usize },

    #[error("Block corrupted: {bid}, reason: {reason}")]
    Corrupted { bid: Bid, reason: String },

    #[error("Block size mismatch: expected {expected}, got {actual}")]
    BlockSizeMismatch { expected: usize, actual: usize },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Builds an `InvalidParameter` error from anything displayable.
    pub fn invalid_parameter(name: &str, value: impl std::fmt::Display) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_io_error_conversion() {
        let io_err = IoError::new(ErrorKind::NotFound, "file not found");
        let err: StrataError = io_err.into();
        assert!(matches!(err, StrataError::Io(_)));
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_request_failed_display() {
        let err = StrataError::RequestFailed {
            op: "pread",
            bid: Bid::new(1, 4096),
            reason: "Input/output error (os error 5)".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "pread of [1:0x1000] failed: Input/output error (os error 5)"
        );
    }

    #[test]
    fn test_out_of_space_display() {
        let err = StrataError::OutOfSpace {
            disk: 3,
            requested: 8192,
        };
        assert_eq!(err.to_string(), "Out of space on disk 3: 8192 bytes requested");
    }

    #[test]
    fn test_cache_errors_display() {
        let err = StrataError::CacheFull;
        assert_eq!(err.to_string(), "Node cache full, every resident entry is pinned");

        let err = StrataError::CacheTooSmall {
            required: 5,
            available: 2,
        };
        assert_eq!(
            err.to_string(),
            "Node cache too small: 5 entries required, 2 available"
        );
    }

    #[test]
    fn test_config_errors_display() {
        let err = StrataError::ConfigError("missing disk".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing disk");

        let err = StrataError::invalid_parameter("capacity", "-1");
        assert_eq!(err.to_string(), "Invalid parameter: capacity = -1");
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_ok() -> Result<i32> {
            Ok(42)
        }

        fn returns_err() -> Result<i32> {
            Err(StrataError::Internal("test".to_string()))
        }

        assert!(returns_ok().is_ok());
        assert!(returns_err().is_err());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StrataError>();
    }
}
