//! Error types for tierstore
//!
//! This module defines the common error type used by the object store client,
//! the virtual disks and the part store, together with the classification the
//! engine uses to decide between retrying, degrading and failing.

use thiserror::Error;

/// Common result type for tierstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for tierstore
#[derive(Debug, Error)]
pub enum Error {
    // Local I/O
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("file not found: {disk}:{path}")]
    FileNotFound { disk: String, path: String },

    #[error("file already exists: {disk}:{path}")]
    FileExists { disk: String, path: String },

    #[error("insufficient disk space: required {required} bytes, available {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },

    // Remote object store
    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    #[error("no such upload: {upload_id}")]
    NoSuchUpload { upload_id: String },

    #[error("invalid part: {part_number}")]
    InvalidPart { part_number: u32 },

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    // Catalog and parts
    #[error("disk not found: {0}")]
    DiskNotFound(String),

    #[error("cache not found: {0}")]
    CacheNotFound(String),

    #[error("storage policy not found: {0}")]
    PolicyNotFound(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("part not found: {0}")]
    PartNotFound(String),

    #[error("part already exists: {0}")]
    PartAlreadyExists(String),

    #[error("part {part} is busy: {operation} in progress")]
    PartBusy { part: String, operation: String },

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    // Integrity
    #[error("checksum mismatch in {path}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("data corruption detected: {0}")]
    Corruption(String),

    // Internal errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an error, used by callers to pick a reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network hiccup or throttling, worth retrying with backoff
    Transient,
    /// Local space ran out; reads degrade to pass-through
    ResourceExhausted,
    /// Integrity problem detected on load or read
    Corruption,
    /// Invalid or missing configuration
    Configuration,
    /// Something that was looked up does not exist
    NotFound,
    /// Concurrent transition or duplicate name
    Conflict,
    /// Everything else
    Internal,
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a corruption error
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create a file not found error
    pub fn file_not_found(disk: impl Into<String>, path: impl Into<String>) -> Self {
        Self::FileNotFound {
            disk: disk.into(),
            path: path.into(),
        }
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ServiceUnavailable(_)
                | Self::ConnectionFailed(_)
                | Self::Throttled(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::FileNotFound { .. }
            | Self::ObjectNotFound { .. }
            | Self::NoSuchUpload { .. }
            | Self::DiskNotFound(_)
            | Self::CacheNotFound(_)
            | Self::PolicyNotFound(_)
            | Self::TableNotFound(_)
            | Self::PartNotFound(_)
            | Self::ColumnNotFound(_)
            | Self::SnapshotNotFound(_) => true,
            Self::DiskIo(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// Classify the error
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        if self.is_retryable() {
            return ErrorClass::Transient;
        }
        if self.is_not_found() {
            return ErrorClass::NotFound;
        }
        match self {
            Self::RetriesExhausted { .. } => ErrorClass::Transient,
            Self::InsufficientSpace { .. } => ErrorClass::ResourceExhausted,
            Self::ChecksumMismatch { .. } | Self::Corruption(_) => ErrorClass::Corruption,
            Self::Configuration(_) => ErrorClass::Configuration,
            Self::PartBusy { .. }
            | Self::PartAlreadyExists(_)
            | Self::TableAlreadyExists(_)
            | Self::FileExists { .. } => ErrorClass::Conflict,
            _ => ErrorClass::Internal,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<::config::ConfigError> for Error {
    fn from(e: ::config::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::ConnectionFailed("reset by peer".into()).is_retryable());
        assert!(Error::Throttled("slow down".into()).is_retryable());
        assert!(!Error::PartNotFound("all_1_1_0".into()).is_retryable());
    }

    #[test]
    fn test_error_not_found() {
        assert!(Error::file_not_found("s3", "store/abc/x.bin").is_not_found());
        assert!(
            Error::ObjectNotFound {
                bucket: "b".into(),
                key: "k".into()
            }
            .is_not_found()
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(Error::DiskIo(io).is_not_found());
        assert!(!Error::Timeout.is_not_found());
    }

    #[test]
    fn test_error_class() {
        assert_eq!(Error::Timeout.class(), ErrorClass::Transient);
        let exhausted = Error::RetriesExhausted {
            operation: "GET".into(),
            attempts: 3,
            source: Box::new(Error::Timeout),
        };
        assert_eq!(exhausted.class(), ErrorClass::Transient);
        assert!(!exhausted.is_retryable());
        assert_eq!(
            Error::InsufficientSpace {
                required: 10,
                available: 1
            }
            .class(),
            ErrorClass::ResourceExhausted
        );
        assert_eq!(
            Error::configuration("no disks").class(),
            ErrorClass::Configuration
        );
        assert_eq!(
            Error::PartBusy {
                part: "p".into(),
                operation: "merge".into()
            }
            .class(),
            ErrorClass::Conflict
        );
    }
}
