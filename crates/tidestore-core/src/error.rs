//! Error types for Tidestore operations
//!
//! All storage errors are represented by the StoreError enum. Variants carry
//! enough context (object, serial, file offset) to debug a failure without
//! reproducing it.
//!
//! Errors fall into three groups:
//! - user errors (`Conflict`, `VersionLock`, `VersionCommit`, `Undo`) leave
//!   the storage untouched and may be retried by the application
//! - corruption (`CorruptedData`) puts the storage into a read-only posture
//! - `StorageFatal` means the storage is hosed until it is reopened

use std::path::{Path, PathBuf};

use crate::types::{Oid, Tid};

/// Tidestore error types with detailed context
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", describe_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// `store` or a `tpc_*` call made in the wrong state or with a foreign
    /// transaction token
    #[error("transaction error: {reason}")]
    StorageTransaction { reason: String },

    /// The committed serial differs from the one the writer started from
    #[error("conflict on {oid}: expected {expected}, committed {committed}")]
    Conflict { oid: Oid, expected: Tid, committed: Tid },

    /// The object is held in a different version
    #[error("{oid} is locked in version {locked:?}")]
    VersionLock { oid: Oid, locked: String },

    /// Invalid source or destination for a version commit or abort
    #[error("version commit error: {reason}")]
    VersionCommit { reason: String },

    /// The transaction cannot be undone
    #[error("cannot undo {tid}: {reason}")]
    Undo { tid: Tid, reason: String },

    /// Unknown object, packed-away revision, or deleted object
    #[error("no data for {oid}{}", describe_serial(.serial))]
    PosKey { oid: Oid, serial: Option<Tid> },

    /// An on-disk invariant does not hold
    #[error("corrupted data in {} at offset {offset}: {reason}", .path.display())]
    CorruptedData {
        /// File holding the damaged bytes
        path: PathBuf,
        /// Byte offset where the damage was detected
        offset: u64,
        /// Description of the violated invariant
        reason: String,
    },

    /// The storage was opened read-only or has seen corruption
    #[error("storage is read-only")]
    ReadOnly,

    /// Another process holds the advisory lock
    #[error("{} is locked by another process", .path.display())]
    Locked { path: PathBuf },

    /// A failure after the commit point; the storage refuses writes until reopened
    #[error("storage is hosed: {reason}")]
    StorageFatal { reason: String },

    /// The remote storage cannot be reached
    #[error("disconnected: {reason}")]
    Disconnected { reason: String },

    /// A caller-supplied argument is out of range
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
}

fn describe_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

fn describe_serial(serial: &Option<Tid>) -> String {
    match serial {
        Some(serial) => format!(" at {}", serial),
        None => String::new(),
    }
}

/// Placeholder path used by pure decoders that do not know their file.
pub(crate) const BUFFER_PATH: &str = "<buffer>";

impl StoreError {
    /// I/O error with file context.
    pub fn io(path: &Path, err: std::io::Error, what: &str) -> Self {
        StoreError::Io {
            path: Some(path.to_path_buf()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// Corruption detected by a decoder that only knows the offset.
    pub fn corrupted(offset: u64, reason: impl Into<String>) -> Self {
        StoreError::CorruptedData { path: PathBuf::from(BUFFER_PATH), offset, reason: reason.into() }
    }

    pub fn transaction(reason: impl Into<String>) -> Self {
        StoreError::StorageTransaction { reason: reason.into() }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        StoreError::InvalidArgument { reason: reason.into() }
    }

    /// Attach a file path to a corruption error raised by a decoder.
    pub fn in_file(self, file: &Path) -> Self {
        match self {
            StoreError::CorruptedData { path, offset, reason } if path == Path::new(BUFFER_PATH) => {
                StoreError::CorruptedData { path: file.to_path_buf(), offset, reason }
            }
            StoreError::Io { path: None, kind, message } => {
                StoreError::Io { path: Some(file.to_path_buf()), kind, message }
            }
            other => other,
        }
    }

    /// Errors the application is expected to handle (retry, resolve, report).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            StoreError::Conflict { .. }
                | StoreError::VersionLock { .. }
                | StoreError::VersionCommit { .. }
                | StoreError::Undo { .. }
        )
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::CorruptedData { .. })
    }
}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io { path: None, kind: err.kind(), message: err.to_string() }
    }
}

/// Result type alias for Tidestore operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::Conflict { oid: Oid(7), expected: Tid(1), committed: Tid(2) };
        let display = err.to_string();
        assert!(display.contains("conflict"));
        assert!(display.contains("oid 0x0000000000000007"));

        let err = StoreError::PosKey { oid: Oid(1), serial: Some(Tid(3)) };
        assert!(err.to_string().ends_with("at tid 0x0000000000000003"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StoreError = io_err.into();

        match err {
            StoreError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_in_file_fills_buffer_path() {
        let err = StoreError::corrupted(1024, "bad status").in_file(Path::new("/tmp/Data.fs"));
        match err {
            StoreError::CorruptedData { path, offset, .. } => {
                assert_eq!(path, PathBuf::from("/tmp/Data.fs"));
                assert_eq!(offset, 1024);
            }
            _ => panic!("Expected CorruptedData"),
        }
    }

    #[test]
    fn test_user_error_classification() {
        assert!(StoreError::Undo { tid: Tid(1), reason: "x".into() }.is_user_error());
        assert!(!StoreError::ReadOnly.is_user_error());
        assert!(StoreError::corrupted(0, "x").is_corruption());
    }
}
