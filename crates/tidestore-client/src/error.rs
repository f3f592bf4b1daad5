//! Error types for the Tidestore client

use std::path::PathBuf;

use thiserror::Error;
use tidestore_core::StoreError;

/// Errors raised by the client cache, the notification codec and the
/// client storage shim.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Error reported by the storage behind the client
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The cache file does not hold a valid ring
    #[error("Cache file {path} is corrupt at offset {offset}: {reason}")]
    CacheCorrupt { path: PathBuf, offset: u64, reason: String },

    /// Another process has the cache file open
    #[error("Cache file {path} is in use by another process")]
    CacheInUse { path: PathBuf },

    /// Configured cache size cannot hold the header and one entry
    #[error("Cache size {size} is too small (minimum {min} bytes)")]
    CacheTooSmall { size: u64, min: u64 },

    /// Malformed frame or message
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    pub fn protocol(reason: impl Into<String>) -> Self {
        ClientError::Protocol { reason: reason.into() }
    }
}

impl From<ClientError> for StoreError {
    fn from(err: ClientError) -> Self {
        let text = err.to_string();
        match err {
            ClientError::Store(inner) => inner,
            ClientError::CacheCorrupt { path, offset, reason } => StoreError::CorruptedData { path, offset, reason },
            ClientError::CacheInUse { path } => StoreError::Locked { path },
            ClientError::CacheTooSmall { .. } => StoreError::InvalidArgument { reason: text },
            ClientError::Protocol { .. } => StoreError::Disconnected { reason: text },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidestore_core::Oid;

    #[test]
    fn test_store_errors_pass_through() {
        let inner = StoreError::PosKey { oid: Oid(7), serial: None };
        let wrapped: ClientError = inner.clone().into();
        assert_eq!(wrapped.to_string(), inner.to_string());
        assert!(matches!(StoreError::from(wrapped), StoreError::PosKey { .. }));
    }

    #[test]
    fn test_cache_in_use_maps_to_locked() {
        let err = ClientError::CacheInUse { path: PathBuf::from("/tmp/c.tsc") };
        assert!(matches!(StoreError::from(err), StoreError::Locked { .. }));
    }

    #[test]
    fn test_protocol_maps_to_disconnected() {
        let err = ClientError::protocol("short frame");
        assert!(err.to_string().contains("short frame"));
        assert!(matches!(StoreError::from(err), StoreError::Disconnected { .. }));
    }
}
