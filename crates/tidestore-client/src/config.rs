//! Configuration for the client cache, the client shim and the local server

use std::path::PathBuf;
use std::time::Duration;

use crate::cache_format::MIN_CACHE_SIZE;

/// Client cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache file; `None` keeps the ring in an anonymous temporary file
    pub path: Option<PathBuf>,
    /// Total file size in bytes, header included
    pub size: u64,
}

impl CacheConfig {
    /// Persistent cache of `size` bytes at `path`.
    pub fn persistent(path: impl Into<PathBuf>, size: u64) -> Self {
        Self { path: Some(path.into()), size }
    }

    /// Throwaway cache, emptied on every start.
    pub fn temporary(size: u64) -> Self {
        Self { path: None, size }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.size < MIN_CACHE_SIZE {
            return Err(format!("cache size must be at least {} bytes", MIN_CACHE_SIZE));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::temporary(20 * 1024 * 1024)
    }
}

/// Client storage configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub cache: CacheConfig,
    /// Refuse commits
    pub read_only: bool,
    /// On reconnect ask the server for the invalidations missed since the
    /// cache's last tid before falling back to full verification
    pub quick_verify: bool,
    /// Longest wait of the invalidator thread before it rechecks shutdown
    pub invalidation_poll: Duration,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.invalidation_poll.is_zero() {
            return Err("invalidation_poll must be > 0".into());
        }
        self.cache.validate()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            read_only: false,
            quick_verify: true,
            invalidation_poll: Duration::from_millis(100),
        }
    }
}

/// In-process server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Committed invalidation sets kept for reconnecting clients
    pub invalidation_history: usize,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.invalidation_history == 0 {
            return Err("invalidation_history must be > 0".into());
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { invalidation_history: 100 }
    }
}
