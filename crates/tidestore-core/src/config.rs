//! Configuration management for Tidestore
//!
//! Presets for the common ways a file storage is opened, plus validation.

use std::path::PathBuf;

/// Environment variable naming the directory for commit scratch files.
pub const SCRATCH_DIR_ENV: &str = "TIDESTORE_TMPDIR";

/// File storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Create the file if it does not exist
    pub create: bool,
    /// Refuse every write operation
    pub read_only: bool,
    /// Truncate a damaged or half-written tail instead of failing the open
    pub recover: bool,
    /// Treat a `prev` pointer that disagrees with the index as corruption
    pub strict_prev_check: bool,
    /// Directory for commit scratch files (overridden by `TIDESTORE_TMPDIR`)
    pub scratch_dir: Option<PathBuf>,
    /// Longest back-pointer chain followed before the data is declared corrupt
    pub max_backpointer_hops: usize,
    /// Commit-lock queue depth logged at `warn`
    pub commit_queue_warn: usize,
    /// Commit-lock queue depth logged at `error`
    pub commit_queue_critical: usize,
}

impl StorageConfig {
    /// Read-write storage that repairs an interrupted commit on open.
    pub fn server() -> Self {
        Self {
            create: true,
            read_only: false,
            recover: true,
            strict_prev_check: false,
            scratch_dir: None,
            max_backpointer_hops: 1024,
            commit_queue_warn: 10,
            commit_queue_critical: 50,
        }
    }

    /// Opens an existing file without modifying it. A damaged tail is
    /// ignored in memory but left on disk.
    pub fn read_only() -> Self {
        Self { create: false, read_only: true, ..Self::server() }
    }

    /// Fails the open on any inconsistency instead of repairing it.
    pub fn strict() -> Self {
        Self { recover: false, strict_prev_check: true, ..Self::server() }
    }

    /// Directory used for commit scratch files.
    pub fn scratch_directory(&self) -> PathBuf {
        if let Some(dir) = std::env::var_os(SCRATCH_DIR_ENV) {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        match &self.scratch_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir(),
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.read_only && self.create {
            return Err("a read-only storage cannot create its file".into());
        }
        if self.max_backpointer_hops == 0 {
            return Err("max_backpointer_hops must be > 0".into());
        }
        if self.commit_queue_warn == 0 {
            return Err("commit_queue_warn must be > 0".into());
        }
        if self.commit_queue_critical <= self.commit_queue_warn {
            return Err("commit_queue_critical must be greater than commit_queue_warn".into());
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self { Self::server() }
}
