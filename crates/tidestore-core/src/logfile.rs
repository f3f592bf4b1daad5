//! Positional access to the transaction log file
//!
//! All reads and writes take an explicit offset (`pread`/`pwrite` on Unix),
//! so readers share one handle without a cursor and never serialize on it.
//! The advisory `.lock` sibling keeps a second process from opening the
//! same log.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, error};

use crate::durability::{durable_sync, truncate_durable};
use crate::error::{StoreError, StoreResult};

#[cfg(unix)]
use std::os::unix::fs::FileExt as _;
#[cfg(windows)]
use std::os::windows::fs::FileExt as _;

/// `<path><suffix>`, e.g. `Data.fs` + `.pack` = `Data.fs.pack`.
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Handle on the log file.
#[derive(Debug)]
pub struct LogFile {
    file: File,
    path: PathBuf,
}

impl LogFile {
    /// Open an existing file, or create it when `create` is set.
    pub fn open(path: &Path, create: bool, read_only: bool) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(create && !read_only)
            .open(path)
            .map_err(|e| StoreError::io(path, e, "failed to open log file"))?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    /// Create (or truncate) a file for writing, used for the pack output.
    pub fn create_new(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e, "failed to create log file"))?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current physical length.
    pub fn len(&self) -> StoreResult<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| StoreError::io(&self.path, e, "failed to stat log file"))
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Fill `buf` from `offset`. Hitting end-of-file is an error.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> StoreResult<()> {
        read_exact_at_offset(&self.file, buf, offset).map_err(|e| {
            StoreError::io(&self.path, e, &format!("failed to read {} bytes at offset {}", buf.len(), offset))
        })
    }

    /// Read `len` bytes at `offset` into a new buffer.
    pub fn read_at(&self, offset: u64, len: usize) -> StoreResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    pub fn read_u64_at(&self, offset: u64) -> StoreResult<u64> {
        let mut buf = [0u8; 8];
        self.read_exact_at(&mut buf, offset)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn write_at(&self, data: &[u8], offset: u64) -> StoreResult<()> {
        write_all_at_offset(&self.file, data, offset).map_err(|e| {
            StoreError::io(&self.path, e, &format!("failed to write {} bytes at offset {}", data.len(), offset))
        })
    }

    /// Flush data to stable storage.
    pub fn sync(&self) -> StoreResult<()> {
        durable_sync(&self.file).map_err(|e| StoreError::io(&self.path, e, "durable_sync failed"))
    }

    /// Cut the file back to `len` bytes.
    pub fn truncate(&self, len: u64) -> StoreResult<()> {
        debug!(path = %self.path.display(), len, "truncating log file");
        truncate_durable(&self.file, len).map_err(|e| StoreError::io(&self.path, e, "failed to truncate log file"))
    }
}

/// Advisory lock on `<path>.lock`, held for the lifetime of an open storage.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    /// Take the lock without blocking.
    pub fn acquire(target: &Path) -> StoreResult<Self> {
        let path = sibling_path(target, ".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e, "failed to open lock file"))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "acquired storage lock");
                Ok(Self { file, path })
            }
            Err(e) if is_contended(&e) => {
                error!(path = %target.display(), "storage is already locked by another process");
                Err(StoreError::Locked { path: target.to_path_buf() })
            }
            Err(e) => Err(StoreError::io(&path, e, "failed to lock")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            error!(path = %self.path.display(), error = %e, "failed to release storage lock");
        }
    }
}

// Some platforms report a held flock as EAGAIN rather than WouldBlock.
fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(11) || e.raw_os_error() == Some(35)
}

#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    file.read_exact_at(buf, offset)
}

/// `seek_read` moves the cursor on Windows; reads stay correct because
/// every call passes its own offset.
#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected end of file during seek_read"));
        }
        pos += n;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}
