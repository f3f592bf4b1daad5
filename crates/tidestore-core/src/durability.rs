//! Platform-specific durable sync
//!
//! Maps to the strongest durability guarantee available on each platform.
//! Used at the commit point of every transaction and around the pack rename.

use std::fs::File;
use std::io;
use std::path::Path;

/// Ensures data is durably written to persistent storage before returning.
///
/// Platform behaviors:
/// - Linux: fdatasync()
/// - macOS/iOS: fcntl(F_FULLFSYNC), since plain fsync stops at the drive cache
/// - Windows: FlushFileBuffers()
/// - Other: file.sync_data()
///
/// May block for a long time under heavy I/O; callers must not hold the
/// storage lock across it.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File, so it is open for the duration of the call.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File, so it is open for the duration of the call.
        let result = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: handle comes from a live File.
        let result = unsafe { FlushFileBuffers(handle as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}

/// Persist a rename or file creation in `dir`.
///
/// Directory handles cannot be opened on Windows; there the rename is
/// already durable once `MoveFileEx` returns, so this is a no-op.
pub fn sync_directory(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        handle.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

/// Cut `file` back to `len` bytes and make the new length durable.
pub fn truncate_durable(file: &File, len: u64) -> io::Result<()> {
    file.set_len(len)?;
    file.sync_all()
}
