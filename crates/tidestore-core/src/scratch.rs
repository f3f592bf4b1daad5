//! Commit scratch file
//!
//! Records stored during a transaction are staged here, outside the log,
//! until vote copies them behind the transaction header. Abort just clears
//! the scratch; the log is never touched before vote.
//!
//! The backing file is anonymous (`tempfile::tempfile_in`), so nothing is
//! left behind if the process dies mid-transaction.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{StoreError, StoreResult};
use crate::logfile::LogFile;

/// Chunk size used when copying staged records into the log.
const COPY_CHUNK: usize = 64 * 1024;

/// Append-only staging area for one transaction's data records.
#[derive(Debug)]
pub struct ScratchFile {
    file: File,
    dir: PathBuf,
    len: u64,
}

impl ScratchFile {
    /// Create an anonymous scratch file in `dir`.
    pub fn new(dir: &Path) -> StoreResult<Self> {
        let file = tempfile::tempfile_in(dir).map_err(|e| StoreError::io(dir, e, "failed to create scratch file"))?;
        Ok(Self { file, dir: dir.to_path_buf(), len: 0 })
    }

    /// Bytes staged so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stage `bytes`, returning their offset within the scratch.
    pub fn append(&mut self, bytes: &[u8]) -> StoreResult<u64> {
        let at = self.len;
        self.file
            .seek(SeekFrom::Start(at))
            .and_then(|_| self.file.write_all(bytes))
            .map_err(|e| StoreError::io(&self.dir, e, "scratch write failed"))?;
        self.len += bytes.len() as u64;
        Ok(at)
    }

    /// Copy everything staged into `log` starting at offset `at`.
    pub fn copy_to(&mut self, log: &LogFile, at: u64) -> StoreResult<()> {
        self.file.seek(SeekFrom::Start(0)).map_err(|e| StoreError::io(&self.dir, e, "scratch seek failed"))?;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut copied = 0u64;
        while copied < self.len {
            let want = COPY_CHUNK.min((self.len - copied) as usize);
            self.file
                .read_exact(&mut buf[..want])
                .map_err(|e| StoreError::io(&self.dir, e, "scratch read failed"))?;
            log.write_at(&buf[..want], at + copied)?;
            copied += want as u64;
        }
        Ok(())
    }

    /// Discard everything staged.
    pub fn clear(&mut self) -> StoreResult<()> {
        self.file.set_len(0).map_err(|e| StoreError::io(&self.dir, e, "scratch truncate failed"))?;
        self.len = 0;
        Ok(())
    }
}
