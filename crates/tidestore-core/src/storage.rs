//! File storage engine
//!
//! FileStorage keeps every revision of every object in one append-only log.
//! The in-memory index maps each object to its current record; everything
//! older is reached through the records' `prev` chains.
//!
//! **Read path**: index lookup under a short read lock, then positional reads
//! with no lock held.
//! **Write path**: two-phase commit serialized by the commit lock (see
//! `tpc.rs`). Records are staged in a scratch file and land in the log at vote.
//!
//! Lock order: transaction slot, then index state. The commit lock is never
//! acquired while either is held.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::api::{
    ConflictResolver, InvalidationSink, ReferencesFn, Revision, RevisionInfo, Storage, Transaction,
    TransactionDescription, UndoFilter,
};
use crate::codec::{encode_metadata, METADATA_LEN};
use crate::commit_lock::CommitLock;
use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::index::{read_index, FsIndex, VersionIndex};
use crate::iterator::{
    read_data_header, read_txn_header, read_version_info, resolve_payload, ReadMode,
    TransactionIterator,
};
use crate::logfile::{sibling_path, LockFile, LogFile};
use crate::timestamp::tid_time;
use crate::tpc::ActiveTxn;
use crate::types::{Oid, Tid};

/// Index state shared by readers and the committer.
#[derive(Debug)]
pub(crate) struct IndexState {
    pub(crate) log: Arc<LogFile>,
    pub(crate) index: FsIndex,
    pub(crate) vindex: VersionIndex,
    /// Offset just past the last committed transaction
    pub(crate) end: u64,
    pub(crate) last_tid: Tid,
}

/// Append-only transactional object storage backed by a single file.
pub struct FileStorage {
    pub(crate) path: PathBuf,
    pub(crate) config: StorageConfig,
    pub(crate) state: RwLock<IndexState>,
    pub(crate) txn: Mutex<Option<ActiveTxn>>,
    pub(crate) commit_lock: CommitLock,
    pub(crate) next_oid: Mutex<Oid>,
    pub(crate) sink: RwLock<Option<Arc<dyn InvalidationSink>>>,
    pub(crate) resolver: RwLock<Option<Arc<dyn ConflictResolver>>>,
    pub(crate) references: RwLock<Option<Arc<ReferencesFn>>>,
    pub(crate) hosed: AtomicBool,
    pub(crate) corrupt: AtomicBool,
    pub(crate) pack_lock: Mutex<()>,
    _lock: Option<LockFile>,
}

impl FileStorage {
    /// Open or create a storage at `path`.
    ///
    /// The index is rebuilt by scanning the log. A stale `.pack` file left by
    /// an interrupted pack is removed; the original log is untouched until a
    /// pack completes, so nothing else needs repair.
    pub fn open<P: AsRef<Path>>(path: P, config: StorageConfig) -> StoreResult<Self> {
        config.validate().map_err(StoreError::invalid)?;
        let path = path.as_ref().to_path_buf();

        let lock = if config.read_only { None } else { Some(LockFile::acquire(&path)?) };

        if !config.read_only {
            let pack_path = sibling_path(&path, ".pack");
            if pack_path.exists() {
                warn!(path = %pack_path.display(), "removing leftover pack file");
                std::fs::remove_file(&pack_path)
                    .map_err(|e| StoreError::io(&pack_path, e, "failed to remove leftover pack file"))?;
            }
        }

        let log = LogFile::open(&path, config.create, config.read_only)?;
        if log.is_empty()? {
            if config.read_only {
                return Err(StoreError::CorruptedData {
                    path: path.clone(),
                    offset: 0,
                    reason: "empty file opened read-only".into(),
                });
            }
            log.write_at(&encode_metadata(), 0)?;
            log.sync()?;
            info!(path = %path.display(), "created storage");
        }

        let scan = read_index(&log, &config)?;
        if let Some(at) = scan.truncated_at {
            warn!(path = %path.display(), offset = at, "storage recovered to an earlier end");
        }
        info!(
            path = %path.display(),
            objects = scan.index.len(),
            transactions = scan.txn_count,
            last_tid = %scan.last_tid,
            "opened storage"
        );

        Ok(Self {
            commit_lock: CommitLock::new(config.commit_queue_warn, config.commit_queue_critical),
            next_oid: Mutex::new(scan.max_oid.next()),
            state: RwLock::new(IndexState {
                log: Arc::new(log),
                index: scan.index,
                vindex: scan.vindex,
                end: scan.end,
                last_tid: scan.last_tid,
            }),
            path,
            config,
            txn: Mutex::new(None),
            sink: RwLock::new(None),
            resolver: RwLock::new(None),
            references: RwLock::new(None),
            hosed: AtomicBool::new(false),
            corrupt: AtomicBool::new(false),
            pack_lock: Mutex::new(()),
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Register the receiver of per-commit invalidation sets.
    pub fn set_invalidation_sink(&self, sink: Arc<dyn InvalidationSink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn set_conflict_resolver(&self, resolver: Arc<dyn ConflictResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    /// Reference extractor used by `pack` when none is passed explicitly.
    pub fn set_references(&self, references: Arc<ReferencesFn>) {
        *self.references.write() = Some(references);
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().index.is_empty()
    }

    /// Committed size of the log in bytes.
    pub fn size(&self) -> u64 {
        self.state.read().end
    }

    /// True when writes are refused because of configuration or corruption.
    pub fn is_read_only(&self) -> bool {
        self.config.read_only || self.corrupt.load(Ordering::Acquire)
    }

    pub fn is_hosed(&self) -> bool {
        self.hosed.load(Ordering::Acquire)
    }

    /// Abort any transaction in progress and flush the log.
    pub fn close(&self) -> StoreResult<()> {
        let active = self.txn.lock().take();
        if let Some(active) = active {
            warn!(tid = %active.tid, "closing storage with a transaction in progress");
            self.rollback(active)?;
        }
        if !self.config.read_only {
            self.state.read().log.sync()?;
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> StoreResult<()> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        if self.is_hosed() {
            return Err(StoreError::StorageFatal { reason: "a commit failed after its data was written".into() });
        }
        Ok(())
    }

    /// Switch to read-only if `result` reports on-disk corruption.
    pub(crate) fn observe<T>(&self, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(e @ StoreError::CorruptedData { .. }) = &result {
            if !self.corrupt.swap(true, Ordering::AcqRel) {
                error!(path = %self.path.display(), error = %e, "corruption detected, storage is now read-only");
            }
        }
        result
    }

    pub(crate) fn log(&self) -> Arc<LogFile> {
        Arc::clone(&self.state.read().log)
    }

    fn current_pos(&self, oid: Oid) -> StoreResult<(Arc<LogFile>, u64)> {
        let state = self.state.read();
        match state.index.get(oid) {
            Some(pos) => Ok((Arc::clone(&state.log), pos)),
            None => Err(StoreError::PosKey { oid, serial: None }),
        }
    }

    /// Allocate the next object id.
    pub fn new_oid(&self) -> StoreResult<Oid> {
        self.check_writable()?;
        let mut next = self.next_oid.lock();
        let oid = *next;
        *next = oid.next();
        Ok(oid)
    }

    /// Newest revision of `oid` visible in `version`.
    ///
    /// When the current record belongs to a different version (the trunk
    /// included) the non-version revision it shadows is returned instead.
    pub fn load(&self, oid: Oid, version: &[u8]) -> StoreResult<(Vec<u8>, Tid)> {
        self.observe(self.load_inner(oid, version))
    }

    fn load_inner(&self, oid: Oid, version: &[u8]) -> StoreResult<(Vec<u8>, Tid)> {
        let (log, mut pos) = self.current_pos(oid)?;
        let mut header = read_data_header(&log, pos)?;
        if let Some(info) = read_version_info(&log, pos, &header)? {
            if info.name != version {
                if info.pnv == 0 {
                    return Err(StoreError::PosKey { oid, serial: None });
                }
                pos = info.pnv;
                header = read_data_header(&log, pos)?;
            }
        }
        match resolve_payload(&log, pos, self.config.max_backpointer_hops)? {
            Some(data) => Ok((data, header.serial)),
            None => Err(StoreError::PosKey { oid, serial: None }),
        }
    }

    /// The revision of `oid` written by transaction `serial`.
    pub fn load_serial(&self, oid: Oid, serial: Tid) -> StoreResult<Vec<u8>> {
        self.observe(self.load_serial_inner(oid, serial))
    }

    fn load_serial_inner(&self, oid: Oid, serial: Tid) -> StoreResult<Vec<u8>> {
        let not_found = || StoreError::PosKey { oid, serial: Some(serial) };
        let (log, mut pos) = self.current_pos(oid).map_err(|_| not_found())?;
        loop {
            let header = read_data_header(&log, pos)?;
            if header.oid != oid {
                return Err(StoreError::CorruptedData {
                    path: self.path.clone(),
                    offset: pos,
                    reason: format!("prev chain of {} reached a record for {}", oid, header.oid),
                });
            }
            if header.serial == serial {
                return resolve_payload(&log, pos, self.config.max_backpointer_hops)?.ok_or_else(not_found);
            }
            if header.serial < serial || header.prev == 0 {
                return Err(not_found());
            }
            if header.prev >= pos {
                return Err(StoreError::CorruptedData {
                    path: self.path.clone(),
                    offset: pos,
                    reason: format!("prev pointer {} does not point backwards", header.prev),
                });
            }
            pos = header.prev;
        }
    }

    /// The non-version revision of `oid` that was current just before `tid`.
    pub fn load_before(&self, oid: Oid, tid: Tid) -> StoreResult<Option<Revision>> {
        self.observe(self.load_before_inner(oid, tid))
    }

    fn load_before_inner(&self, oid: Oid, tid: Tid) -> StoreResult<Option<Revision>> {
        let (log, mut pos) = self.current_pos(oid)?;
        let mut end_tid = None;
        let header = loop {
            let header = read_data_header(&log, pos)?;
            if let Some(info) = read_version_info(&log, pos, &header)? {
                // Version records are invisible here; continue from the
                // non-version revision they shadow.
                if info.pnv == 0 {
                    return Ok(None);
                }
                pos = info.pnv;
                continue;
            }
            if header.serial < tid {
                break header;
            }
            end_tid = Some(header.serial);
            if header.prev == 0 {
                return Ok(None);
            }
            pos = header.prev;
        };
        Ok(resolve_payload(&log, pos, self.config.max_backpointer_hops)?.map(|data| Revision {
            data,
            start_tid: header.serial,
            end_tid,
        }))
    }

    /// Revisions of `oid`, newest first, at most `size` entries.
    pub fn history(&self, oid: Oid, size: usize) -> StoreResult<Vec<RevisionInfo>> {
        self.observe(self.history_inner(oid, size))
    }

    fn history_inner(&self, oid: Oid, size: usize) -> StoreResult<Vec<RevisionInfo>> {
        let (log, mut pos) = self.current_pos(oid)?;
        let mut out = Vec::new();
        while pos != 0 && out.len() < size {
            let header = read_data_header(&log, pos)?;
            let version = read_version_info(&log, pos, &header)?.map(|v| v.name).unwrap_or_default();
            let txn = read_transaction_meta(&log, header.tloc)?;
            let size = resolve_payload(&log, pos, self.config.max_backpointer_hops)?.map_or(0, |d| d.len() as u64);
            out.push(RevisionInfo {
                serial: header.serial,
                time: tid_time(header.serial),
                user: txn.user,
                description: txn.description,
                version,
                size,
            });
            pos = header.prev;
        }
        Ok(out)
    }

    /// Committed transactions with `start <= tid <= stop`, in file order.
    pub fn iter_transactions(&self, start: Option<Tid>, stop: Option<Tid>) -> TransactionIterator {
        let state = self.state.read();
        TransactionIterator::new(Arc::clone(&state.log), METADATA_LEN, state.end, start, stop, ReadMode::Full)
    }

    pub fn last_transaction(&self) -> Tid {
        self.state.read().last_tid
    }
}

/// Transaction metadata without its data records.
pub(crate) fn read_transaction_meta(log: &LogFile, pos: u64) -> StoreResult<TransactionDescription> {
    let header = read_txn_header(log, pos)?;
    let meta_len = header.ulen as usize + header.dlen as usize + header.elen as usize;
    let meta = log.read_at(pos + crate::codec::TXN_HEADER_LEN as u64, meta_len)?;
    let (user, rest) = meta.split_at(header.ulen as usize);
    let (description, extension) = rest.split_at(header.dlen as usize);
    Ok(TransactionDescription {
        tid: header.tid,
        time: tid_time(header.tid),
        user: user.to_vec(),
        description: description.to_vec(),
        extension: extension.to_vec(),
        size: crate::codec::TID_AND_TLEN + header.tlen,
    })
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(path = %self.path.display(), error = %e, "failed to close storage cleanly");
        }
    }
}

impl Storage for FileStorage {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn new_oid(&self) -> StoreResult<Oid> {
        FileStorage::new_oid(self)
    }

    fn load(&self, oid: Oid, version: &[u8]) -> StoreResult<(Vec<u8>, Tid)> {
        FileStorage::load(self, oid, version)
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> StoreResult<Vec<u8>> {
        FileStorage::load_serial(self, oid, serial)
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> StoreResult<Option<Revision>> {
        FileStorage::load_before(self, oid, tid)
    }

    fn store(&self, oid: Oid, serial: Tid, data: &[u8], version: &[u8], txn: &Transaction) -> StoreResult<Tid> {
        FileStorage::store(self, oid, serial, data, version, txn)
    }

    fn tpc_begin(&self, txn: &Transaction) -> StoreResult<()> {
        FileStorage::tpc_begin(self, txn)
    }

    fn tpc_vote(&self, txn: &Transaction) -> StoreResult<()> {
        FileStorage::tpc_vote(self, txn)
    }

    fn tpc_finish(&self, txn: &Transaction) -> StoreResult<Tid> {
        FileStorage::tpc_finish(self, txn)
    }

    fn tpc_abort(&self, txn: &Transaction) -> StoreResult<()> {
        FileStorage::tpc_abort(self, txn)
    }

    fn undo_log(&self, first: usize, last: i64, filter: Option<&UndoFilter>) -> StoreResult<Vec<TransactionDescription>> {
        FileStorage::undo_log(self, first, last, filter)
    }

    fn undo(&self, tid: Tid, txn: &Transaction) -> StoreResult<Vec<Oid>> {
        FileStorage::undo(self, tid, txn)
    }

    fn pack(&self, cutoff: f64) -> StoreResult<()> {
        FileStorage::pack(self, cutoff).map(|_| ())
    }

    fn versions(&self, max: Option<usize>) -> StoreResult<Vec<Vec<u8>>> {
        Ok(FileStorage::versions(self, max))
    }

    fn version_empty(&self, version: &[u8]) -> StoreResult<bool> {
        Ok(FileStorage::version_empty(self, version))
    }

    fn abort_version(&self, version: &[u8], txn: &Transaction) -> StoreResult<Vec<Oid>> {
        FileStorage::abort_version(self, version, txn)
    }

    fn commit_version(&self, src: &[u8], dest: &[u8], txn: &Transaction) -> StoreResult<Vec<Oid>> {
        FileStorage::commit_version(self, src, dest, txn)
    }

    fn last_transaction(&self) -> Tid {
        FileStorage::last_transaction(self)
    }
}
