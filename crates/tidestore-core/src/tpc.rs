//! Two-phase commit for FileStorage
//!
//! Per-transaction state machine:
//!   IDLE --tpc_begin--> BEGIN --store*--> BEGIN --tpc_vote--> VOTED --tpc_finish--> IDLE
//!   BEGIN or VOTED --tpc_abort--> IDLE
//!
//! WRITE ORDERING:
//! 1. store:  records go to the scratch file, the log is untouched
//! 2. vote:   header with status 'c' plus all staged records appended to the log
//! 3. finish: trailer, status flipped to ' ', undo marks, then durable_sync
//! 4. finish: indexes merged, invalidations sent, then last_tid published
//!
//! A crash before step 3 completes leaves a 'c' transaction (or a torn tail)
//! that the next open truncates away.

use std::sync::atomic::Ordering;

use hashbrown::{HashMap, HashSet};
use tracing::{debug, error, warn};

use crate::api::Transaction;
use crate::codec::{
    encode_data_record, encode_txn_meta, RecordBody, NewRecord, TxnHeader, TxnStatus, TID_AND_TLEN,
    TXN_HEADER_LEN,
};
use crate::error::{StoreError, StoreResult};
use crate::index::FsIndex;
use crate::iterator::{read_data_header, read_version_info, resolve_payload};
use crate::scratch::ScratchFile;
use crate::storage::FileStorage;
use crate::timestamp::new_tid;
use crate::types::{Oid, Tid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnStage {
    Begun,
    Voted,
}

/// State of the transaction holding the commit lock.
#[derive(Debug)]
pub(crate) struct ActiveTxn {
    pub(crate) ticket: u64,
    pub(crate) tid: Tid,
    /// Offset where the transaction header goes
    pub(crate) pos: u64,
    pub(crate) stage: TxnStage,
    user: Vec<u8>,
    description: Vec<u8>,
    extension: Vec<u8>,
    scratch: ScratchFile,
    /// Records staged by this transaction, by absolute offset
    pub(crate) tindex: FsIndex,
    /// Newest record staged in each version
    heads: HashMap<Vec<u8>, u64>,
    touched: Vec<(Oid, Vec<u8>, u64)>,
    invalidated: Vec<(Oid, Vec<u8>)>,
    /// Transactions to mark undone at finish
    pub(crate) undone: Vec<u64>,
    /// Undone transactions whose records this one brings back
    pub(crate) redone: Vec<u64>,
    /// Objects whose stored payload came from the conflict resolver
    resolved: Vec<Oid>,
    tlen: u64,
}

impl ActiveTxn {
    fn data_start(&self) -> u64 {
        self.pos
            + TXN_HEADER_LEN as u64
            + self.user.len() as u64
            + self.description.len() as u64
            + self.extension.len() as u64
    }

    /// `vprev` for the next record written in `version`.
    pub(crate) fn version_head(&self, version: &[u8], committed: u64) -> u64 {
        self.heads.get(version).copied().unwrap_or(committed)
    }

    /// Append an encoded record to the scratch and index it.
    pub(crate) fn stage_record(&mut self, oid: Oid, version: &[u8], record: &[u8]) -> StoreResult<u64> {
        let at = self.data_start() + self.scratch.append(record)?;
        self.tindex.insert(oid, at);
        if !version.is_empty() {
            self.heads.insert(version.to_vec(), at);
        }
        self.touched.push((oid, version.to_vec(), at));
        self.invalidated.push((oid, version.to_vec()));
        Ok(at)
    }

    /// Report `oid` as changed in `version` without staging a record there.
    pub(crate) fn invalidate(&mut self, oid: Oid, version: &[u8]) {
        self.invalidated.push((oid, version.to_vec()));
    }
}

impl FileStorage {
    /// The active transaction if it belongs to `txn` and is in `stage`.
    pub(crate) fn active_for<'a>(
        &self,
        slot: &'a mut Option<ActiveTxn>,
        txn: &Transaction,
        stage: TxnStage,
    ) -> StoreResult<&'a mut ActiveTxn> {
        match slot {
            Some(active) if active.ticket == txn.id() => {
                if active.stage != stage {
                    return Err(StoreError::transaction(format!(
                        "transaction is {:?}, operation needs {:?}",
                        active.stage, stage
                    )));
                }
                Ok(active)
            }
            Some(_) => Err(StoreError::transaction("another transaction is in progress")),
            None => Err(StoreError::transaction("no transaction in progress")),
        }
    }

    /// Start a transaction, blocking until the commit lock is free.
    pub fn tpc_begin(&self, txn: &Transaction) -> StoreResult<()> {
        self.check_writable()?;
        if let Some(active) = self.txn.lock().as_ref() {
            if active.ticket == txn.id() {
                return Err(StoreError::transaction("transaction already begun"));
            }
        }
        for (name, field) in [("user", txn.user()), ("description", txn.description()), ("extension", txn.extension())] {
            if field.len() > u16::MAX as usize {
                return Err(StoreError::invalid(format!("transaction {} is {} bytes, max 65535", name, field.len())));
            }
        }

        self.commit_lock.acquire(txn.id())?;

        let started = self.check_writable().and_then(|_| {
            let scratch = ScratchFile::new(&self.config.scratch_directory())?;
            let state = self.state.read();
            Ok(ActiveTxn {
                ticket: txn.id(),
                tid: new_tid(state.last_tid),
                pos: state.end,
                stage: TxnStage::Begun,
                user: txn.user().to_vec(),
                description: txn.description().to_vec(),
                extension: txn.extension().to_vec(),
                scratch,
                tindex: FsIndex::new(),
                heads: HashMap::new(),
                touched: Vec::new(),
                invalidated: Vec::new(),
                undone: Vec::new(),
                redone: Vec::new(),
                resolved: Vec::new(),
                tlen: 0,
            })
        });
        match started {
            Ok(active) => {
                debug!(tid = %active.tid, pos = active.pos, "transaction begun");
                *self.txn.lock() = Some(active);
                Ok(())
            }
            Err(e) => {
                self.commit_lock.release(txn.id());
                Err(e)
            }
        }
    }

    /// Objects stored by `txn` whose payload was rewritten by the conflict
    /// resolver, so the caller's copy is not what will be committed.
    pub fn resolved_oids(&self, txn: &Transaction) -> StoreResult<Vec<Oid>> {
        match self.txn.lock().as_ref() {
            Some(active) if active.ticket == txn.id() => Ok(active.resolved.clone()),
            _ => Err(StoreError::transaction("no transaction in progress")),
        }
    }

    /// Stage a new revision of `oid`.
    pub fn store(&self, oid: Oid, serial: Tid, data: &[u8], version: &[u8], txn: &Transaction) -> StoreResult<Tid> {
        self.store_with_refs(oid, serial, data, version, &[], txn)
    }

    /// `store` with an explicit list of referenced oids kept in the record.
    pub fn store_with_refs(
        &self,
        oid: Oid,
        serial: Tid,
        data: &[u8],
        version: &[u8],
        refs: &[Oid],
        txn: &Transaction,
    ) -> StoreResult<Tid> {
        self.check_writable()?;
        if data.is_empty() {
            return Err(StoreError::invalid("payload must not be empty"));
        }
        let mut slot = self.txn.lock();
        let active = self.active_for(&mut slot, txn, TxnStage::Begun)?;

        let (log, old, committed_head) = {
            let state = self.state.read();
            (std::sync::Arc::clone(&state.log), state.index.get(oid).unwrap_or(0), state.vindex.head(version))
        };

        let mut resolved = None;
        let mut pnv = 0;
        if old != 0 {
            let header = self.observe(read_data_header(&log, old))?;
            let info = self.observe(read_version_info(&log, old, &header))?;
            let locked = info.as_ref().map(|v| v.name.as_slice()).unwrap_or(&[]);
            if !locked.is_empty() && locked != version {
                debug!(oid = %oid, "store refused, object is locked in another version");
                return Err(StoreError::VersionLock { oid, locked: String::from_utf8_lossy(locked).into_owned() });
            }
            if header.serial != serial {
                resolved = self.try_resolve(oid, serial, old, data)?;
                if resolved.is_none() {
                    debug!(oid = %oid, expected = %serial, committed = %header.serial, "write conflict");
                    return Err(StoreError::Conflict { oid, expected: serial, committed: header.serial });
                }
            }
            if !version.is_empty() {
                pnv = info.map(|v| v.pnv).unwrap_or(old);
            }
        }

        if resolved.is_some() {
            active.resolved.push(oid);
        }
        let data = resolved.as_deref().unwrap_or(data);
        let vprev = if version.is_empty() { 0 } else { active.version_head(version, committed_head) };
        let record = encode_data_record(&NewRecord {
            oid,
            serial: active.tid,
            prev: old,
            tloc: active.pos,
            version,
            pnv,
            vprev,
            refs,
            body: RecordBody::Data(data),
        })?;
        active.stage_record(oid, version, &record)?;
        Ok(active.tid)
    }

    fn try_resolve(&self, oid: Oid, serial: Tid, current: u64, new: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let resolver = match self.resolver.read().clone() {
            Some(resolver) => resolver,
            None => return Ok(None),
        };
        let old = match self.load_serial(oid, serial) {
            Ok(old) => old,
            Err(StoreError::PosKey { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let committed = match resolve_payload(&self.log(), current, self.config.max_backpointer_hops)? {
            Some(committed) => committed,
            None => return Ok(None),
        };
        Ok(resolver.resolve(oid, &old, &committed, new))
    }

    /// Write the transaction into the log with status 'c'.
    ///
    /// Any failure aborts the transaction.
    pub fn tpc_vote(&self, txn: &Transaction) -> StoreResult<()> {
        let mut slot = self.txn.lock();
        let active = self.active_for(&mut slot, txn, TxnStage::Begun)?;
        match self.write_vote(active) {
            Ok(()) => {
                active.stage = TxnStage::Voted;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "vote failed, aborting transaction");
                if let Some(active) = slot.take() {
                    if let Err(abort_err) = self.rollback(active) {
                        error!(error = %abort_err, "abort after failed vote also failed");
                    }
                }
                Err(e)
            }
        }
    }

    fn write_vote(&self, active: &mut ActiveTxn) -> StoreResult<()> {
        self.check_writable()?;
        let log = self.log();
        let meta_len = active.user.len() + active.description.len() + active.extension.len();
        let tlen = TxnHeader::tlen_for(meta_len, active.scratch.len());
        let header = encode_txn_meta(
            active.tid,
            tlen,
            TxnStatus::Checkpoint,
            &active.user,
            &active.description,
            &active.extension,
        )?;
        log.write_at(&header, active.pos)?;
        active.scratch.copy_to(&log, active.pos + header.len() as u64)?;
        active.tlen = tlen;
        Ok(())
    }

    /// Make the voted transaction durable and visible. Returns its tid.
    pub fn tpc_finish(&self, txn: &Transaction) -> StoreResult<Tid> {
        let mut slot = self.txn.lock();
        self.active_for(&mut slot, txn, TxnStage::Voted)?;
        let active = match slot.take() {
            Some(active) => active,
            None => return Err(StoreError::transaction("no transaction in progress")),
        };
        drop(slot);
        let log = self.log();
        let end = active.pos + TID_AND_TLEN + active.tlen;

        // Before the status flip a failure is an ordinary abort.
        if let Err(e) = log.write_at(&active.tlen.to_be_bytes(), end - 8) {
            self.rollback(active)?;
            return Err(e);
        }

        let durable = log
            .write_at(&[TxnStatus::Normal.as_byte()], active.pos + 16)
            .and_then(|_| {
                for pos in &active.undone {
                    log.write_at(&[TxnStatus::Undone.as_byte()], pos + 16)?;
                }
                for pos in &active.redone {
                    log.write_at(&[TxnStatus::Normal.as_byte()], pos + 16)?;
                }
                Ok(())
            })
            .and_then(|_| log.sync());
        if let Err(e) = durable {
            self.hosed.store(true, Ordering::Release);
            self.commit_lock.release(active.ticket);
            error!(tid = %active.tid, error = %e, "commit failed after status flip, storage is hosed");
            return Err(StoreError::StorageFatal { reason: format!("finish of {} failed: {}", active.tid, e) });
        }

        {
            let mut state = self.state.write();
            state.index.merge(&active.tindex);
            for (oid, version, pos) in &active.touched {
                state.vindex.record(*oid, version, *pos);
            }
            state.end = end;
        }

        let mut seen = HashSet::new();
        let oids: Vec<(Oid, Vec<u8>)> =
            active.invalidated.iter().filter(|entry| seen.insert((*entry).clone())).cloned().collect();
        if let Some(sink) = self.sink.read().clone() {
            sink.invalidate(active.tid, &oids, active.ticket);
        }

        self.state.write().last_tid = active.tid;
        self.commit_lock.release(active.ticket);
        debug!(tid = %active.tid, records = active.touched.len(), "transaction committed");
        Ok(active.tid)
    }

    /// Abandon the transaction and remove anything it wrote.
    pub fn tpc_abort(&self, txn: &Transaction) -> StoreResult<()> {
        let active = {
            let mut slot = self.txn.lock();
            match slot.as_ref() {
                Some(active) if active.ticket == txn.id() => slot.take(),
                Some(_) => return Err(StoreError::transaction("another transaction is in progress")),
                None => return Err(StoreError::transaction("no transaction in progress")),
            }
        };
        match active {
            Some(active) => self.rollback(active),
            None => Ok(()),
        }
    }

    /// Drop a client's claim on the storage: cancel its commit-lock wait or
    /// abort the transaction it holds.
    pub fn abandon(&self, ticket: u64) {
        if self.commit_lock.cancel(ticket) {
            return;
        }
        let active = {
            let mut slot = self.txn.lock();
            if slot.as_ref().map(|a| a.ticket) == Some(ticket) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(active) = active {
            warn!(tid = %active.tid, "aborting transaction of a departed client");
            if let Err(e) = self.rollback(active) {
                error!(error = %e, "failed to abort abandoned transaction");
            }
        }
    }

    /// Truncate anything written past the transaction start and release the
    /// commit lock.
    pub(crate) fn rollback(&self, mut active: ActiveTxn) -> StoreResult<()> {
        let result = (|| -> StoreResult<()> {
            active.scratch.clear()?;
            let log = self.log();
            if log.len()? > active.pos {
                log.truncate(active.pos)?;
            }
            Ok(())
        })();
        if let Err(e) = &result {
            self.hosed.store(true, Ordering::Release);
            error!(tid = %active.tid, error = %e, "failed to truncate aborted transaction");
        } else {
            debug!(tid = %active.tid, "transaction aborted");
        }
        self.commit_lock.release(active.ticket);
        result
    }
}
