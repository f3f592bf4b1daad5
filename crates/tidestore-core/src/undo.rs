//! Transactional undo
//!
//! Undo never rewrites history. It writes, inside the caller's transaction,
//! one record per object the target transaction touched, pointing back at
//! the revision that preceded it. The target is marked `'u'` when the undoing
//! transaction finishes. Undoing that undo brings the target's records back,
//! so the target returns to normal status and shows up in the undo log again.

use std::collections::BTreeMap;

use crate::api::{Transaction, TransactionDescription, UndoFilter};
use crate::codec::{encode_data_record, RecordBody, NewRecord, TxnStatus, METADATA_LEN};
use crate::error::{StoreError, StoreResult};
use crate::iterator::{
    payload_pos, previous_transaction, read_data_header, read_transaction, read_txn_header, read_version_info,
    DataRecord, ReadMode, TransactionRecord,
};
use crate::logfile::LogFile;
use crate::storage::{read_transaction_meta, FileStorage};
use crate::tpc::TxnStage;
use crate::types::{Oid, Tid};

/// Locate the committed transaction `tid` by walking back from `end`.
fn find_transaction(log: &LogFile, end: u64, tid: Tid) -> StoreResult<Option<TransactionRecord>> {
    let mut pos = end;
    while pos > METADATA_LEN {
        let at = previous_transaction(log, pos)?;
        let header = read_txn_header(log, at)?;
        if header.tid == tid {
            return read_transaction(log, at, ReadMode::HeadersOnly).map(Some);
        }
        if header.tid < tid {
            break;
        }
        pos = at;
    }
    Ok(None)
}

impl FileStorage {
    /// Revert the effects of transaction `tid` within `txn`. Returns the
    /// objects that will change.
    ///
    /// Fails with `Undo` if any of those objects has been modified since.
    pub fn undo(&self, tid: Tid, txn: &Transaction) -> StoreResult<Vec<Oid>> {
        self.check_writable()?;
        let mut slot = self.txn.lock();
        let active = self.active_for(&mut slot, txn, TxnStage::Begun)?;
        let undo_err = |reason: &str| StoreError::Undo { tid, reason: reason.to_string() };

        let (log, end) = {
            let state = self.state.read();
            (std::sync::Arc::clone(&state.log), state.end)
        };
        let target = match self.observe(find_transaction(&log, end, tid))? {
            Some(target) => target,
            None => return Err(undo_err("no such transaction")),
        };
        match target.status() {
            TxnStatus::Undone => return Err(undo_err("transaction was already undone")),
            TxnStatus::Packed => return Err(undo_err("transaction was packed")),
            _ => {}
        }
        if active.undone.contains(&target.pos) {
            return Err(undo_err("transaction is already being undone"));
        }

        // The last record per object is the one the transaction left behind.
        let mut last: BTreeMap<Oid, DataRecord> = BTreeMap::new();
        for record in target.records {
            last.insert(record.oid(), record);
        }

        let mut staged = Vec::with_capacity(last.len());
        {
            let state = self.state.read();
            for (oid, record) in &last {
                let current = active.tindex.get(*oid).or_else(|| state.index.get(*oid));
                let current = match current {
                    Some(pos) if pos == record.pos => pos,
                    // A later undo may have restored exactly this payload.
                    Some(pos) if pos < end && self.same_payload(&log, pos, record.pos)? => pos,
                    _ => {
                        return Err(StoreError::Undo {
                            tid,
                            reason: format!("{} was modified by a later transaction", oid),
                        })
                    }
                };
                staged.push((*oid, current, record.prev(), record.version_name().to_vec()));
            }
        }

        for (oid, current, prev, undone_version) in staged {
            let (version, pnv, body) = if prev == 0 {
                (Vec::new(), 0, RecordBody::DELETED)
            } else {
                let header = self.observe(read_data_header(&log, prev))?;
                let info = self.observe(read_version_info(&log, prev, &header))?;
                let owner = self.observe(read_txn_header(&log, header.tloc))?;
                if owner.status == TxnStatus::Undone && !active.redone.contains(&header.tloc) {
                    active.redone.push(header.tloc);
                }
                match info {
                    Some(info) => (info.name, info.pnv, RecordBody::BackPointer(prev)),
                    None => (Vec::new(), 0, RecordBody::BackPointer(prev)),
                }
            };
            let vprev = if version.is_empty() {
                0
            } else {
                let committed = self.state.read().vindex.head(&version);
                active.version_head(&version, committed)
            };
            let record = encode_data_record(&NewRecord {
                oid,
                serial: active.tid,
                prev: current,
                tloc: active.pos,
                version: &version,
                pnv,
                vprev,
                refs: &[],
                body,
            })?;
            active.stage_record(oid, &version, &record)?;
            if undone_version != version {
                active.invalidate(oid, &undone_version);
            }
        }
        active.undone.push(target.pos);
        Ok(last.into_keys().collect())
    }

    /// Whether the records at `a` and `b` resolve to the same stored payload.
    fn same_payload(&self, log: &LogFile, a: u64, b: u64) -> StoreResult<bool> {
        let hops = self.config.max_backpointer_hops;
        Ok(self.observe(payload_pos(log, a, hops))? == self.observe(payload_pos(log, b, hops))?)
    }

    /// Undoable transactions, newest first.
    ///
    /// Returns the entries with index `first..last` among those passing
    /// `filter`; a negative `last` asks for `-last` entries from `first`.
    /// Undone transactions are skipped and the walk stops at the first
    /// packed one.
    pub fn undo_log(
        &self,
        first: usize,
        last: i64,
        filter: Option<&UndoFilter>,
    ) -> StoreResult<Vec<TransactionDescription>> {
        let last = if last < 0 { first + last.unsigned_abs() as usize } else { last as usize };
        let (log, end) = {
            let state = self.state.read();
            (std::sync::Arc::clone(&state.log), state.end)
        };
        self.observe(undo_log_from(&log, end, first, last, filter))
    }
}

fn undo_log_from(
    log: &LogFile,
    end: u64,
    first: usize,
    last: usize,
    filter: Option<&UndoFilter>,
) -> StoreResult<Vec<TransactionDescription>> {
    let mut out = Vec::new();
    let mut index = 0;
    let mut pos = end;
    while pos > METADATA_LEN && index < last {
        let at = previous_transaction(log, pos)?;
        pos = at;
        let header = read_txn_header(log, at)?;
        match header.status {
            TxnStatus::Packed => break,
            TxnStatus::Undone | TxnStatus::Checkpoint => continue,
            TxnStatus::Normal => {}
        }
        let description = read_transaction_meta(log, at)?;
        if let Some(filter) = filter {
            if !filter(&description) {
                continue;
            }
        }
        if index >= first {
            out.push(description);
        }
        index += 1;
    }
    Ok(out)
}
