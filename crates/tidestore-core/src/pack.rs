//! Pack: reclaim history older than a cutoff
//!
//! Every record written at or before the cutoff is dropped unless its object
//! is reachable at the cutoff AND the record is either the object's current
//! revision at the cutoff or the non-version revision shadowed by a retained
//! version record. Records written after the cutoff are copied unchanged
//! apart from their offsets.
//!
//! Pack never modifies the log in place. It uses the atomic rename pattern:
//! 1. Write retained transactions to `<file>.pack` (loads and commits go on)
//! 2. Take the commit lock, append transactions committed meanwhile
//! 3. durable_sync the pack file
//! 4. Rename it over the log (atomic on POSIX), sync the directory
//! 5. Rebuild the indexes from the new file and swap them in
//!
//! A crash before step 4 leaves the original log intact and a stale
//! `.pack` file that the next open removes.

use std::path::Path;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

use crate::api::ReferencesFn;
use crate::codec::{
    encode_data_record, encode_metadata, encode_txn_meta, RecordBody, NewRecord, TxnHeader, TxnStatus,
    METADATA_LEN, TXN_HEADER_LEN,
};
use crate::commit_lock::new_ticket;
use crate::durability::sync_directory;
use crate::error::{StoreError, StoreResult};
use crate::index::{read_index, FsIndex};
use crate::iterator::{read_txn_header, resolve_payload, RecordData, ReadMode, TransactionIterator, TransactionRecord};
use crate::logfile::{sibling_path, LogFile};
use crate::storage::FileStorage;
use crate::timestamp::tid_at;
use crate::types::{Oid, Tid};

/// Result of a pack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackReport {
    /// Transactions with `tid <= cutoff` were subject to collection
    pub cutoff: Tid,
    /// Records written at or before the cutoff
    pub records_before: usize,
    pub records_kept: usize,
    pub records_dropped: usize,
    /// Transactions removed because none of their records survived
    pub transactions_dropped: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl PackReport {
    /// Space reclaimed in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Links of a record written before the cutoff.
#[derive(Debug, Clone)]
struct Links {
    prev: u64,
    vprev: u64,
    pnv: u64,
    refs: Vec<Oid>,
}

/// Writes retained transactions into the pack file, translating offsets.
struct PackWriter<'a> {
    old: &'a LogFile,
    out: LogFile,
    end: u64,
    /// Records before this offset are subject to collection
    packpos: u64,
    kept: HashSet<u64>,
    links: HashMap<u64, Links>,
    /// Old offset to new offset of every record written so far
    moved: HashMap<u64, u64>,
    max_hops: usize,
}

impl PackWriter<'_> {
    /// New offset of the nearest surviving record on a chain starting at
    /// `pos`, following `link` past dropped records.
    fn survivor(&self, mut pos: u64, link: fn(&Links) -> u64) -> u64 {
        while pos != 0 && pos < self.packpos && !self.kept.contains(&pos) {
            pos = self.links.get(&pos).map(link).unwrap_or(0);
        }
        self.moved.get(&pos).copied().unwrap_or(0)
    }

    /// Append `txn`. With `collect` set only retained records are written
    /// and a transaction left without records is skipped. Returns the new
    /// offset of the transaction and its record count if it was written.
    fn copy_transaction(
        &mut self,
        txn: &TransactionRecord,
        status: TxnStatus,
        collect: bool,
    ) -> StoreResult<Option<(u64, usize)>> {
        let records: Vec<_> = txn.records.iter().filter(|r| !collect || self.kept.contains(&r.pos)).collect();
        if records.is_empty() && collect {
            return Ok(None);
        }
        let pos = self.end;
        let meta_len = txn.user.len() + txn.description.len() + txn.extension.len();
        let data_start = pos + (TXN_HEADER_LEN + meta_len) as u64;

        let mut body = Vec::new();
        for record in &records {
            let prev = self.survivor(record.prev(), |l| l.prev);
            let (pnv, vprev) = if record.version.is_some() {
                (self.survivor(record.pnv(), |_| 0), self.survivor(record.vprev(), |l| l.vprev))
            } else {
                (0, 0)
            };

            let resolved;
            let data = match &record.data {
                RecordData::Payload(data) => RecordBody::Data(data),
                RecordData::BackPointer(0) => RecordBody::DELETED,
                RecordData::BackPointer(target) => match self.moved.get(target) {
                    Some(&moved) => RecordBody::BackPointer(moved),
                    None => {
                        // The target was dropped: carry its payload instead.
                        resolved = resolve_payload(self.old, *target, self.max_hops)?;
                        match &resolved {
                            Some(data) => RecordBody::Data(data),
                            None => RecordBody::DELETED,
                        }
                    }
                },
                RecordData::Unread => {
                    return Err(StoreError::corrupted(record.pos, "record payload was not loaded").in_file(self.old.path()))
                }
            };

            let encoded = encode_data_record(&NewRecord {
                oid: record.oid(),
                serial: record.serial(),
                prev,
                tloc: pos,
                version: record.version_name(),
                pnv,
                vprev,
                refs: &record.refs,
                body: data,
            })?;
            self.moved.insert(record.pos, data_start + body.len() as u64);
            body.extend_from_slice(&encoded);
        }

        let tlen = TxnHeader::tlen_for(meta_len, body.len() as u64);
        let mut buf = encode_txn_meta(txn.tid(), tlen, status, &txn.user, &txn.description, &txn.extension)?;
        buf.extend_from_slice(&body);
        buf.extend_from_slice(&tlen.to_be_bytes());
        self.out.write_at(&buf, pos)?;
        self.end += buf.len() as u64;
        Ok(Some((pos, records.len())))
    }
}

impl FileStorage {
    /// Pack away history older than `time` (Unix seconds), using the
    /// registered reference extractor.
    pub fn pack(&self, time: f64) -> StoreResult<PackReport> {
        let references = self.references.read().clone();
        self.pack_at(tid_at(time), references)
    }

    /// Pack away records from transactions with `tid <= cutoff`.
    ///
    /// Reachability starts at the root object and at every object written
    /// after the cutoff. It follows the refs stored in each record and, when
    /// `references` is given, the oids it extracts from payloads.
    pub fn pack_at(&self, cutoff: Tid, references: Option<Arc<ReferencesFn>>) -> StoreResult<PackReport> {
        let _running = self.pack_lock.try_lock().ok_or_else(|| StoreError::transaction("pack already in progress"))?;
        self.check_writable()?;

        let (log, end) = {
            let state = self.state.read();
            (Arc::clone(&state.log), state.end)
        };
        let mut report = PackReport { cutoff, bytes_before: end, ..PackReport::default() };

        // Shadow index as of the cutoff.
        let mut shadow = FsIndex::new();
        let mut links: HashMap<u64, Links> = HashMap::new();
        let mut packpos = METADATA_LEN;
        let scan = TransactionIterator::new(Arc::clone(&log), METADATA_LEN, end, None, Some(cutoff), ReadMode::HeadersOnly);
        for txn in scan {
            let txn = self.observe(txn)?;
            packpos = txn.end();
            for record in &txn.records {
                shadow.insert(record.oid(), record.pos);
                links.insert(
                    record.pos,
                    Links {
                        prev: record.prev(),
                        vprev: record.vprev(),
                        pnv: record.pnv(),
                        refs: record.refs.clone(),
                    },
                );
                report.records_before += 1;
            }
        }
        if packpos == METADATA_LEN {
            info!(path = %self.path.display(), cutoff = %cutoff, "nothing to pack");
            report.bytes_after = end;
            return Ok(report);
        }

        // Objects written after the cutoff are live, as is whatever they
        // reference and any non-version revision they shadow.
        let mut seeds = vec![Oid::ROOT];
        let mut kept = HashSet::new();
        let tail = TransactionIterator::new(Arc::clone(&log), packpos, end, None, None, ReadMode::Full);
        for txn in tail {
            let txn = self.observe(txn)?;
            for record in &txn.records {
                seeds.push(record.oid());
                seeds.extend_from_slice(&record.refs);
                if let (Some(extract), RecordData::Payload(data)) = (&references, &record.data) {
                    seeds.extend(extract(data));
                }
                if record.pnv() != 0 && record.pnv() < packpos {
                    kept.insert(record.pnv());
                }
            }
        }

        let max_hops = self.config.max_backpointer_hops;
        let reachable = self.observe(reachable_from(&log, &shadow, &links, seeds, references.as_deref(), max_hops))?;
        for oid in &reachable {
            if let Some(pos) = shadow.get(*oid) {
                kept.insert(pos);
                let pnv = links.get(&pos).map_or(0, |l| l.pnv);
                if pnv != 0 {
                    kept.insert(pnv);
                }
            }
        }
        debug!(reachable = reachable.len(), kept = kept.len(), "pack reachability computed");

        let pack_path = sibling_path(&self.path, ".pack");
        let out = LogFile::create_new(&pack_path)?;
        let mut writer = PackWriter {
            old: &log,
            out,
            end: METADATA_LEN,
            packpos,
            kept,
            links,
            moved: HashMap::new(),
            max_hops: self.config.max_backpointer_hops,
        };

        let result = self
            .copy_retained(&mut writer, &log, end, cutoff, &mut report)
            .and_then(|copied| self.swap_in_pack(&mut writer, &log, end, copied, &pack_path));
        report.bytes_after = match result {
            Ok(bytes_after) => bytes_after,
            Err(e) => {
                if pack_path.exists() {
                    if let Err(rm) = std::fs::remove_file(&pack_path) {
                        warn!(path = %pack_path.display(), error = %rm, "failed to remove abandoned pack file");
                    }
                }
                return self.observe(Err(e));
            }
        };
        info!(
            path = %self.path.display(),
            cutoff = %cutoff,
            kept = report.records_kept,
            dropped = report.records_dropped,
            transactions_dropped = report.transactions_dropped,
            bytes_saved = report.bytes_saved(),
            "pack complete"
        );
        Ok(report)
    }

    /// Copy the retained part of the log up to `end`. Returns the old and new
    /// offsets of the copied post-cutoff transactions.
    fn copy_retained(
        &self,
        writer: &mut PackWriter<'_>,
        log: &Arc<LogFile>,
        end: u64,
        cutoff: Tid,
        report: &mut PackReport,
    ) -> StoreResult<Vec<(u64, u64)>> {
        writer.out.write_at(&encode_metadata(), 0)?;

        let before = TransactionIterator::new(Arc::clone(log), METADATA_LEN, writer.packpos, None, Some(cutoff), ReadMode::Full);
        for txn in before {
            let txn = txn?;
            match writer.copy_transaction(&txn, TxnStatus::Packed, true)? {
                Some((_, n)) => report.records_kept += n,
                None => report.transactions_dropped += 1,
            }
        }
        report.records_dropped = report.records_before - report.records_kept;

        let mut copied = Vec::new();
        let after = TransactionIterator::new(Arc::clone(log), writer.packpos, end, None, None, ReadMode::Full);
        for txn in after {
            let txn = txn?;
            if let Some((pos, _)) = writer.copy_transaction(&txn, txn.status(), false)? {
                copied.push((txn.pos, pos));
            }
        }
        Ok(copied)
    }

    /// Under the commit lock: catch up with commits made during the copy,
    /// then replace the log. Returns the new committed size.
    fn swap_in_pack(
        &self,
        writer: &mut PackWriter<'_>,
        log: &Arc<LogFile>,
        copied_to: u64,
        mut copied: Vec<(u64, u64)>,
        pack_path: &Path,
    ) -> StoreResult<u64> {
        let ticket = new_ticket();
        self.commit_lock.acquire(ticket)?;
        let result = (|| -> StoreResult<u64> {
            let end = self.state.read().end;
            let catch_up = TransactionIterator::new(Arc::clone(log), copied_to, end, None, None, ReadMode::Full);
            for txn in catch_up {
                let txn = txn?;
                if let Some((pos, _)) = writer.copy_transaction(&txn, txn.status(), false)? {
                    copied.push((txn.pos, pos));
                }
            }
            // Undo may have marked copied transactions meanwhile.
            for (old_pos, new_pos) in &copied {
                let status = read_txn_header(log, *old_pos)?.status;
                writer.out.write_at(&[status.as_byte()], new_pos + 16)?;
            }
            writer.out.sync()?;

            std::fs::rename(pack_path, &self.path)
                .map_err(|e| StoreError::io(pack_path, e, "failed to move pack file into place"))?;
            self.reload_after_pack()
        })();
        self.commit_lock.release(ticket);
        result
    }

    // Past the rename the old log is gone: any failure leaves the in-memory
    // state unusable.
    fn reload_after_pack(&self) -> StoreResult<u64> {
        let reloaded = (|| -> StoreResult<_> {
            if let Some(dir) = self.path.parent() {
                sync_directory(dir).map_err(|e| StoreError::io(dir, e, "failed to sync directory after pack"))?;
            }
            let log = LogFile::open(&self.path, false, false)?;
            let scan = read_index(&log, &self.config)?;
            Ok((log, scan))
        })();
        let (log, scan) = match reloaded {
            Ok(reloaded) => reloaded,
            Err(e) => {
                self.hosed.store(true, std::sync::atomic::Ordering::Release);
                error!(path = %self.path.display(), error = %e, "reload after pack failed, storage is hosed");
                return Err(StoreError::StorageFatal { reason: format!("reload after pack failed: {}", e) });
            }
        };
        let mut state = self.state.write();
        state.log = Arc::new(log);
        state.index = scan.index;
        state.vindex = scan.vindex;
        state.end = scan.end;
        state.last_tid = state.last_tid.max(scan.last_tid);
        Ok(scan.end)
    }
}

/// Oids reachable from `seeds` through the records current at the cutoff.
fn reachable_from(
    log: &LogFile,
    shadow: &FsIndex,
    links: &HashMap<u64, Links>,
    seeds: Vec<Oid>,
    references: Option<&ReferencesFn>,
    max_hops: usize,
) -> StoreResult<HashSet<Oid>> {
    let mut reachable = HashSet::new();
    let mut stack: Vec<Oid> = seeds.into_iter().filter(|oid| shadow.contains(*oid)).collect();
    while let Some(oid) = stack.pop() {
        if !reachable.insert(oid) {
            continue;
        }
        let pos = match shadow.get(oid) {
            Some(pos) => pos,
            None => continue,
        };
        let mut positions = vec![pos];
        if let Some(pnv) = links.get(&pos).map(|l| l.pnv).filter(|pnv| *pnv != 0) {
            positions.push(pnv);
        }
        for at in positions {
            let mut refs = links.get(&at).map(|l| l.refs.clone()).unwrap_or_default();
            if let Some(extract) = references {
                if let Some(data) = resolve_payload(log, at, max_hops)? {
                    refs.extend(extract(&data));
                }
            }
            for target in refs {
                if shadow.contains(target) && !reachable.contains(&target) {
                    stack.push(target);
                }
            }
        }
    }
    Ok(reachable)
}
