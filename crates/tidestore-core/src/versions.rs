//! Versions: named long-running branches of object state
//!
//! A version record carries the offset of the non-version revision it
//! shadows (`pnv`) and of the previous record written in the same version
//! (`vprev`). While an object has a version record as its current revision
//! it is locked to that version: stores from the trunk or any other version
//! fail with `VersionLock`.
//!
//! Committing or aborting a version writes new records inside the caller's
//! transaction. Nothing is copied: the new records are back-pointers.

use std::sync::Arc;

use crate::api::Transaction;
use crate::codec::{encode_data_record, RecordBody, NewRecord};
use crate::error::{StoreError, StoreResult};
use crate::iterator::{read_data_header, read_version_info};
use crate::logfile::LogFile;
use crate::storage::FileStorage;
use crate::tpc::TxnStage;
use crate::types::Oid;

impl FileStorage {
    /// Committed members of `version` with the offset of their current record.
    fn version_members(&self, version: &[u8]) -> (Arc<LogFile>, Vec<(Oid, u64)>, u64) {
        let state = self.state.read();
        let members = state
            .vindex
            .members(version)
            .into_iter()
            .filter_map(|oid| state.index.get(oid).map(|pos| (oid, pos)))
            .collect();
        (Arc::clone(&state.log), members, state.vindex.head(version))
    }

    /// Move every object of `src` into `dest` (the trunk when empty).
    /// Returns the objects moved.
    pub fn commit_version(&self, src: &[u8], dest: &[u8], txn: &Transaction) -> StoreResult<Vec<Oid>> {
        self.check_writable()?;
        if src.is_empty() {
            return Err(StoreError::VersionCommit { reason: "the trunk cannot be committed".into() });
        }
        if src == dest {
            return Err(StoreError::VersionCommit { reason: "source and destination are the same version".into() });
        }
        let mut slot = self.txn.lock();
        let active = self.active_for(&mut slot, txn, TxnStage::Begun)?;
        let (log, members, _) = self.version_members(src);
        let dest_head = self.state.read().vindex.head(dest);

        let mut moved = Vec::with_capacity(members.len());
        for (oid, pos) in members {
            let header = self.observe(read_data_header(&log, pos))?;
            let info = self.observe(read_version_info(&log, pos, &header))?;
            let (pnv, vprev) = if dest.is_empty() {
                (0, 0)
            } else {
                (info.map(|v| v.pnv).unwrap_or(0), active.version_head(dest, dest_head))
            };
            let record = encode_data_record(&NewRecord {
                oid,
                serial: active.tid,
                prev: pos,
                tloc: active.pos,
                version: dest,
                pnv,
                vprev,
                refs: &[],
                body: RecordBody::BackPointer(pos),
            })?;
            active.stage_record(oid, dest, &record)?;
            active.invalidate(oid, src);
            moved.push(oid);
        }
        Ok(moved)
    }

    /// Discard every change made in `version`, returning its objects to the
    /// non-version state they had before. Returns the objects affected.
    pub fn abort_version(&self, version: &[u8], txn: &Transaction) -> StoreResult<Vec<Oid>> {
        self.check_writable()?;
        if version.is_empty() {
            return Err(StoreError::VersionCommit { reason: "the trunk cannot be aborted".into() });
        }
        let mut slot = self.txn.lock();
        let active = self.active_for(&mut slot, txn, TxnStage::Begun)?;
        let (log, members, _) = self.version_members(version);

        let mut aborted = Vec::with_capacity(members.len());
        for (oid, pos) in members {
            let header = self.observe(read_data_header(&log, pos))?;
            let pnv = self.observe(read_version_info(&log, pos, &header))?.map(|v| v.pnv).unwrap_or(0);
            // Objects created inside the version have nothing to return to.
            let body = if pnv == 0 { RecordBody::DELETED } else { RecordBody::BackPointer(pnv) };
            let record = encode_data_record(&NewRecord {
                oid,
                serial: active.tid,
                prev: pos,
                tloc: active.pos,
                version: b"",
                pnv: 0,
                vprev: 0,
                refs: &[],
                body,
            })?;
            active.stage_record(oid, b"", &record)?;
            active.invalidate(oid, version);
            aborted.push(oid);
        }
        Ok(aborted)
    }

    /// Names of non-empty versions, sorted, at most `max` of them.
    pub fn versions(&self, max: Option<usize>) -> Vec<Vec<u8>> {
        let mut names = self.state.read().vindex.versions();
        if let Some(max) = max {
            names.truncate(max);
        }
        names
    }

    /// True if no object is held in `version`. For the trunk: true if the
    /// storage holds no objects at all.
    pub fn version_empty(&self, version: &[u8]) -> bool {
        let state = self.state.read();
        if version.is_empty() {
            state.index.is_empty()
        } else {
            state.vindex.is_empty(version)
        }
    }

    /// The version `oid` is locked in, empty if none.
    pub fn modified_in_version(&self, oid: Oid) -> Vec<u8> {
        self.state.read().vindex.version_of(oid).map(|v| v.to_vec()).unwrap_or_default()
    }
}
