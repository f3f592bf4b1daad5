//! In-memory indexes rebuilt from a forward scan of the log
//!
//! There is no separate index file: the log is authoritative and every open
//! replays it. The scan doubles as crash recovery. An interrupted commit
//! (status `'c'`), a transaction running past end-of-file, or a trailer that
//! does not repeat `tlen` marks the point where the file is truncated.

use std::collections::BTreeSet;

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::codec::{check_metadata, TxnStatus, METADATA_LEN, TXN_HEADER_LEN};
use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};
use crate::iterator::{check_trailer, read_transaction, read_txn_header, ReadMode, TransactionRecord};
use crate::logfile::LogFile;
use crate::types::{Oid, Tid};

/// Object id to offset of its current data record.
#[derive(Debug, Clone, Default)]
pub struct FsIndex {
    map: HashMap<Oid, u64>,
}

impl FsIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, oid: Oid) -> Option<u64> {
        self.map.get(&oid).copied()
    }

    pub fn insert(&mut self, oid: Oid, pos: u64) {
        self.map.insert(oid, pos);
    }

    pub fn contains(&self, oid: Oid) -> bool {
        self.map.contains_key(&oid)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Oid, u64)> + '_ {
        self.map.iter().map(|(oid, pos)| (*oid, *pos))
    }

    /// Fold a finished transaction's index into this one.
    pub fn merge(&mut self, tindex: &FsIndex) {
        self.map.extend(tindex.map.iter().map(|(oid, pos)| (*oid, *pos)));
    }
}

/// Which objects are held in which version.
#[derive(Debug, Clone, Default)]
pub struct VersionIndex {
    members: HashMap<Vec<u8>, BTreeSet<Oid>>,
    /// Offset of the newest record in each version, the next record's `vprev`.
    heads: HashMap<Vec<u8>, u64>,
    locked: HashMap<Oid, Vec<u8>>,
}

impl VersionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a record of `oid` in `version` (empty for trunk) at `pos`.
    pub fn record(&mut self, oid: Oid, version: &[u8], pos: u64) {
        if let Some(old) = self.locked.get(&oid) {
            if old.as_slice() != version {
                let old = old.clone();
                self.release(oid, &old);
            }
        }
        if version.is_empty() {
            self.locked.remove(&oid);
            return;
        }
        self.members.entry(version.to_vec()).or_default().insert(oid);
        self.heads.insert(version.to_vec(), pos);
        self.locked.insert(oid, version.to_vec());
    }

    fn release(&mut self, oid: Oid, version: &[u8]) {
        if let Some(set) = self.members.get_mut(version) {
            set.remove(&oid);
            if set.is_empty() {
                self.members.remove(version);
                self.heads.remove(version);
            }
        }
        self.locked.remove(&oid);
    }

    /// Version currently holding `oid`, if any.
    pub fn version_of(&self, oid: Oid) -> Option<&[u8]> {
        self.locked.get(&oid).map(|v| v.as_slice())
    }

    /// Objects in `version`, ascending.
    pub fn members(&self, version: &[u8]) -> Vec<Oid> {
        self.members.get(version).map(|set| set.iter().copied().collect()).unwrap_or_default()
    }

    pub fn head(&self, version: &[u8]) -> u64 {
        self.heads.get(version).copied().unwrap_or(0)
    }

    pub fn is_empty(&self, version: &[u8]) -> bool {
        !self.members.contains_key(version)
    }

    /// Names of non-empty versions, sorted.
    pub fn versions(&self) -> Vec<Vec<u8>> {
        let mut names: Vec<Vec<u8>> = self.members.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Result of scanning a log.
#[derive(Debug, Default)]
pub struct IndexScan {
    pub index: FsIndex,
    pub vindex: VersionIndex,
    pub last_tid: Tid,
    pub max_oid: Oid,
    /// Offset just past the last committed transaction.
    pub end: u64,
    /// Where a damaged or interrupted tail began, if one was found.
    pub truncated_at: Option<u64>,
    pub txn_count: usize,
}

/// Rebuild the indexes by replaying `log` from the first transaction.
///
/// Damaged tails are truncated when `config.recover` is set (and only
/// logically when the storage is read-only). An interrupted commit is always
/// dropped.
pub fn read_index(log: &LogFile, config: &StorageConfig) -> StoreResult<IndexScan> {
    let file_len = log.len()?;
    if file_len < METADATA_LEN {
        return Err(StoreError::CorruptedData {
            path: log.path().to_path_buf(),
            offset: 0,
            reason: format!("file is {} bytes, shorter than its metadata block", file_len),
        });
    }
    let meta = log.read_at(0, 4)?;
    check_metadata(&meta).map_err(|e| e.in_file(log.path()))?;

    let mut scan = IndexScan { end: METADATA_LEN, ..IndexScan::default() };
    let mut pos = METADATA_LEN;

    while pos < file_len {
        if pos + TXN_HEADER_LEN as u64 > file_len {
            damaged(log, config, &mut scan, pos, "incomplete transaction header")?;
            break;
        }
        let header = match read_txn_header(log, pos) {
            Ok(header) => header,
            Err(e) if e.is_corruption() => {
                damaged(log, config, &mut scan, pos, &e.to_string())?;
                break;
            }
            Err(e) => return Err(e),
        };
        // An interrupted commit may also be cut short, so this comes before
        // the length check.
        if header.status == TxnStatus::Checkpoint {
            info!(path = %log.path().display(), pos, tid = %header.tid, "dropping interrupted commit");
            scan.truncated_at = Some(pos);
            if !config.read_only {
                log.truncate(pos)?;
            }
            break;
        }
        if header.end(pos) > file_len {
            damaged(log, config, &mut scan, pos, "transaction extends past end of file")?;
            break;
        }
        if header.tid <= scan.last_tid {
            let reason = format!("{} does not follow {}", header.tid, scan.last_tid);
            damaged(log, config, &mut scan, pos, &reason)?;
            break;
        }
        if !check_trailer(log, pos, &header)? {
            damaged(log, config, &mut scan, pos, "trailer does not repeat tlen")?;
            break;
        }
        let txn = match read_transaction(log, pos, ReadMode::HeadersOnly) {
            Ok(txn) => txn,
            Err(e) if is_damage(&e) => {
                damaged(log, config, &mut scan, pos, &e.to_string())?;
                break;
            }
            Err(e) => return Err(e),
        };
        check_prev_pointers(log, config, &scan.index, &txn)?;

        for record in &txn.records {
            scan.index.insert(record.oid(), record.pos);
            scan.vindex.record(record.oid(), record.version_name(), record.pos);
            if record.oid() > scan.max_oid {
                scan.max_oid = record.oid();
            }
        }
        scan.last_tid = header.tid;
        scan.txn_count += 1;
        pos = header.end(pos);
        scan.end = pos;
    }

    debug!(
        path = %log.path().display(),
        transactions = scan.txn_count,
        objects = scan.index.len(),
        end = scan.end,
        "index rebuilt"
    );
    Ok(scan)
}

fn is_damage(e: &StoreError) -> bool {
    match e {
        StoreError::CorruptedData { .. } => true,
        StoreError::Io { kind, .. } => *kind == std::io::ErrorKind::UnexpectedEof,
        _ => false,
    }
}

// Every record's prev must be the object's current record before this
// transaction. Stores, undo and version operations all chain to the
// committed index, never to an earlier record of the same transaction.
fn check_prev_pointers(
    log: &LogFile,
    config: &StorageConfig,
    index: &FsIndex,
    txn: &TransactionRecord,
) -> StoreResult<()> {
    for record in &txn.records {
        let expected = index.get(record.oid()).unwrap_or(0);
        if record.prev() == expected {
            continue;
        }
        if config.strict_prev_check {
            return Err(StoreError::CorruptedData {
                path: log.path().to_path_buf(),
                offset: record.pos,
                reason: format!("{} has prev {} but index says {}", record.oid(), record.prev(), expected),
            });
        }
        warn!(
            path = %log.path().display(),
            oid = %record.oid(),
            pos = record.pos,
            prev = record.prev(),
            expected,
            "inconsistent prev pointer"
        );
    }
    Ok(())
}

fn damaged(log: &LogFile, config: &StorageConfig, scan: &mut IndexScan, pos: u64, reason: &str) -> StoreResult<()> {
    if !config.recover {
        return Err(StoreError::CorruptedData {
            path: log.path().to_path_buf(),
            offset: pos,
            reason: reason.to_string(),
        });
    }
    warn!(path = %log.path().display(), pos, reason, "truncating damaged tail");
    scan.truncated_at = Some(pos);
    if !config.read_only {
        log.truncate(pos)?;
    }
    Ok(())
}
