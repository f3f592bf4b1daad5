//! Reading transactions and data records back out of the log
//!
//! Used by the index scan at open, by pack, by undo, and by anyone who wants
//! to walk committed history in file order.

use std::sync::Arc;

use crate::codec::{
    decode_refs, DataHeader, TxnHeader, TxnStatus, VersionInfo, DATA_HEADER_LEN, TRAILER_LEN, TXN_HEADER_LEN,
    VERSION_PREFIX_LEN,
};
use crate::error::{StoreError, StoreResult};
use crate::logfile::LogFile;
use crate::types::{be_u64, Oid, Tid};

/// How much of each data record to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Headers, version info, refs and payload.
    Full,
    /// Everything except payload bytes. Back-pointers are still read.
    HeadersOnly,
}

/// Body of a data record as read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    Payload(Vec<u8>),
    BackPointer(u64),
    /// Payload present on disk but not loaded (`ReadMode::HeadersOnly`).
    Unread,
}

/// One data record and its position in the file.
#[derive(Debug, Clone)]
pub struct DataRecord {
    pub pos: u64,
    pub header: DataHeader,
    /// Present iff the record belongs to a version.
    pub version: Option<VersionInfo>,
    pub refs: Vec<Oid>,
    pub data: RecordData,
}

impl DataRecord {
    pub fn oid(&self) -> Oid {
        self.header.oid
    }

    pub fn serial(&self) -> Tid {
        self.header.serial
    }

    pub fn prev(&self) -> u64 {
        self.header.prev
    }

    /// Version name, empty for trunk records.
    pub fn version_name(&self) -> &[u8] {
        self.version.as_ref().map(|v| v.name.as_slice()).unwrap_or(&[])
    }

    pub fn pnv(&self) -> u64 {
        self.version.as_ref().map(|v| v.pnv).unwrap_or(0)
    }

    pub fn vprev(&self) -> u64 {
        self.version.as_ref().map(|v| v.vprev).unwrap_or(0)
    }

    /// Back-pointer target, if the record has no payload of its own.
    pub fn backpointer(&self) -> Option<u64> {
        match self.data {
            RecordData::BackPointer(target) => Some(target),
            _ => None,
        }
    }

    /// A back-pointer of zero: the object does not exist from here on.
    pub fn is_deletion(&self) -> bool {
        self.backpointer() == Some(0)
    }

    /// Offset just past this record.
    pub fn end(&self) -> u64 {
        self.pos.saturating_add(self.header.record_len())
    }
}

/// One transaction with its data records.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    pub pos: u64,
    pub header: TxnHeader,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
    pub records: Vec<DataRecord>,
}

impl TransactionRecord {
    pub fn tid(&self) -> Tid {
        self.header.tid
    }

    pub fn status(&self) -> TxnStatus {
        self.header.status
    }

    /// Offset of the next transaction.
    pub fn end(&self) -> u64 {
        self.header.end(self.pos)
    }
}

pub fn read_txn_header(log: &LogFile, pos: u64) -> StoreResult<TxnHeader> {
    let mut buf = [0u8; TXN_HEADER_LEN];
    log.read_exact_at(&mut buf, pos)?;
    TxnHeader::decode(&buf, pos).map_err(|e| e.in_file(log.path()))
}

pub fn read_data_header(log: &LogFile, pos: u64) -> StoreResult<DataHeader> {
    let mut buf = [0u8; DATA_HEADER_LEN];
    log.read_exact_at(&mut buf, pos)?;
    DataHeader::decode(&buf, pos).map_err(|e| e.in_file(log.path()))
}

/// Read the data record at `pos`, which must end at or before `limit`.
pub fn read_data_record(log: &LogFile, pos: u64, limit: u64, mode: ReadMode) -> StoreResult<DataRecord> {
    let header = read_data_header(log, pos)?;
    header.check_fits(pos, limit).map_err(|e| e.in_file(log.path()))?;
    let meta_len = (header.version_len() + header.nrefs as u64 * 8) as usize;
    let load_body = mode == ReadMode::Full || header.is_backpointer();
    let tail_len = if load_body { meta_len + header.body_len() as usize } else { meta_len };
    let tail = log.read_at(pos + DATA_HEADER_LEN as u64, tail_len)?;

    let decode = || -> StoreResult<DataRecord> {
        let version = if header.in_version() {
            Some(VersionInfo::decode(&tail, header.vlen as usize, pos + DATA_HEADER_LEN as u64)?)
        } else {
            None
        };
        let refs_at = header.version_len() as usize;
        let refs = decode_refs(&tail[refs_at..], header.nrefs, header.refs_offset(pos))?;
        let data = if !load_body {
            RecordData::Unread
        } else if header.is_backpointer() {
            RecordData::BackPointer(be_u64(&tail, meta_len))
        } else {
            RecordData::Payload(tail[meta_len..].to_vec())
        };
        Ok(DataRecord { pos, header, version, refs, data })
    };
    decode().map_err(|e| e.in_file(log.path()))
}

/// Read a whole transaction at `pos`, checking every record's `tloc` and
/// that the records exactly fill the space before the trailer.
pub fn read_transaction(log: &LogFile, pos: u64, mode: ReadMode) -> StoreResult<TransactionRecord> {
    let header = read_txn_header(log, pos)?;
    let meta_len = (header.ulen as usize) + (header.dlen as usize) + (header.elen as usize);
    let meta = log.read_at(pos + TXN_HEADER_LEN as u64, meta_len)?;
    let (user, rest) = meta.split_at(header.ulen as usize);
    let (description, extension) = rest.split_at(header.dlen as usize);

    let data_end = header.data_end(pos);
    let mut records = Vec::new();
    let mut at = header.data_start(pos);
    while at < data_end {
        let record = read_data_record(log, at, data_end, mode)?;
        record.header.check_tloc(pos, at).map_err(|e| e.in_file(log.path()))?;
        if record.header.serial != header.tid {
            return Err(StoreError::CorruptedData {
                path: log.path().to_path_buf(),
                offset: at,
                reason: format!("record serial {} differs from transaction {}", record.header.serial, header.tid),
            });
        }
        at = record.end();
        records.push(record);
    }
    if at != data_end {
        return Err(StoreError::CorruptedData {
            path: log.path().to_path_buf(),
            offset: at,
            reason: format!("data records overrun the trailer at {}", data_end),
        });
    }

    Ok(TransactionRecord {
        pos,
        header,
        user: user.to_vec(),
        description: description.to_vec(),
        extension: extension.to_vec(),
        records,
    })
}

/// Read the trailer and confirm it repeats tlen.
pub fn check_trailer(log: &LogFile, pos: u64, header: &TxnHeader) -> StoreResult<bool> {
    let trailer = log.read_u64_at(header.end(pos) - TRAILER_LEN as u64)?;
    Ok(trailer == header.tlen)
}

/// Offset of the transaction that ends at `end`, found through its trailer.
pub fn previous_transaction(log: &LogFile, end: u64) -> StoreResult<u64> {
    let tlen = log.read_u64_at(end - TRAILER_LEN as u64)?;
    let pos = tlen
        .checked_add(crate::codec::TID_AND_TLEN)
        .and_then(|len| end.checked_sub(len))
        .ok_or_else(|| StoreError::CorruptedData {
            path: log.path().to_path_buf(),
            offset: end,
            reason: format!("trailer tlen {} points before the start of the file", tlen),
        })?;
    Ok(pos)
}

/// Follow back-pointers from the record at `pos` to its effective payload.
///
/// Returns `None` when the chain ends in a deletion marker. A chain longer
/// than `max_hops` is treated as a cycle.
pub fn resolve_payload(log: &LogFile, pos: u64, max_hops: usize) -> StoreResult<Option<Vec<u8>>> {
    let file_len = log.len()?;
    let mut at = pos;
    for _ in 0..=max_hops {
        let header = read_data_header(log, at)?;
        header.check_fits(at, file_len).map_err(|e| e.in_file(log.path()))?;
        let body = header.body_offset(at);
        if !header.is_backpointer() {
            return log.read_at(body, header.plen as usize).map(Some);
        }
        let target = log.read_u64_at(body)?;
        if target == 0 {
            return Ok(None);
        }
        at = target;
    }
    Err(StoreError::CorruptedData {
        path: log.path().to_path_buf(),
        offset: pos,
        reason: format!("back-pointer chain longer than {} hops", max_hops),
    })
}

/// Offset of the record holding the payload reached from `pos`, or 0 when
/// the chain ends in a deletion.
pub fn payload_pos(log: &LogFile, pos: u64, max_hops: usize) -> StoreResult<u64> {
    let mut at = pos;
    for _ in 0..=max_hops {
        let header = read_data_header(log, at)?;
        if !header.is_backpointer() {
            return Ok(at);
        }
        at = log.read_u64_at(header.body_offset(at))?;
        if at == 0 {
            return Ok(0);
        }
    }
    Err(StoreError::CorruptedData {
        path: log.path().to_path_buf(),
        offset: pos,
        reason: format!("back-pointer chain longer than {} hops", max_hops),
    })
}

/// Read only the version prefix of a version record.
pub fn read_version_info(log: &LogFile, pos: u64, header: &DataHeader) -> StoreResult<Option<VersionInfo>> {
    if !header.in_version() {
        return Ok(None);
    }
    let buf = log.read_at(pos + DATA_HEADER_LEN as u64, VERSION_PREFIX_LEN + header.vlen as usize)?;
    VersionInfo::decode(&buf, header.vlen as usize, pos + DATA_HEADER_LEN as u64)
        .map(Some)
        .map_err(|e| e.in_file(log.path()))
}

/// Iterator over committed transactions in file order.
pub struct TransactionIterator {
    log: Arc<LogFile>,
    pos: u64,
    end: u64,
    start: Option<Tid>,
    stop: Option<Tid>,
    mode: ReadMode,
    failed: bool,
}

impl TransactionIterator {
    /// Walk transactions from `pos` up to the committed end `end`, yielding
    /// those with `start <= tid <= stop`.
    pub fn new(log: Arc<LogFile>, pos: u64, end: u64, start: Option<Tid>, stop: Option<Tid>, mode: ReadMode) -> Self {
        Self { log, pos, end, start, stop, mode, failed: false }
    }
}

impl Iterator for TransactionIterator {
    type Item = StoreResult<TransactionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.failed && self.pos < self.end {
            let header = match read_txn_header(&self.log, self.pos) {
                Ok(header) => header,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            };
            if self.stop.map_or(false, |stop| header.tid > stop) {
                self.pos = self.end;
                return None;
            }
            let pos = self.pos;
            self.pos = header.end(pos);
            if self.start.map_or(false, |start| header.tid < start) {
                continue;
            }
            let result = read_transaction(&self.log, pos, self.mode);
            if result.is_err() {
                self.failed = true;
            }
            return Some(result);
        }
        None
    }
}
