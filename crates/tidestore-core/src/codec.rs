//! Binary record formats for the Tidestore log
//!
//! The file is a 1024-byte metadata block followed by transaction records.
//! All integers are big-endian.
//!
//! Transaction record:
//!   [0..8]   tid
//!   [8..16]  tlen    - bytes after this field, trailer included
//!   [16]     status  - ' ' normal, 'p' packed, 'u' undone, 'c' commit in progress
//!   [17..19] ulen
//!   [19..21] dlen
//!   [21..23] elen
//!   user, description, extension, data records, then tlen again (8 bytes)
//!
//! Data record:
//!   [0..8]   oid
//!   [8..16]  serial  - tid of the enclosing transaction
//!   [16..24] prev    - offset of the previous record for this oid, or 0
//!   [24..32] tloc    - offset of the enclosing transaction
//!   [32..34] vlen
//!   [34..38] nrefs
//!   [38..46] plen
//!   if vlen > 0: pnv(8) vprev(8) name(vlen)
//!   nrefs * 8 reference oids
//!   plen payload bytes, or when plen == 0 an 8-byte back-pointer
//!   (a back-pointer of 0 marks a deleted object)

use crate::error::{StoreError, StoreResult};
use crate::types::{be_u16, be_u32, be_u64, Oid, Tid};

/// Size of the metadata block at the start of every file.
pub const METADATA_LEN: u64 = 1024;

/// File magic: "FS" followed by the format version "43".
pub const MAGIC: [u8; 4] = *b"FS43";

/// Transaction header size in bytes
pub const TXN_HEADER_LEN: usize = 23;

/// Data record header size in bytes
pub const DATA_HEADER_LEN: usize = 46;

/// pnv + vprev, present only for version records
pub const VERSION_PREFIX_LEN: usize = 16;

/// Redundant copy of tlen at the end of each transaction
pub const TRAILER_LEN: usize = 8;

/// Bytes of a transaction record before its tlen-counted region.
pub const TID_AND_TLEN: u64 = 16;

/// Transaction status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxnStatus {
    Normal = b' ',
    Packed = b'p',
    Undone = b'u',
    /// Written at vote, flipped to `Normal` at finish. Seen on open only
    /// after an interrupted commit.
    Checkpoint = b'c',
}

impl TxnStatus {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b' ' => Some(TxnStatus::Normal),
            b'p' => Some(TxnStatus::Packed),
            b'u' => Some(TxnStatus::Undone),
            b'c' => Some(TxnStatus::Checkpoint),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Fixed part of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnHeader {
    pub tid: Tid,
    pub tlen: u64,
    pub status: TxnStatus,
    pub ulen: u16,
    pub dlen: u16,
    pub elen: u16,
}

impl TxnHeader {
    /// tlen of a transaction carrying `meta_len` bytes of user, description
    /// and extension plus `data_len` bytes of data records.
    pub fn tlen_for(meta_len: usize, data_len: u64) -> u64 {
        (TXN_HEADER_LEN as u64 - TID_AND_TLEN) + meta_len as u64 + data_len + TRAILER_LEN as u64
    }

    /// Bytes occupied by the header and its three variable fields.
    pub fn header_len(&self) -> u64 {
        TXN_HEADER_LEN as u64 + self.ulen as u64 + self.dlen as u64 + self.elen as u64
    }

    /// Offset of the first data record for a transaction at `pos`.
    pub fn data_start(&self, pos: u64) -> u64 {
        pos + self.header_len()
    }

    /// Offset of the trailer for a transaction at `pos`.
    pub fn data_end(&self, pos: u64) -> u64 {
        self.end(pos).saturating_sub(TRAILER_LEN as u64)
    }

    /// Offset of the next transaction. Saturates on a damaged `tlen`, so a
    /// bounds check against the file length rejects it.
    pub fn end(&self, pos: u64) -> u64 {
        pos.saturating_add(TID_AND_TLEN).saturating_add(self.tlen)
    }

    /// Smallest tlen that can hold this header's variable fields.
    pub fn min_tlen(&self) -> u64 {
        self.header_len() - TID_AND_TLEN + TRAILER_LEN as u64
    }

    pub fn encode(&self) -> [u8; TXN_HEADER_LEN] {
        let mut buf = [0u8; TXN_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.tid.to_bytes());
        buf[8..16].copy_from_slice(&self.tlen.to_be_bytes());
        buf[16] = self.status.as_byte();
        buf[17..19].copy_from_slice(&self.ulen.to_be_bytes());
        buf[19..21].copy_from_slice(&self.dlen.to_be_bytes());
        buf[21..23].copy_from_slice(&self.elen.to_be_bytes());
        buf
    }

    /// Decode the header stored at file offset `pos`.
    pub fn decode(buf: &[u8], pos: u64) -> StoreResult<Self> {
        if buf.len() < TXN_HEADER_LEN {
            return Err(StoreError::corrupted(
                pos,
                format!("transaction header needs {} bytes, got {}", TXN_HEADER_LEN, buf.len()),
            ));
        }
        let status = TxnStatus::from_byte(buf[16]).ok_or_else(|| {
            StoreError::corrupted(pos, format!("unknown transaction status 0x{:02x}", buf[16]))
        })?;
        let header = TxnHeader {
            tid: Tid(be_u64(buf, 0)),
            tlen: be_u64(buf, 8),
            status,
            ulen: be_u16(buf, 17),
            dlen: be_u16(buf, 19),
            elen: be_u16(buf, 21),
        };
        if header.tlen < header.min_tlen() {
            return Err(StoreError::corrupted(
                pos,
                format!("tlen {} too small for a {}-byte header", header.tlen, header.header_len()),
            ));
        }
        Ok(header)
    }
}

/// Encode a transaction header followed by its user, description and
/// extension fields.
pub fn encode_txn_meta(
    tid: Tid,
    tlen: u64,
    status: TxnStatus,
    user: &[u8],
    description: &[u8],
    extension: &[u8],
) -> StoreResult<Vec<u8>> {
    let field_len = |name: &str, field: &[u8]| -> StoreResult<u16> {
        u16::try_from(field.len())
            .map_err(|_| StoreError::invalid(format!("transaction {} is {} bytes, max 65535", name, field.len())))
    };
    let header = TxnHeader {
        tid,
        tlen,
        status,
        ulen: field_len("user", user)?,
        dlen: field_len("description", description)?,
        elen: field_len("extension", extension)?,
    };
    let mut buf = Vec::with_capacity(header.header_len() as usize);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(user);
    buf.extend_from_slice(description);
    buf.extend_from_slice(extension);
    Ok(buf)
}

/// Fixed part of a data record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub oid: Oid,
    pub serial: Tid,
    pub prev: u64,
    pub tloc: u64,
    pub vlen: u16,
    pub nrefs: u32,
    pub plen: u64,
}

impl DataHeader {
    pub fn decode(buf: &[u8], pos: u64) -> StoreResult<Self> {
        if buf.len() < DATA_HEADER_LEN {
            return Err(StoreError::corrupted(
                pos,
                format!("data header needs {} bytes, got {}", DATA_HEADER_LEN, buf.len()),
            ));
        }
        Ok(DataHeader {
            oid: Oid(be_u64(buf, 0)),
            serial: Tid(be_u64(buf, 8)),
            prev: be_u64(buf, 16),
            tloc: be_u64(buf, 24),
            vlen: be_u16(buf, 32),
            nrefs: be_u32(buf, 34),
            plen: be_u64(buf, 38),
        })
    }

    pub fn encode(&self) -> [u8; DATA_HEADER_LEN] {
        let mut buf = [0u8; DATA_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.oid.to_bytes());
        buf[8..16].copy_from_slice(&self.serial.to_bytes());
        buf[16..24].copy_from_slice(&self.prev.to_be_bytes());
        buf[24..32].copy_from_slice(&self.tloc.to_be_bytes());
        buf[32..34].copy_from_slice(&self.vlen.to_be_bytes());
        buf[34..38].copy_from_slice(&self.nrefs.to_be_bytes());
        buf[38..46].copy_from_slice(&self.plen.to_be_bytes());
        buf
    }

    pub fn in_version(&self) -> bool {
        self.vlen > 0
    }

    /// True when the body is an 8-byte back-pointer instead of a payload.
    pub fn is_backpointer(&self) -> bool {
        self.plen == 0
    }

    /// Bytes of the version prefix and name.
    pub fn version_len(&self) -> u64 {
        if self.vlen > 0 {
            VERSION_PREFIX_LEN as u64 + self.vlen as u64
        } else {
            0
        }
    }

    pub fn refs_offset(&self, pos: u64) -> u64 {
        pos + DATA_HEADER_LEN as u64 + self.version_len()
    }

    /// Offset of the payload or back-pointer for a record at `pos`.
    pub fn body_offset(&self, pos: u64) -> u64 {
        self.refs_offset(pos) + self.nrefs as u64 * 8
    }

    pub fn body_len(&self) -> u64 {
        if self.plen == 0 {
            8
        } else {
            self.plen
        }
    }

    /// Full on-disk length of the record. Saturates when `plen` is damaged.
    pub fn record_len(&self) -> u64 {
        (DATA_HEADER_LEN as u64 + self.version_len() + self.nrefs as u64 * 8).saturating_add(self.body_len())
    }

    /// Fail unless the record at `pos` ends at or before `limit`.
    pub fn check_fits(&self, pos: u64, limit: u64) -> StoreResult<()> {
        if self.record_len() > limit.saturating_sub(pos) {
            return Err(StoreError::corrupted(
                pos,
                format!("record for {} of {} bytes runs past offset {}", self.oid, self.record_len(), limit),
            ));
        }
        Ok(())
    }

    /// Verify that the record at `pos` belongs to the transaction at `tloc`.
    pub fn check_tloc(&self, tloc: u64, pos: u64) -> StoreResult<()> {
        if self.tloc != tloc {
            return Err(StoreError::corrupted(
                pos,
                format!("record for {} claims transaction at {}, found inside {}", self.oid, self.tloc, tloc),
            ));
        }
        Ok(())
    }
}

/// Version part of a version record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionInfo {
    /// Offset of the non-version revision this version record shadows
    pub pnv: u64,
    /// Offset of the previous record written in the same version
    pub vprev: u64,
    pub name: Vec<u8>,
}

impl VersionInfo {
    pub fn decode(buf: &[u8], name_len: usize, pos: u64) -> StoreResult<Self> {
        if buf.len() < VERSION_PREFIX_LEN + name_len {
            return Err(StoreError::corrupted(pos, "truncated version prefix"));
        }
        Ok(VersionInfo {
            pnv: be_u64(buf, 0),
            vprev: be_u64(buf, 8),
            name: buf[VERSION_PREFIX_LEN..VERSION_PREFIX_LEN + name_len].to_vec(),
        })
    }
}

/// What follows the refs of a record being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordBody<'a> {
    Data(&'a [u8]),
    /// Reuse the payload of the record at this offset; 0 deletes the object.
    BackPointer(u64),
}

impl RecordBody<'_> {
    pub const DELETED: RecordBody<'static> = RecordBody::BackPointer(0);
}

/// Everything needed to encode one data record.
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    pub oid: Oid,
    pub serial: Tid,
    pub prev: u64,
    pub tloc: u64,
    /// Empty for trunk records
    pub version: &'a [u8],
    pub pnv: u64,
    pub vprev: u64,
    pub refs: &'a [Oid],
    pub body: RecordBody<'a>,
}

/// Build a complete data record.
pub fn encode_data_record(rec: &NewRecord<'_>) -> StoreResult<Vec<u8>> {
    let vlen = u16::try_from(rec.version.len())
        .map_err(|_| StoreError::invalid(format!("version name is {} bytes, max 65535", rec.version.len())))?;
    let nrefs = u32::try_from(rec.refs.len())
        .map_err(|_| StoreError::invalid(format!("{} references exceed the record limit", rec.refs.len())))?;
    let plen = match rec.body {
        RecordBody::Data(data) if data.is_empty() => {
            return Err(StoreError::invalid("payload must not be empty"));
        }
        RecordBody::Data(data) => data.len() as u64,
        RecordBody::BackPointer(_) => 0,
    };
    let header = DataHeader {
        oid: rec.oid,
        serial: rec.serial,
        prev: rec.prev,
        tloc: rec.tloc,
        vlen,
        nrefs,
        plen,
    };
    let mut buf = Vec::with_capacity(header.record_len() as usize);
    buf.extend_from_slice(&header.encode());
    if vlen > 0 {
        buf.extend_from_slice(&rec.pnv.to_be_bytes());
        buf.extend_from_slice(&rec.vprev.to_be_bytes());
        buf.extend_from_slice(rec.version);
    }
    for oid in rec.refs {
        buf.extend_from_slice(&oid.to_bytes());
    }
    match rec.body {
        RecordBody::Data(data) => buf.extend_from_slice(data),
        RecordBody::BackPointer(target) => buf.extend_from_slice(&target.to_be_bytes()),
    }
    Ok(buf)
}

/// Decode `nrefs` reference oids.
pub fn decode_refs(buf: &[u8], nrefs: u32, pos: u64) -> StoreResult<Vec<Oid>> {
    let need = nrefs as usize * 8;
    if buf.len() < need {
        return Err(StoreError::corrupted(pos, format!("expected {} reference bytes, got {}", need, buf.len())));
    }
    Ok((0..nrefs as usize).map(|i| Oid(be_u64(buf, i * 8))).collect())
}

/// Metadata block written at the start of a new file.
pub fn encode_metadata() -> Vec<u8> {
    let mut block = vec![0u8; METADATA_LEN as usize];
    block[0..4].copy_from_slice(&MAGIC);
    block
}

pub fn check_metadata(buf: &[u8]) -> StoreResult<()> {
    if buf.len() < MAGIC.len() || buf[0..4] != MAGIC {
        let found = &buf[..buf.len().min(4)];
        return Err(StoreError::corrupted(0, format!("bad file magic {:?}", found)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_header_layout() {
        let header = TxnHeader {
            tid: Tid(0x0102),
            tlen: 99,
            status: TxnStatus::Checkpoint,
            ulen: 1,
            dlen: 2,
            elen: 3,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), 23);
        assert_eq!(bytes[16], b'c');
        assert_eq!(TxnHeader::decode(&bytes, 1024).unwrap(), header);
        assert_eq!(header.header_len(), 29);
        assert_eq!(header.end(1024), 1024 + 16 + 99);
        assert_eq!(header.data_end(1024), 1024 + 16 + 99 - 8);
    }

    #[test]
    fn test_tlen_for_empty_txn() {
        let tlen = TxnHeader::tlen_for(0, 0);
        let header = TxnHeader { tid: Tid(1), tlen, status: TxnStatus::Normal, ulen: 0, dlen: 0, elen: 0 };
        assert_eq!(header.data_start(0), header.data_end(0));
        assert_eq!(header.end(0), 31);
    }

    #[test]
    fn test_unknown_status_is_corruption() {
        let mut bytes = TxnHeader {
            tid: Tid(1),
            tlen: 15,
            status: TxnStatus::Normal,
            ulen: 0,
            dlen: 0,
            elen: 0,
        }
        .encode();
        bytes[16] = b'x';
        assert!(TxnHeader::decode(&bytes, 0).unwrap_err().is_corruption());
    }

    #[test]
    fn test_version_record_layout() {
        let refs = [Oid(5), Oid(6)];
        let record = NewRecord {
            oid: Oid(1),
            serial: Tid(9),
            prev: 2000,
            tloc: 1024,
            version: b"v1",
            pnv: 1500,
            vprev: 1800,
            refs: &refs,
            body: RecordBody::Data(b"payload"),
        };
        let bytes = encode_data_record(&record).unwrap();
        let header = DataHeader::decode(&bytes, 0).unwrap();
        assert_eq!(header.vlen, 2);
        assert_eq!(header.nrefs, 2);
        assert_eq!(header.record_len(), bytes.len() as u64);
        assert_eq!(header.body_offset(0), (46 + 16 + 2 + 16) as u64);

        let version = VersionInfo::decode(&bytes[46..], 2, 46).unwrap();
        assert_eq!(version, VersionInfo { pnv: 1500, vprev: 1800, name: b"v1".to_vec() });
        let decoded = decode_refs(&bytes[64..], 2, 64).unwrap();
        assert_eq!(decoded, refs.to_vec());
        assert_eq!(&bytes[80..], b"payload");
    }

    #[test]
    fn test_backpointer_record() {
        let record = NewRecord {
            oid: Oid(3),
            serial: Tid(4),
            prev: 0,
            tloc: 1024,
            version: b"",
            pnv: 0,
            vprev: 0,
            refs: &[],
            body: RecordBody::DELETED,
        };
        let bytes = encode_data_record(&record).unwrap();
        assert_eq!(bytes.len(), 46 + 8);
        let header = DataHeader::decode(&bytes, 0).unwrap();
        assert!(header.is_backpointer());
        assert_eq!(be_u64(&bytes, 46), 0);
    }

    #[test]
    fn test_huge_payload_length_does_not_fit() {
        let header = DataHeader {
            oid: Oid(1),
            serial: Tid(2),
            prev: 0,
            tloc: 1024,
            vlen: 0,
            nrefs: u32::MAX,
            plen: u64::MAX,
        };
        assert_eq!(header.record_len(), u64::MAX);
        assert!(header.check_fits(1063, 4096).unwrap_err().is_corruption());
        assert!(header.check_fits(u64::MAX, u64::MAX).is_err());
    }

    #[test]
    fn test_empty_payload_rejected() {
        let record = NewRecord {
            oid: Oid(3),
            serial: Tid(4),
            prev: 0,
            tloc: 1024,
            version: b"",
            pnv: 0,
            vprev: 0,
            refs: &[],
            body: RecordBody::Data(b""),
        };
        assert!(matches!(encode_data_record(&record), Err(StoreError::InvalidArgument { .. })));
    }

    #[test]
    fn test_check_tloc() {
        let header = DataHeader { oid: Oid(1), serial: Tid(1), prev: 0, tloc: 1024, vlen: 0, nrefs: 0, plen: 1 };
        assert!(header.check_tloc(1024, 1047).is_ok());
        assert!(header.check_tloc(2048, 2071).is_err());
    }

    #[test]
    fn test_metadata() {
        let block = encode_metadata();
        assert_eq!(block.len(), 1024);
        assert!(check_metadata(&block).is_ok());
        assert!(check_metadata(b"XX43").is_err());
    }
}
