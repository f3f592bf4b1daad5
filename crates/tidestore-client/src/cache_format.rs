//! Binary format of the client cache file
//!
//! The file is a fixed header followed by the ring. The ring is tiled by
//! self-describing blocks so that it can be rebuilt by a linear scan:
//! allocated entries (`'a'`), free blocks (`'f'`), and gaps too small to hold
//! a free-block header (a single byte `'1'..='8'` giving their length).
//!
//! All integers are big-endian.

use std::path::PathBuf;

use tidestore_core::{Oid, Tid};

use crate::error::{ClientError, ClientResult};

/// Magic bytes identifying a cache file: "TSC1"
pub const MAGIC: [u8; 4] = *b"TSC1";

/// Header size in bytes, also the offset of the first ring block
///
/// Layout:
///   [0..4]   magic:          "TSC1"
///   [4..12]  last_tid:       u64 - newest transaction the cache reflects
///   [12..20] cache_size:     u64 - total file size
///   [20..28] current_offset: u64 - next write position in the ring
///   [28..32] reserved
pub const HEADER_LEN: u64 = 32;

/// Allocated entry header size
///
/// Layout:
///   [0]      tag:       'a'
///   [1..9]   size:      u64 - whole block, header included
///   [9..17]  oid:       u64
///   [17..25] start_tid: u64
///   [25..33] end_tid:   u64 - 0 while the revision is current
///   [33..37] plen:      u32
///   [37..41] checksum:  u32 - CRC32C of the payload
pub const ENTRY_HEADER_LEN: u64 = 41;

/// Offset of `end_tid` within an entry, rewritten in place on invalidation
pub const END_TID_OFFSET: u64 = 25;

/// Free block header: tag `'f'` and u64 size
pub const FREE_HEADER_LEN: u64 = 9;

/// Smallest cache file accepted
pub const MIN_CACHE_SIZE: u64 = HEADER_LEN + 1024;

pub const TAG_ALLOCATED: u8 = b'a';
pub const TAG_FREE: u8 = b'f';

/// Decoded cache file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheHeader {
    pub last_tid: Tid,
    pub cache_size: u64,
    pub current_offset: u64,
}

impl CacheHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..12].copy_from_slice(&self.last_tid.to_bytes());
        buf[12..20].copy_from_slice(&self.cache_size.to_be_bytes());
        buf[20..28].copy_from_slice(&self.current_offset.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> ClientResult<Self> {
        if buf.len() < HEADER_LEN as usize {
            return Err(corrupt(0, format!("header needs {} bytes, got {}", HEADER_LEN, buf.len())));
        }
        if buf[0..4] != MAGIC {
            return Err(corrupt(0, format!("bad cache magic {:?}", &buf[0..4])));
        }
        Ok(CacheHeader {
            last_tid: Tid(be_u64(buf, 4)),
            cache_size: be_u64(buf, 12),
            current_offset: be_u64(buf, 20),
        })
    }
}

/// Header of an allocated entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub size: u64,
    pub oid: Oid,
    pub start_tid: Tid,
    /// `Tid::ZERO` while current
    pub end_tid: Tid,
    pub plen: u32,
    pub checksum: u32,
}

impl EntryHeader {
    /// Header for `payload`, valid from `start_tid` until `end_tid`.
    pub fn for_payload(oid: Oid, start_tid: Tid, end_tid: Tid, payload: &[u8]) -> ClientResult<Self> {
        let plen = u32::try_from(payload.len())
            .map_err(|_| ClientError::protocol(format!("payload of {} bytes is too large to cache", payload.len())))?;
        Ok(EntryHeader {
            size: entry_size(payload.len()),
            oid,
            start_tid,
            end_tid,
            plen,
            checksum: crc32c::crc32c(payload),
        })
    }

    pub fn encode(&self) -> [u8; ENTRY_HEADER_LEN as usize] {
        let mut buf = [0u8; ENTRY_HEADER_LEN as usize];
        buf[0] = TAG_ALLOCATED;
        buf[1..9].copy_from_slice(&self.size.to_be_bytes());
        buf[9..17].copy_from_slice(&self.oid.to_bytes());
        buf[17..25].copy_from_slice(&self.start_tid.to_bytes());
        buf[25..33].copy_from_slice(&self.end_tid.to_bytes());
        buf[33..37].copy_from_slice(&self.plen.to_be_bytes());
        buf[37..41].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Decode an entry header found at ring offset `offset`.
    pub fn decode(buf: &[u8], offset: u64) -> ClientResult<Self> {
        if buf.len() < ENTRY_HEADER_LEN as usize || buf[0] != TAG_ALLOCATED {
            return Err(corrupt(offset, "not an allocated entry"));
        }
        let header = EntryHeader {
            size: be_u64(buf, 1),
            oid: Oid(be_u64(buf, 9)),
            start_tid: Tid(be_u64(buf, 17)),
            end_tid: Tid(be_u64(buf, 25)),
            plen: u32::from_be_bytes([buf[33], buf[34], buf[35], buf[36]]),
            checksum: u32::from_be_bytes([buf[37], buf[38], buf[39], buf[40]]),
        };
        if header.size != entry_size(header.plen as usize) {
            return Err(corrupt(offset, format!("entry size {} does not match payload length {}", header.size, header.plen)));
        }
        if !header.end_tid.is_zero() && header.end_tid <= header.start_tid {
            return Err(corrupt(offset, format!("entry range {}..{} is empty", header.start_tid, header.end_tid)));
        }
        Ok(header)
    }

    /// Check `payload` against the stored checksum.
    pub fn verify(&self, payload: &[u8]) -> bool {
        payload.len() == self.plen as usize && crc32c::crc32c(payload) == self.checksum
    }
}

/// On-disk size of an entry carrying `plen` payload bytes.
pub fn entry_size(plen: usize) -> u64 {
    ENTRY_HEADER_LEN + plen as u64
}

/// Bytes marking `size` bytes of the ring as unused.
///
/// Only the marker is returned; the rest of the block keeps whatever bytes
/// it held before.
pub fn free_marker(size: u64) -> Vec<u8> {
    if size >= FREE_HEADER_LEN {
        let mut buf = Vec::with_capacity(FREE_HEADER_LEN as usize);
        buf.push(TAG_FREE);
        buf.extend_from_slice(&size.to_be_bytes());
        buf
    } else {
        vec![b'0' + size as u8]
    }
}

/// What the scan found at one ring offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Allocated,
    Free(u64),
}

/// Classify the block starting with `buf` (at least `FREE_HEADER_LEN` bytes
/// unless the ring ends sooner).
pub fn block_kind(buf: &[u8], offset: u64) -> ClientResult<BlockKind> {
    match buf.first() {
        Some(&TAG_ALLOCATED) => Ok(BlockKind::Allocated),
        Some(&TAG_FREE) if buf.len() >= FREE_HEADER_LEN as usize => {
            let size = be_u64(buf, 1);
            if size < FREE_HEADER_LEN {
                return Err(corrupt(offset, format!("free block of {} bytes", size)));
            }
            Ok(BlockKind::Free(size))
        }
        Some(&tag) if (b'1'..=b'8').contains(&tag) => Ok(BlockKind::Free((tag - b'0') as u64)),
        Some(&tag) => Err(corrupt(offset, format!("unknown block tag 0x{:02x}", tag))),
        None => Err(corrupt(offset, "ring ends inside a block header")),
    }
}

fn be_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

fn corrupt(offset: u64, reason: impl Into<String>) -> ClientError {
    ClientError::CacheCorrupt { path: PathBuf::from("<buffer>"), offset, reason: reason.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = CacheHeader { last_tid: Tid(99), cache_size: 4096, current_offset: 700 };
        assert_eq!(CacheHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = CacheHeader { last_tid: Tid(1), cache_size: 4096, current_offset: 32 }.encode();
        buf[0] = b'X';
        assert!(matches!(CacheHeader::decode(&buf), Err(ClientError::CacheCorrupt { .. })));
    }

    #[test]
    fn test_entry_header_and_checksum() {
        let payload = b"revision bytes";
        let header = EntryHeader::for_payload(Oid(5), Tid(10), Tid::ZERO, payload).unwrap();
        assert_eq!(header.size, ENTRY_HEADER_LEN + payload.len() as u64);
        let decoded = EntryHeader::decode(&header.encode(), 32).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.verify(payload));
        assert!(!decoded.verify(b"revision bytez"));
    }

    #[test]
    fn test_inverted_range_is_corrupt() {
        let header = EntryHeader::for_payload(Oid(5), Tid(10), Tid(10), b"x").unwrap();
        assert!(EntryHeader::decode(&header.encode(), 32).is_err());
    }

    #[test]
    fn test_free_markers() {
        assert_eq!(free_marker(3), vec![b'3']);
        assert_eq!(block_kind(&free_marker(3), 0).unwrap(), BlockKind::Free(3));
        let big = free_marker(500);
        assert_eq!(big.len(), FREE_HEADER_LEN as usize);
        assert_eq!(block_kind(&big, 0).unwrap(), BlockKind::Free(500));
        assert!(block_kind(&[b'z'], 0).is_err());
    }
}
