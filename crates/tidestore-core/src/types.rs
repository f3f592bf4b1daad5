//! Identifier types shared by every Tidestore component
//!
//! Object and transaction identifiers are 8-byte values stored big-endian on
//! disk, so their byte order and their numeric order agree.

use std::fmt;

/// Object identifier.
///
/// Allocated monotonically by the storage. `Oid::ROOT` (all zero bytes) is
/// reserved for the root object of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Oid(pub u64);

impl Oid {
    /// The root object.
    pub const ROOT: Oid = Oid(0);

    /// Big-endian on-disk representation.
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Oid(u64::from_be_bytes(bytes))
    }

    /// The identifier allocated after this one.
    pub fn next(self) -> Oid {
        Oid(self.0 + 1)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid 0x{:016x}", self.0)
    }
}

/// Transaction identifier, doubling as the serial of every revision written
/// by that transaction.
///
/// The value is a packed wall-clock timestamp (see [`crate::timestamp`]).
/// `Tid::ZERO` stands for "no transaction" (an object's serial before it was
/// first stored, or "no upper bound" for current cache entries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tid(pub u64);

impl Tid {
    pub const ZERO: Tid = Tid(0);

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Tid(u64::from_be_bytes(bytes))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Smallest identifier strictly greater than this one.
    pub fn successor(self) -> Tid {
        Tid(self.0 + 1)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid 0x{:016x}", self.0)
    }
}

/// Read a big-endian u64 at `at`. Callers check the slice length first.
pub(crate) fn be_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

pub(crate) fn be_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(bytes)
}

pub(crate) fn be_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_order_matches_numeric_order() {
        let a = Oid(0x01_00);
        let b = Oid(0x00_ff);
        assert!(a > b);
        assert!(a.to_bytes() > b.to_bytes());
    }

    #[test]
    fn test_display() {
        assert_eq!(Oid::ROOT.to_string(), "oid 0x0000000000000000");
        assert_eq!(Tid(255).to_string(), "tid 0x00000000000000ff");
    }

    #[test]
    fn test_be_readers() {
        let buf = [0u8, 0, 0, 0, 0, 0, 1, 2, 0xAB, 0xCD];
        assert_eq!(be_u64(&buf, 0), 0x0102);
        assert_eq!(be_u16(&buf, 8), 0xABCD);
        assert_eq!(be_u32(&buf, 4), 0x0000_0102);
    }
}
