//! The storage capability set
//!
//! Everything the application (or a transaction manager) may ask of a
//! storage, independent of whether the storage is a local file or a client
//! talking to a remote server.

use std::fmt;
use std::sync::Arc;

use crate::commit_lock::new_ticket;
use crate::error::StoreResult;
use crate::types::{Oid, Tid};

/// Token identifying one transaction across `tpc_*` calls.
///
/// Two tokens are the same transaction iff their ids match; cloning keeps
/// the id.
#[derive(Clone)]
pub struct Transaction {
    id: u64,
    user: Vec<u8>,
    description: Vec<u8>,
    extension: Vec<u8>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::with_meta(b"", b"")
    }

    pub fn with_meta(user: &[u8], description: &[u8]) -> Self {
        Self { id: new_ticket(), user: user.to_vec(), description: description.to_vec(), extension: Vec::new() }
    }

    /// Attach opaque extension bytes stored with the transaction header.
    pub fn with_extension(mut self, extension: &[u8]) -> Self {
        self.extension = extension.to_vec();
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> &[u8] {
        &self.user
    }

    pub fn description(&self) -> &[u8] {
        &self.description
    }

    pub fn extension(&self) -> &[u8] {
        &self.extension
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("user", &String::from_utf8_lossy(&self.user))
            .field("description", &String::from_utf8_lossy(&self.description))
            .finish()
    }
}

/// A revision returned by `load_before`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub data: Vec<u8>,
    /// Serial of the revision
    pub start_tid: Tid,
    /// Serial of the next revision, `None` if this one is current
    pub end_tid: Option<Tid>,
}

/// One entry of `undo_log`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionDescription {
    pub tid: Tid,
    /// Commit time in Unix seconds
    pub time: f64,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub extension: Vec<u8>,
    /// Bytes occupied in the log
    pub size: u64,
}

/// One entry of `history`.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionInfo {
    pub serial: Tid,
    pub time: f64,
    pub user: Vec<u8>,
    pub description: Vec<u8>,
    pub version: Vec<u8>,
    /// Payload size, 0 for a deletion
    pub size: u64,
}

/// Predicate applied to `undo_log` entries.
pub type UndoFilter = dyn Fn(&TransactionDescription) -> bool;

/// Extracts the oids referenced from a payload, used by pack to find what
/// is reachable from the root.
pub type ReferencesFn = dyn Fn(&[u8]) -> Vec<Oid> + Send + Sync;

/// Application-level resolution of write conflicts.
pub trait ConflictResolver: Send + Sync {
    /// Merge `new` (written against `old`) with `committed`. `None` means the
    /// conflict stands.
    fn resolve(&self, oid: Oid, old: &[u8], committed: &[u8], new: &[u8]) -> Option<Vec<u8>>;
}

/// Receiver of the objects changed by each committed transaction.
pub trait InvalidationSink: Send + Sync {
    /// Called after the transaction is durable and before its tid becomes
    /// visible through `last_transaction`. `origin` is the committing
    /// transaction's id.
    fn invalidate(&self, tid: Tid, oids: &[(Oid, Vec<u8>)], origin: u64);
}

/// Shared storage handle.
pub type SharedStorage = Arc<dyn Storage>;

/// Operations every storage supports.
pub trait Storage: Send + Sync {
    fn name(&self) -> String;

    /// Allocate a fresh object id.
    fn new_oid(&self) -> StoreResult<Oid>;

    /// Newest revision visible in `version` (empty for trunk) and its serial.
    fn load(&self, oid: Oid, version: &[u8]) -> StoreResult<(Vec<u8>, Tid)>;

    fn load_serial(&self, oid: Oid, serial: Tid) -> StoreResult<Vec<u8>>;

    /// Revision valid just before `tid`, or `None` if the object did not
    /// exist then.
    fn load_before(&self, oid: Oid, tid: Tid) -> StoreResult<Option<Revision>>;

    /// Stage a new revision. `serial` is the revision the data was derived
    /// from. Returns the serial the new revision will carry.
    fn store(&self, oid: Oid, serial: Tid, data: &[u8], version: &[u8], txn: &Transaction) -> StoreResult<Tid>;

    fn tpc_begin(&self, txn: &Transaction) -> StoreResult<()>;
    fn tpc_vote(&self, txn: &Transaction) -> StoreResult<()>;
    fn tpc_finish(&self, txn: &Transaction) -> StoreResult<Tid>;
    fn tpc_abort(&self, txn: &Transaction) -> StoreResult<()>;

    /// Undoable transactions, newest first. Returns entries `first..last`;
    /// a negative `last` means `-last` entries starting at `first`.
    fn undo_log(&self, first: usize, last: i64, filter: Option<&UndoFilter>) -> StoreResult<Vec<TransactionDescription>>;

    fn undo(&self, tid: Tid, txn: &Transaction) -> StoreResult<Vec<Oid>>;

    /// Remove history older than `cutoff` (Unix seconds) that is not needed
    /// to serve current reads.
    fn pack(&self, cutoff: f64) -> StoreResult<()>;

    fn versions(&self, max: Option<usize>) -> StoreResult<Vec<Vec<u8>>>;
    fn version_empty(&self, version: &[u8]) -> StoreResult<bool>;
    fn abort_version(&self, version: &[u8], txn: &Transaction) -> StoreResult<Vec<Oid>>;
    fn commit_version(&self, src: &[u8], dest: &[u8], txn: &Transaction) -> StoreResult<Vec<Oid>>;

    fn last_transaction(&self) -> Tid;
}
