//! Tidestore Core: Append-Only Transactional Object Storage
//!
//! Objects are opaque byte payloads named by 8-byte object ids. Every
//! committed transaction is appended to a single log file and never
//! rewritten, so every past revision stays loadable until a pack removes it.
//!
//! # Architecture
//!
//! - **Read path**: in-memory index from object id to its current record,
//!   then positional reads from the log
//! - **Write path**: two-phase commit behind a FIFO commit lock; records are
//!   staged in a scratch file and appended at vote
//! - **Recovery**: the index is rebuilt at open by replaying the log; an
//!   interrupted commit or torn tail is truncated away
//! - **History**: `load_before` time travel, transactional undo, versions
//!   (long-lived branches), and online pack
//!
//! The engine is payload-agnostic. Anything that needs to look inside a
//! payload (conflict resolution, pack reachability) is supplied by the
//! caller.

pub mod api;
pub mod codec;
pub mod commit_lock;
pub mod config;
pub mod durability;
pub mod error;
pub mod index;
pub mod iterator;
pub mod logfile;
pub mod pack;
pub mod scratch;
pub mod storage;
pub mod timestamp;
mod tpc;
pub mod types;
mod undo;
mod versions;

// Re-export key types for convenience
pub use api::{
    ConflictResolver, InvalidationSink, ReferencesFn, Revision, RevisionInfo, SharedStorage, Storage, Transaction,
    TransactionDescription, UndoFilter,
};
pub use config::StorageConfig;
pub use error::{StoreError, StoreResult};
pub use iterator::{DataRecord, TransactionIterator, TransactionRecord};
pub use pack::PackReport;
pub use storage::FileStorage;
pub use timestamp::{new_tid, tid_at, tid_time, TimeStamp};
pub use types::{Oid, Tid};
