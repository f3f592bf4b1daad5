//! The server side of a client connection, as seen by the client

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tidestore_core::{Oid, Storage, StoreResult, Tid, Transaction};

/// Storage reached through a connection.
///
/// Besides the plain storage operations the server answers the cache
/// verification calls, and pushes notifications into the connection's
/// [`Inbox`].
pub trait RemoteStorage: Storage {
    /// Objects changed by transactions committed after `tid`, with the
    /// server's last tid. `None` when the server's history does not reach
    /// back that far.
    fn get_invalidations(&self, tid: Tid) -> StoreResult<Option<(Tid, Vec<Oid>)>>;

    fn begin_verify(&self) -> StoreResult<()>;

    /// Whether the revision of `oid` valid over `start..end` (`end == ZERO`
    /// for current) is still what the server holds.
    fn verify(&self, oid: Oid, start: Tid, end: Tid) -> StoreResult<bool>;

    fn end_verify(&self) -> StoreResult<()>;

    /// Objects stored by `txn` whose committed payload differs from what the
    /// client sent because the server resolved a conflict.
    fn resolved(&self, txn: &Transaction) -> StoreResult<Vec<Oid>>;

    /// Where the server delivers encoded notification frames.
    fn inbox(&self) -> Arc<Inbox>;

    fn is_connected(&self) -> bool;
}

/// Queue of encoded frames from the server to one client.
#[derive(Debug, Default)]
pub struct Inbox {
    frames: Mutex<VecDeque<Vec<u8>>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame. Returns false once the inbox is closed.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.frames.lock().push_back(frame);
        self.ready.notify_one();
        true
    }

    /// Wait up to `timeout` for the next frame.
    pub fn pop(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut frames = self.frames.lock();
        if frames.is_empty() && !self.is_closed() {
            self.ready.wait_for(&mut frames, timeout);
        }
        frames.pop_front()
    }

    /// Everything queued so far, without waiting.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.frames.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting frames and wake any waiter. Queued frames stay
    /// readable.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _frames = self.frames.lock();
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
