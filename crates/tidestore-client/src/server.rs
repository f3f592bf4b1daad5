//! In-process server hosting a FileStorage for many client connections
//!
//! Each connection forwards storage calls to the shared FileStorage. After
//! every commit the server encodes one `invalidateTransaction` frame and
//! queues it in the inbox of every connection except the committer's. The
//! last `invalidation_history` commits are kept so a reconnecting client can
//! catch up without verifying its whole cache.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tidestore_core::{
    FileStorage, InvalidationSink, Oid, Revision, Storage, StoreError, StoreResult, Tid, Transaction,
    TransactionDescription, UndoFilter,
};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{ClientError, ClientResult};
use crate::protocol::Notification;
use crate::remote::{Inbox, RemoteStorage};

/// Per-connection state the server needs for fan-out and cleanup.
#[derive(Debug)]
struct Peer {
    inbox: Arc<Inbox>,
    /// Token of the transaction this connection has begun, if any
    txn: Mutex<Option<u64>>,
}

/// Commits remembered for quick reconnection.
#[derive(Debug)]
struct History {
    entries: VecDeque<(Tid, Vec<Oid>)>,
    /// Newest tid whose invalidations are no longer held
    base: Tid,
    limit: usize,
}

impl History {
    fn record(&mut self, tid: Tid, oids: Vec<Oid>) {
        self.entries.push_back((tid, oids));
        while self.entries.len() > self.limit {
            if let Some((dropped, _)) = self.entries.pop_front() {
                self.base = dropped;
            }
        }
    }

    /// Union of the objects changed after `tid`, if the history covers it.
    fn since(&self, tid: Tid) -> Option<Vec<Oid>> {
        if tid < self.base {
            return None;
        }
        let mut oids: Vec<Oid> =
            self.entries.iter().filter(|(t, _)| *t > tid).flat_map(|(_, oids)| oids.iter().copied()).collect();
        oids.sort();
        oids.dedup();
        Some(oids)
    }
}

#[derive(Debug)]
struct Hub {
    peers: Mutex<HashMap<u64, Arc<Peer>>>,
    history: Mutex<History>,
}

impl InvalidationSink for Hub {
    fn invalidate(&self, tid: Tid, oids: &[(Oid, Vec<u8>)], origin: u64) {
        let mut changed: Vec<Oid> = oids.iter().map(|(oid, _)| *oid).collect();
        changed.sort();
        changed.dedup();

        let notification = Notification::InvalidateTransaction { tid, oids: changed.clone() };
        let frame = match notification.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%tid, error = %e, "failed to encode invalidations");
                return;
            }
        };
        let peers: Vec<Arc<Peer>> = self.peers.lock().values().cloned().collect();
        let mut delivered = 0usize;
        for peer in peers {
            if *peer.txn.lock() == Some(origin) {
                continue;
            }
            if peer.inbox.push(frame.clone()) {
                delivered += 1;
            }
        }
        debug!(%tid, objects = changed.len(), delivered, "sent invalidations");
        self.history.lock().record(tid, changed);
    }
}

/// Server for clients living in the same process.
pub struct LocalServer {
    storage: Arc<FileStorage>,
    hub: Arc<Hub>,
    next_id: AtomicU64,
}

impl LocalServer {
    /// Serve `storage`. Registers the server as the storage's invalidation
    /// sink.
    pub fn new(storage: Arc<FileStorage>, config: ServerConfig) -> ClientResult<Self> {
        config.validate().map_err(|reason| ClientError::Store(StoreError::invalid(reason)))?;
        let hub = Arc::new(Hub {
            peers: Mutex::new(HashMap::new()),
            history: Mutex::new(History {
                entries: VecDeque::new(),
                base: storage.last_transaction(),
                limit: config.invalidation_history,
            }),
        });
        storage.set_invalidation_sink(Arc::clone(&hub) as Arc<dyn InvalidationSink>);
        info!(storage = %storage.path().display(), "local server started");
        Ok(Self { storage, hub, next_id: AtomicU64::new(1) })
    }

    pub fn storage(&self) -> &Arc<FileStorage> {
        &self.storage
    }

    /// Open a new connection. Its inbox starts with an `info` notification.
    pub fn connect(&self) -> ClientResult<Arc<LocalConnection>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let peer = Arc::new(Peer { inbox: Arc::new(Inbox::new()), txn: Mutex::new(None) });
        let info = Notification::Info {
            name: self.storage.name(),
            last_tid: self.storage.last_transaction(),
            size: self.storage.size(),
        };
        peer.inbox.push(info.encode()?);
        self.hub.peers.lock().insert(id, Arc::clone(&peer));
        debug!(connection = id, "client connected");
        Ok(Arc::new(LocalConnection {
            id,
            storage: Arc::clone(&self.storage),
            hub: Arc::clone(&self.hub),
            peer,
            connected: AtomicBool::new(true),
            verifying: AtomicBool::new(false),
            stale: AtomicU64::new(0),
        }))
    }

    /// Number of open connections.
    pub fn connections(&self) -> usize {
        self.hub.peers.lock().len()
    }
}

/// One client's connection to a [`LocalServer`].
pub struct LocalConnection {
    id: u64,
    storage: Arc<FileStorage>,
    hub: Arc<Hub>,
    peer: Arc<Peer>,
    connected: AtomicBool,
    verifying: AtomicBool,
    stale: AtomicU64,
}

impl LocalConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drop the connection. A transaction in progress is aborted and a
    /// pending commit-lock wait fails with `Disconnected`.
    pub fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        self.hub.peers.lock().remove(&self.id);
        self.peer.inbox.close();
        let ticket = self.peer.txn.lock().take();
        if let Some(ticket) = ticket {
            self.storage.abandon(ticket);
        }
        info!(connection = self.id, "client disconnected");
    }

    fn check(&self) -> StoreResult<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Disconnected { reason: format!("connection {} is closed", self.id) })
        }
    }

    fn end_txn(&self, txn: &Transaction) {
        let mut slot = self.peer.txn.lock();
        if *slot == Some(txn.id()) {
            *slot = None;
        }
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn stale_if_missing<T>(result: StoreResult<T>) -> StoreResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::PosKey { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

impl Storage for LocalConnection {
    fn name(&self) -> String {
        self.storage.name()
    }

    fn new_oid(&self) -> StoreResult<Oid> {
        self.check()?;
        self.storage.new_oid()
    }

    fn load(&self, oid: Oid, version: &[u8]) -> StoreResult<(Vec<u8>, Tid)> {
        self.check()?;
        self.storage.load(oid, version)
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> StoreResult<Vec<u8>> {
        self.check()?;
        self.storage.load_serial(oid, serial)
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> StoreResult<Option<Revision>> {
        self.check()?;
        self.storage.load_before(oid, tid)
    }

    fn store(&self, oid: Oid, serial: Tid, data: &[u8], version: &[u8], txn: &Transaction) -> StoreResult<Tid> {
        self.check()?;
        self.storage.store(oid, serial, data, version, txn)
    }

    fn tpc_begin(&self, txn: &Transaction) -> StoreResult<()> {
        self.check()?;
        // Recorded before blocking so a disconnect can cancel the wait.
        *self.peer.txn.lock() = Some(txn.id());
        let result = self.storage.tpc_begin(txn);
        if result.is_err() {
            self.end_txn(txn);
        }
        result
    }

    fn tpc_vote(&self, txn: &Transaction) -> StoreResult<()> {
        self.check()?;
        self.storage.tpc_vote(txn)
    }

    fn tpc_finish(&self, txn: &Transaction) -> StoreResult<Tid> {
        self.check()?;
        let result = self.storage.tpc_finish(txn);
        self.end_txn(txn);
        result
    }

    fn tpc_abort(&self, txn: &Transaction) -> StoreResult<()> {
        self.check()?;
        let result = self.storage.tpc_abort(txn);
        self.end_txn(txn);
        result
    }

    fn undo_log(&self, first: usize, last: i64, filter: Option<&UndoFilter>) -> StoreResult<Vec<TransactionDescription>> {
        self.check()?;
        self.storage.undo_log(first, last, filter)
    }

    fn undo(&self, tid: Tid, txn: &Transaction) -> StoreResult<Vec<Oid>> {
        self.check()?;
        self.storage.undo(tid, txn)
    }

    fn pack(&self, cutoff: f64) -> StoreResult<()> {
        self.check()?;
        Storage::pack(self.storage.as_ref(), cutoff)
    }

    fn versions(&self, max: Option<usize>) -> StoreResult<Vec<Vec<u8>>> {
        self.check()?;
        Storage::versions(self.storage.as_ref(), max)
    }

    fn version_empty(&self, version: &[u8]) -> StoreResult<bool> {
        self.check()?;
        Storage::version_empty(self.storage.as_ref(), version)
    }

    fn abort_version(&self, version: &[u8], txn: &Transaction) -> StoreResult<Vec<Oid>> {
        self.check()?;
        self.storage.abort_version(version, txn)
    }

    fn commit_version(&self, src: &[u8], dest: &[u8], txn: &Transaction) -> StoreResult<Vec<Oid>> {
        self.check()?;
        self.storage.commit_version(src, dest, txn)
    }

    fn last_transaction(&self) -> Tid {
        self.storage.last_transaction()
    }
}

impl RemoteStorage for LocalConnection {
    fn get_invalidations(&self, tid: Tid) -> StoreResult<Option<(Tid, Vec<Oid>)>> {
        self.check()?;
        let last = self.storage.last_transaction();
        let found = self.hub.history.lock().since(tid);
        match found {
            Some(oids) => {
                debug!(connection = self.id, %tid, objects = oids.len(), "quick verification");
                Ok(Some((last, oids)))
            }
            None => {
                debug!(connection = self.id, %tid, "history too short for quick verification");
                Ok(None)
            }
        }
    }

    fn begin_verify(&self) -> StoreResult<()> {
        self.check()?;
        if self.verifying.swap(true, Ordering::AcqRel) {
            return Err(StoreError::transaction("verification already in progress"));
        }
        self.stale.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn verify(&self, oid: Oid, start: Tid, end: Tid) -> StoreResult<bool> {
        self.check()?;
        if !self.verifying.load(Ordering::Acquire) {
            return Err(StoreError::transaction("verify outside begin_verify/end_verify"));
        }
        let valid = if end.is_zero() {
            stale_if_missing(self.storage.load(oid, b""))?.map_or(false, |(_, serial)| serial == start)
        } else {
            stale_if_missing(self.storage.load_before(oid, end))?
                .flatten()
                .map_or(false, |rev| rev.start_tid == start && rev.end_tid == Some(end))
        };
        if !valid {
            self.stale.fetch_add(1, Ordering::Relaxed);
        }
        Ok(valid)
    }

    fn end_verify(&self) -> StoreResult<()> {
        self.check()?;
        if !self.verifying.swap(false, Ordering::AcqRel) {
            return Err(StoreError::transaction("no verification in progress"));
        }
        info!(connection = self.id, stale = self.stale.load(Ordering::Relaxed), "cache verification complete");
        Ok(())
    }

    fn resolved(&self, txn: &Transaction) -> StoreResult<Vec<Oid>> {
        self.check()?;
        self.storage.resolved_oids(txn)
    }

    fn inbox(&self) -> Arc<Inbox> {
        Arc::clone(&self.peer.inbox)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameDecoder;
    use tempfile::TempDir;
    use tidestore_core::StorageConfig;

    fn test_server() -> (LocalServer, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::open(dir.path().join("Data.fs"), StorageConfig::default()).unwrap();
        let server = LocalServer::new(Arc::new(storage), ServerConfig::default()).unwrap();
        (server, dir)
    }

    fn commit(conn: &LocalConnection, oid: Oid, serial: Tid, data: &[u8]) -> Tid {
        let txn = Transaction::new();
        conn.tpc_begin(&txn).unwrap();
        conn.store(oid, serial, data, b"", &txn).unwrap();
        conn.tpc_vote(&txn).unwrap();
        conn.tpc_finish(&txn).unwrap()
    }

    fn notifications(inbox: &Inbox) -> Vec<Notification> {
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for frame in inbox.drain() {
            decoder.feed(&frame);
            while let Some(message) = decoder.next_message().unwrap() {
                out.push(Notification::from_message(&message).unwrap());
            }
        }
        out
    }

    #[test]
    fn test_fan_out_skips_committer() {
        let (server, _dir) = test_server();
        let a = server.connect().unwrap();
        let b = server.connect().unwrap();
        notifications(&a.inbox());
        notifications(&b.inbox());

        let oid = a.new_oid().unwrap();
        let tid = commit(&a, oid, Tid::ZERO, b"x");

        assert!(notifications(&a.inbox()).is_empty());
        assert_eq!(notifications(&b.inbox()), vec![Notification::InvalidateTransaction { tid, oids: vec![oid] }]);
    }

    #[test]
    fn test_connect_sends_info() {
        let (server, _dir) = test_server();
        let conn = server.connect().unwrap();
        match notifications(&conn.inbox()).as_slice() {
            [Notification::Info { last_tid, .. }] => assert_eq!(*last_tid, Tid::ZERO),
            other => panic!("unexpected notifications {:?}", other),
        }
    }

    #[test]
    fn test_history_answers_and_expires() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FileStorage::open(dir.path().join("Data.fs"), StorageConfig::default()).unwrap());
        let server = LocalServer::new(storage, ServerConfig { invalidation_history: 2 }).unwrap();
        let conn = server.connect().unwrap();

        let oid = conn.new_oid().unwrap();
        let t1 = commit(&conn, oid, Tid::ZERO, b"1");
        let t2 = commit(&conn, oid, t1, b"2");
        let (last, oids) = conn.get_invalidations(t1).unwrap().unwrap();
        assert_eq!((last, oids), (t2, vec![oid]));

        let t3 = commit(&conn, oid, t2, b"3");
        // t1 fell out of the history, so changes after ZERO are unknown.
        assert!(conn.get_invalidations(Tid::ZERO).unwrap().is_none());
        assert_eq!(conn.get_invalidations(t3).unwrap(), Some((t3, vec![])));
    }

    #[test]
    fn test_verify_reports_stale_revisions() {
        let (server, _dir) = test_server();
        let conn = server.connect().unwrap();
        let oid = conn.new_oid().unwrap();
        let t1 = commit(&conn, oid, Tid::ZERO, b"1");
        let t2 = commit(&conn, oid, t1, b"2");

        conn.begin_verify().unwrap();
        assert!(conn.verify(oid, t2, Tid::ZERO).unwrap());
        assert!(!conn.verify(oid, t1, Tid::ZERO).unwrap());
        assert!(conn.verify(oid, t1, t2).unwrap());
        assert!(!conn.verify(Oid(99), t1, Tid::ZERO).unwrap());
        conn.end_verify().unwrap();
        assert!(conn.end_verify().is_err());
    }

    #[test]
    fn test_disconnect_aborts_transaction() {
        let (server, _dir) = test_server();
        let conn = server.connect().unwrap();
        let oid = conn.new_oid().unwrap();
        let txn = Transaction::new();
        conn.tpc_begin(&txn).unwrap();
        conn.store(oid, Tid::ZERO, b"lost", b"", &txn).unwrap();
        conn.disconnect();

        assert!(matches!(conn.tpc_vote(&txn), Err(StoreError::Disconnected { .. })));
        assert_eq!(server.connections(), 0);

        // The commit lock is free again.
        let other = server.connect().unwrap();
        let tid = commit(&other, oid, Tid::ZERO, b"kept");
        assert_eq!(other.load(oid, b"").unwrap(), (b"kept".to_vec(), tid));
    }
}
