//! Client storage shim
//!
//! ClientStorage presents the full storage surface to the application while
//! the data lives behind a [`RemoteStorage`]. Trunk reads are served from the
//! circular cache when possible; everything else, commits included, is
//! forwarded to the server call by call.
//!
//! On connect the cache is brought up to date with the server:
//! 1. cache and server agree on the last tid: nothing to do
//! 2. cache is newer than the server (restored server, other database): clear
//! 3. server history covers the gap: invalidate what changed since
//! 4. otherwise ask the server about every cached revision
//!
//! A lost connection fails the transaction in progress with `Disconnected`;
//! reads the cache can answer keep working.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tidestore_core::{
    Oid, Revision, Storage, StoreError, StoreResult, Tid, Transaction, TransactionDescription, UndoFilter,
};
use tracing::{debug, info, warn};

use crate::cache::ClientCache;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::invalidator::{start_invalidator, InvalidatorHandle, Invalidations};
use crate::remote::RemoteStorage;

/// How the cache was reconciled with the server at connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Cache and server agreed already
    UpToDate,
    /// Cache was ahead of the server and has been emptied
    Cleared,
    /// Server history listed the changed objects
    Quick { invalidated: usize },
    /// Every cached revision was checked with the server
    Full { stale: usize },
}

/// What a client transaction changed, applied to the cache at finish.
#[derive(Debug, Default)]
struct ClientTxn {
    /// Trunk stores as `(oid, serial, data)`, in order; the last one per
    /// object wins
    stores: Vec<(Oid, Tid, Vec<u8>)>,
    /// Objects whose cached revisions must be dropped at finish
    dropped: Vec<Oid>,
}

/// Storage backed by a remote server and a local revision cache.
pub struct ClientStorage {
    remote: Arc<dyn RemoteStorage>,
    shared: Arc<Invalidations>,
    config: ClientConfig,
    txns: Mutex<HashMap<u64, ClientTxn>>,
    invalidator: Mutex<Option<InvalidatorHandle>>,
    verification: Verification,
}

impl ClientStorage {
    /// Open the cache and reconcile it with `remote`.
    pub fn connect(remote: Arc<dyn RemoteStorage>, config: ClientConfig) -> ClientResult<Self> {
        config.validate().map_err(|reason| ClientError::Store(StoreError::invalid(reason)))?;
        let cache = ClientCache::open(&config.cache)?;
        let shared = Arc::new(Invalidations::new(cache, remote.inbox()));

        let verification = verify_cache(remote.as_ref(), &shared.cache, config.quick_verify)?;
        // Notifications queued during verification are newer than what it
        // settled, so they are applied only now.
        shared.drain()?;
        info!(
            server = %shared.server_name().unwrap_or_else(|| remote.name()),
            last_tid = %shared.cache.last_tid(),
            ?verification,
            "client connected"
        );

        Ok(Self {
            remote,
            shared,
            config,
            txns: Mutex::new(HashMap::new()),
            invalidator: Mutex::new(None),
            verification,
        })
    }

    pub fn cache(&self) -> &ClientCache {
        &self.shared.cache
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn verification(&self) -> Verification {
        self.verification
    }

    pub fn is_connected(&self) -> bool {
        self.remote.is_connected()
    }

    /// Apply every notification queued so far. Returns how many.
    pub fn sync(&self) -> ClientResult<usize> {
        self.shared.drain()
    }

    /// Apply notifications on a background thread as they arrive.
    pub fn start_invalidator(&self) -> ClientResult<()> {
        let mut slot = self.invalidator.lock();
        if slot.as_ref().map_or(false, |h| h.is_running()) {
            return Ok(());
        }
        *slot = Some(start_invalidator(Arc::clone(&self.shared), self.config.invalidation_poll)?);
        Ok(())
    }

    pub fn stop_invalidator(&self) {
        if let Some(handle) = self.invalidator.lock().take() {
            handle.shutdown();
        }
    }

    /// Stop the invalidator and persist the cache header.
    pub fn close(&self) -> ClientResult<()> {
        self.stop_invalidator();
        self.shared.cache.close()
    }

    fn check_txn(&self, txn: &Transaction) -> StoreResult<()> {
        if self.txns.lock().contains_key(&txn.id()) {
            Ok(())
        } else {
            Err(StoreError::transaction("transaction was not begun on this client"))
        }
    }

    /// Forget `txn` locally when the server reports the connection gone.
    fn fail_if_disconnected<T>(&self, txn: &Transaction, result: StoreResult<T>) -> StoreResult<T> {
        if let Err(StoreError::Disconnected { .. }) = &result {
            warn!(txn = txn.id(), "connection lost during transaction");
            self.txns.lock().remove(&txn.id());
        }
        result
    }

    fn note_dropped(&self, txn: &Transaction, oids: &[Oid]) {
        if let Some(record) = self.txns.lock().get_mut(&txn.id()) {
            record.dropped.extend_from_slice(oids);
        }
    }

    /// Cache lookups never fail a read; a broken cache is a miss.
    fn cached<T>(&self, result: ClientResult<Option<T>>) -> Option<T> {
        match result {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "cache lookup failed");
                None
            }
        }
    }

    /// Bring the cache in line with a transaction this client committed.
    fn apply_own_commit(&self, tid: Tid, record: ClientTxn, resolved: &[Oid]) -> ClientResult<()> {
        self.shared.exclusive(|cache| {
            // Serial of the first store of each object names the revision it
            // replaced.
            let mut replaced = HashMap::new();
            for (oid, serial, _) in &record.stores {
                replaced.entry(*oid).or_insert(*serial);
            }
            let mut seen = HashSet::new();
            for (oid, _, data) in record.stores.iter().rev() {
                if !seen.insert(*oid) {
                    continue;
                }
                if resolved.contains(oid) {
                    // The server committed a merge the client never saw.
                    cache.invalidate(*oid, Tid::ZERO)?;
                    continue;
                }
                if cache.current_tid(*oid) == replaced.get(oid).copied() {
                    cache.invalidate(*oid, tid)?;
                } else {
                    cache.invalidate(*oid, Tid::ZERO)?;
                }
                cache.store(*oid, data, tid, Tid::ZERO)?;
            }
            for oid in &record.dropped {
                cache.invalidate(*oid, Tid::ZERO)?;
            }
            cache.set_last_tid(tid)
        })
    }
}

impl Drop for ClientStorage {
    fn drop(&mut self) {
        self.stop_invalidator();
    }
}

/// Reconcile `cache` with the server behind `remote`.
fn verify_cache(remote: &dyn RemoteStorage, cache: &ClientCache, quick: bool) -> ClientResult<Verification> {
    let cache_tid = cache.last_tid();
    let server_tid = remote.last_transaction();

    if cache_tid == server_tid {
        return Ok(Verification::UpToDate);
    }
    if cache_tid > server_tid {
        warn!(%cache_tid, %server_tid, "cache is newer than the server, clearing it");
        cache.clear()?;
        cache.set_last_tid(server_tid)?;
        return Ok(Verification::Cleared);
    }
    if cache.is_empty() {
        cache.set_last_tid(server_tid)?;
        return Ok(Verification::UpToDate);
    }

    if quick {
        if let Some((last, oids)) = remote.get_invalidations(cache_tid)? {
            for oid in &oids {
                cache.invalidate(*oid, Tid::ZERO)?;
            }
            cache.set_last_tid(last)?;
            debug!(invalidated = oids.len(), %last, "quick cache verification");
            return Ok(Verification::Quick { invalidated: oids.len() });
        }
    }

    remote.begin_verify()?;
    let mut failure = None;
    let stale = cache.verify(|oid, start, end| match remote.verify(oid, start, end) {
        Ok(valid) => valid,
        Err(e) => {
            failure.get_or_insert(e);
            true
        }
    })?;
    if let Some(e) = failure {
        return Err(e.into());
    }
    remote.end_verify()?;
    cache.set_last_tid(server_tid)?;
    Ok(Verification::Full { stale: stale.len() })
}

impl Storage for ClientStorage {
    fn name(&self) -> String {
        self.shared.server_name().unwrap_or_else(|| self.remote.name())
    }

    fn new_oid(&self) -> StoreResult<Oid> {
        self.remote.new_oid()
    }

    /// Trunk reads go to the cache first; version reads always go to the
    /// server.
    fn load(&self, oid: Oid, version: &[u8]) -> StoreResult<(Vec<u8>, Tid)> {
        if !version.is_empty() {
            return self.remote.load(oid, version);
        }
        if let Some(hit) = self.cached(self.shared.cache.load(oid, Tid::ZERO)) {
            return Ok(hit);
        }
        self.shared.begin_load(oid);
        let result = self.remote.load(oid, b"");
        let loaded = result.as_ref().ok().map(|(data, serial)| (data.as_slice(), *serial));
        if let Err(e) = self.shared.finish_load(oid, loaded) {
            warn!(%oid, error = %e, "failed to cache loaded revision");
        }
        result
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> StoreResult<Vec<u8>> {
        let cache = &self.shared.cache;
        for at in [Tid::ZERO, serial] {
            if let Some((data, start)) = self.cached(cache.load(oid, at)) {
                if start == serial {
                    return Ok(data);
                }
            }
        }
        self.remote.load_serial(oid, serial)
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> StoreResult<Option<Revision>> {
        if let Some((data, start, end)) = self.cached(self.shared.cache.load_before(oid, tid)) {
            return Ok(Some(Revision { data, start_tid: start, end_tid: Some(end) }));
        }
        let revision = self.remote.load_before(oid, tid)?;
        if let Some(Revision { data, start_tid, end_tid: Some(end) }) = &revision {
            // Closed ranges never change, so no race with invalidations.
            if let Err(e) = self.shared.cache.store(oid, data, *start_tid, *end) {
                warn!(%oid, error = %e, "failed to cache historical revision");
            }
        }
        Ok(revision)
    }

    fn store(&self, oid: Oid, serial: Tid, data: &[u8], version: &[u8], txn: &Transaction) -> StoreResult<Tid> {
        self.check_txn(txn)?;
        let result = self.remote.store(oid, serial, data, version, txn);
        let tid = self.fail_if_disconnected(txn, result)?;
        if let Some(record) = self.txns.lock().get_mut(&txn.id()) {
            if version.is_empty() {
                record.stores.push((oid, serial, data.to_vec()));
            } else {
                record.dropped.push(oid);
            }
        }
        Ok(tid)
    }

    fn tpc_begin(&self, txn: &Transaction) -> StoreResult<()> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly);
        }
        if self.txns.lock().contains_key(&txn.id()) {
            return Err(StoreError::transaction("transaction already begun"));
        }
        self.remote.tpc_begin(txn)?;
        self.txns.lock().insert(txn.id(), ClientTxn::default());
        Ok(())
    }

    fn tpc_vote(&self, txn: &Transaction) -> StoreResult<()> {
        self.check_txn(txn)?;
        let result = self.remote.tpc_vote(txn);
        self.fail_if_disconnected(txn, result)
    }

    fn tpc_finish(&self, txn: &Transaction) -> StoreResult<Tid> {
        self.check_txn(txn)?;
        let resolved = self.remote.resolved(txn);
        let resolved = self.fail_if_disconnected(txn, resolved)?;
        let result = self.remote.tpc_finish(txn);
        let record = self.txns.lock().remove(&txn.id());
        let tid = result?;
        // Earlier commits by others must land before this one's tid is recorded.
        if let Err(e) = self.shared.drain() {
            warn!(error = %e, "failed to apply queued invalidations");
        }
        if let Some(record) = record {
            if let Err(e) = self.apply_own_commit(tid, record, &resolved) {
                warn!(%tid, error = %e, "failed to update cache after commit");
            }
        }
        debug!(%tid, "client transaction committed");
        Ok(tid)
    }

    fn tpc_abort(&self, txn: &Transaction) -> StoreResult<()> {
        if self.txns.lock().remove(&txn.id()).is_none() {
            return Err(StoreError::transaction("transaction was not begun on this client"));
        }
        match self.remote.tpc_abort(txn) {
            // The server drops the transaction of a lost connection itself.
            Err(StoreError::Disconnected { .. }) => Ok(()),
            other => other,
        }
    }

    fn undo_log(&self, first: usize, last: i64, filter: Option<&UndoFilter>) -> StoreResult<Vec<TransactionDescription>> {
        self.remote.undo_log(first, last, filter)
    }

    fn undo(&self, tid: Tid, txn: &Transaction) -> StoreResult<Vec<Oid>> {
        self.check_txn(txn)?;
        let result = self.remote.undo(tid, txn);
        let oids = self.fail_if_disconnected(txn, result)?;
        self.note_dropped(txn, &oids);
        Ok(oids)
    }

    fn pack(&self, cutoff: f64) -> StoreResult<()> {
        self.remote.pack(cutoff)
    }

    fn versions(&self, max: Option<usize>) -> StoreResult<Vec<Vec<u8>>> {
        self.remote.versions(max)
    }

    fn version_empty(&self, version: &[u8]) -> StoreResult<bool> {
        self.remote.version_empty(version)
    }

    fn abort_version(&self, version: &[u8], txn: &Transaction) -> StoreResult<Vec<Oid>> {
        self.check_txn(txn)?;
        let result = self.remote.abort_version(version, txn);
        let oids = self.fail_if_disconnected(txn, result)?;
        self.note_dropped(txn, &oids);
        Ok(oids)
    }

    fn commit_version(&self, src: &[u8], dest: &[u8], txn: &Transaction) -> StoreResult<Vec<Oid>> {
        self.check_txn(txn)?;
        let result = self.remote.commit_version(src, dest, txn);
        let oids = self.fail_if_disconnected(txn, result)?;
        self.note_dropped(txn, &oids);
        Ok(oids)
    }

    /// Newest transaction the cache has caught up with.
    fn last_transaction(&self) -> Tid {
        self.shared.cache.last_tid()
    }
}
