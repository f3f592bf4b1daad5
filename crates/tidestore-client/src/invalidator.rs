//! Applying server notifications to the client cache
//!
//! Frames queued in the connection's inbox are decoded and applied either on
//! demand (`ClientStorage::sync`) or by a background pump thread. Both paths
//! go through [`Invalidations`], which also arbitrates between invalidations
//! and loads in flight: a load whose object was invalidated while the server
//! was answering must not put its (possibly stale) result in the cache.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tidestore_core::{Oid, StoreError, Tid};
use tracing::{debug, error, info, warn};

use crate::cache::ClientCache;
use crate::error::ClientResult;
use crate::protocol::{FrameDecoder, Notification};
use crate::remote::Inbox;

#[derive(Debug, Default)]
struct LoadSlot {
    waiters: usize,
    raced: bool,
}

/// Notification state shared by the client and its pump thread.
pub(crate) struct Invalidations {
    pub(crate) cache: ClientCache,
    inbox: Arc<Inbox>,
    decoder: Mutex<FrameDecoder>,
    /// Loads in flight; lock order is `loads`, then the cache
    loads: Mutex<HashMap<Oid, LoadSlot>>,
    server_name: RwLock<Option<String>>,
    applied: AtomicU64,
}

impl Invalidations {
    pub(crate) fn new(cache: ClientCache, inbox: Arc<Inbox>) -> Self {
        Self {
            cache,
            inbox,
            decoder: Mutex::new(FrameDecoder::new()),
            loads: Mutex::new(HashMap::new()),
            server_name: RwLock::new(None),
            applied: AtomicU64::new(0),
        }
    }

    pub(crate) fn inbox(&self) -> &Arc<Inbox> {
        &self.inbox
    }

    pub(crate) fn server_name(&self) -> Option<String> {
        self.server_name.read().clone()
    }

    /// Notifications applied so far.
    pub(crate) fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Apply everything already queued.
    pub(crate) fn drain(&self) -> ClientResult<usize> {
        let mut applied = 0;
        for frame in self.inbox.drain() {
            applied += self.apply_frame(&frame)?;
        }
        Ok(applied)
    }

    /// Decode `frame` (possibly one piece of a message) and apply what
    /// completes.
    pub(crate) fn apply_frame(&self, frame: &[u8]) -> ClientResult<usize> {
        let mut decoder = self.decoder.lock();
        decoder.feed(frame);
        let mut applied = 0;
        while let Some(message) = decoder.next_message()? {
            self.apply(Notification::from_message(&message)?)?;
            applied += 1;
        }
        Ok(applied)
    }

    pub(crate) fn apply(&self, notification: Notification) -> ClientResult<()> {
        match notification {
            Notification::InvalidateTransaction { tid, oids } => {
                let mut loads = self.loads.lock();
                for oid in &oids {
                    if let Some(slot) = loads.get_mut(oid) {
                        slot.raced = true;
                    }
                    self.cache.invalidate(*oid, tid)?;
                }
                self.cache.set_last_tid(tid)?;
                debug!(%tid, objects = oids.len(), "applied invalidations");
            }
            Notification::Info { name, last_tid, size } => {
                debug!(%name, %last_tid, size, "server info");
                *self.server_name.write() = Some(name);
            }
        }
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Register a load of `oid` from the server.
    pub(crate) fn begin_load(&self, oid: Oid) {
        self.loads.lock().entry(oid).or_default().waiters += 1;
    }

    /// Finish a load begun with `begin_load`, caching its result unless an
    /// invalidation for `oid` arrived meanwhile.
    pub(crate) fn finish_load(&self, oid: Oid, loaded: Option<(&[u8], Tid)>) -> ClientResult<()> {
        let mut loads = self.loads.lock();
        let raced = match loads.get_mut(&oid) {
            Some(slot) => {
                slot.waiters -= 1;
                let raced = slot.raced;
                if slot.waiters == 0 {
                    loads.remove(&oid);
                }
                raced
            }
            None => true,
        };
        match loaded {
            Some((data, serial)) if !raced => self.cache.store(oid, data, serial, Tid::ZERO),
            Some(_) => {
                debug!(%oid, "load raced an invalidation, not cached");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Run `f` with in-flight loads held off, for updates to the cache made
    /// by the client itself.
    pub(crate) fn exclusive<T>(&self, f: impl FnOnce(&ClientCache) -> ClientResult<T>) -> ClientResult<T> {
        let mut loads = self.loads.lock();
        for slot in loads.values_mut() {
            slot.raced = true;
        }
        f(&self.cache)
    }
}

/// Handle to the background pump. Dropping it stops the thread.
pub struct InvalidatorHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl InvalidatorHandle {
    /// Stop the pump and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("invalidator thread panicked");
            }
        }
    }
}

impl Drop for InvalidatorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start a thread applying notifications as they arrive.
///
/// The pump waits on the inbox for at most `poll` at a time so it notices
/// shutdown, and exits by itself once the inbox is closed and empty.
pub(crate) fn start_invalidator(shared: Arc<Invalidations>, poll: Duration) -> ClientResult<InvalidatorHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);

    let thread = thread::Builder::new()
        .name("tidestore-invalidator".to_string())
        .spawn(move || pump(shared, poll, shutdown_clone))
        .map_err(StoreError::from)?;

    Ok(InvalidatorHandle { shutdown, thread: Some(thread) })
}

fn pump(shared: Arc<Invalidations>, poll: Duration, shutdown: Arc<AtomicBool>) {
    info!("invalidator started");
    while !shutdown.load(Ordering::Acquire) {
        match shared.inbox().pop(poll) {
            Some(frame) => {
                if let Err(e) = shared.apply_frame(&frame) {
                    error!(error = %e, "failed to apply notification");
                }
            }
            None if shared.inbox().is_closed() => break,
            None => {}
        }
    }
    info!(applied = shared.applied(), "invalidator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use std::time::Instant;

    fn shared() -> Arc<Invalidations> {
        let cache = ClientCache::open(&CacheConfig::temporary(64 * 1024)).unwrap();
        Arc::new(Invalidations::new(cache, Arc::new(Inbox::new())))
    }

    fn invalidation(tid: u64, oids: &[u64]) -> Vec<u8> {
        Notification::InvalidateTransaction { tid: Tid(tid), oids: oids.iter().map(|o| Oid(*o)).collect() }
            .encode()
            .unwrap()
    }

    #[test]
    fn test_drain_applies_invalidations() {
        let shared = shared();
        shared.cache.store(Oid(1), b"v1", Tid(5), Tid::ZERO).unwrap();
        shared.inbox().push(invalidation(9, &[1]));

        assert_eq!(shared.drain().unwrap(), 1);
        assert_eq!(shared.cache.load(Oid(1), Tid::ZERO).unwrap(), None);
        assert_eq!(shared.cache.last_tid(), Tid(9));
    }

    #[test]
    fn test_raced_load_not_cached() {
        let shared = shared();
        shared.begin_load(Oid(1));
        shared.inbox().push(invalidation(9, &[1]));
        shared.drain().unwrap();
        shared.finish_load(Oid(1), Some((b"stale", Tid(5)))).unwrap();
        assert!(shared.cache.is_empty());

        shared.begin_load(Oid(1));
        shared.finish_load(Oid(1), Some((b"fresh", Tid(9)))).unwrap();
        assert_eq!(shared.cache.load(Oid(1), Tid::ZERO).unwrap(), Some((b"fresh".to_vec(), Tid(9))));
    }

    #[test]
    fn test_frame_split_across_pushes() {
        let shared = shared();
        let frame = invalidation(4, &[2, 3]);
        let (head, tail) = frame.split_at(7);
        assert_eq!(shared.apply_frame(head).unwrap(), 0);
        assert_eq!(shared.apply_frame(tail).unwrap(), 1);
        assert_eq!(shared.cache.last_tid(), Tid(4));
    }

    #[test]
    fn test_pump_applies_and_stops() {
        let shared = shared();
        let handle = start_invalidator(Arc::clone(&shared), Duration::from_millis(10)).unwrap();
        assert!(handle.is_running());
        shared.inbox().push(invalidation(7, &[1]));

        let deadline = Instant::now() + Duration::from_secs(5);
        while shared.cache.last_tid() != Tid(7) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(shared.cache.last_tid(), Tid(7));
        handle.shutdown();
    }

    #[test]
    fn test_pump_exits_when_inbox_closes() {
        let shared = shared();
        let handle = start_invalidator(Arc::clone(&shared), Duration::from_millis(10)).unwrap();
        shared.inbox().close();
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!handle.is_running());
    }
}
