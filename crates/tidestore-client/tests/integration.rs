//! Integration tests: clients, the local server and the cache file together.
//!
//! Clients here reach the storage through `LocalServer` connections exactly
//! as an application would, and the cache file is checked afterwards.

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use tempfile::TempDir;

use tidestore_client::cache_format::{entry_size, HEADER_LEN};
use tidestore_client::{
    CacheConfig, ClientCache, ClientConfig, ClientStorage, LocalConnection, LocalServer, RemoteStorage, ServerConfig,
    Verification,
};
use tidestore_core::{ConflictResolver, FileStorage, Oid, Storage, StorageConfig, StoreError, Tid, Transaction};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const CACHE_SIZE: u64 = 256 * 1024;

fn open_server(dir: &Path, history: usize) -> LocalServer {
    let storage = FileStorage::open(dir.join("Data.fs"), StorageConfig::default()).unwrap();
    LocalServer::new(Arc::new(storage), ServerConfig { invalidation_history: history }).unwrap()
}

fn connect(conn: &Arc<LocalConnection>, cache: CacheConfig) -> ClientStorage {
    let config = ClientConfig { cache, invalidation_poll: Duration::from_millis(10), ..ClientConfig::default() };
    ClientStorage::connect(Arc::clone(conn) as Arc<dyn RemoteStorage>, config).unwrap()
}

fn commit(storage: &dyn Storage, writes: &[(Oid, Tid, &[u8])]) -> Tid {
    let txn = Transaction::with_meta(b"tests", b"client integration");
    storage.tpc_begin(&txn).unwrap();
    for (oid, serial, data) in writes {
        storage.store(*oid, *serial, data, b"", &txn).unwrap();
    }
    storage.tpc_vote(&txn).unwrap();
    storage.tpc_finish(&txn).unwrap()
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

// ---------------------------------------------------------------------------
// Client and server
// ---------------------------------------------------------------------------

#[test]
fn test_invalidator_thread_refreshes_other_client() {
    let dir = TempDir::new().unwrap();
    let server = open_server(dir.path(), 100);
    let (ca, cb) = (server.connect().unwrap(), server.connect().unwrap());
    let a = connect(&ca, CacheConfig::temporary(CACHE_SIZE));
    let b = connect(&cb, CacheConfig::temporary(CACHE_SIZE));
    b.start_invalidator().unwrap();

    let oid = a.new_oid().unwrap();
    let t1 = commit(&a, &[(oid, Tid::ZERO, b"first")]);
    wait_for("first invalidation", || b.last_transaction() == t1);
    assert_eq!(b.load(oid, b"").unwrap(), (b"first".to_vec(), t1));

    let t2 = commit(&a, &[(oid, t1, b"second")]);
    wait_for("second invalidation", || b.last_transaction() == t2);
    assert_eq!(b.load(oid, b"").unwrap(), (b"second".to_vec(), t2));

    // The replaced revision is still answerable from b's cache.
    let before = b.load_before(oid, t2).unwrap().unwrap();
    assert_eq!(before.data, b"first".to_vec());
    b.stop_invalidator();
    b.cache().check_invariants().unwrap();
}

#[test]
fn test_many_objects_in_one_commit() {
    let dir = TempDir::new().unwrap();
    let server = open_server(dir.path(), 100);
    let (ca, cb) = (server.connect().unwrap(), server.connect().unwrap());
    let a = connect(&ca, CacheConfig::temporary(CACHE_SIZE));
    let b = connect(&cb, CacheConfig::temporary(CACHE_SIZE));

    let oids: Vec<Oid> = (0..10).map(|_| a.new_oid().unwrap()).collect();
    let writes: Vec<(Oid, Tid, &[u8])> = oids.iter().map(|o| (*o, Tid::ZERO, &b"v1"[..])).collect();
    let t1 = commit(&a, &writes);
    b.sync().unwrap();
    for oid in &oids {
        assert_eq!(b.load(*oid, b"").unwrap(), (b"v1".to_vec(), t1));
    }

    let writes: Vec<(Oid, Tid, &[u8])> = oids.iter().step_by(2).map(|o| (*o, t1, &b"v2"[..])).collect();
    let t2 = commit(&a, &writes);
    b.sync().unwrap();
    for (i, oid) in oids.iter().enumerate() {
        assert_eq!(b.cache().contains_current(*oid), i % 2 == 1);
        let expected = if i % 2 == 0 { (b"v2".to_vec(), t2) } else { (b"v1".to_vec(), t1) };
        assert_eq!(b.load(*oid, b"").unwrap(), expected);
    }
}

struct Concat;

impl ConflictResolver for Concat {
    fn resolve(&self, _oid: Oid, _old: &[u8], committed: &[u8], new: &[u8]) -> Option<Vec<u8>> {
        Some([committed, new].concat())
    }
}

#[test]
fn test_resolved_write_not_cached() {
    let dir = TempDir::new().unwrap();
    let server = open_server(dir.path(), 100);
    server.storage().set_conflict_resolver(Arc::new(Concat));
    let (ca, cb) = (server.connect().unwrap(), server.connect().unwrap());
    let a = connect(&ca, CacheConfig::temporary(CACHE_SIZE));
    let b = connect(&cb, CacheConfig::temporary(CACHE_SIZE));

    let oid = a.new_oid().unwrap();
    let t1 = commit(&a, &[(oid, Tid::ZERO, b"a")]);
    b.sync().unwrap();
    assert_eq!(b.load(oid, b"").unwrap().0, b"a".to_vec());

    commit(&a, &[(oid, t1, b"b")]);
    // b writes against t1 without having seen a's change.
    let t3 = commit(&b, &[(oid, t1, b"c")]);

    assert!(!b.cache().contains_current(oid));
    assert_eq!(b.load(oid, b"").unwrap(), (b"bc".to_vec(), t3));
    b.cache().check_invariants().unwrap();
}

#[test]
fn test_conflict_surfaces_to_client() {
    let dir = TempDir::new().unwrap();
    let server = open_server(dir.path(), 100);
    let (ca, cb) = (server.connect().unwrap(), server.connect().unwrap());
    let a = connect(&ca, CacheConfig::temporary(CACHE_SIZE));
    let b = connect(&cb, CacheConfig::temporary(CACHE_SIZE));

    let oid = a.new_oid().unwrap();
    let t1 = commit(&a, &[(oid, Tid::ZERO, b"a")]);
    commit(&a, &[(oid, t1, b"b")]);

    let txn = Transaction::new();
    b.tpc_begin(&txn).unwrap();
    assert!(matches!(b.store(oid, t1, b"c", b"", &txn), Err(StoreError::Conflict { .. })));
    b.tpc_abort(&txn).unwrap();
    assert!(b.tpc_vote(&txn).is_err());
}

#[test]
fn test_undo_drops_cached_revisions() {
    let dir = TempDir::new().unwrap();
    let server = open_server(dir.path(), 100);
    let conn = server.connect().unwrap();
    let client = connect(&conn, CacheConfig::temporary(CACHE_SIZE));

    let oid = client.new_oid().unwrap();
    let t1 = commit(&client, &[(oid, Tid::ZERO, b"one")]);
    let t2 = commit(&client, &[(oid, t1, b"two")]);
    assert!(client.cache().contains_current(oid));

    let txn = Transaction::new();
    client.tpc_begin(&txn).unwrap();
    assert_eq!(client.undo(t2, &txn).unwrap(), vec![oid]);
    client.tpc_vote(&txn).unwrap();
    let t3 = client.tpc_finish(&txn).unwrap();

    assert!(!client.cache().contains_current(oid));
    assert_eq!(client.load(oid, b"").unwrap(), (b"one".to_vec(), t3));
    // The undone transaction no longer shows in the undo log.
    let tids: Vec<Tid> = client.undo_log(0, 10, None).unwrap().iter().map(|d| d.tid).collect();
    assert_eq!(tids, vec![t3, t1]);
}

#[test]
fn test_disconnect_mid_commit() {
    let dir = TempDir::new().unwrap();
    let server = open_server(dir.path(), 100);
    let conn = server.connect().unwrap();
    let client = connect(&conn, CacheConfig::temporary(CACHE_SIZE));
    let oid = client.new_oid().unwrap();
    let t1 = commit(&client, &[(oid, Tid::ZERO, b"kept")]);

    let txn = Transaction::new();
    client.tpc_begin(&txn).unwrap();
    client.store(oid, t1, b"lost", b"", &txn).unwrap();
    conn.disconnect();
    assert!(matches!(client.tpc_vote(&txn), Err(StoreError::Disconnected { .. })));
    assert!(client.tpc_abort(&txn).is_err());

    // Cached reads still work; the server never saw the second write.
    assert_eq!(client.load(oid, b"").unwrap(), (b"kept".to_vec(), t1));
    let other = server.connect().unwrap();
    assert_eq!(other.load(oid, b"").unwrap(), (b"kept".to_vec(), t1));
}

// ---------------------------------------------------------------------------
// Reconnecting with a persistent cache
// ---------------------------------------------------------------------------

#[test]
fn test_reconnect_quick_verification() {
    let dir = TempDir::new().unwrap();
    let server = open_server(dir.path(), 100);
    let cache_path = dir.path().join("client.tsc");

    let c1 = server.connect().unwrap();
    let client = connect(&c1, CacheConfig::persistent(&cache_path, CACHE_SIZE));
    let (changed, kept) = (client.new_oid().unwrap(), client.new_oid().unwrap());
    let t1 = commit(&client, &[(changed, Tid::ZERO, b"old"), (kept, Tid::ZERO, b"same")]);
    client.close().unwrap();
    drop(client);
    c1.disconnect();

    let writer = server.connect().unwrap();
    let t2 = commit(writer.as_ref(), &[(changed, t1, b"new")]);

    let c2 = server.connect().unwrap();
    let client = connect(&c2, CacheConfig::persistent(&cache_path, CACHE_SIZE));
    assert_eq!(client.verification(), Verification::Quick { invalidated: 1 });
    assert_eq!(client.last_transaction(), t2);
    assert!(!client.cache().contains_current(changed));
    assert!(client.cache().contains_current(kept));
    assert_eq!(client.load(changed, b"").unwrap(), (b"new".to_vec(), t2));
    assert_eq!(client.load(kept, b"").unwrap(), (b"same".to_vec(), t1));
}

#[test]
fn test_reconnect_full_verification() {
    let dir = TempDir::new().unwrap();
    let server = open_server(dir.path(), 1);
    let cache_path = dir.path().join("client.tsc");

    let c1 = server.connect().unwrap();
    let client = connect(&c1, CacheConfig::persistent(&cache_path, CACHE_SIZE));
    let (changed, kept) = (client.new_oid().unwrap(), client.new_oid().unwrap());
    let t1 = commit(&client, &[(changed, Tid::ZERO, b"old")]);
    let t2 = commit(&client, &[(kept, Tid::ZERO, b"same")]);
    drop(client);
    c1.disconnect();

    let writer = server.connect().unwrap();
    commit(writer.as_ref(), &[(changed, t1, b"new")]);
    let other = writer.new_oid().unwrap();
    let t4 = commit(writer.as_ref(), &[(other, Tid::ZERO, b"x")]);

    let c2 = server.connect().unwrap();
    let client = connect(&c2, CacheConfig::persistent(&cache_path, CACHE_SIZE));
    assert_eq!(client.verification(), Verification::Full { stale: 1 });
    assert_eq!(client.last_transaction(), t4);
    assert!(!client.cache().contains_current(changed));
    assert_eq!(client.cache().current_tid(kept), Some(t2));
}

#[test]
fn test_reconnect_to_older_server_clears_cache() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("client.tsc");
    {
        let first = dir.path().join("a");
        std::fs::create_dir_all(&first).unwrap();
        let server = open_server(&first, 100);
        let conn = server.connect().unwrap();
        let client = connect(&conn, CacheConfig::persistent(&cache_path, CACHE_SIZE));
        let oid = client.new_oid().unwrap();
        commit(&client, &[(oid, Tid::ZERO, b"gone")]);
    }

    let fresh = dir.path().join("b");
    std::fs::create_dir_all(&fresh).unwrap();
    let server = open_server(&fresh, 100);
    let conn = server.connect().unwrap();
    let client = connect(&conn, CacheConfig::persistent(&cache_path, CACHE_SIZE));
    assert_eq!(client.verification(), Verification::Cleared);
    assert!(client.cache().is_empty());
    assert_eq!(client.last_transaction(), Tid::ZERO);
}

#[test]
fn test_reconnect_without_changes() {
    let dir = TempDir::new().unwrap();
    let server = open_server(dir.path(), 100);
    let cache_path = dir.path().join("client.tsc");

    let c1 = server.connect().unwrap();
    let client = connect(&c1, CacheConfig::persistent(&cache_path, CACHE_SIZE));
    let oid = client.new_oid().unwrap();
    let tid = commit(&client, &[(oid, Tid::ZERO, b"v")]);
    drop(client);

    let c2 = server.connect().unwrap();
    let client = connect(&c2, CacheConfig::persistent(&cache_path, CACHE_SIZE));
    assert_eq!(client.verification(), Verification::UpToDate);
    assert_eq!(client.load(oid, b"").unwrap(), (b"v".to_vec(), tid));
    assert_eq!(client.cache().stats().hits, 1);
}

// ---------------------------------------------------------------------------
// Cache file
// ---------------------------------------------------------------------------

#[test]
fn test_ring_of_exact_entry_multiple() {
    // 87-byte payloads make 128-byte entries; eight fill the ring exactly.
    let payload = vec![7u8; 87];
    let entry = entry_size(payload.len());
    assert_eq!(entry, 128);
    let cache = ClientCache::open(&CacheConfig::temporary(HEADER_LEN + 8 * entry)).unwrap();

    for n in 1..=30u64 {
        cache.store(Oid(n), &payload, Tid(n), Tid::ZERO).unwrap();
        assert_eq!(cache.len() as u64, n.min(8));
        cache.check_invariants().unwrap();
    }
    for n in 23..=30u64 {
        assert_eq!(cache.load(Oid(n), Tid::ZERO).unwrap(), Some((payload.clone(), Tid(n))));
    }
    assert_eq!(cache.load(Oid(22), Tid::ZERO).unwrap(), None);
    assert_eq!(cache.stats().evictions, 22);
}

#[test]
fn test_mixed_sizes_keep_ring_tiled() {
    let cache = ClientCache::open(&CacheConfig::temporary(HEADER_LEN + 4096)).unwrap();
    for n in 1..=200u64 {
        let payload = vec![n as u8; (n as usize * 37) % 700 + 1];
        cache.store(Oid(n % 23), &payload, Tid(n), Tid::ZERO).unwrap();
        if n % 3 == 0 {
            cache.invalidate(Oid(n % 23), Tid(n + 1)).unwrap();
        }
        cache.check_invariants().unwrap();
    }
}

#[derive(Debug, Clone)]
enum CacheOp {
    Store { oid: u64, len: usize },
    Invalidate { oid: u64 },
    Forget { oid: u64 },
    Load { oid: u64 },
    StoreRange { oid: u64, start: u64, span: u64, len: usize },
    LoadBefore { oid: u64, at: u64 },
}

fn cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        4 => (0u64..12, 1usize..900).prop_map(|(oid, len)| CacheOp::Store { oid, len }),
        2 => (0u64..12).prop_map(|oid| CacheOp::Invalidate { oid }),
        1 => (0u64..12).prop_map(|oid| CacheOp::Forget { oid }),
        2 => (0u64..12).prop_map(|oid| CacheOp::Load { oid }),
        3 => (0u64..12, 1u64..200, 1u64..40, 1usize..300)
            .prop_map(|(oid, start, span, len)| CacheOp::StoreRange { oid, start, span, len }),
        2 => (0u64..12, 1u64..250).prop_map(|(oid, at)| CacheOp::LoadBefore { oid, at }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_cache_invariants_hold(ops in prop::collection::vec(cache_op(), 1..120)) {
        let cache = ClientCache::open(&CacheConfig::temporary(HEADER_LEN + 4096)).unwrap();
        let mut tid = 0u64;
        for op in ops {
            tid += 1;
            match op {
                CacheOp::Store { oid, len } => {
                    cache.store(Oid(oid), &vec![oid as u8; len], Tid(tid), Tid::ZERO).unwrap();
                }
                CacheOp::Invalidate { oid } => cache.invalidate(Oid(oid), Tid(tid)).unwrap(),
                CacheOp::Forget { oid } => cache.invalidate(Oid(oid), Tid::ZERO).unwrap(),
                CacheOp::Load { oid } => {
                    if let Some((data, _)) = cache.load(Oid(oid), Tid::ZERO).unwrap() {
                        prop_assert!(data.iter().all(|b| *b == oid as u8));
                    }
                }
                CacheOp::StoreRange { oid, start, span, len } => {
                    cache.store(Oid(oid), &vec![oid as u8; len], Tid(start), Tid(start + span)).unwrap();
                }
                CacheOp::LoadBefore { oid, at } => {
                    if let Some((data, start, end)) = cache.load_before(Oid(oid), Tid(at)).unwrap() {
                        prop_assert!(start < Tid(at) && Tid(at) <= end);
                        prop_assert!(data.iter().all(|b| *b == oid as u8));
                    }
                }
            }
            prop_assert_eq!(cache.check_invariants(), Ok(()));
        }
    }

    #[test]
    fn prop_damaged_cache_file_opens_consistent(
        writes in prop::collection::vec((0u64..12, 1usize..300), 1..30),
        damage in prop::collection::vec((HEADER_LEN..HEADER_LEN + 4096, any::<u8>()), 1..8),
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("client.tsc");
        let config = CacheConfig::persistent(&path, HEADER_LEN + 4096);
        {
            let cache = ClientCache::open(&config).unwrap();
            for (i, (oid, len)) in writes.iter().enumerate() {
                cache.invalidate(Oid(*oid), Tid(2 * i as u64 + 1)).unwrap();
                cache.store(Oid(*oid), &vec![*oid as u8; *len], Tid(2 * i as u64 + 2), Tid::ZERO).unwrap();
            }
        }
        let mut raw = std::fs::read(&path).unwrap();
        for (at, byte) in &damage {
            raw[*at as usize] = *byte;
        }
        std::fs::write(&path, &raw).unwrap();

        let cache = ClientCache::open(&config).unwrap();
        prop_assert_eq!(cache.check_invariants(), Ok(()));
        for oid in 0..12 {
            cache.load(Oid(oid), Tid::ZERO).unwrap();
        }
        cache.store(Oid(99), b"after", Tid(1000), Tid::ZERO).unwrap();
        prop_assert_eq!(cache.check_invariants(), Ok(()));
    }
}
