//! Integration tests: FileStorage end to end.
//!
//! These tests drive the storage only through its public API and then poke
//! at the file underneath to check recovery and on-disk invariants.
#![cfg(unix)]

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tempfile::TempDir;

use tidestore_core::{
    FileStorage, InvalidationSink, Oid, Storage, StorageConfig, StoreError, StoreResult, Tid, Transaction,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_storage() -> (FileStorage, TempDir) {
    let dir = TempDir::new().unwrap();
    let storage = FileStorage::open(dir.path().join("Data.fs"), StorageConfig::default()).unwrap();
    (storage, dir)
}

fn minpo(n: u32) -> Vec<u8> {
    format!("MinPO({})", n).into_bytes()
}

/// Run `f` inside a full two-phase commit, aborting if it fails.
fn transact<T>(storage: &dyn Storage, f: impl FnOnce(&Transaction) -> StoreResult<T>) -> StoreResult<(T, Tid)> {
    let txn = Transaction::with_meta(b"tests", b"integration");
    storage.tpc_begin(&txn)?;
    let out = match f(&txn) {
        Ok(out) => out,
        Err(e) => {
            storage.tpc_abort(&txn)?;
            return Err(e);
        }
    };
    storage.tpc_vote(&txn)?;
    let tid = storage.tpc_finish(&txn)?;
    Ok((out, tid))
}

fn store(storage: &dyn Storage, oid: Oid, serial: Tid, data: &[u8], version: &[u8]) -> Tid {
    transact(storage, |t| storage.store(oid, serial, data, version, t)).unwrap().1
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

/// Trunk revisions 49..=51 then version "v" revisions 52..=54 of one object.
fn version_prelude(storage: &FileStorage) -> Oid {
    let oid = storage.new_oid().unwrap();
    let mut serial = Tid::ZERO;
    for n in 49..=51 {
        serial = store(storage, oid, serial, &minpo(n), b"");
    }
    for n in 52..=54 {
        serial = store(storage, oid, serial, &minpo(n), b"v");
    }
    oid
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_simple_store_and_load() {
    let (storage, _dir) = test_storage();
    let oid = storage.new_oid().unwrap();
    let s1 = store(&storage, oid, Tid::ZERO, &minpo(11), b"");
    assert_eq!(storage.load(oid, b"").unwrap(), (minpo(11), s1));
}

#[test]
fn test_version_commit_to_trunk() {
    let (storage, _dir) = test_storage();
    let oid = version_prelude(&storage);
    assert_eq!(storage.load(oid, b"v").unwrap().0, minpo(54));
    assert_eq!(storage.load(oid, b"").unwrap().0, minpo(51));

    let (moved, _) = transact(&storage, |t| storage.commit_version(b"v", b"", t)).unwrap();
    assert_eq!(moved, vec![oid]);
    assert_eq!(storage.load(oid, b"").unwrap().0, minpo(54));
    assert_eq!(storage.load(oid, b"v").unwrap().0, minpo(54));
    assert!(storage.version_empty(b"v"));
}

#[test]
fn test_abort_version() {
    let (storage, _dir) = test_storage();
    let oid = version_prelude(&storage);
    let (aborted, _) = transact(&storage, |t| storage.abort_version(b"v", t)).unwrap();
    assert_eq!(aborted, vec![oid]);
    assert_eq!(storage.load(oid, b"").unwrap().0, minpo(51));
    assert!(storage.versions(None).is_empty());
}

#[test]
fn test_undo_of_create() {
    let (storage, _dir) = test_storage();
    let oid = storage.new_oid().unwrap();
    let s1 = store(&storage, oid, Tid::ZERO, &minpo(1), b"");
    transact(&storage, |t| storage.undo(s1, t)).unwrap();
    assert!(matches!(storage.load(oid, b""), Err(StoreError::PosKey { .. })));
}

#[test]
fn test_pack_cutoff() {
    let (storage, _dir) = test_storage();
    let root = Oid::ROOT;
    let s1 = store(&storage, root, Tid::ZERO, &minpo(1), b"");
    let s2 = store(&storage, root, s1, &minpo(2), b"");
    let s3 = store(&storage, root, s2, &minpo(3), b"");

    storage.pack_at(s2, None).unwrap();
    assert!(matches!(storage.load_serial(root, s1), Err(StoreError::PosKey { .. })));
    assert_eq!(storage.load(root, b"").unwrap(), (minpo(3), s3));
}

#[test]
fn test_pack_by_time_keeps_everything_newer() {
    let (storage, _dir) = test_storage();
    let root = Oid::ROOT;
    let s1 = store(&storage, root, Tid::ZERO, &minpo(1), b"");
    // A cutoff well before the first commit leaves nothing to collect.
    storage.pack(tidestore_core::tid_time(s1) - 3600.0).unwrap();
    assert_eq!(storage.load_serial(root, s1).unwrap(), minpo(1));
}

// ---------------------------------------------------------------------------
// Invariants
// ---------------------------------------------------------------------------

#[test]
fn test_log_invariants_hold() {
    let (storage, _dir) = test_storage();
    let a = storage.new_oid().unwrap();
    let b = storage.new_oid().unwrap();
    let mut sa = Tid::ZERO;
    let mut sb = Tid::ZERO;
    for i in 0..10u32 {
        let (_, tid) = transact(&storage, |t| {
            storage.store(a, sa, &minpo(i), b"", t)?;
            if i % 2 == 0 {
                storage.store(b, sb, &minpo(100 + i), b"", t)?;
            }
            Ok(())
        })
        .unwrap();
        // Every committed tid becomes the last transaction at once.
        assert_eq!(storage.last_transaction(), tid);
        sa = tid;
        if i % 2 == 0 {
            sb = tid;
        }
    }

    let txns: Vec<_> = storage.iter_transactions(None, None).collect::<StoreResult<_>>().unwrap();
    assert_eq!(txns.len(), 10);
    for pair in txns.windows(2) {
        assert!(pair[1].tid() > pair[0].tid());
    }

    let mut by_pos = std::collections::HashMap::new();
    for txn in &txns {
        for record in &txn.records {
            by_pos.insert(record.pos, (record.oid(), record.serial()));
        }
    }
    for txn in &txns {
        for record in &txn.records {
            if record.prev() != 0 {
                let (oid, serial) = by_pos[&record.prev()];
                assert_eq!(oid, record.oid());
                assert!(serial < record.serial());
            }
        }
    }

    assert_eq!(storage.load(a, b"").unwrap().1, sa);
    assert_eq!(storage.load(b, b"").unwrap().1, sb);
}

#[test]
fn test_round_trip_through_load_serial() {
    let (storage, _dir) = test_storage();
    let oid = storage.new_oid().unwrap();
    let mut serial = Tid::ZERO;
    for n in 0..5 {
        let payload = minpo(n);
        serial = store(&storage, oid, serial, &payload, b"");
        assert_eq!(storage.load_serial(oid, serial).unwrap(), payload);
    }
}

#[test]
fn test_undo_restores_prior_payload() {
    let (storage, _dir) = test_storage();
    let a = storage.new_oid().unwrap();
    let b = storage.new_oid().unwrap();
    let s1 = transact(&storage, |t| {
        storage.store(a, Tid::ZERO, &minpo(1), b"", t)?;
        storage.store(b, Tid::ZERO, &minpo(2), b"", t)
    })
    .unwrap()
    .1;
    let s2 = transact(&storage, |t| {
        storage.store(a, s1, &minpo(10), b"", t)?;
        storage.store(b, s1, &minpo(20), b"", t)
    })
    .unwrap()
    .1;

    let (oids, _) = transact(&storage, |t| storage.undo(s2, t)).unwrap();
    assert_eq!(oids, vec![a, b]);
    for oid in oids {
        assert_eq!(storage.load(oid, b"").unwrap().0, storage.load_serial(oid, s1).unwrap());
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[test]
fn test_truncated_tail_is_recovered() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Data.fs");
    let (prev_tid, prev_end, end) = {
        let storage = FileStorage::open(&path, StorageConfig::default()).unwrap();
        let oid = storage.new_oid().unwrap();
        let s1 = store(&storage, oid, Tid::ZERO, &minpo(1), b"");
        let prev_end = storage.size();
        store(&storage, oid, s1, &minpo(2), b"");
        (s1, prev_end, storage.size())
    };

    for cut in [prev_end + 5, prev_end + 30, end - 8, end - 1] {
        let copy = dir.path().join(format!("cut-{}.fs", cut));
        std::fs::copy(&path, &copy).unwrap();
        OpenOptions::new().write(true).open(&copy).unwrap().set_len(cut).unwrap();

        let storage = FileStorage::open(&copy, StorageConfig::default()).unwrap();
        assert_eq!(storage.last_transaction(), prev_tid, "cut at {}", cut);
        assert_eq!(storage.size(), prev_end);
        drop(storage);
        assert_eq!(file_len(&copy), prev_end);
    }
}

#[test]
fn test_strict_open_refuses_damaged_tail() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Data.fs");
    let end = {
        let storage = FileStorage::open(&path, StorageConfig::default()).unwrap();
        store(&storage, Oid(1), Tid::ZERO, &minpo(1), b"");
        storage.size()
    };
    OpenOptions::new().write(true).open(&path).unwrap().set_len(end - 3).unwrap();
    let config = StorageConfig { recover: false, ..StorageConfig::default() };
    assert!(matches!(FileStorage::open(&path, config), Err(StoreError::CorruptedData { .. })));
    assert_eq!(file_len(&path), end - 3);
}

#[test]
fn test_interrupted_commit_is_dropped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Data.fs");
    let copy = dir.path().join("crashed.fs");
    let (prev_tid, pos) = {
        let storage = FileStorage::open(&path, StorageConfig::default()).unwrap();
        let s1 = store(&storage, Oid(1), Tid::ZERO, &minpo(1), b"");
        let pos = storage.size();

        let txn = Transaction::new();
        storage.tpc_begin(&txn).unwrap();
        storage.store(Oid(1), s1, &minpo(2), b"", &txn).unwrap();
        storage.tpc_vote(&txn).unwrap();
        // Snapshot the file as a crash between vote and finish would leave it.
        std::fs::copy(&path, &copy).unwrap();
        storage.tpc_abort(&txn).unwrap();
        (s1, pos)
    };

    // Give the copy a well-formed trailer so only the status marks it.
    let len = file_len(&copy);
    let tlen = len - pos - 16 + 8;
    let file = OpenOptions::new().write(true).open(&copy).unwrap();
    file.write_all_at(&tlen.to_be_bytes(), len).unwrap();
    drop(file);

    let storage = FileStorage::open(&copy, StorageConfig::default()).unwrap();
    assert_eq!(storage.last_transaction(), prev_tid);
    assert_eq!(storage.load(Oid(1), b"").unwrap().0, minpo(1));
    drop(storage);
    assert_eq!(file_len(&copy), pos);
}

#[test]
fn test_interrupted_commit_dropped_in_strict_mode() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Data.fs");
    let copy = dir.path().join("crashed.fs");
    let (prev_tid, pos) = {
        let storage = FileStorage::open(&path, StorageConfig::default()).unwrap();
        let s1 = store(&storage, Oid(1), Tid::ZERO, &minpo(1), b"");
        let pos = storage.size();

        let txn = Transaction::new();
        storage.tpc_begin(&txn).unwrap();
        storage.store(Oid(1), s1, &minpo(2), b"", &txn).unwrap();
        storage.tpc_vote(&txn).unwrap();
        std::fs::copy(&path, &copy).unwrap();
        storage.tpc_abort(&txn).unwrap();
        (s1, pos)
    };

    // No trailer yet: the header's tlen runs past the end of the copy.
    let storage = FileStorage::open(&copy, StorageConfig::strict()).unwrap();
    assert_eq!(storage.last_transaction(), prev_tid);
    assert_eq!(storage.load(Oid(1), b"").unwrap().0, minpo(1));
    drop(storage);
    assert_eq!(file_len(&copy), pos);
}

#[test]
fn test_damaged_payload_length_is_corruption() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Data.fs");
    let oid = {
        let storage = FileStorage::open(&path, StorageConfig::default()).unwrap();
        let oid = storage.new_oid().unwrap();
        store(&storage, oid, Tid::ZERO, &minpo(1), b"");
        oid
    };
    // plen of the first record: metadata, transaction header, "tests" and
    // "integration", then 38 bytes into the data header.
    let plen_at = 1024 + 23 + 16 + 38;
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all_at(&u64::MAX.to_be_bytes(), plen_at).unwrap();
    drop(file);

    let copy = dir.path().join("strict.fs");
    std::fs::copy(&path, &copy).unwrap();
    let strict = StorageConfig { recover: false, ..StorageConfig::default() };
    assert!(matches!(FileStorage::open(&copy, strict), Err(StoreError::CorruptedData { .. })));

    let storage = FileStorage::open(&path, StorageConfig::default()).unwrap();
    assert_eq!(storage.last_transaction(), Tid::ZERO);
    assert!(matches!(storage.load(oid, b""), Err(StoreError::PosKey { .. })));
    drop(storage);
    assert_eq!(file_len(&path), 1024);
}

#[test]
fn test_damaged_transaction_length_is_truncated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Data.fs");
    let (s1, end) = {
        let storage = FileStorage::open(&path, StorageConfig::default()).unwrap();
        let s1 = store(&storage, Oid(1), Tid::ZERO, &minpo(1), b"");
        let end = storage.size();
        store(&storage, Oid(1), s1, &minpo(2), b"");
        (s1, end)
    };
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all_at(&u64::MAX.to_be_bytes(), end + 8).unwrap();
    drop(file);

    let storage = FileStorage::open(&path, StorageConfig::default()).unwrap();
    assert_eq!(storage.last_transaction(), s1);
    assert_eq!(storage.size(), end);
}

#[test]
fn test_stale_pack_file_removed_at_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Data.fs");
    let stale = dir.path().join("Data.fs.pack");
    std::fs::write(&stale, b"half a pack").unwrap();
    let _storage = FileStorage::open(&path, StorageConfig::default()).unwrap();
    assert!(!stale.exists());
}

#[test]
fn test_backpointer_cycle_switches_to_read_only() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("Data.fs");
    let storage = FileStorage::open(&path, StorageConfig::default()).unwrap();
    let oid = storage.new_oid().unwrap();
    let s1 = store(&storage, oid, Tid::ZERO, &minpo(1), b"");
    let s2 = store(&storage, oid, s1, &minpo(2), b"");
    transact(&storage, |t| storage.undo(s2, t)).unwrap();

    // Point the undo record's back-pointer at itself.
    let last = storage.iter_transactions(None, None).last().unwrap().unwrap();
    let record = &last.records[0];
    assert!(record.backpointer().is_some());
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all_at(&record.pos.to_be_bytes(), record.header.body_offset(record.pos)).unwrap();
    drop(file);

    assert!(matches!(storage.load(oid, b""), Err(StoreError::CorruptedData { .. })));
    assert!(storage.is_read_only());
    assert!(matches!(storage.new_oid(), Err(StoreError::ReadOnly)));
}

// ---------------------------------------------------------------------------
// Boundaries and state machine
// ---------------------------------------------------------------------------

#[test]
fn test_load_before_boundaries() {
    let (storage, _dir) = test_storage();
    let oid = storage.new_oid().unwrap();
    let s1 = store(&storage, oid, Tid::ZERO, &minpo(1), b"");
    let s2 = store(&storage, oid, s1, &minpo(2), b"");

    assert_eq!(storage.load_before(oid, s1).unwrap(), None);
    let rev = storage.load_before(oid, s2).unwrap().unwrap();
    assert_eq!((rev.data, rev.start_tid, rev.end_tid), (minpo(1), s1, Some(s2)));
}

#[test]
fn test_load_before_skips_version_records() {
    let (storage, _dir) = test_storage();
    let oid = version_prelude(&storage);
    let rev = storage.load_before(oid, Tid(u64::MAX)).unwrap().unwrap();
    assert_eq!(rev.data, minpo(51));
}

#[test]
fn test_wrong_state_calls_fail_cleanly() {
    let (storage, _dir) = test_storage();
    let size = storage.size();
    let txn = Transaction::new();
    assert!(matches!(storage.tpc_vote(&txn), Err(StoreError::StorageTransaction { .. })));
    assert!(matches!(storage.tpc_finish(&txn), Err(StoreError::StorageTransaction { .. })));
    assert!(matches!(storage.undo(Tid(1), &txn), Err(StoreError::StorageTransaction { .. })));

    storage.tpc_begin(&txn).unwrap();
    assert!(matches!(storage.tpc_begin(&txn), Err(StoreError::StorageTransaction { .. })));
    storage.tpc_vote(&txn).unwrap();
    assert!(matches!(storage.store(Oid(1), Tid::ZERO, b"late", b"", &txn), Err(StoreError::StorageTransaction { .. })));
    storage.tpc_abort(&txn).unwrap();
    assert_eq!(storage.size(), size);
}

#[test]
fn test_empty_transaction_commits() {
    let (storage, _dir) = test_storage();
    let ((), tid) = transact(&storage, |_| Ok(())).unwrap();
    assert_eq!(storage.last_transaction(), tid);
    assert_eq!(storage.undo_log(0, 10, None).unwrap().len(), 1);
}

#[test]
fn test_concurrent_committers_serialize() {
    let (storage, _dir) = test_storage();
    let storage = Arc::new(storage);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let storage = Arc::clone(&storage);
            thread::spawn(move || {
                let oid = storage.new_oid().unwrap();
                let mut serial = Tid::ZERO;
                for n in 0..10 {
                    serial = store(storage.as_ref(), oid, serial, &minpo(n), b"");
                }
                (oid, serial)
            })
        })
        .collect();
    for handle in handles {
        let (oid, serial) = handle.join().unwrap();
        assert_eq!(storage.load(oid, b"").unwrap(), (minpo(9), serial));
    }
    let tids: Vec<Tid> = storage.iter_transactions(None, None).map(|t| t.unwrap().tid()).collect();
    assert_eq!(tids.len(), 40);
    assert!(tids.windows(2).all(|w| w[0] < w[1]));
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(Tid, Vec<(Oid, Vec<u8>)>, u64)>>,
}

impl InvalidationSink for Recorder {
    fn invalidate(&self, tid: Tid, oids: &[(Oid, Vec<u8>)], origin: u64) {
        self.seen.lock().push((tid, oids.to_vec(), origin));
    }
}

#[test]
fn test_invalidations_follow_commits() {
    let (storage, _dir) = test_storage();
    let recorder = Arc::new(Recorder::default());
    storage.set_invalidation_sink(recorder.clone());
    let oid = version_prelude(&storage);

    let txn = Transaction::new();
    storage.tpc_begin(&txn).unwrap();
    storage.commit_version(b"v", b"", &txn).unwrap();
    storage.tpc_vote(&txn).unwrap();
    let tid = storage.tpc_finish(&txn).unwrap();

    let seen = recorder.seen.lock();
    assert_eq!(seen.len(), 7);
    let (last_tid, oids, origin) = seen.last().unwrap();
    assert_eq!(*last_tid, tid);
    assert_eq!(*origin, txn.id());
    assert!(oids.contains(&(oid, Vec::new())));
    assert!(oids.contains(&(oid, b"v".to_vec())));
}
