//! Circular client cache
//!
//! Revisions fetched from the server are appended to a fixed-size ring file.
//! Writing advances an offset; when a record does not fit before the end of
//! the ring the offset wraps to the header end. Whatever the new record
//! overlaps is evicted, so eviction is positional rather than LRU.
//!
//! In-memory indexes, rebuilt by scanning the ring at open:
//! - `filemap`: ring offset -> block, tiling `[HEADER_LEN, size)` exactly
//! - `key2entry`: (oid, start_tid) -> (offset, end_tid)
//! - `current`: oid -> start_tid of the revision believed newest
//! - `noncurrent`: oid -> start_tid -> end_tid of historical revisions
//!
//! Everything sits behind one mutex. Loads hold it only while the payload is
//! copied out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tidestore_core::logfile::{LockFile, LogFile};
use tidestore_core::{Oid, StoreError, Tid};
use tracing::{debug, info, warn};

use crate::cache_format::{
    block_kind, entry_size, free_marker, BlockKind, CacheHeader, EntryHeader, END_TID_OFFSET, ENTRY_HEADER_LEN,
    HEADER_LEN, MIN_CACHE_SIZE,
};
use crate::config::CacheConfig;
use crate::error::{ClientError, ClientResult};

/// One block of the ring. `key` is `None` for free space.
#[derive(Debug, Clone, Copy)]
struct Block {
    size: u64,
    key: Option<(Oid, Tid)>,
}

/// Counters and occupancy of a cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    /// Live entries, current and noncurrent
    pub entries: usize,
    pub current: usize,
    pub noncurrent: usize,
    /// Bytes available to entries (file size minus header)
    pub ring_size: u64,
    /// Bytes held by live entries
    pub bytes_used: u64,
}

struct CacheInner {
    file: LogFile,
    size: u64,
    offset: u64,
    last_tid: Tid,
    filemap: BTreeMap<u64, Block>,
    key2entry: HashMap<(Oid, Tid), (u64, Tid)>,
    current: HashMap<Oid, Tid>,
    noncurrent: HashMap<Oid, BTreeMap<Tid, Tid>>,
    stats: CacheStats,
}

/// Fixed-size ring of object revisions.
pub struct ClientCache {
    path: PathBuf,
    inner: Mutex<CacheInner>,
    persistent: bool,
    _lock: Option<LockFile>,
    _temp: Option<NamedTempFile>,
}

impl ClientCache {
    /// Open the cache described by `config`.
    ///
    /// A persistent cache keeps its entries across restarts; if the file is
    /// missing, has a different size, or fails the scan, it starts empty.
    pub fn open(config: &CacheConfig) -> ClientResult<Self> {
        config
            .validate()
            .map_err(|_| ClientError::CacheTooSmall { size: config.size, min: MIN_CACHE_SIZE })?;

        let (path, lock, temp) = match &config.path {
            Some(path) => {
                let lock = LockFile::acquire(path).map_err(|e| match e {
                    StoreError::Locked { path } => ClientError::CacheInUse { path },
                    other => ClientError::Store(other),
                })?;
                (path.clone(), Some(lock), None)
            }
            None => {
                let temp = NamedTempFile::new()
                    .map_err(|e| StoreError::io(&std::env::temp_dir(), e, "failed to create temporary cache"))?;
                (temp.path().to_path_buf(), None, Some(temp))
            }
        };

        let file = LogFile::open(&path, true, false)?;
        let mut inner = CacheInner {
            file,
            size: config.size,
            offset: HEADER_LEN,
            last_tid: Tid::ZERO,
            filemap: BTreeMap::new(),
            key2entry: HashMap::new(),
            current: HashMap::new(),
            noncurrent: HashMap::new(),
            stats: CacheStats { ring_size: config.size - HEADER_LEN, ..CacheStats::default() },
        };

        if temp.is_some() || inner.file.is_empty()? {
            inner.reset()?;
        } else {
            match inner.scan() {
                Ok(()) => info!(
                    path = %path.display(),
                    entries = inner.key2entry.len(),
                    last_tid = %inner.last_tid,
                    "opened client cache"
                ),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "client cache unusable, starting empty");
                    inner.reset()?;
                }
            }
        }

        Ok(Self { path, inner: Mutex::new(inner), persistent: temp.is_none(), _lock: lock, _temp: temp })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current revision (`tid == ZERO`) or the revision valid at `tid`.
    pub fn load(&self, oid: Oid, tid: Tid) -> ClientResult<Option<(Vec<u8>, Tid)>> {
        let mut inner = self.inner.lock();
        let start = if tid.is_zero() {
            inner.current.get(&oid).copied()
        } else {
            inner
                .noncurrent
                .get(&oid)
                .and_then(|ranges| ranges.range(..=tid).next_back())
                .filter(|(_, end)| **end > tid)
                .map(|(start, _)| *start)
        };
        let found = match start {
            Some(start) => inner.read_entry(&self.path, oid, start)?.map(|data| (data, start)),
            None => None,
        };
        inner.count(found.is_some());
        Ok(found)
    }

    /// Historical revision valid just before `tid`: `start < tid <= end`.
    pub fn load_before(&self, oid: Oid, tid: Tid) -> ClientResult<Option<(Vec<u8>, Tid, Tid)>> {
        let mut inner = self.inner.lock();
        let range = inner
            .noncurrent
            .get(&oid)
            .and_then(|ranges| ranges.range(..tid).next_back())
            .filter(|(_, end)| **end >= tid)
            .map(|(start, end)| (*start, *end));
        let found = match range {
            Some((start, end)) => inner.read_entry(&self.path, oid, start)?.map(|data| (data, start, end)),
            None => None,
        };
        inner.count(found.is_some());
        Ok(found)
    }

    /// Cache a revision valid from `start` until `end` (`ZERO` for current).
    ///
    /// A revision whose range overlaps one already cached for the object is
    /// not stored.
    pub fn store(&self, oid: Oid, data: &[u8], start: Tid, end: Tid) -> ClientResult<()> {
        let mut inner = self.inner.lock();
        if end.is_zero() && inner.current.contains_key(&oid) {
            return Ok(());
        }
        if inner.key2entry.contains_key(&(oid, start)) {
            return Ok(());
        }
        if !end.is_zero() && end <= start {
            return Err(ClientError::protocol(format!("revision range {}..{} is empty", start, end)));
        }
        if inner.overlaps(oid, start, end) {
            debug!(%oid, %start, %end, "revision overlaps a cached range, not cached");
            return Ok(());
        }

        let need = entry_size(data.len());
        if need > inner.size - HEADER_LEN {
            debug!(%oid, size = need, "revision larger than the cache, not cached");
            return Ok(());
        }

        let header = EntryHeader::for_payload(oid, start, end, data)?;
        let reclaimed = inner.makeroom(&self.path, need)?;
        let at = inner.offset;
        let mut buf = Vec::with_capacity(need as usize);
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(data);
        inner.file.write_at(&buf, at)?;

        inner.filemap.insert(at, Block { size: need, key: Some((oid, start)) });
        inner.index_entry(oid, start, end, at);
        let surplus = reclaimed - need;
        if surplus > 0 {
            inner.file.write_at(&free_marker(surplus), at + need)?;
            inner.filemap.insert(at + need, Block { size: surplus, key: None });
        }
        inner.offset = at + need;
        inner.stats.stores += 1;
        Ok(())
    }

    /// Record that `oid` changed in transaction `tid`.
    ///
    /// With `tid == ZERO` every cached revision of `oid` is dropped. Otherwise
    /// the current revision, if any, becomes historical with `end_tid = tid`;
    /// a current revision starting at or after `tid` is kept.
    pub fn invalidate(&self, oid: Oid, tid: Tid) -> ClientResult<()> {
        let mut inner = self.inner.lock();
        if tid.is_zero() {
            return inner.forget_oid(oid);
        }
        let start = match inner.current.get(&oid) {
            Some(start) => *start,
            None => return Ok(()),
        };
        if tid <= start {
            // Late delivery: the cached revision already includes this change.
            debug!(%oid, %start, %tid, "ignoring invalidation older than cached revision");
            return Ok(());
        }
        let (at, _) = match inner.key2entry.get(&(oid, start)) {
            Some(entry) => *entry,
            None => return Ok(()),
        };
        inner.current.remove(&oid);
        inner.file.write_at(&tid.to_bytes(), at + END_TID_OFFSET)?;
        inner.key2entry.insert((oid, start), (at, tid));
        inner.noncurrent.entry(oid).or_default().insert(start, tid);
        Ok(())
    }

    /// Ask `still_valid(oid, start, end)` about every cached revision and drop
    /// all revisions of each object reported stale. Returns those objects.
    pub fn verify<F>(&self, mut still_valid: F) -> ClientResult<Vec<Oid>>
    where
        F: FnMut(Oid, Tid, Tid) -> bool,
    {
        let mut entries: Vec<(Oid, Tid, Tid)> = {
            let inner = self.inner.lock();
            inner.key2entry.iter().map(|(&(oid, start), &(_, end))| (oid, start, end)).collect()
        };
        entries.sort();

        let mut stale = Vec::new();
        for (oid, start, end) in entries {
            if stale.last() == Some(&oid) {
                continue;
            }
            if !still_valid(oid, start, end) {
                stale.push(oid);
            }
        }
        let mut inner = self.inner.lock();
        for oid in &stale {
            inner.forget_oid(*oid)?;
        }
        debug!(stale = stale.len(), "cache verification finished");
        Ok(stale)
    }

    /// Newest transaction whose invalidations the cache has seen.
    pub fn last_tid(&self) -> Tid {
        self.inner.lock().last_tid
    }

    /// Advance the last-seen transaction. Older tids are ignored.
    pub fn set_last_tid(&self, tid: Tid) -> ClientResult<()> {
        let mut inner = self.inner.lock();
        if tid < inner.last_tid {
            debug!(%tid, last_tid = %inner.last_tid, "ignoring older last tid");
            return Ok(());
        }
        inner.last_tid = tid;
        inner.write_header()
    }

    /// Drop every entry and forget the last tid.
    pub fn clear(&self) -> ClientResult<()> {
        let mut inner = self.inner.lock();
        info!(path = %self.path.display(), entries = inner.key2entry.len(), "clearing client cache");
        inner.reset()
    }

    /// Number of cached revisions.
    pub fn len(&self) -> usize {
        self.inner.lock().key2entry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `oid` has a current revision cached.
    pub fn contains_current(&self, oid: Oid) -> bool {
        self.inner.lock().current.contains_key(&oid)
    }

    /// Start tid of the cached current revision of `oid`.
    pub fn current_tid(&self, oid: Oid) -> Option<Tid> {
        self.inner.lock().current.get(&oid).copied()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.entries = inner.key2entry.len();
        stats.current = inner.current.len();
        stats.noncurrent = stats.entries - stats.current;
        stats.bytes_used = inner.filemap.values().filter(|b| b.key.is_some()).map(|b| b.size).sum();
        stats
    }

    /// Check the in-memory indexes against each other.
    ///
    /// The ring must be tiled by `filemap` without gaps or overlaps, every
    /// live block must match `key2entry`, each object has at most one current
    /// revision, and historical ranges are non-empty and disjoint.
    pub fn check_invariants(&self) -> Result<(), String> {
        let inner = self.inner.lock();
        let mut expected = HEADER_LEN;
        let mut live = 0usize;
        for (&at, block) in &inner.filemap {
            if at != expected {
                return Err(format!("block at {} but previous block ends at {}", at, expected));
            }
            if block.size == 0 {
                return Err(format!("empty block at {}", at));
            }
            expected = at + block.size;
            if let Some(key) = block.key {
                live += 1;
                match inner.key2entry.get(&key) {
                    Some(&(offset, _)) if offset == at => {}
                    _ => return Err(format!("block at {} holds {:?} but key2entry disagrees", at, key)),
                }
            }
        }
        if expected != inner.size {
            return Err(format!("blocks end at {}, ring ends at {}", expected, inner.size));
        }
        if live != inner.key2entry.len() {
            return Err(format!("{} live blocks but {} entries", live, inner.key2entry.len()));
        }

        let mut current_seen: HashMap<Oid, usize> = HashMap::new();
        for (&(oid, start), &(_, end)) in &inner.key2entry {
            if end.is_zero() {
                *current_seen.entry(oid).or_default() += 1;
                if inner.current.get(&oid) != Some(&start) {
                    return Err(format!("{} has a current entry at {} missing from current", oid, start));
                }
            } else if inner.noncurrent.get(&oid).and_then(|r| r.get(&start)) != Some(&end) {
                return Err(format!("{} range {}..{} missing from noncurrent", oid, start, end));
            }
        }
        if let Some((oid, n)) = current_seen.iter().find(|(_, n)| **n > 1) {
            return Err(format!("{} has {} current entries", oid, n));
        }
        if current_seen.len() != inner.current.len() {
            return Err("current holds objects without a current entry".into());
        }

        for (oid, ranges) in &inner.noncurrent {
            let mut prev_end = Tid::ZERO;
            for (&start, &end) in ranges {
                if start >= end {
                    return Err(format!("{} has empty range {}..{}", oid, start, end));
                }
                if start < prev_end {
                    return Err(format!("{} ranges overlap at {}", oid, start));
                }
                prev_end = end;
            }
            if let Some(&current) = inner.current.get(oid) {
                if current < prev_end {
                    return Err(format!("{} current revision {} starts inside range ending {}", oid, current, prev_end));
                }
            }
        }
        Ok(())
    }

    /// Persist the header so the next open starts where this one stopped.
    pub fn close(&self) -> ClientResult<()> {
        if !self.persistent {
            return Ok(());
        }
        let inner = self.inner.lock();
        inner.write_header()?;
        inner.file.sync()?;
        Ok(())
    }
}

impl Drop for ClientCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(path = %self.path.display(), error = %e, "failed to close client cache cleanly");
        }
    }
}

impl CacheInner {
    fn count(&mut self, hit: bool) {
        if hit {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
    }

    fn write_header(&self) -> ClientResult<()> {
        let header = CacheHeader { last_tid: self.last_tid, cache_size: self.size, current_offset: self.offset };
        self.file.write_at(&header.encode(), 0)?;
        Ok(())
    }

    /// Empty ring: one free block covering everything after the header.
    fn reset(&mut self) -> ClientResult<()> {
        self.filemap.clear();
        self.key2entry.clear();
        self.current.clear();
        self.noncurrent.clear();
        self.offset = HEADER_LEN;
        self.last_tid = Tid::ZERO;

        self.file.truncate(self.size)?;
        let ring = self.size - HEADER_LEN;
        self.file.write_at(&free_marker(ring), HEADER_LEN)?;
        self.filemap.insert(HEADER_LEN, Block { size: ring, key: None });
        self.write_header()?;
        self.file.sync()?;
        Ok(())
    }

    /// Rebuild the indexes from the file.
    fn scan(&mut self) -> ClientResult<()> {
        let path = self.file.path().to_path_buf();
        let len = self.file.len()?;
        let header = CacheHeader::decode(&self.file.read_at(0, HEADER_LEN as usize)?).map_err(|e| in_cache(e, &path))?;
        if header.cache_size != self.size || len != self.size {
            return Err(ClientError::CacheCorrupt {
                path,
                offset: 0,
                reason: format!("file holds a {} byte cache, configured for {}", header.cache_size, self.size),
            });
        }

        let mut at = HEADER_LEN;
        while at < self.size {
            let head = (self.size - at).min(ENTRY_HEADER_LEN) as usize;
            let buf = self.file.read_at(at, head)?;
            let size = match block_kind(&buf, at).map_err(|e| in_cache(e, &path))? {
                BlockKind::Free(size) => {
                    self.filemap.insert(at, Block { size, key: None });
                    size
                }
                BlockKind::Allocated => {
                    let entry = EntryHeader::decode(&buf, at).map_err(|e| in_cache(e, &path))?;
                    let key = (entry.oid, entry.start_tid);
                    if self.key2entry.contains_key(&key)
                        || (entry.end_tid.is_zero() && self.current.contains_key(&entry.oid))
                    {
                        return Err(scan_error(&path, at, "duplicate entry"));
                    }
                    if self.overlaps(entry.oid, entry.start_tid, entry.end_tid) {
                        return Err(scan_error(&path, at, "entry overlaps another revision"));
                    }
                    self.filemap.insert(at, Block { size: entry.size, key: Some(key) });
                    self.index_entry(entry.oid, entry.start_tid, entry.end_tid, at);
                    entry.size
                }
            };
            if size > self.size - at {
                return Err(scan_error(&path, at, "block runs past the end of the ring"));
            }
            at += size;
        }

        self.last_tid = header.last_tid;
        self.offset = if header.current_offset == self.size || self.filemap.contains_key(&header.current_offset) {
            header.current_offset
        } else {
            HEADER_LEN
        };
        Ok(())
    }

    /// Whether a revision valid over `start..end` would overlap one already
    /// cached for `oid`. A zero `end` means the revision is current.
    fn overlaps(&self, oid: Oid, start: Tid, end: Tid) -> bool {
        let ranges = self.noncurrent.get(&oid);
        if end.is_zero() {
            return ranges.and_then(|r| r.values().next_back()).map_or(false, |&last| last > start);
        }
        if self.current.get(&oid).map_or(false, |&cur| cur < end) {
            return true;
        }
        ranges.map_or(false, |r| {
            r.range(..start).next_back().map_or(false, |(_, &prev_end)| prev_end > start)
                || r.range(start..end).next().is_some()
        })
    }

    fn index_entry(&mut self, oid: Oid, start: Tid, end: Tid, at: u64) {
        self.key2entry.insert((oid, start), (at, end));
        if end.is_zero() {
            self.current.insert(oid, start);
        } else {
            self.noncurrent.entry(oid).or_default().insert(start, end);
        }
    }

    fn unindex_entry(&mut self, oid: Oid, start: Tid) -> Option<u64> {
        let (at, end) = self.key2entry.remove(&(oid, start))?;
        if end.is_zero() {
            if self.current.get(&oid) == Some(&start) {
                self.current.remove(&oid);
            }
        } else if let Some(ranges) = self.noncurrent.get_mut(&oid) {
            ranges.remove(&start);
            if ranges.is_empty() {
                self.noncurrent.remove(&oid);
            }
        }
        Some(at)
    }

    /// Turn the entry's block into free space.
    fn free_entry(&mut self, oid: Oid, start: Tid) -> ClientResult<()> {
        if let Some(at) = self.unindex_entry(oid, start) {
            if let Some(block) = self.filemap.get_mut(&at) {
                block.key = None;
                let size = block.size;
                self.file.write_at(&free_marker(size), at)?;
            }
        }
        Ok(())
    }

    fn forget_oid(&mut self, oid: Oid) -> ClientResult<()> {
        let mut starts: Vec<Tid> = self.noncurrent.get(&oid).map(|r| r.keys().copied().collect()).unwrap_or_default();
        if let Some(start) = self.current.get(&oid) {
            starts.push(*start);
        }
        for start in starts {
            self.free_entry(oid, start)?;
        }
        Ok(())
    }

    /// Reclaim at least `need` bytes starting at the write offset, wrapping
    /// first if the record would run past the end of the ring. Returns the
    /// bytes reclaimed.
    fn makeroom(&mut self, path: &Path, need: u64) -> ClientResult<u64> {
        if self.offset + need > self.size {
            self.offset = HEADER_LEN;
        }
        let mut reclaimed = 0;
        while reclaimed < need {
            let at = self.offset + reclaimed;
            let block = self
                .filemap
                .remove(&at)
                .ok_or_else(|| scan_error(path, at, "write offset is not on a block boundary"))?;
            if let Some((oid, start)) = block.key {
                self.unindex_entry(oid, start);
                self.stats.evictions += 1;
            }
            reclaimed += block.size;
        }
        Ok(reclaimed)
    }

    /// Payload of the entry for `(oid, start)`. A damaged entry is dropped
    /// and reported as a miss.
    fn read_entry(&mut self, path: &Path, oid: Oid, start: Tid) -> ClientResult<Option<Vec<u8>>> {
        let (at, _) = match self.key2entry.get(&(oid, start)) {
            Some(entry) => *entry,
            None => return Ok(None),
        };
        let size = match self.filemap.get(&at) {
            Some(block) => block.size,
            None => return Err(scan_error(path, at, "entry has no block")),
        };
        let buf = self.file.read_at(at, size as usize)?;
        let (head, payload) = buf.split_at(ENTRY_HEADER_LEN as usize);
        let valid = match EntryHeader::decode(head, at) {
            Ok(header) => header.oid == oid && header.start_tid == start && header.verify(payload),
            Err(_) => false,
        };
        if !valid {
            warn!(path = %path.display(), offset = at, %oid, "damaged cache entry dropped");
            self.free_entry(oid, start)?;
            self.stats.evictions += 1;
            return Ok(None);
        }
        Ok(Some(payload.to_vec()))
    }
}

fn in_cache(err: ClientError, path: &Path) -> ClientError {
    match err {
        ClientError::CacheCorrupt { offset, reason, .. } => {
            ClientError::CacheCorrupt { path: path.to_path_buf(), offset, reason }
        }
        other => other,
    }
}

fn scan_error(path: &Path, offset: u64, reason: &str) -> ClientError {
    ClientError::CacheCorrupt { path: path.to_path_buf(), offset, reason: reason.to_string() }
}
