//! L2 Cache - Persistent Disk Tier
//!
//! Size-bounded, compressed, checksum-verified cache that survives restarts.
//!
//! # Layout
//!
//! ```text
//! <dir>/
//!   index.json          committed index (key -> file, sizes, checksum, TTL)
//!   index.json.tmp      next index, renamed over index.json on commit
//!   data/<xx>/<id>.bin  immutable payload files
//!   tmp/<id>.part       payloads being written
//! ```
//!
//! # Write ordering
//!
//! A payload is fully written and fsynced under `tmp/`, renamed into `data/`,
//! and only then referenced by a new index which is itself written to a
//! temporary file and atomically renamed. Payload files are never rewritten
//! in place, so readers holding an old index entry either read the complete
//! old payload or find it gone (a miss). Index commits are serialized by a
//! commit lock; the in-memory index lock is only held exclusively while the
//! map changes, never across file I/O. Hits record access statistics through
//! atomics under the shared lock.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::compression::{CompressionAlgorithm, CompressionConfig, CompressionManager};
use super::entry::{CacheKey, Checksum};
use super::{DEFAULT_L2_CAPACITY, DEFAULT_L2_COMPRESSION_THRESHOLD};
use crate::error::{Error, Result};

const INDEX_FILE: &str = "index.json";
const INDEX_TMP_FILE: &str = "index.json.tmp";
const DATA_DIR: &str = "data";
const TMP_DIR: &str = "tmp";
const INDEX_VERSION: u32 = 1;

/// L2 Cache configuration
#[derive(Debug, Clone)]
pub struct L2Config {
    /// Root directory of the tier
    pub dir: PathBuf,
    /// Maximum stored (post-compression) bytes
    pub capacity: u64,
    /// Payloads at or above this size are LZ4-compressed
    pub compression_threshold: u64,
    /// TTL applied when `put` is called without one (None = no expiry)
    pub default_ttl: Option<Duration>,
    /// Re-verify every payload checksum when opening
    pub verify_on_open: bool,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./strata-cache"),
            capacity: DEFAULT_L2_CAPACITY,
            compression_threshold: DEFAULT_L2_COMPRESSION_THRESHOLD,
            default_ttl: Some(Duration::from_secs(24 * 3600)),
            verify_on_open: true,
        }
    }
}

/// Index entry for one persisted payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L2IndexEntry {
    /// Payload file, relative to the data directory
    pub file: String,
    /// Bytes on disk
    pub stored_size: u64,
    /// Bytes after decompression
    pub raw_size: u64,
    /// SHA-256 of the uncompressed payload (hex)
    pub checksum: String,
    pub compression: CompressionAlgorithm,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// Tie-breaker for entries accessed within the same clock tick
    pub access_seq: u64,
}

impl L2IndexEntry {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// Deadline `ttl` after `now`; a TTL past the calendar's range never expires
fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

/// A verified payload read from disk
#[derive(Debug, Clone)]
pub struct L2Hit {
    pub data: Bytes,
    pub checksum: Checksum,
    pub expires_at: Option<DateTime<Utc>>,
}

impl L2Hit {
    /// Time left before expiry (None = no TTL)
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }
}

#[derive(Serialize)]
struct IndexFileRef<'a> {
    version: u32,
    entries: &'a HashMap<&'a CacheKey, L2IndexEntry>,
}

#[derive(Deserialize)]
struct IndexFile {
    version: u32,
    #[serde(default)]
    entries: HashMap<CacheKey, L2IndexEntry>,
}

/// In-memory index slot; the access fields of `entry` are only the values
/// it was created or recovered with.
struct Slot {
    entry: L2IndexEntry,
    last_accessed_ms: AtomicI64,
    access_count: AtomicU64,
    access_seq: AtomicU64,
}

impl Slot {
    fn new(entry: L2IndexEntry) -> Self {
        Self {
            last_accessed_ms: AtomicI64::new(entry.last_accessed_at.timestamp_millis()),
            access_count: AtomicU64::new(entry.access_count),
            access_seq: AtomicU64::new(entry.access_seq),
            entry,
        }
    }

    fn touch(&self, now: DateTime<Utc>, seq: u64) {
        self.last_accessed_ms
            .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.access_seq.fetch_max(seq, Ordering::Relaxed);
    }

    /// Eviction order: older access first
    fn recency(&self) -> (i64, u64) {
        (
            self.last_accessed_ms.load(Ordering::Relaxed),
            self.access_seq.load(Ordering::Relaxed),
        )
    }

    /// The entry with its current access statistics
    fn snapshot(&self) -> L2IndexEntry {
        let (last_ms, seq) = self.recency();
        L2IndexEntry {
            last_accessed_at: DateTime::from_timestamp_millis(last_ms)
                .unwrap_or(self.entry.last_accessed_at),
            access_count: self.access_count.load(Ordering::Relaxed),
            access_seq: seq,
            ..self.entry.clone()
        }
    }
}

#[derive(Default)]
struct L2State {
    entries: HashMap<CacheKey, Slot>,
    total_size: u64,
}

impl L2State {
    fn remove(&mut self, key: &CacheKey) -> Option<L2IndexEntry> {
        let removed = self.entries.remove(key)?;
        self.total_size -= removed.entry.stored_size;
        Some(removed.entry)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let entries: HashMap<&CacheKey, L2IndexEntry> = self
            .entries
            .iter()
            .map(|(key, slot)| (key, slot.snapshot()))
            .collect();
        Ok(serde_json::to_vec(&IndexFileRef {
            version: INDEX_VERSION,
            entries: &entries,
        })?)
    }
}

/// Why an entry could not be read back
enum ReadFault {
    Missing,
    Corrupt(String),
}

/// L2 Cache - disk tier
pub struct L2Cache {
    config: L2Config,
    compression: CompressionManager,
    state: RwLock<L2State>,
    /// Serializes index commits (and the payload renames feeding them)
    commit_lock: Mutex<()>,
    next_seq: AtomicU64,
    /// Access statistics changed since the last commit
    dirty: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    corruptions: AtomicU64,
    writes: AtomicU64,
    bytes_saved: AtomicU64,
}

impl L2Cache {
    /// Open (or create) the tier at `config.dir`, recovering what it can
    pub fn open(config: L2Config) -> Result<Self> {
        fs::create_dir_all(config.dir.join(DATA_DIR))?;
        fs::create_dir_all(config.dir.join(TMP_DIR))?;

        let compression = CompressionManager::with_config(CompressionConfig {
            threshold_bytes: config.compression_threshold,
            ..Default::default()
        });

        let cache = Self {
            compression,
            state: RwLock::new(L2State::default()),
            commit_lock: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            corruptions: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            bytes_saved: AtomicU64::new(0),
            config,
        };
        cache.recover()?;
        Ok(cache)
    }

    fn recover(&self) -> Result<()> {
        let stale_parts = clear_dir(&self.config.dir.join(TMP_DIR))?;
        if stale_parts > 0 {
            debug!(stale_parts, "Removed interrupted L2 writes");
        }

        let loaded = self.read_index_file();
        let found = loaded.len();
        let now = Utc::now();

        let mut state = L2State::default();
        let mut dropped = 0usize;
        for (key, entry) in loaded {
            if entry.is_expired_at(now) {
                dropped += 1;
                continue;
            }
            if let Err(fault) = self.check_payload(&entry, self.config.verify_on_open) {
                if let ReadFault::Corrupt(reason) = fault {
                    warn!(%key, %reason, "Dropping unverifiable L2 entry");
                }
                dropped += 1;
                continue;
            }
            self.next_seq.fetch_max(entry.access_seq, Ordering::Relaxed);
            state.total_size += entry.stored_size;
            state.entries.insert(key, Slot::new(entry));
        }

        // A smaller capacity than last run: shed the oldest
        let mut evicted = Vec::new();
        Self::evict_locked(&mut state, self.config.capacity, 0, &mut evicted);
        dropped += evicted.len();

        let _commit = self.commit_lock.lock();
        if dropped > 0 || found == 0 {
            self.commit_index(&state.encode()?)?;
        }
        *self.state.write() = state;
        let orphans = self.remove_orphans_locked()?;

        info!(
            dir = %self.config.dir.display(),
            entries = found - dropped,
            dropped,
            orphans,
            "L2 cache opened"
        );
        Ok(())
    }

    fn read_index_file(&self) -> HashMap<CacheKey, L2IndexEntry> {
        let path = self.config.dir.join(INDEX_FILE);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "L2 index unreadable, starting empty");
                return HashMap::new();
            }
        };
        match serde_json::from_slice::<IndexFile>(&raw) {
            Ok(index) if index.version == INDEX_VERSION => index.entries,
            Ok(index) => {
                warn!(version = index.version, "Unsupported L2 index version, starting empty");
                HashMap::new()
            }
            Err(e) => {
                warn!(error = %e, "L2 index corrupt, starting empty");
                HashMap::new()
            }
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read and verify a payload. Corruption evicts the entry and reads as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<L2Hit> {
        let Some(entry) = self.state.read().entries.get(key).map(|s| s.entry.clone()) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired_at(Utc::now()) {
            if self.remove_if_file(key, &entry.file) {
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match self.read_payload(&entry) {
            Ok((data, checksum)) => {
                self.touch(key, &entry.file);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(L2Hit {
                    data,
                    checksum,
                    expires_at: entry.expires_at,
                })
            }
            Err(fault) => {
                self.handle_fault(key, &entry, fault);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Re-verify a stored payload without counting an access
    pub fn verify(&self, key: &CacheKey) -> bool {
        let Some(entry) = self.state.read().entries.get(key).map(|s| s.entry.clone()) else {
            return false;
        };
        match self.check_payload(&entry, true) {
            Ok(()) => true,
            Err(fault) => {
                self.handle_fault(key, &entry, fault);
                false
            }
        }
    }

    fn handle_fault(&self, key: &CacheKey, entry: &L2IndexEntry, fault: ReadFault) {
        let reason = match fault {
            ReadFault::Missing => "payload file missing".to_string(),
            ReadFault::Corrupt(reason) => reason,
        };
        warn!(%key, file = %entry.file, %reason, "Corrupted L2 entry evicted");
        self.corruptions.fetch_add(1, Ordering::Relaxed);
        self.remove_if_file(key, &entry.file);
    }

    fn check_payload(&self, entry: &L2IndexEntry, full: bool) -> std::result::Result<(), ReadFault> {
        if full {
            return self.read_payload(entry).map(|_| ());
        }
        match fs::metadata(self.payload_file(&entry.file)) {
            Ok(meta) if meta.len() == entry.stored_size => Ok(()),
            Ok(meta) => Err(ReadFault::Corrupt(format!(
                "size {} != recorded {}",
                meta.len(),
                entry.stored_size
            ))),
            Err(_) => Err(ReadFault::Missing),
        }
    }

    fn read_payload(&self, entry: &L2IndexEntry) -> std::result::Result<(Bytes, Checksum), ReadFault> {
        let stored = match fs::read(self.payload_file(&entry.file)) {
            Ok(stored) => stored,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(ReadFault::Missing),
            Err(e) => return Err(ReadFault::Corrupt(format!("unreadable payload: {e}"))),
        };
        if stored.len() as u64 != entry.stored_size {
            return Err(ReadFault::Corrupt(format!(
                "size {} != recorded {}",
                stored.len(),
                entry.stored_size
            )));
        }

        let data = self
            .compression
            .decompress(&stored, entry.compression)
            .map_err(|e| ReadFault::Corrupt(e.to_string()))?;

        let expected =
            Checksum::from_hex(&entry.checksum).map_err(|e| ReadFault::Corrupt(e.to_string()))?;
        if data.len() as u64 != entry.raw_size || !expected.matches(&data) {
            return Err(ReadFault::Corrupt("checksum mismatch".into()));
        }
        Ok((data, expected))
    }

    fn touch(&self, key: &CacheKey, file: &str) {
        let state = self.state.read();
        if let Some(slot) = state.entries.get(key).filter(|s| s.entry.file == file) {
            slot.touch(Utc::now(), self.bump_seq());
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    fn bump_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Persist a payload. `ttl` of None applies the configured default.
    pub fn put(&self, key: CacheKey, data: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.put_guarded(key, data, ttl, || true).map(|_| ())
    }

    /// Persist a payload; the index is only committed if `guard` holds under
    /// the index lock. Returns `Ok(false)` when the guard rejected the write.
    pub fn put_guarded<G>(&self, key: CacheKey, data: &[u8], ttl: Option<Duration>, guard: G) -> Result<bool>
    where
        G: FnOnce() -> bool,
    {
        let checksum = Checksum::compute(data);
        let (stored, compression) = self.compression.compress(data);
        let stored_size = stored.len() as u64;
        if stored_size > self.config.capacity {
            return Err(Error::CapacityExceeded {
                tier: "L2",
                size: stored_size,
                capacity: self.config.capacity,
            });
        }

        let now = Utc::now();
        let expires_at = ttl
            .or(self.config.default_ttl)
            .and_then(|ttl| expiry_after(now, ttl));

        // Payload first
        let name = uuid::Uuid::new_v4().simple().to_string();
        let part = self.config.dir.join(TMP_DIR).join(format!("{name}.part"));
        write_synced(&part, &stored)?;
        let file = format!("{}/{}.bin", &name[..2], name);

        let _commit = self.commit_lock.lock();
        let target = self.payload_file(&file);
        let placed = target
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::rename(&part, &target));
        if let Err(e) = placed {
            let _ = fs::remove_file(&part);
            return Err(e.into());
        }

        let mut state = self.state.write();
        if !guard() {
            drop(state);
            let _ = fs::remove_file(&target);
            debug!(%key, "L2 write fenced off by invalidation");
            return Ok(false);
        }

        let mut obsolete = Vec::new();
        if let Some(old) = state.remove(&key) {
            obsolete.push(old.file);
        }
        let mut evicted = Vec::new();
        Self::evict_locked(&mut state, self.config.capacity, stored_size, &mut evicted);

        state.entries.insert(
            key.clone(),
            Slot::new(L2IndexEntry {
                file,
                stored_size,
                raw_size: data.len() as u64,
                checksum: checksum.to_hex(),
                compression,
                created_at: now,
                expires_at,
                last_accessed_at: now,
                access_count: 0,
                access_seq: self.bump_seq(),
            }),
        );
        state.total_size += stored_size;
        self.commit_after(state)?;

        self.writes.fetch_add(1, Ordering::Relaxed);
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        if compression != CompressionAlgorithm::None {
            self.bytes_saved
                .fetch_add(data.len() as u64 - stored_size, Ordering::Relaxed);
        }
        for (evicted_key, entry) in evicted {
            debug!(key = %evicted_key, size = entry.stored_size, "L2 evicted");
            obsolete.push(entry.file);
        }
        self.remove_files(obsolete);
        Ok(true)
    }

    /// Pick victims until `incoming` more bytes fit: expired first, then
    /// oldest access.
    fn evict_locked(
        state: &mut L2State,
        capacity: u64,
        incoming: u64,
        evicted: &mut Vec<(CacheKey, L2IndexEntry)>,
    ) {
        if state.total_size + incoming <= capacity {
            return;
        }
        let now = Utc::now();
        let mut order: Vec<(bool, (i64, u64), CacheKey)> = state
            .entries
            .iter()
            .map(|(k, s)| (!s.entry.is_expired_at(now), s.recency(), k.clone()))
            .collect();
        order.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        for (_, _, key) in order {
            if state.total_size + incoming <= capacity {
                break;
            }
            if let Some(entry) = state.remove(&key) {
                evicted.push((key, entry));
            }
        }
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove a key; returns true if it was present
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.remove_where(|k, _| k == key) > 0
    }

    /// Remove every key matching `pred`; returns the count removed
    pub fn invalidate_matching<P>(&self, pred: P) -> usize
    where
        P: Fn(&CacheKey) -> bool,
    {
        self.remove_where(|k, _| pred(k))
    }

    /// Drop every expired entry; returns the count removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let purged = self.remove_where(|_, e| e.is_expired_at(now));
        self.expirations
            .fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    fn remove_if_file(&self, key: &CacheKey, file: &str) -> bool {
        self.remove_where(|k, e| k == key && e.file == file) > 0
    }

    fn remove_where<P>(&self, pred: P) -> usize
    where
        P: Fn(&CacheKey, &L2IndexEntry) -> bool,
    {
        let _commit = self.commit_lock.lock();
        let mut state = self.state.write();
        let doomed: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|(k, s)| pred(k, &s.entry))
            .map(|(k, _)| k.clone())
            .collect();
        if doomed.is_empty() {
            return 0;
        }

        let files: Vec<String> = doomed
            .iter()
            .filter_map(|k| state.remove(k))
            .map(|e| e.file)
            .collect();
        if let Err(e) = self.commit_after(state) {
            // Entries are gone from memory; the next commit or restart reconciles
            warn!(error = %e, "Failed to commit L2 index after removal");
        }

        self.remove_files(files);
        doomed.len()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Persist access statistics gathered since the last commit
    pub fn flush(&self) -> Result<()> {
        let _commit = self.commit_lock.lock();
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let body = self.state.read().encode();
        let committed = body.and_then(|body| self.commit_index(&body));
        if committed.is_err() {
            self.dirty.store(true, Ordering::Relaxed);
        }
        committed
    }

    /// Delete payload files no index entry references
    pub fn cleanup_orphans(&self) -> Result<usize> {
        let _commit = self.commit_lock.lock();
        self.remove_orphans_locked()
    }

    fn remove_orphans_locked(&self) -> Result<usize> {
        let referenced: std::collections::HashSet<PathBuf> = self
            .state
            .read()
            .entries
            .values()
            .map(|s| self.payload_file(&s.entry.file))
            .collect();

        let mut removed = 0;
        for bucket in fs::read_dir(self.config.dir.join(DATA_DIR))? {
            let bucket = bucket?.path();
            if !bucket.is_dir() {
                continue;
            }
            for file in fs::read_dir(&bucket)? {
                let path = file?.path();
                if !referenced.contains(&path) && fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Commit the index after a change made under `state`. Must be called
    /// with the commit lock held. Readers are let back in before encoding and
    /// the lock is released before any file I/O.
    fn commit_after(&self, state: RwLockWriteGuard<'_, L2State>) -> Result<()> {
        self.dirty.store(false, Ordering::Relaxed);
        let state = RwLockWriteGuard::downgrade(state);
        let body = state.encode();
        drop(state);
        let committed = body.and_then(|body| self.commit_index(&body));
        if committed.is_err() {
            self.dirty.store(true, Ordering::Relaxed);
        }
        committed
    }

    fn commit_index(&self, body: &[u8]) -> Result<()> {
        let tmp = self.config.dir.join(INDEX_TMP_FILE);
        write_synced(&tmp, body)?;
        fs::rename(&tmp, self.config.dir.join(INDEX_FILE))?;
        Ok(())
    }

    fn remove_files(&self, files: Vec<String>) {
        for file in files {
            let path = self.payload_file(&file);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove L2 payload");
                }
            }
        }
    }

    fn payload_file(&self, file: &str) -> PathBuf {
        self.config.dir.join(DATA_DIR).join(file)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// On-disk location of a key's payload (diagnostics and tests)
    pub fn payload_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.state
            .read()
            .entries
            .get(key)
            .map(|s| self.payload_file(&s.entry.file))
    }

    /// Index metadata for a key, with current access statistics
    pub fn index_entry(&self, key: &CacheKey) -> Option<L2IndexEntry> {
        self.state.read().entries.get(key).map(Slot::snapshot)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.read().entries.contains_key(key)
    }

    /// Stored bytes currently indexed
    pub fn size(&self) -> u64 {
        self.state.read().total_size
    }

    pub fn capacity(&self) -> u64 {
        self.config.capacity
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn corruptions(&self) -> u64 {
        self.corruptions.load(Ordering::Relaxed)
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }
}

/// L2 cache statistics
#[derive(Debug, Clone)]
pub struct L2Stats {
    pub entries: usize,
    pub size: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub corruptions: u64,
    pub writes: u64,
    pub compressed_entries: usize,
    /// Bytes saved by compression across all writes
    pub bytes_saved: u64,
}

impl L2Cache {
    pub fn stats(&self) -> L2Stats {
        let state = self.state.read();
        L2Stats {
            entries: state.entries.len(),
            size: state.total_size,
            capacity: self.config.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions(),
            expirations: self.expirations.load(Ordering::Relaxed),
            corruptions: self.corruptions(),
            writes: self.writes.load(Ordering::Relaxed),
            compressed_entries: state
                .entries
                .values()
                .filter(|s| s.entry.compression != CompressionAlgorithm::None)
                .count(),
            bytes_saved: self.bytes_saved.load(Ordering::Relaxed),
        }
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn clear_dir(dir: &Path) -> std::io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

// =============================================================================
// Tests
// =============================================================================
