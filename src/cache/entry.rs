//! Cache Entry Types
//!
//! Keys, checksums and the per-entry metadata shared by the memory and disk
//! tiers. Each tier owns its own copy of an entry; nothing here is shared by
//! reference across tiers.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Namespace reserved for keys that address index-tier content
pub const INDEX_NAMESPACE: &str = "index";

/// Process-wide recency clock. Strictly increasing, so two accesses never tie.
static RECENCY_CLOCK: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_tick() -> u64 {
    RECENCY_CLOCK.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Cache Key
// =============================================================================

/// Cache key - namespace plus content id
#[derive(Clone, Eq)]
pub struct CacheKey {
    /// Precomputed hash over namespace and id
    hash: u64,
    namespace: String,
    id: String,
}

impl CacheKey {
    /// Create a new cache key. The namespace must be non-empty and free of
    /// `:` so the `namespace:id` form parses back to the same key.
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        Ok(Self::from_parts(namespace, id.into()))
    }

    fn from_parts(namespace: String, id: String) -> Self {
        let hash = Self::fx_hash(namespace.as_bytes()).rotate_left(17) ^ Self::fx_hash(id.as_bytes());
        Self {
            hash,
            namespace,
            id,
        }
    }

    /// Key addressing index-tier content (`index:<fragment>[#<pointer>]`)
    pub fn index(target: impl Into<String>) -> Self {
        Self::from_parts(INDEX_NAMESPACE.to_string(), target.into())
    }

    /// Parse the `namespace:id` form produced by `Display`
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((ns, id)) if !ns.is_empty() && !id.is_empty() => Ok(Self::from_parts(ns.into(), id.into())),
            _ => Err(Error::Config(format!("invalid cache key '{s}', expected namespace:id"))),
        }
    }

    /// Fast non-cryptographic hash (FxHash algorithm)
    #[inline]
    fn fx_hash(bytes: &[u8]) -> u64 {
        const SEED: u64 = 0x517cc1b727220a95;
        let mut hash = SEED;
        for &byte in bytes {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(SEED);
        }
        hash
    }

    /// Get the shard index for this key (shard_count must be a power of two)
    #[inline]
    pub fn shard_index(&self, shard_count: usize) -> usize {
        (self.hash as usize) & (shard_count - 1)
    }

    #[inline]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Precomputed hash, stable for the process lifetime
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// True if this key addresses index-tier content
    pub fn is_index(&self) -> bool {
        self.namespace == INDEX_NAMESPACE
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.namespace == other.namespace && self.id == other.id
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({self})")
    }
}

impl Serialize for CacheKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CacheKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty() || namespace.contains(':') {
        return Err(Error::Config(format!(
            "invalid cache namespace '{namespace}': must be non-empty and contain no ':'"
        )));
    }
    Ok(())
}

// =============================================================================
// Key Derivation
// =============================================================================

/// Deterministic content id → cache key mapping supplied by collaborators
pub trait KeyDeriver: Send + Sync {
    fn derive(&self, content_id: &str) -> CacheKey;
}

/// Places every content id under one fixed namespace
#[derive(Debug, Clone)]
pub struct NamespacedKeys {
    namespace: String,
}

impl NamespacedKeys {
    pub fn new(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        Ok(Self { namespace })
    }
}

impl KeyDeriver for NamespacedKeys {
    fn derive(&self, content_id: &str) -> CacheKey {
        CacheKey::from_parts(self.namespace.clone(), content_id.trim().to_string())
    }
}

// =============================================================================
// Checksum
// =============================================================================

/// SHA-256 content checksum
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    /// Checksum of a payload
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| Error::Internal(format!("invalid checksum '{s}': {e}")))?;
        Ok(Self(out))
    }

    /// Does `data` still hash to this checksum
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// =============================================================================
// Entry Metadata
// =============================================================================

/// Metadata for in-memory cache entries
#[derive(Debug)]
pub struct EntryMetadata {
    /// Payload size in bytes
    size: u64,
    /// Creation time
    created_at: Instant,
    /// Expiry deadline (None = no TTL)
    expires_at: Option<Instant>,
    /// Recency tick of the last access
    last_access: AtomicU64,
    /// Access count
    access_count: AtomicU32,
    /// Content checksum
    checksum: Checksum,
}

impl EntryMetadata {
    /// Create new entry metadata. A TTL too large to represent never expires.
    pub fn new(size: u64, checksum: Checksum, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            size,
            created_at: now,
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
            last_access: AtomicU64::new(next_tick()),
            access_count: AtomicU32::new(0),
            checksum,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Record an access and return the new count
    #[inline]
    pub fn record_access(&self) -> u32 {
        self.last_access.store(next_tick(), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Recency tick; larger means more recently used
    #[inline]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    #[inline]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Check if entry has expired
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    #[inline]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }

    /// Time left before expiry (None = no TTL)
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    #[inline]
    pub fn checksum(&self) -> &Checksum {
        &self.checksum
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// Cache entry containing data and metadata
pub struct CacheEntry {
    /// Entry metadata
    pub metadata: EntryMetadata,
    /// Cached payload (zero-copy)
    data: Bytes,
}

impl CacheEntry {
    /// Create a new cache entry without TTL
    pub fn new(data: Bytes) -> Self {
        Self::with_ttl(data, None)
    }

    /// Create with an optional TTL
    pub fn with_ttl(data: Bytes, ttl: Option<Duration>) -> Self {
        let checksum = Checksum::compute(&data);
        Self {
            metadata: EntryMetadata::new(data.len() as u64, checksum, ttl),
            data,
        }
    }

    /// Create with a checksum computed elsewhere (tier transfers)
    pub fn with_checksum(data: Bytes, checksum: Checksum, ttl: Option<Duration>) -> Self {
        Self {
            metadata: EntryMetadata::new(data.len() as u64, checksum, ttl),
            data,
        }
    }

    /// Get data (zero-copy)
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.metadata.size()
    }

    #[inline]
    pub fn record_access(&self) -> u32 {
        self.metadata.record_access()
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.metadata.is_expired()
    }

    /// Verify content integrity
    pub fn verify_integrity(&self) -> bool {
        self.metadata.checksum().matches(&self.data)
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("size", &self.metadata.size())
            .field("access_count", &self.metadata.access_count())
            .field("is_expired", &self.is_expired())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
