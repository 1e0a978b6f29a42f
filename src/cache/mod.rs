//! Cache layer: byte store abstraction and the metadata index
//!
//! The byte store is an opaque key/value map with TTLs. The in-tree
//! reference implementation keeps everything in memory; disk or remote
//! backends implement the same trait out of tree. The [`CacheIndex`]
//! sits on top of any byte store and enforces the size and TTL bounds.

pub mod index;
pub mod memory;

pub use index::{CacheIndex, EvictionPolicy, IndexEntry, IndexOptions};
pub use memory::MemoryByteStore;

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a byte store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("key not found in cache")]
    NotFound,

    #[error("key expired in cache")]
    Expired,

    #[error("cache backend unreachable: {0}")]
    Unreachable(String),
}

/// Opaque key → (bytes, ttl) storage contract.
///
/// Implementations must be safe for concurrent callers. `retrieve` with
/// `update_lru = true` bumps the entry's last-access time.
pub trait ByteStore: Send + Sync + 'static {
    /// Store a value under a key with the given TTL
    fn store(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;

    /// Retrieve the value for a key
    fn retrieve(&self, key: &str, update_lru: bool) -> Result<Bytes, CacheError>;

    /// Remove a key
    fn remove(&self, key: &str);

    /// Reset the TTL for an existing key
    fn set_ttl(&self, key: &str, ttl: Duration);

    /// Remove a batch of keys
    fn bulk_remove(&self, keys: &[String]);

    /// Enumerate all live keys
    fn iterate(&self) -> Vec<String>;
}

/// Disposition of a cache lookup, reported in the results header and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    /// Entire request range was served from cache
    Hit,
    /// Cached object covered part of the range; deltas were fetched
    PartialHit,
    /// No cached object existed for the key
    KeyMiss,
    /// A cached object existed but shared no overlap with the request
    RangeMiss,
    /// The path is not cacheable
    ProxyOnly,
    /// The upstream returned an error status
    ProxyError,
    /// Served from the negative cache
    NegativeCacheHit,
    /// A response matching the negative cache table was fetched and stored
    NegativeCacheMiss,
}

impl LookupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupStatus::Hit => "hit",
            LookupStatus::PartialHit => "phit",
            LookupStatus::KeyMiss => "kmiss",
            LookupStatus::RangeMiss => "rmiss",
            LookupStatus::ProxyOnly => "proxy-only",
            LookupStatus::ProxyError => "proxy-error",
            LookupStatus::NegativeCacheHit => "nchit",
            LookupStatus::NegativeCacheMiss => "ncmiss",
        }
    }
}

impl std::fmt::Display for LookupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
