//! In-memory byte store
//!
//! Reference [`ByteStore`] backend. Entries live in a single map guarded by
//! a reader-writer lock; expiry is enforced lazily on retrieval and by the
//! index reaper.

use super::{ByteStore, CacheError};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};
use tracing::debug;

struct StoreEntry {
    data: Bytes,
    expires_at: SystemTime,
    last_accessed: SystemTime,
}

/// Thread-safe in-memory key/value store with TTLs
#[derive(Default)]
pub struct MemoryByteStore {
    storage: RwLock<HashMap<String, StoreEntry>>,
}

impl MemoryByteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries, for tests and stats
    pub fn len(&self) -> usize {
        self.storage.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ByteStore for MemoryByteStore {
    fn store(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let now = SystemTime::now();
        debug!(key, size = value.len(), "storing cache object");
        let mut storage = self
            .storage
            .write()
            .map_err(|e| CacheError::Unreachable(e.to_string()))?;
        storage.insert(
            key.to_string(),
            StoreEntry {
                data: value,
                expires_at: now + ttl,
                last_accessed: now,
            },
        );
        Ok(())
    }

    fn retrieve(&self, key: &str, update_lru: bool) -> Result<Bytes, CacheError> {
        let now = SystemTime::now();
        let mut storage = self
            .storage
            .write()
            .map_err(|e| CacheError::Unreachable(e.to_string()))?;
        match storage.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                if update_lru {
                    entry.last_accessed = now;
                }
                Ok(entry.data.clone())
            }
            Some(_) => {
                storage.remove(key);
                Err(CacheError::Expired)
            }
            None => Err(CacheError::NotFound),
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut storage) = self.storage.write() {
            storage.remove(key);
        }
    }

    fn set_ttl(&self, key: &str, ttl: Duration) {
        if let Ok(mut storage) = self.storage.write() {
            if let Some(entry) = storage.get_mut(key) {
                entry.expires_at = SystemTime::now() + ttl;
            }
        }
    }

    fn bulk_remove(&self, keys: &[String]) {
        if let Ok(mut storage) = self.storage.write() {
            for key in keys {
                storage.remove(key);
            }
        }
    }

    fn iterate(&self) -> Vec<String> {
        self.storage
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }
}
