//! Cache index: metadata and bounds enforcement over a byte store
//!
//! The index keeps an in-memory entry per cached object (size, write time,
//! last access, TTL) and runs two background tasks: a reaper that drops
//! expired entries and enforces the byte/object capacity caps, and a
//! flusher that persists the metadata so a restart can resume without
//! orphaning stored bytes.
//!
//! The index is authoritative for reachability: an entry past its TTL is
//! never returned to a reader even if the reaper has not yet run, and an
//! index/store disagreement is treated as a miss rather than an error.

use super::{ByteStore, CacheError};
use crate::metrics;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Metadata for one cached object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub size: u64,
    pub last_access: i64,
    pub write_time: i64,
    pub ttl_secs: u64,
}

impl IndexEntry {
    fn is_expired(&self, now: i64) -> bool {
        now > self.write_time + self.ttl_secs as i64
    }
}

/// Victim selection strategy when the cache exceeds its caps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Remove the least recently accessed entries first
    #[default]
    Lru,
    /// Remove the entries written longest ago first
    Oldest,
}

impl EvictionPolicy {
    /// Select keys to remove so that the totals drop to the given targets.
    ///
    /// A target of 0 means the corresponding bound is not enforced.
    pub fn select_victims(
        &self,
        entries: &HashMap<String, IndexEntry>,
        target_bytes: u64,
        target_objects: u64,
    ) -> Vec<String> {
        let mut ranked: Vec<&IndexEntry> = entries.values().collect();
        match self {
            EvictionPolicy::Lru => ranked.sort_by_key(|e| (e.last_access, e.write_time)),
            EvictionPolicy::Oldest => ranked.sort_by_key(|e| (e.write_time, e.last_access)),
        }

        let mut bytes: u64 = entries.values().map(|e| e.size).sum();
        let mut objects = entries.len() as u64;
        let mut victims = Vec::new();
        for entry in ranked {
            let over_bytes = target_bytes > 0 && bytes > target_bytes;
            let over_objects = target_objects > 0 && objects > target_objects;
            if !over_bytes && !over_objects {
                break;
            }
            bytes = bytes.saturating_sub(entry.size);
            objects -= 1;
            victims.push(entry.key.clone());
        }
        victims
    }
}

/// Tunables for a [`CacheIndex`]
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Maximum total object bytes; 0 disables the bound
    pub max_size_bytes: u64,
    /// How far below the byte cap the reaper drives the total
    pub max_size_backoff_bytes: u64,
    /// Maximum object count; 0 disables the bound
    pub max_size_objects: u64,
    /// How far below the object cap the reaper drives the count
    pub max_size_backoff_objects: u64,
    pub reap_interval: Duration,
    pub flush_interval: Duration,
    pub eviction: EvictionPolicy,
    /// Where the flusher persists the index; None disables flushing
    pub flush_path: Option<PathBuf>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        IndexOptions {
            max_size_bytes: 512 * 1024 * 1024,
            max_size_backoff_bytes: 16 * 1024 * 1024,
            max_size_objects: 0,
            max_size_backoff_objects: 100,
            reap_interval: Duration::from_secs(3),
            flush_interval: Duration::from_secs(5),
            eviction: EvictionPolicy::Lru,
            flush_path: None,
        }
    }
}

/// Metadata layer over a [`ByteStore`]
pub struct CacheIndex {
    name: String,
    store: Arc<dyn ByteStore>,
    entries: RwLock<HashMap<String, IndexEntry>>,
    opts: IndexOptions,
}

impl CacheIndex {
    /// Create an index over a byte store, replaying the flush file if one
    /// exists at the configured path.
    pub fn new(name: &str, store: Arc<dyn ByteStore>, opts: IndexOptions) -> Self {
        let mut entries = HashMap::new();
        if let Some(path) = &opts.flush_path {
            match load_flush_file(path) {
                Ok(loaded) if !loaded.is_empty() => {
                    info!(cache = name, entries = loaded.len(), "replayed cache index");
                    entries = loaded;
                }
                Ok(_) => {}
                Err(e) => warn!(cache = name, error = %e, "could not replay cache index"),
            }
        }
        let index = CacheIndex {
            name: name.to_string(),
            store,
            entries: RwLock::new(entries),
            opts,
        };
        index.update_usage_metrics();
        index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store an object and record its metadata
    pub fn store(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError> {
        let size = value.len() as u64;
        self.store.store(key, value, ttl)?;
        let now = now_epoch();
        {
            let mut entries = self.entries.write().unwrap();
            entries.insert(
                key.to_string(),
                IndexEntry {
                    key: key.to_string(),
                    size,
                    last_access: now,
                    write_time: now,
                    ttl_secs: ttl.as_secs(),
                },
            );
        }
        metrics::record_cache_operation(&self.name, "set");
        self.update_usage_metrics();
        Ok(())
    }

    /// Retrieve an object, enforcing the index TTL.
    ///
    /// If the index and the store disagree on presence the entry is dropped
    /// from the index and the lookup reports a miss, so a lost blob can
    /// never wedge a key.
    pub fn retrieve(&self, key: &str, update_lru: bool) -> Result<Bytes, CacheError> {
        let now = now_epoch();
        let expired = {
            let entries = self.entries.read().unwrap();
            match entries.get(key) {
                None => {
                    // unknown to the index: scrub any orphaned blob
                    drop(entries);
                    self.store.remove(key);
                    metrics::record_cache_operation(&self.name, "miss");
                    return Err(CacheError::NotFound);
                }
                Some(entry) => entry.is_expired(now),
            }
        };

        if expired {
            self.remove(key);
            metrics::record_cache_operation(&self.name, "expired");
            return Err(CacheError::Expired);
        }

        match self.store.retrieve(key, update_lru) {
            Ok(data) => {
                if update_lru {
                    let mut entries = self.entries.write().unwrap();
                    if let Some(entry) = entries.get_mut(key) {
                        entry.last_access = now;
                    }
                }
                metrics::record_cache_operation(&self.name, "hit");
                Ok(data)
            }
            Err(e) => {
                // index said present but the store disagrees
                let mut entries = self.entries.write().unwrap();
                entries.remove(key);
                drop(entries);
                self.update_usage_metrics();
                metrics::record_cache_operation(&self.name, "miss");
                Err(match e {
                    CacheError::Unreachable(m) => CacheError::Unreachable(m),
                    _ => CacheError::NotFound,
                })
            }
        }
    }

    /// Reset an entry's lifetime, measured from now
    pub fn set_ttl(&self, key: &str, ttl: Duration) {
        self.store.set_ttl(key, ttl);
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            entry.write_time = now_epoch();
            entry.ttl_secs = ttl.as_secs();
        }
    }

    pub fn remove(&self, key: &str) {
        self.store.remove(key);
        {
            let mut entries = self.entries.write().unwrap();
            entries.remove(key);
        }
        metrics::record_cache_operation(&self.name, "remove");
        self.update_usage_metrics();
    }

    pub fn bulk_remove(&self, keys: &[String]) {
        self.store.bulk_remove(keys);
        {
            let mut entries = self.entries.write().unwrap();
            for key in keys {
                entries.remove(key);
            }
        }
        self.update_usage_metrics();
    }

    pub fn object_count(&self) -> u64 {
        self.entries.read().unwrap().len() as u64
    }

    pub fn byte_size(&self) -> u64 {
        self.entries.read().unwrap().values().map(|e| e.size).sum()
    }

    /// Drop expired entries, then enforce the byte and object caps.
    ///
    /// Capacity enforcement drives totals to cap − backoff so the reaper
    /// does not oscillate under steady write pressure.
    pub fn reap(&self) {
        let now = now_epoch();

        let expired: Vec<String> = {
            let entries = self.entries.read().unwrap();
            entries
                .values()
                .filter(|e| e.is_expired(now))
                .map(|e| e.key.clone())
                .collect()
        };
        if !expired.is_empty() {
            debug!(cache = %self.name, count = expired.len(), "reaping expired cache entries");
            metrics::record_cache_events(&self.name, "expire", expired.len() as u64);
            self.bulk_remove(&expired);
        }

        let victims = {
            let entries = self.entries.read().unwrap();
            let bytes: u64 = entries.values().map(|e| e.size).sum();
            let objects = entries.len() as u64;
            let over_bytes = self.opts.max_size_bytes > 0 && bytes > self.opts.max_size_bytes;
            let over_objects =
                self.opts.max_size_objects > 0 && objects > self.opts.max_size_objects;
            if !over_bytes && !over_objects {
                return;
            }
            let target_bytes = if over_bytes {
                self.opts
                    .max_size_bytes
                    .saturating_sub(self.opts.max_size_backoff_bytes)
            } else {
                0
            };
            let target_objects = if over_objects {
                self.opts
                    .max_size_objects
                    .saturating_sub(self.opts.max_size_backoff_objects)
            } else {
                0
            };
            self.opts
                .eviction
                .select_victims(&entries, target_bytes, target_objects)
        };

        if !victims.is_empty() {
            info!(cache = %self.name, count = victims.len(), "evicting cache entries over capacity");
            metrics::record_cache_events(&self.name, "evict", victims.len() as u64);
            self.bulk_remove(&victims);
        }
    }

    /// Persist the index metadata to the flush file
    pub fn flush(&self) {
        let Some(path) = &self.opts.flush_path else {
            return;
        };
        let snapshot: Vec<IndexEntry> = {
            let entries = self.entries.read().unwrap();
            entries.values().cloned().collect()
        };
        if let Err(e) = write_flush_file(path, &snapshot) {
            error!(cache = %self.name, error = %e, "could not flush cache index");
        }
    }

    /// Launch the background reaper and flusher tasks
    pub fn start_tasks(self: &Arc<Self>) {
        let reaper = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reaper.opts.reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                reaper.reap();
            }
        });

        if self.opts.flush_path.is_some() {
            let flusher = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(flusher.opts.flush_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    flusher.flush();
                }
            });
        }
    }

    fn update_usage_metrics(&self) {
        let (objects, bytes) = {
            let entries = self.entries.read().unwrap();
            (
                entries.len() as u64,
                entries.values().map(|e| e.size).sum::<u64>(),
            )
        };
        metrics::set_cache_usage(&self.name, objects, bytes);
    }
}

/// Write the flush file: a sequence of records, each a u32 big-endian
/// length followed by a JSON-encoded [`IndexEntry`].
fn write_flush_file(path: &Path, entries: &[IndexEntry]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        for entry in entries {
            let record = serde_json::to_vec(entry)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            f.write_all(&(record.len() as u32).to_be_bytes())?;
            f.write_all(&record)?;
        }
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

fn load_flush_file(path: &Path) -> std::io::Result<HashMap<String, IndexEntry>> {
    let mut entries = HashMap::new();
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e),
    };
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        pos += 4;
        if pos + len > data.len() {
            break; // truncated tail record
        }
        match serde_json::from_slice::<IndexEntry>(&data[pos..pos + len]) {
            Ok(entry) => {
                entries.insert(entry.key.clone(), entry);
            }
            Err(e) => {
                warn!(error = %e, "skipping unreadable index record");
            }
        }
        pos += len;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryByteStore;

    fn test_index(opts: IndexOptions) -> CacheIndex {
        CacheIndex::new("test", Arc::new(MemoryByteStore::new()), opts)
    }

    #[test]
    fn test_store_retrieve_roundtrip() {
        let index = test_index(IndexOptions::default());
        index
            .store("k1", Bytes::from_static(b"hello"), Duration::from_secs(60))
            .unwrap();
        assert_eq!(
            index.retrieve("k1", true).unwrap(),
            Bytes::from_static(b"hello")
        );
        assert_eq!(index.object_count(), 1);
        assert_eq!(index.byte_size(), 5);
    }

    #[test]
    fn test_ttl_expiry_is_enforced_by_index() {
        let index = test_index(IndexOptions::default());
        index
            .store("k1", Bytes::from_static(b"v"), Duration::from_secs(0))
            .unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(index.retrieve("k1", false), Err(CacheError::Expired));
        assert_eq!(index.object_count(), 0);
    }

    #[test]
    fn test_store_disagreement_is_a_miss() {
        let store = Arc::new(MemoryByteStore::new());
        let index = CacheIndex::new("test", store.clone(), IndexOptions::default());
        index
            .store("k1", Bytes::from_static(b"v"), Duration::from_secs(60))
            .unwrap();
        // blob vanishes behind the index's back
        store.remove("k1");
        assert_eq!(index.retrieve("k1", false), Err(CacheError::NotFound));
        // and the stale entry is gone
        assert_eq!(index.object_count(), 0);
    }

    #[test]
    fn test_reap_enforces_byte_cap_with_backoff() {
        let index = test_index(IndexOptions {
            max_size_bytes: 100,
            max_size_backoff_bytes: 20,
            ..Default::default()
        });
        for i in 0..12 {
            index
                .store(
                    &format!("k{i}"),
                    Bytes::from(vec![0u8; 10]),
                    Duration::from_secs(60),
                )
                .unwrap();
        }
        assert_eq!(index.byte_size(), 120);
        index.reap();
        assert!(index.byte_size() <= 80, "size {} > 80", index.byte_size());
    }

    #[test]
    fn test_reap_enforces_object_cap() {
        let index = test_index(IndexOptions {
            max_size_bytes: 0,
            max_size_objects: 5,
            max_size_backoff_objects: 2,
            ..Default::default()
        });
        for i in 0..8 {
            index
                .store(&format!("k{i}"), Bytes::from_static(b"v"), Duration::from_secs(60))
                .unwrap();
        }
        index.reap();
        assert!(index.object_count() <= 3);
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut entries = HashMap::new();
        for (key, last_access, write_time) in
            [("old", 10i64, 100i64), ("mid", 50, 50), ("new", 90, 10)]
        {
            entries.insert(
                key.to_string(),
                IndexEntry {
                    key: key.to_string(),
                    size: 10,
                    last_access,
                    write_time,
                    ttl_secs: 60,
                },
            );
        }
        // LRU removes by last access
        let victims = EvictionPolicy::Lru.select_victims(&entries, 20, 0);
        assert_eq!(victims, vec!["old".to_string()]);
        // Oldest removes by write time
        let victims = EvictionPolicy::Oldest.select_victims(&entries, 20, 0);
        assert_eq!(victims, vec!["new".to_string()]);
    }

    #[test]
    fn test_flush_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trickster.index");
        let store = Arc::new(MemoryByteStore::new());
        let opts = IndexOptions {
            flush_path: Some(path.clone()),
            ..Default::default()
        };
        let index = CacheIndex::new("test", store.clone(), opts.clone());
        index
            .store("k1", Bytes::from_static(b"hello"), Duration::from_secs(60))
            .unwrap();
        index
            .store("k2", Bytes::from_static(b"world"), Duration::from_secs(60))
            .unwrap();
        index.flush();

        // a new index over the same store resumes from the flush file
        let replayed = CacheIndex::new("test", store, opts);
        assert_eq!(replayed.object_count(), 2);
        assert_eq!(
            replayed.retrieve("k1", false).unwrap(),
            Bytes::from_static(b"hello")
        );
    }
}
