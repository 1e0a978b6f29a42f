//! Cached-object read and write helpers
//!
//! Objects are stored through the cache index, optionally compressed with
//! Snappy. Compression is opaque to callers: the `.sz` suffix on the
//! storage key disambiguates compressed blobs at retrieval.

use crate::cache::{CacheError, CacheIndex};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// A cached HTTP response with its freshness bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpDocument {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// When the document was written, epoch seconds
    pub stored_at: i64,
    /// The document is fresh until this time; between here and the index
    /// TTL it may be served only after revalidation
    pub fresh_until: i64,
    /// Whether this entry came from the negative cache table
    pub negative: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

fn storage_key(key: &str, compression: bool) -> String {
    if compression {
        format!("{key}.sz")
    } else {
        key.to_string()
    }
}

/// Retrieve raw cached bytes, inflating when the cache compresses
pub fn query_cache(cache: &CacheIndex, compression: bool, key: &str) -> Result<Bytes, CacheError> {
    let storage_key = storage_key(key, compression);
    let data = cache.retrieve(&storage_key, true)?;
    if compression {
        debug!(key = %storage_key, "decompressing cached data");
        let inflated = snap::raw::Decoder::new()
            .decompress_vec(&data)
            .map_err(|e| CacheError::Unreachable(format!("decompression failed: {e}")))?;
        Ok(Bytes::from(inflated))
    } else {
        Ok(data)
    }
}

/// Store raw bytes, deflating when the cache compresses
pub fn write_cache(
    cache: &CacheIndex,
    compression: bool,
    key: &str,
    value: Bytes,
    ttl: Duration,
) -> Result<(), CacheError> {
    let storage_key = storage_key(key, compression);
    let data = if compression {
        debug!(key = %storage_key, "compressing cached data");
        Bytes::from(snap::raw::Encoder::new().compress_vec(&value).map_err(|e| {
            CacheError::Unreachable(format!("compression failed: {e}"))
        })?)
    } else {
        value
    };
    cache.store(&storage_key, data, ttl)
}

/// Drop a cached object regardless of compression state
pub fn remove_cached(cache: &CacheIndex, compression: bool, key: &str) {
    cache.remove(&storage_key(key, compression));
}

/// Reset a cached object's lifetime
pub fn extend_ttl(cache: &CacheIndex, compression: bool, key: &str, ttl: Duration) {
    cache.set_ttl(&storage_key(key, compression), ttl);
}

/// Retrieve and decode a cached HTTP document
pub fn query_document(
    cache: &CacheIndex,
    compression: bool,
    key: &str,
) -> Result<HttpDocument, CacheError> {
    let data = query_cache(cache, compression, key)?;
    serde_json::from_slice(&data)
        .map_err(|e| CacheError::Unreachable(format!("unreadable cached document: {e}")))
}

/// Encode and store an HTTP document
pub fn write_document(
    cache: &CacheIndex,
    compression: bool,
    key: &str,
    document: &HttpDocument,
    ttl: Duration,
) -> Result<(), CacheError> {
    let data = serde_json::to_vec(document)
        .map_err(|e| CacheError::Unreachable(format!("unencodable document: {e}")))?;
    write_cache(cache, compression, key, Bytes::from(data), ttl)
}
