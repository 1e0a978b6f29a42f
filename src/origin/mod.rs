//! Origin clients
//!
//! Each upstream origin type supplies a client implementing the
//! [`OriginClient`] capability surface: request parsing into a canonical
//! [`TimeseriesRequest`], wire-format codec for its timeseries payloads,
//! upstream URL construction, and its default routing paths. The delta
//! proxy cache is generic over this trait; the in-tree clients cover
//! Prometheus and the plain reverse proxy cache, and additional types plug
//! in through the [`ClientRegistry`].

pub mod prometheus;
pub mod rpc;

use crate::config::{OriginConfig, PathConfig};
use crate::engines::ProxyRequest;
use crate::error::{Result, TricksterError};
use crate::timeseries::{Extent, Timeseries};
use std::collections::BTreeMap;
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

/// Canonical form of a range query, independent of its time extent
#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesRequest {
    /// The query text as the origin will evaluate it
    pub query: String,
    /// Sample period in seconds; always > 0
    pub step: i64,
    /// Requested time range, not yet normalized to the step grid
    pub extent: Extent,
    /// Stable identity of the underlying series; two requests with the
    /// same fingerprint address the same cached object
    pub fingerprint: String,
}

/// Capability contract each origin backend fulfills
pub trait OriginClient: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn origin_type(&self) -> &'static str;

    fn origin_config(&self) -> &OriginConfig;

    /// Merge an origin-relative path and query with the configured
    /// upstream base URL
    fn build_upstream_url(&self, path: &str, query: Option<&str>) -> Result<url::Url>;

    /// Decode the inbound request into a canonical timeseries request
    fn parse_timeseries_request(
        &self,
        req: &ProxyRequest,
        path_config: &PathConfig,
    ) -> Result<TimeseriesRequest>;

    /// Rewrite the upstream request to cover only the given extent
    fn set_extent(&self, req: &mut ProxyRequest, extent: &Extent);

    fn unmarshal_timeseries(&self, data: &[u8]) -> Result<Timeseries>;

    fn marshal_timeseries(&self, ts: &Timeseries) -> Result<Vec<u8>>;

    /// Derive a real-time point query from a range request; None disables
    /// fast-forwarding for this origin
    fn fast_forward_request(&self, req: &ProxyRequest) -> Option<ProxyRequest>;

    /// The routing paths this origin type serves by default, keyed by path
    fn default_path_configs(&self) -> BTreeMap<String, PathConfig>;

    /// Upstream request probing origin health, or None when the origin
    /// type has no health surface configured
    fn health_check_request(&self) -> Option<ProxyRequest>;
}

/// Hash the cache-relevant parts of a request into a fingerprint.
///
/// `parts` must exclude anything extent-dependent so that requests over
/// different time ranges share a fingerprint.
pub fn derive_fingerprint(parts: &[&str]) -> String {
    let mut buf = String::new();
    for part in parts {
        buf.push_str(part);
        buf.push('\u{1f}');
    }
    format!("{:016x}", xxh3_64(buf.as_bytes()))
}

/// Collect the configured cache-key params and headers of a request, in a
/// stable order, for fingerprint derivation.
pub fn cache_key_parts(req: &ProxyRequest, path_config: &PathConfig) -> Vec<String> {
    let mut parts = Vec::new();
    let mut params = path_config.cache_key_params.clone();
    params.sort();
    for name in &params {
        if let Some(value) = req.param(name) {
            parts.push(format!("{name}={value}"));
        }
    }
    let mut header_names = path_config.cache_key_headers.clone();
    header_names.sort();
    for name in &header_names {
        if let Some(value) = req.headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
            parts.push(format!("{name}:{value}"));
        }
    }
    parts
}

/// Factory function constructing a client for one origin
pub type ClientFactory =
    fn(name: &str, config: Arc<OriginConfig>) -> Result<Arc<dyn OriginClient>>;

/// Mapping of origin type to client factory.
///
/// The registry ships with the in-tree clients; deployments embedding
/// other origin types register their factories before startup.
pub struct ClientRegistry {
    factories: BTreeMap<String, ClientFactory>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        let mut registry = ClientRegistry {
            factories: BTreeMap::new(),
        };
        registry.register("prometheus", prometheus::new_client);
        registry.register("rpc", rpc::new_client);
        registry.register("reverseproxycache", rpc::new_client);
        registry
    }
}

impl ClientRegistry {
    pub fn register(&mut self, origin_type: &str, factory: ClientFactory) {
        self.factories.insert(origin_type.to_string(), factory);
    }

    /// Build a client for an origin, failing when no factory is registered
    /// for its type
    pub fn new_client(
        &self,
        name: &str,
        config: Arc<OriginConfig>,
    ) -> Result<Arc<dyn OriginClient>> {
        match self.factories.get(&config.origin_type) {
            Some(factory) => factory(name, config),
            None => Err(TricksterError::Config(format!(
                "origin '{name}' has type '{}' but no client for that type is registered",
                config.origin_type
            ))),
        }
    }
}
