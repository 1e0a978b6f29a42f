//! Configuration management
//!
//! Configuration is loaded from a TOML file with sections for the process
//! (`[main]`), the listener (`[frontend]`), logging, metrics, tracing, and
//! maps of origins, caches and negative caches. A handful of command-line
//! flags can override or replace the file. Once `load` returns the config
//! is immutable: request handling reads it through shared references and
//! nothing mutates it after startup.

use crate::error::{Result, TricksterError};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use url::Url;

pub const DEFAULT_PROXY_PORT: u16 = 8480;
pub const DEFAULT_METRICS_PORT: u16 = 8481;

/// Command-line flags. Flags win over the config file; `-origin-url` plus
/// `-origin-type` with no `-config` synthesize a single-origin config.
#[derive(Debug, Parser, Default)]
#[command(name = "trickster", disable_version_flag = true)]
pub struct Flags {
    /// Path to the TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// URL of a single upstream origin to proxy
    #[arg(long = "origin-url")]
    pub origin_url: Option<String>,

    /// Type of the single upstream origin (prometheus, influxdb, ...)
    #[arg(long = "origin-type")]
    pub origin_type: Option<String>,

    /// Log verbosity (trace, debug, info, warn, error)
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    /// Port the HTTP front end listens on
    #[arg(long = "proxy-port")]
    pub proxy_port: Option<u16>,

    /// Port the metrics endpoint listens on
    #[arg(long = "metrics-port")]
    pub metrics_port: Option<u16>,

    /// Print the version and exit
    #[arg(long)]
    pub version: bool,
}

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub main: MainConfig,
    #[serde(default)]
    pub frontend: FrontendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
    #[serde(default)]
    pub origins: BTreeMap<String, OriginConfig>,
    #[serde(default)]
    pub caches: BTreeMap<String, CacheConfig>,
    /// name → (status code string → TTL seconds)
    #[serde(default)]
    pub negative_caches: BTreeMap<String, BTreeMap<String, u64>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MainConfig {
    #[serde(default)]
    pub instance_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    #[serde(default)]
    pub listen_address: String,
    #[serde(default = "default_proxy_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub tls_listen_address: String,
    #[serde(default)]
    pub tls_listen_port: u16,
    /// Maximum concurrent inbound connections; 0 disables the bound.
    /// Excess connections wait in the accept queue rather than being
    /// refused.
    #[serde(default)]
    pub connections_limit: usize,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        FrontendConfig {
            listen_address: String::new(),
            listen_port: default_proxy_port(),
            tls_listen_address: String::new(),
            tls_listen_port: 0,
            connections_limit: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub listen_address: String,
    #[serde(default = "default_metrics_port")]
    pub listen_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            listen_address: String::new(),
            listen_port: default_metrics_port(),
        }
    }
}

/// Tracing exporter selection. The proxy emits spans through the `tracing`
/// facade; this section selects what the subscriber does with them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default = "default_tracing_type")]
    pub tracing_type: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        TracingConfig {
            tracing_type: default_tracing_type(),
            sample_rate: default_sample_rate(),
        }
    }
}

/// How a path rule matches the request path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMatchType {
    #[default]
    Exact,
    Prefix,
}

/// Collapsed-forwarding mode for a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollapsedForwarding {
    #[default]
    Off,
    Basic,
    Progressive,
}

/// How samples are evicted from a cached timeseries object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeseriesEvictionMethod {
    #[default]
    Oldest,
    Lru,
}

/// A routing rule for one path under an origin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub match_type: PathMatchType,
    #[serde(default = "default_handler")]
    pub handler_name: String,
    /// Allowed HTTP methods; empty means GET and HEAD, "*" means all
    #[serde(default)]
    pub methods: Vec<String>,
    /// Query parameters folded into the cache key
    #[serde(default)]
    pub cache_key_params: Vec<String>,
    /// Request headers folded into the cache key
    #[serde(default)]
    pub cache_key_headers: Vec<String>,
    /// Header mutations applied to the upstream request; an empty value
    /// removes the header
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    /// Header mutations applied to the downstream response
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    /// Synthetic response: when set, the handler short-circuits upstream
    #[serde(default)]
    pub response_code: Option<u16>,
    #[serde(default)]
    pub response_body: Option<String>,
    #[serde(default)]
    pub no_metrics: bool,
    #[serde(default)]
    pub collapsed_forwarding: CollapsedForwarding,
    /// Object-cache TTL for this path, seconds
    #[serde(default)]
    pub default_ttl_secs: Option<u64>,
}

impl Default for PathConfig {
    fn default() -> Self {
        PathConfig {
            path: default_path(),
            match_type: PathMatchType::Exact,
            handler_name: default_handler(),
            methods: Vec::new(),
            cache_key_params: Vec::new(),
            cache_key_headers: Vec::new(),
            request_headers: BTreeMap::new(),
            response_headers: BTreeMap::new(),
            response_code: None,
            response_body: None,
            no_metrics: false,
            collapsed_forwarding: CollapsedForwarding::Off,
            default_ttl_secs: None,
        }
    }
}

impl PathConfig {
    /// Effective method list for route registration
    pub fn effective_methods(&self) -> Vec<String> {
        if self.methods.is_empty() {
            return vec!["GET".to_string(), "HEAD".to_string()];
        }
        if self.methods.iter().any(|m| m == "*") {
            return ["GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "TRACE", "PATCH"]
                .iter()
                .map(|m| m.to_string())
                .collect();
        }
        self.methods.iter().map(|m| m.to_uppercase()).collect()
    }

    pub fn default_ttl(&self, fallback: Duration) -> Duration {
        self.default_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub full_chain_cert_path: String,
    pub private_key_path: String,
}

/// Configuration for one upstream origin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    #[serde(default = "default_origin_type")]
    pub origin_type: String,
    #[serde(default)]
    pub origin_url: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_cache_name")]
    pub cache_name: String,
    #[serde(default)]
    pub negative_cache_name: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,
    #[serde(default = "default_max_object_size")]
    pub max_object_size_bytes: usize,
    #[serde(default = "default_revalidation_factor")]
    pub revalidation_factor: f64,

    // Timeseries options are optional so that setting one on an origin
    // type that does not consume it can be detected and warned about.
    pub timeseries_retention_factor: Option<i64>,
    pub timeseries_eviction_method: Option<TimeseriesEvictionMethod>,
    pub timeseries_ttl_secs: Option<u64>,
    pub fastforward_ttl_secs: Option<u64>,
    pub fast_forward_disable: Option<bool>,
    pub backfill_tolerance_secs: Option<u64>,

    #[serde(default)]
    pub health_check_upstream_path: String,
    #[serde(default)]
    pub health_check_verb: String,
    #[serde(default)]
    pub health_check_query: String,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Per-path overrides, merged over the client's default paths
    #[serde(default)]
    pub paths: BTreeMap<String, PathConfig>,

    // Derived at load time from origin_url
    #[serde(skip)]
    pub scheme: String,
    #[serde(skip)]
    pub host: String,
    #[serde(skip)]
    pub path_prefix: String,
    /// Resolved negative cache: status code → TTL
    #[serde(skip)]
    pub negative_cache: BTreeMap<u16, Duration>,
}

impl Default for OriginConfig {
    fn default() -> Self {
        OriginConfig {
            origin_type: default_origin_type(),
            origin_url: String::new(),
            is_default: false,
            cache_name: default_cache_name(),
            negative_cache_name: String::new(),
            timeout_secs: default_timeout_secs(),
            max_ttl_secs: default_max_ttl_secs(),
            max_object_size_bytes: default_max_object_size(),
            revalidation_factor: default_revalidation_factor(),
            timeseries_retention_factor: None,
            timeseries_eviction_method: None,
            timeseries_ttl_secs: None,
            fastforward_ttl_secs: None,
            fast_forward_disable: None,
            backfill_tolerance_secs: None,
            health_check_upstream_path: String::new(),
            health_check_verb: String::new(),
            health_check_query: String::new(),
            tls: None,
            paths: BTreeMap::new(),
            scheme: String::new(),
            host: String::new(),
            path_prefix: String::new(),
            negative_cache: BTreeMap::new(),
        }
    }
}

impl OriginConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    pub fn timeseries_retention_factor(&self) -> i64 {
        self.timeseries_retention_factor.unwrap_or(1024)
    }

    pub fn timeseries_eviction_method(&self) -> TimeseriesEvictionMethod {
        self.timeseries_eviction_method.unwrap_or_default()
    }

    pub fn timeseries_ttl(&self) -> Duration {
        Duration::from_secs(self.timeseries_ttl_secs.unwrap_or(21600))
    }

    pub fn fastforward_ttl(&self) -> Duration {
        Duration::from_secs(self.fastforward_ttl_secs.unwrap_or(15))
    }

    pub fn fast_forward_disabled(&self) -> bool {
        self.fast_forward_disable.unwrap_or(false)
    }

    pub fn backfill_tolerance(&self) -> Duration {
        Duration::from_secs(self.backfill_tolerance_secs.unwrap_or(0))
    }

    /// True when any timeseries-only option was set explicitly
    fn has_timeseries_options(&self) -> bool {
        self.timeseries_retention_factor.is_some()
            || self.timeseries_eviction_method.is_some()
            || self.timeseries_ttl_secs.is_some()
            || self.fastforward_ttl_secs.is_some()
            || self.fast_forward_disable.is_some()
            || self.backfill_tolerance_secs.is_some()
    }
}

/// Configuration for one cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_type")]
    pub cache_type: String,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default)]
    pub index: IndexConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cache_type: default_cache_type(),
            compression: true,
            index: IndexConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    #[serde(default = "default_max_size_backoff_bytes")]
    pub max_size_backoff_bytes: u64,
    #[serde(default)]
    pub max_size_objects: u64,
    #[serde(default = "default_max_size_backoff_objects")]
    pub max_size_backoff_objects: u64,
    /// Where the index flusher persists metadata; empty disables flushing
    #[serde(default)]
    pub flush_path: Option<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            reap_interval_secs: default_reap_interval_secs(),
            flush_interval_secs: default_flush_interval_secs(),
            max_size_bytes: default_max_size_bytes(),
            max_size_backoff_bytes: default_max_size_backoff_bytes(),
            max_size_objects: 0,
            max_size_backoff_objects: default_max_size_backoff_objects(),
            flush_path: None,
        }
    }
}

// Default value functions for serde
fn default_proxy_port() -> u16 {
    DEFAULT_PROXY_PORT
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tracing_type() -> String {
    "none".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

fn default_path() -> String {
    "/".to_string()
}

fn default_handler() -> String {
    "proxy".to_string()
}

fn default_origin_type() -> String {
    "prometheus".to_string()
}

fn default_cache_name() -> String {
    "default".to_string()
}

fn default_cache_type() -> String {
    "memory".to_string()
}

fn default_timeout_secs() -> u64 {
    180
}

fn default_max_ttl_secs() -> u64 {
    86400
}

fn default_max_object_size() -> usize {
    524288
}

fn default_revalidation_factor() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_reap_interval_secs() -> u64 {
    3
}

fn default_flush_interval_secs() -> u64 {
    5
}

fn default_max_size_bytes() -> u64 {
    512 * 1024 * 1024
}

fn default_max_size_backoff_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_max_size_backoff_objects() -> u64 {
    100
}

const VALID_ORIGIN_TYPES: &[&str] = &[
    "prometheus",
    "influxdb",
    "clickhouse",
    "irondb",
    "rpc",
    "reverseproxycache",
];

/// Origin types with a timeseries query surface
const TIMESERIES_ORIGIN_TYPES: &[&str] = &["prometheus", "influxdb", "clickhouse", "irondb"];

impl Config {
    /// Load a configuration file and resolve it for serving
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TricksterError::Config(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| TricksterError::Config(format!("failed to parse config file: {e}")))?;
        config.resolve()?;
        Ok(config)
    }

    /// Build a single-origin configuration from the `-origin-url` and
    /// `-origin-type` flags when no config file is given.
    pub fn from_origin_flags(origin_url: &str, origin_type: &str) -> Result<Self> {
        let mut config = Config::default();
        config.origins.insert(
            "default".to_string(),
            OriginConfig {
                origin_type: origin_type.to_string(),
                origin_url: origin_url.to_string(),
                is_default: true,
                ..Default::default()
            },
        );
        config.resolve()?;
        Ok(config)
    }

    /// Apply flag overrides after the file is loaded
    pub fn apply_flags(&mut self, flags: &Flags) {
        if let Some(level) = &flags.log_level {
            self.logging.log_level = level.clone();
        }
        if let Some(port) = flags.proxy_port {
            self.frontend.listen_port = port;
        }
        if let Some(port) = flags.metrics_port {
            self.metrics.listen_port = port;
        }
    }

    /// Validate the document and compute derived fields. Errors here are
    /// fatal at startup.
    pub fn resolve(&mut self) -> Result<()> {
        if self.origins.is_empty() {
            return Err(TricksterError::Config("no origins configured".to_string()));
        }

        // every config carries at least the default memory cache
        self.caches.entry("default".to_string()).or_default();

        self.resolve_default_origin()?;

        for (name, cache) in &self.caches {
            if cache.cache_type != "memory" {
                return Err(TricksterError::Config(format!(
                    "unknown cache type '{}' for cache '{name}'",
                    cache.cache_type
                )));
            }
        }

        let cache_names: Vec<String> = self.caches.keys().cloned().collect();
        let negative_cache_names: Vec<String> = self.negative_caches.keys().cloned().collect();

        for (name, origin) in self.origins.iter_mut() {
            let origin_type = origin.origin_type.to_lowercase();
            if !VALID_ORIGIN_TYPES.contains(&origin_type.as_str()) {
                return Err(TricksterError::Config(format!(
                    "unknown origin type in origin config. originName: {name}, originType: {}",
                    origin.origin_type
                )));
            }
            origin.origin_type = origin_type;

            if origin.origin_url.is_empty() {
                return Err(TricksterError::Config(format!(
                    "missing origin_url for origin '{name}'"
                )));
            }
            let url = Url::parse(&origin.origin_url).map_err(|e| {
                TricksterError::Config(format!("malformed origin_url for origin '{name}': {e}"))
            })?;
            origin.scheme = url.scheme().to_string();
            origin.host = match (url.host_str(), url.port()) {
                (Some(h), Some(p)) => format!("{h}:{p}"),
                (Some(h), None) => h.to_string(),
                (None, _) => {
                    return Err(TricksterError::Config(format!(
                        "origin_url for origin '{name}' has no host"
                    )))
                }
            };
            origin.path_prefix = url.path().trim_end_matches('/').to_string();

            if !cache_names.contains(&origin.cache_name) {
                return Err(TricksterError::Config(format!(
                    "invalid cache name '{}' in origin '{name}'",
                    origin.cache_name
                )));
            }

            if !TIMESERIES_ORIGIN_TYPES.contains(&origin.origin_type.as_str())
                && origin.has_timeseries_options()
            {
                warn!(
                    origin = %name,
                    origin_type = %origin.origin_type,
                    "timeseries options are set on an origin type that does not consume them"
                );
            }

            if !origin.negative_cache_name.is_empty() {
                if !negative_cache_names.contains(&origin.negative_cache_name) {
                    return Err(TricksterError::Config(format!(
                        "invalid negative cache name '{}' in origin '{name}'",
                        origin.negative_cache_name
                    )));
                }
                let table = &self.negative_caches[&origin.negative_cache_name];
                for (code, ttl_secs) in table {
                    let status: u16 = code.parse().map_err(|_| {
                        TricksterError::Config(format!(
                            "invalid negative cache status code '{code}'"
                        ))
                    })?;
                    if !(400..=599).contains(&status) {
                        return Err(TricksterError::Config(format!(
                            "negative cache status code {status} is not a 4xx or 5xx code"
                        )));
                    }
                    origin
                        .negative_cache
                        .insert(status, Duration::from_secs(*ttl_secs));
                }
            }
        }

        Ok(())
    }

    /// Ensure exactly one default origin.
    ///
    /// An explicit `is_default = true` always wins. An origin literally
    /// named `default` is the fallback, then a lone configured origin.
    fn resolve_default_origin(&mut self) -> Result<()> {
        let flagged: Vec<String> = self
            .origins
            .iter()
            .filter(|(_, o)| o.is_default)
            .map(|(name, _)| name.clone())
            .collect();

        match flagged.len() {
            1 => Ok(()),
            0 => {
                if let Some(origin) = self.origins.get_mut("default") {
                    origin.is_default = true;
                    return Ok(());
                }
                if self.origins.len() == 1 {
                    self.origins.values_mut().next().unwrap().is_default = true;
                    return Ok(());
                }
                Err(TricksterError::Config(
                    "multiple origins configured and none is marked default".to_string(),
                ))
            }
            _ => Err(TricksterError::Config(format!(
                "only one origin can be marked as default. Found both {} and {}",
                flagged[0], flagged[1]
            ))),
        }
    }

    /// Name of the default origin; resolve() guarantees one exists
    pub fn default_origin(&self) -> &str {
        self.origins
            .iter()
            .find(|(_, o)| o.is_default)
            .map(|(name, _)| name.as_str())
            .expect("resolved config has a default origin")
    }

    /// Render the running configuration with secrets masked, for the
    /// `/trickster/config` endpoint.
    pub fn to_redacted_toml(&self) -> String {
        let mut redacted = self.clone();
        for origin in redacted.origins.values_mut() {
            if let Some(tls) = &mut origin.tls {
                tls.full_chain_cert_path = "*****".to_string();
                tls.private_key_path = "*****".to_string();
            }
            for path in origin.paths.values_mut() {
                for (name, value) in path.request_headers.iter_mut() {
                    if crate::headers::is_sensitive(name) {
                        *value = "*****".to_string();
                    }
                }
            }
        }
        toml::to_string_pretty(&redacted)
            .unwrap_or_else(|e| format!("# could not render config: {e}"))
    }
}
