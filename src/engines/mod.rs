//! Proxy engines
//!
//! The engines consume a [`ProxyRequest`] (the inbound request rewritten
//! against the upstream origin) and produce the downstream response. Four
//! engines exist: the raw HTTP proxy, the progressive collapsed forwarder
//! it dispatches to, the object proxy cache, and the delta proxy cache.

pub mod cache;
pub mod deltaproxycache;
pub mod httpproxy;
pub mod objectproxycache;
pub mod pcf;

use crate::cache::{CacheIndex, LookupStatus};
use crate::config::{OriginConfig, PathConfig};
use crate::error::{Result, TricksterError};
use crate::headers;
use crate::origin::OriginClient;
use crate::timeseries::ExtentList;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use pcf::ProgressiveCollapseForwarder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, OwnedMutexGuard};
use url::Url;

/// Response body type shared by all engines
pub type Body = BoxBody<Bytes, Infallible>;

/// A buffered body from a byte buffer
pub fn full_body(data: Bytes) -> Body {
    Full::new(data).boxed()
}

/// Current time as epoch seconds
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// An inbound request rewritten for its upstream origin
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Full upstream URL including the origin's base and the request query
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

impl ProxyRequest {
    /// First value of a query parameter
    pub fn param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Replace (or add) a query parameter, preserving the others
    pub fn set_param(&mut self, name: &str, value: &str) {
        let pairs: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(k, _)| k != name)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let mut editor = self.url.query_pairs_mut();
        editor.clear();
        for (k, v) in pairs {
            editor.append_pair(&k, &v);
        }
        editor.append_pair(name, value);
    }

    /// Drop a query parameter
    pub fn remove_param(&mut self, name: &str) {
        let pairs: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(k, _)| k != name)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if pairs.is_empty() {
            self.url.set_query(None);
            return;
        }
        let mut editor = self.url.query_pairs_mut();
        editor.clear();
        for (k, v) in pairs {
            editor.append_pair(&k, &v);
        }
    }
}

/// A buffered upstream response
#[derive(Debug)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Execute an upstream request and buffer the response.
///
/// The per-origin deadline lives on the `reqwest::Client`, so expiry
/// surfaces here as a timeout error.
pub async fn fetch(http: &reqwest::Client, req: &ProxyRequest) -> Result<FetchResponse> {
    let mut headers = req.headers.clone();
    headers::remove_hop_headers(&mut headers);
    // the upstream host comes from the origin URL, not the inbound request
    headers.remove(http::header::HOST);
    headers::add_proxy_headers(req.remote_addr, &mut headers);

    let response = http
        .request(req.method.clone(), req.url.clone())
        .headers(headers)
        .body(req.body.clone())
        .send()
        .await
        .map_err(|e| classify_fetch_error(&req.url, e))?;

    let status = response.status();
    let mut headers = response.headers().clone();
    headers::remove_hop_headers(&mut headers);
    let body = response
        .bytes()
        .await
        .map_err(|e| classify_fetch_error(&req.url, e))?;

    Ok(FetchResponse {
        status,
        headers,
        body,
    })
}

pub(crate) fn classify_fetch_error(url: &Url, e: reqwest::Error) -> TricksterError {
    if e.is_timeout() {
        TricksterError::Timeout(format!("{url}: {e}"))
    } else {
        TricksterError::Upstream(format!("{url}: {e}"))
    }
}

/// Build the downstream response for a failed engine invocation
pub fn error_response(
    ctx: &OriginContext,
    path_config: &PathConfig,
    engine: &str,
    error: &TricksterError,
    method: &Method,
    path: &str,
    start: std::time::Instant,
) -> http::Response<Body> {
    tracing::warn!(origin = %ctx.name, path, error = %error, "request failed");
    let status =
        StatusCode::from_u16(error.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    respond(
        ctx,
        path_config,
        engine,
        LookupStatus::ProxyError,
        status,
        headers,
        full_body(Bytes::from(error.to_string())),
        None,
        None,
        method,
        path,
        start.elapsed().as_secs_f64(),
    )
}

/// Per-fingerprint lock table.
///
/// Writers to one cached object serialize on its key so concurrent
/// requests with the same fingerprint cannot double-fetch overlapping
/// deltas. The table is sharded internally by the concurrent map.
#[derive(Default)]
pub struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

/// Everything an engine needs to serve one origin
pub struct OriginContext {
    pub name: String,
    pub config: Arc<OriginConfig>,
    pub client: Arc<dyn OriginClient>,
    pub cache: Arc<CacheIndex>,
    /// Whether cached objects are stored compressed
    pub compression: bool,
    /// Pooled upstream HTTP client with the origin's timeout applied
    pub http: reqwest::Client,
    pub locks: KeyLocks,
    /// In-flight progressive collapsed forwards by cache key
    pub collapsed: DashMap<String, Arc<ProgressiveCollapseForwarder>>,
}

impl OriginContext {
    pub fn new(
        name: &str,
        config: Arc<OriginConfig>,
        client: Arc<dyn OriginClient>,
        cache: Arc<CacheIndex>,
        compression: bool,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| TricksterError::Config(format!("could not build HTTP client: {e}")))?;
        Ok(OriginContext {
            name: name.to_string(),
            config,
            client,
            cache,
            compression,
            http,
            locks: KeyLocks::new(),
            collapsed: DashMap::new(),
        })
    }
}

/// Build the downstream response, stamping the standard headers, the
/// results header and the request metrics.
#[allow(clippy::too_many_arguments)]
pub fn respond(
    ctx: &OriginContext,
    path_config: &PathConfig,
    engine: &str,
    cache_status: LookupStatus,
    status: StatusCode,
    mut headers: HeaderMap,
    body: Body,
    ff_status: Option<&str>,
    fetched: Option<&ExtentList>,
    req_method: &Method,
    req_path: &str,
    elapsed_secs: f64,
) -> http::Response<Body> {
    headers::set_results_header(
        &mut headers,
        engine,
        cache_status.as_str(),
        ff_status,
        fetched,
    );
    headers::add_response_headers(&mut headers);
    if !path_config.no_metrics {
        crate::metrics::record_proxy_request(
            &ctx.name,
            ctx.client.origin_type(),
            req_method.as_str(),
            cache_status.as_str(),
            status.as_u16(),
            req_path,
            elapsed_secs,
        );
    }
    let mut response = http::Response::builder().status(status);
    if let Some(h) = response.headers_mut() {
        *h = headers;
    }
    response.body(body).expect("response construction")
}

/// Classify an upstream response for the results header: anything at or
/// above 400 is a proxy error, otherwise the path is proxy-only.
pub fn proxy_lookup_status(status: StatusCode) -> LookupStatus {
    if status.as_u16() >= 400 {
        LookupStatus::ProxyError
    } else {
        LookupStatus::ProxyOnly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            url: Url::parse(url).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
        }
    }

    #[test]
    fn test_param_roundtrip() {
        let mut req = request("http://p:9090/api/v1/query_range?query=up&start=1&end=2&step=10");
        assert_eq!(req.param("query").as_deref(), Some("up"));
        req.set_param("start", "1000");
        req.set_param("end", "2000");
        assert_eq!(req.param("start").as_deref(), Some("1000"));
        assert_eq!(req.param("end").as_deref(), Some("2000"));
        // untouched params survive
        assert_eq!(req.param("query").as_deref(), Some("up"));
        req.remove_param("end");
        assert_eq!(req.param("end"), None);
    }

    #[test]
    fn test_proxy_lookup_status() {
        assert_eq!(
            proxy_lookup_status(StatusCode::OK),
            LookupStatus::ProxyOnly
        );
        assert_eq!(
            proxy_lookup_status(StatusCode::BAD_GATEWAY),
            LookupStatus::ProxyError
        );
    }

    #[tokio::test]
    async fn test_key_locks_serialize_same_key() {
        let locks = Arc::new(KeyLocks::new());
        let guard = locks.acquire("fp1").await;
        let locks2 = Arc::clone(&locks);
        let contender = tokio::spawn(async move { locks2.acquire("fp1").await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }
}
