//! HTTP front end
//!
//! Owns the listener, the per-request dispatch into the proxy engines,
//! and the reserved `/trickster/*` paths. The inbound connection count is
//! bounded by a semaphore acquired before `accept`, so excess connections
//! queue in the kernel instead of being refused.

use crate::cache::{CacheIndex, EvictionPolicy, IndexOptions, MemoryByteStore};
use crate::config::{Config, PathConfig, TimeseriesEvictionMethod};
use crate::engines::{
    self, deltaproxycache, full_body, httpproxy, objectproxycache, Body, OriginContext,
    ProxyRequest,
};
use crate::error::Result;
use crate::headers;
use crate::origin::ClientRegistry;
use crate::routing::{RouteMatch, Router};
use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Everything the front end needs to serve requests
pub struct ServerState {
    pub config: Arc<Config>,
    pub router: Router,
    pub origins: BTreeMap<String, Arc<OriginContext>>,
    caches: Vec<Arc<CacheIndex>>,
}

impl ServerState {
    /// Wire caches, clients and the routing table from a resolved config
    pub fn new(config: Arc<Config>, registry: &ClientRegistry) -> Result<Self> {
        let mut cache_indexes: BTreeMap<String, Arc<CacheIndex>> = BTreeMap::new();
        let mut compression: BTreeMap<String, bool> = BTreeMap::new();
        for (name, cache_config) in &config.caches {
            // LRU is the index-level policy unless every origin on this
            // cache asks for oldest-first
            let eviction = if config
                .origins
                .values()
                .filter(|o| &o.cache_name == name)
                .all(|o| o.timeseries_eviction_method() == TimeseriesEvictionMethod::Oldest)
                && config.origins.values().any(|o| &o.cache_name == name)
            {
                EvictionPolicy::Oldest
            } else {
                EvictionPolicy::Lru
            };
            let options = IndexOptions {
                max_size_bytes: cache_config.index.max_size_bytes,
                max_size_backoff_bytes: cache_config.index.max_size_backoff_bytes,
                max_size_objects: cache_config.index.max_size_objects,
                max_size_backoff_objects: cache_config.index.max_size_backoff_objects,
                reap_interval: Duration::from_secs(cache_config.index.reap_interval_secs),
                flush_interval: Duration::from_secs(cache_config.index.flush_interval_secs),
                eviction,
                flush_path: cache_config.index.flush_path.as_ref().map(Into::into),
            };
            let index = Arc::new(CacheIndex::new(
                name,
                Arc::new(MemoryByteStore::new()),
                options,
            ));
            cache_indexes.insert(name.clone(), index);
            compression.insert(name.clone(), cache_config.compression);
        }

        let mut clients = BTreeMap::new();
        let mut origins = BTreeMap::new();
        for (name, origin_config) in &config.origins {
            let origin_config = Arc::new(origin_config.clone());
            let client = registry.new_client(name, Arc::clone(&origin_config))?;
            clients.insert(name.clone(), Arc::clone(&client));
            let cache = Arc::clone(&cache_indexes[&origin_config.cache_name]);
            let ctx = OriginContext::new(
                name,
                origin_config.clone(),
                client,
                cache,
                compression[&origin_config.cache_name],
            )?;
            origins.insert(name.clone(), Arc::new(ctx));
        }

        let router = Router::new(&config, &clients)?;
        Ok(ServerState {
            config,
            router,
            origins,
            caches: cache_indexes.into_values().collect(),
        })
    }

    /// Launch the cache reaper and flusher tasks; requires a runtime
    pub fn start_cache_tasks(&self) {
        for cache in &self.caches {
            cache.start_tasks();
        }
    }
}

/// Bind the front-end listener and serve until the process exits
pub async fn serve(state: Arc<ServerState>) -> std::io::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        if state.config.frontend.listen_address.is_empty() {
            "0.0.0.0"
        } else {
            &state.config.frontend.listen_address
        },
        state.config.frontend.listen_port
    )
    .parse()
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "frontend listening");

    let limit = state.config.frontend.connections_limit;
    let semaphore = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));

    loop {
        // with a connection limit, hold off on accepting until a slot frees
        let permit = match &semaphore {
            Some(sem) => Some(
                Arc::clone(sem)
                    .acquire_owned()
                    .await
                    .expect("semaphore closed"),
            ),
            None => None,
        };
        let (stream, remote_addr) = listener.accept().await?;
        let connection_state = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: Request<Incoming>| {
                let state = Arc::clone(&connection_state);
                async move { Ok::<_, std::convert::Infallible>(handle(state, req, remote_addr).await) }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                warn!(error = %e, "connection error");
            }
            drop(permit);
        });
    }
}

/// Dispatch one request
pub async fn handle(
    state: Arc<ServerState>,
    req: Request<Incoming>,
    remote_addr: SocketAddr,
) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or("").to_string())
        .unwrap_or_default();

    // reserved paths answer before routing
    if path == "/trickster/ping" {
        return plain_response(StatusCode::OK, "OK");
    }
    if path == "/trickster/config" {
        return plain_response(StatusCode::OK, &state.config.to_redacted_toml());
    }
    if let Some(origin_name) = path.strip_prefix("/trickster/health/") {
        return health_check(&state, origin_name).await;
    }

    let (origin_name, path_config, stripped_path) =
        match state.router.select(&host, &path, &method) {
            RouteMatch::Found {
                origin,
                path_config,
                stripped_path,
            } => (origin, path_config, stripped_path),
            RouteMatch::MethodNotAllowed => {
                return plain_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
            }
            RouteMatch::NotFound => return plain_response(StatusCode::NOT_FOUND, "no route"),
        };

    let ctx = match state.origins.get(&origin_name) {
        Some(ctx) => Arc::clone(ctx),
        None => return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "unknown origin"),
    };

    // synthetic paths short-circuit upstream entirely
    if let Some(code) = path_config.response_code {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::OK);
        let body = path_config.response_body.clone().unwrap_or_default();
        let mut response = plain_response(status, &body);
        headers::update_headers(response.headers_mut(), &path_config.response_headers);
        return response;
    }

    let headers_in = req.headers().clone();
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "could not read request body");
            return plain_response(StatusCode::BAD_REQUEST, "unreadable request body");
        }
    };

    let proxy_request =
        match build_proxy_request(&ctx, &path_config, method, &stripped_path, query, headers_in, body, remote_addr) {
            Ok(r) => r,
            Err(e) => {
                return plain_response(
                    StatusCode::from_u16(e.to_http_status()).unwrap_or(StatusCode::BAD_REQUEST),
                    &e.to_string(),
                )
            }
        };

    match path_config.handler_name.as_str() {
        "deltaproxycache" => deltaproxycache::handle(&ctx, &path_config, proxy_request).await,
        "objectproxycache" => objectproxycache::handle(&ctx, &path_config, proxy_request).await,
        "proxy" => httpproxy::handle(&ctx, &path_config, proxy_request).await,
        other => {
            warn!(handler = %other, origin = %origin_name, "unknown handler name, proxying");
            httpproxy::handle(&ctx, &path_config, proxy_request).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_proxy_request(
    ctx: &OriginContext,
    path_config: &PathConfig,
    method: Method,
    stripped_path: &str,
    query: Option<String>,
    mut headers_in: http::HeaderMap,
    body: Bytes,
    remote_addr: SocketAddr,
) -> Result<ProxyRequest> {
    let url = ctx
        .client
        .build_upstream_url(stripped_path, query.as_deref())?;
    headers::update_headers(&mut headers_in, &path_config.request_headers);
    Ok(ProxyRequest {
        method,
        url,
        headers: headers_in,
        body,
        remote_addr: Some(remote_addr),
    })
}

/// Probe one origin's upstream health endpoint
async fn health_check(state: &ServerState, origin_name: &str) -> Response<Body> {
    let Some(ctx) = state.origins.get(origin_name) else {
        return plain_response(StatusCode::NOT_FOUND, "unknown origin");
    };
    let Some(health_request) = ctx.client.health_check_request() else {
        return plain_response(
            StatusCode::BAD_REQUEST,
            "no health check configured for origin",
        );
    };
    match engines::fetch(&ctx.http, &health_request).await {
        Ok(upstream) => {
            let mut response = Response::builder()
                .status(upstream.status)
                .body(full_body(upstream.body))
                .expect("response construction");
            headers::add_response_headers(response.headers_mut());
            response
        }
        Err(e) => {
            error!(origin = %origin_name, error = %e, "health check failed");
            plain_response(StatusCode::BAD_GATEWAY, &e.to_string())
        }
    }
}

fn plain_response(status: StatusCode, body: &str) -> Response<Body> {
    let mut response = Response::builder()
        .status(status)
        .body(full_body(Bytes::from(body.to_string())))
        .expect("response construction");
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers::add_response_headers(response.headers_mut());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OriginConfig;

    fn state() -> Arc<ServerState> {
        let mut config = Config::default();
        config.origins.insert(
            "default".to_string(),
            OriginConfig {
                origin_type: "prometheus".to_string(),
                origin_url: "http://prometheus:9090".to_string(),
                ..Default::default()
            },
        );
        config.resolve().unwrap();
        let registry = ClientRegistry::default();
        Arc::new(ServerState::new(Arc::new(config), &registry).unwrap())
    }

    #[test]
    fn test_state_builds_origin_contexts() {
        let state = state();
        assert!(state.origins.contains_key("default"));
        assert_eq!(state.caches.len(), 1);
    }

    #[tokio::test]
    async fn test_health_check_unknown_origin() {
        let state = state();
        let response = health_check(&state, "nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_plain_response_carries_server_header() {
        let response = plain_response(StatusCode::OK, "OK");
        let server = response.headers().get(http::header::SERVER).unwrap();
        assert!(server.to_str().unwrap().starts_with("trickster/"));
    }
}
