//! Prometheus metrics for the proxy
//!
//! All metrics live in a dedicated registry exposed over a small HTTP
//! endpoint on the configured metrics port.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, Encoder, HistogramVec, IntCounterVec, IntGaugeVec, Registry, TextEncoder,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Count of front-end requests by origin, method, cache status and HTTP status
pub static PROXY_REQUEST_STATUS: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        opts!(
            "trickster_frontend_requests_total",
            "Count of front end requests handled by trickster"
        ),
        &["origin_name", "origin_type", "method", "cache_status", "http_status", "path"],
    )
    .unwrap();
    REGISTRY.register(Box::new(vec.clone())).ok();
    vec
});

/// Request handling latency with the same label set as the request counter
pub static PROXY_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let vec = HistogramVec::new(
        histogram_opts!(
            "trickster_frontend_requests_duration_seconds",
            "Histogram of front end request durations",
            vec![0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 20.0]
        ),
        &["origin_name", "origin_type", "method", "cache_status", "http_status", "path"],
    )
    .unwrap();
    REGISTRY.register(Box::new(vec.clone())).ok();
    vec
});

/// Cache operations (hit/miss/set/remove/expired) per cache
pub static CACHE_OPERATION_OBJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        opts!(
            "trickster_cache_operation_objects_total",
            "Count of objects affected by cache operations"
        ),
        &["cache_name", "operation"],
    )
    .unwrap();
    REGISTRY.register(Box::new(vec.clone())).ok();
    vec
});

/// Maintenance events (expire/evict) per cache
pub static CACHE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        opts!(
            "trickster_cache_events_total",
            "Count of cache maintenance events"
        ),
        &["cache_name", "event"],
    )
    .unwrap();
    REGISTRY.register(Box::new(vec.clone())).ok();
    vec
});

pub static CACHE_OBJECTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let vec = IntGaugeVec::new(
        opts!("trickster_cache_usage_objects", "Count of objects in the cache"),
        &["cache_name"],
    )
    .unwrap();
    REGISTRY.register(Box::new(vec.clone())).ok();
    vec
});

pub static CACHE_BYTES: Lazy<IntGaugeVec> = Lazy::new(|| {
    let vec = IntGaugeVec::new(
        opts!("trickster_cache_usage_bytes", "Byte size of the cache"),
        &["cache_name"],
    )
    .unwrap();
    REGISTRY.register(Box::new(vec.clone())).ok();
    vec
});

/// Record a proxied request outcome
pub fn record_proxy_request(
    origin_name: &str,
    origin_type: &str,
    method: &str,
    cache_status: &str,
    http_status: u16,
    path: &str,
    elapsed_secs: f64,
) {
    let status = http_status.to_string();
    PROXY_REQUEST_STATUS
        .with_label_values(&[origin_name, origin_type, method, cache_status, &status, path])
        .inc();
    if elapsed_secs > 0.0 {
        PROXY_REQUEST_DURATION
            .with_label_values(&[origin_name, origin_type, method, cache_status, &status, path])
            .observe(elapsed_secs);
    }
}

pub fn record_cache_operation(cache_name: &str, operation: &str) {
    CACHE_OPERATION_OBJECTS
        .with_label_values(&[cache_name, operation])
        .inc();
}

pub fn record_cache_events(cache_name: &str, event: &str, count: u64) {
    CACHE_EVENTS
        .with_label_values(&[cache_name, event])
        .inc_by(count);
}

pub fn set_cache_usage(cache_name: &str, objects: u64, bytes: u64) {
    CACHE_OBJECTS
        .with_label_values(&[cache_name])
        .set(objects as i64);
    CACHE_BYTES
        .with_label_values(&[cache_name])
        .set(bytes as i64);
}

/// Render the registry in Prometheus text exposition format
pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!(error = %e, "could not encode metrics");
    }
    buffer
}

/// Serve `/metrics` on the given address until the process exits
pub async fn serve(addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics endpoint listening");
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let service = service_fn(|req: hyper::Request<hyper::body::Incoming>| async move {
                let resp = if req.uri().path() == "/metrics" {
                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", "text/plain; version=0.0.4")
                        .body(Full::new(Bytes::from(gather())))
                } else {
                    Response::builder()
                        .status(StatusCode::NOT_FOUND)
                        .body(Full::new(Bytes::from_static(b"not found")))
                };
                resp.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                error!(error = %e, "metrics connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_gather() {
        record_proxy_request("default", "prometheus", "GET", "hit", 200, "/api/v1/query_range", 0.2);
        record_cache_operation("default", "hit");
        record_cache_events("default", "evict", 3);
        set_cache_usage("default", 10, 4096);
        let text = String::from_utf8(gather()).unwrap();
        assert!(text.contains("trickster_frontend_requests_total"));
        assert!(text.contains("trickster_cache_usage_objects"));
    }
}
