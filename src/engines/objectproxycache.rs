//! Object proxy cache engine
//!
//! Caches whole HTTP responses for non-timeseries paths. Freshness comes
//! from the origin's caching headers bounded by the path and origin TTLs;
//! error responses listed in the origin's negative cache table are stored
//! briefly so known-bad requests are not hammered upstream. Stale
//! documents that carry validators are revalidated with a conditional
//! request instead of a full refetch.

use super::cache::{extend_ttl, query_document, write_document, HttpDocument};
use super::{
    error_response, fetch, full_body, now_epoch, respond, Body, FetchResponse, OriginContext,
    ProxyRequest,
};
use crate::cache::{CacheError, LookupStatus};
use crate::config::PathConfig;
use crate::headers;
use crate::origin::{cache_key_parts, derive_fingerprint};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

const ENGINE: &str = "ObjectProxyCache";

/// Fallback object TTL when neither the origin nor the path specifies one
const DEFAULT_OBJECT_TTL: Duration = Duration::from_secs(300);

/// Serve a cacheable non-timeseries path
pub async fn handle(
    ctx: &Arc<OriginContext>,
    path_config: &PathConfig,
    req: ProxyRequest,
) -> http::Response<Body> {
    let start = Instant::now();
    let method = req.method.clone();
    let path = req.url.path().to_string();
    let now = now_epoch();

    let mut parts = vec![method.to_string(), path.clone()];
    parts.extend(cache_key_parts(&req, path_config));
    let part_refs: Vec<&str> = parts.iter().map(|p| p.as_str()).collect();
    let key = format!("{}.{}", ctx.name, derive_fingerprint(&part_refs));

    let mut cache_degraded = false;
    let cached = if client_requests_no_cache(&req.headers) {
        None
    } else {
        match query_document(&ctx.cache, ctx.compression, &key) {
            Ok(document) => Some(document),
            Err(CacheError::Unreachable(e)) => {
                warn!(origin = %ctx.name, error = %e, "cache unreachable, serving proxy-only");
                cache_degraded = true;
                None
            }
            Err(_) => None,
        }
    };

    if let Some(document) = cached {
        if now < document.fresh_until {
            let status = if document.negative {
                LookupStatus::NegativeCacheHit
            } else {
                LookupStatus::Hit
            };
            return serve_document(ctx, path_config, &req, &document, status, start);
        }

        // Stale but still stored: revalidate when the document carries
        // validators and the path allows it
        if ctx.config.revalidation_factor >= 1.0
            && (document.etag.is_some() || document.last_modified.is_some())
        {
            let mut conditional = req.clone();
            if let Some(etag) = &document.etag {
                if let Ok(v) = HeaderValue::from_str(etag) {
                    conditional.headers.insert(http::header::IF_NONE_MATCH, v);
                }
            }
            if let Some(lm) = &document.last_modified {
                if let Ok(v) = HeaderValue::from_str(lm) {
                    conditional
                        .headers
                        .insert(http::header::IF_MODIFIED_SINCE, v);
                }
            }
            match fetch(&ctx.http, &conditional).await {
                Ok(upstream) if upstream.status == StatusCode::NOT_MODIFIED => {
                    let ttl = object_ttl(ctx, path_config, &upstream.headers);
                    let extended = Duration::from_secs_f64(
                        ttl.as_secs_f64() * ctx.config.revalidation_factor,
                    );
                    let mut refreshed = document;
                    refreshed.fresh_until = now + ttl.as_secs() as i64;
                    if write_document(&ctx.cache, ctx.compression, &key, &refreshed, extended)
                        .is_err()
                    {
                        extend_ttl(&ctx.cache, ctx.compression, &key, extended);
                    }
                    return serve_document(
                        ctx,
                        path_config,
                        &req,
                        &refreshed,
                        LookupStatus::Hit,
                        start,
                    );
                }
                Ok(upstream) => {
                    return store_and_serve(
                        ctx,
                        path_config,
                        &req,
                        &key,
                        upstream,
                        now,
                        cache_degraded,
                        start,
                    );
                }
                Err(e) => {
                    return error_response(ctx, path_config, ENGINE, &e, &method, &path, start)
                }
            }
        }
    }

    match fetch(&ctx.http, &req).await {
        Ok(upstream) => store_and_serve(
            ctx,
            path_config,
            &req,
            &key,
            upstream,
            now,
            cache_degraded,
            start,
        ),
        Err(e) => error_response(ctx, path_config, ENGINE, &e, &method, &path, start),
    }
}

/// Store a fresh upstream response when it is cacheable, then serve it
#[allow(clippy::too_many_arguments)]
fn store_and_serve(
    ctx: &OriginContext,
    path_config: &PathConfig,
    req: &ProxyRequest,
    key: &str,
    upstream: FetchResponse,
    now: i64,
    cache_degraded: bool,
    start: Instant,
) -> http::Response<Body> {
    let status_code = upstream.status.as_u16();

    // Negative cache: configured error statuses are stored briefly
    if let Some(negative_ttl) = ctx.config.negative_cache.get(&status_code) {
        let ttl = (*negative_ttl).min(ctx.config.max_ttl());
        let lookup = if cache_degraded {
            LookupStatus::ProxyError
        } else {
            let document = document_from(&upstream, now, ttl, true);
            if let Err(e) = write_document(&ctx.cache, ctx.compression, key, &document, ttl) {
                warn!(origin = %ctx.name, error = %e, "could not store negative cache entry");
            }
            LookupStatus::NegativeCacheMiss
        };
        return forward_upstream(ctx, path_config, req, upstream, lookup, start);
    }

    if status_code >= 400 {
        return forward_upstream(
            ctx,
            path_config,
            req,
            upstream,
            LookupStatus::ProxyError,
            start,
        );
    }

    let (hint, no_store) = origin_cache_hint(&upstream.headers);
    if no_store || cache_degraded {
        let lookup = if cache_degraded {
            LookupStatus::ProxyOnly
        } else {
            LookupStatus::KeyMiss
        };
        return forward_upstream(ctx, path_config, req, upstream, lookup, start);
    }

    let mut ttl = object_ttl(ctx, path_config, &upstream.headers);
    if let Some(hint) = hint {
        ttl = ttl.min(hint);
    }

    let document = document_from(&upstream, now, ttl, false);
    // documents with validators outlive their freshness so a later access
    // can revalidate instead of refetching
    let index_ttl = if ctx.config.revalidation_factor >= 1.0
        && (document.etag.is_some() || document.last_modified.is_some())
    {
        Duration::from_secs_f64(ttl.as_secs_f64() * ctx.config.revalidation_factor)
    } else {
        ttl
    };
    if let Err(e) = write_document(&ctx.cache, ctx.compression, key, &document, index_ttl) {
        warn!(origin = %ctx.name, error = %e, "could not store cached document");
    }

    forward_upstream(
        ctx,
        path_config,
        req,
        upstream,
        LookupStatus::KeyMiss,
        start,
    )
}

fn forward_upstream(
    ctx: &OriginContext,
    path_config: &PathConfig,
    req: &ProxyRequest,
    upstream: FetchResponse,
    lookup: LookupStatus,
    start: Instant,
) -> http::Response<Body> {
    let mut response_headers = upstream.headers.clone();
    headers::update_headers(&mut response_headers, &path_config.response_headers);
    respond(
        ctx,
        path_config,
        ENGINE,
        lookup,
        upstream.status,
        response_headers,
        full_body(upstream.body),
        None,
        None,
        &req.method,
        req.url.path(),
        start.elapsed().as_secs_f64(),
    )
}

/// Serve a cached document, answering client conditionals with 304
fn serve_document(
    ctx: &OriginContext,
    path_config: &PathConfig,
    req: &ProxyRequest,
    document: &HttpDocument,
    lookup: LookupStatus,
    start: Instant,
) -> http::Response<Body> {
    let mut response_headers = headers_from_pairs(&document.headers);
    // preserve the origin's Date; synthesize one only when it never sent one
    if !response_headers.contains_key(http::header::DATE) {
        let now = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        if let Ok(v) = HeaderValue::from_str(&now) {
            response_headers.insert(http::header::DATE, v);
        }
    }
    headers::update_headers(&mut response_headers, &path_config.response_headers);

    let status = StatusCode::from_u16(document.status_code).unwrap_or(StatusCode::OK);
    if client_conditional_matches(&req.headers, document) {
        return respond(
            ctx,
            path_config,
            ENGINE,
            lookup,
            StatusCode::NOT_MODIFIED,
            response_headers,
            full_body(Bytes::new()),
            None,
            None,
            &req.method,
            req.url.path(),
            start.elapsed().as_secs_f64(),
        );
    }

    let body = if req.method == Method::HEAD {
        Bytes::new()
    } else {
        Bytes::from(document.body.clone())
    };
    respond(
        ctx,
        path_config,
        ENGINE,
        lookup,
        status,
        response_headers,
        full_body(body),
        None,
        None,
        &req.method,
        req.url.path(),
        start.elapsed().as_secs_f64(),
    )
}

fn document_from(upstream: &FetchResponse, now: i64, ttl: Duration, negative: bool) -> HttpDocument {
    HttpDocument {
        status_code: upstream.status.as_u16(),
        headers: pairs_from_headers(&upstream.headers),
        body: upstream.body.to_vec(),
        stored_at: now,
        fresh_until: now + ttl.as_secs() as i64,
        negative,
        etag: header_string(&upstream.headers, http::header::ETAG),
        last_modified: header_string(&upstream.headers, http::header::LAST_MODIFIED),
    }
}

/// The path/origin TTL bound for a cached object
fn object_ttl(ctx: &OriginContext, path_config: &PathConfig, _headers: &HeaderMap) -> Duration {
    path_config
        .default_ttl(DEFAULT_OBJECT_TTL)
        .min(ctx.config.max_ttl())
}

/// Extract the origin's freshness hint and no-store directives
fn origin_cache_hint(headers: &HeaderMap) -> (Option<Duration>, bool) {
    let mut hint = None;
    let mut no_store = false;
    if let Some(cc) = headers
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
    {
        for directive in cc.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if directive == "no-store" || directive == "private" {
                no_store = true;
            } else if let Some(seconds) = directive
                .strip_prefix("s-maxage=")
                .or_else(|| directive.strip_prefix("max-age="))
            {
                if let Ok(seconds) = seconds.parse::<u64>() {
                    hint = Some(Duration::from_secs(seconds));
                }
            }
        }
    }
    if hint.is_none() {
        if let (Some(expires), Some(date)) = (
            header_date(headers, http::header::EXPIRES),
            header_date(headers, http::header::DATE),
        ) {
            if expires > date {
                hint = Some(Duration::from_secs((expires - date) as u64));
            }
        }
    }
    (hint, no_store)
}

fn header_date(headers: &HeaderMap, name: HeaderName) -> Option<i64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
        .map(|dt| dt.timestamp())
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn client_requests_no_cache(headers: &HeaderMap) -> bool {
    let cache_control = headers
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("no-cache"))
        .unwrap_or(false);
    let pragma = headers
        .get(http::header::PRAGMA)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("no-cache"))
        .unwrap_or(false);
    cache_control || pragma
}

fn client_conditional_matches(req_headers: &HeaderMap, document: &HttpDocument) -> bool {
    if let (Some(inm), Some(etag)) = (
        req_headers
            .get(http::header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok()),
        document.etag.as_deref(),
    ) {
        if inm == etag || inm == "*" {
            return true;
        }
    }
    if let (Some(ims), Some(lm)) = (
        req_headers
            .get(http::header::IF_MODIFIED_SINCE)
            .and_then(|v| v.to_str().ok()),
        document.last_modified.as_deref(),
    ) {
        if let (Ok(since), Ok(modified)) = (
            chrono::DateTime::parse_from_rfc2822(ims),
            chrono::DateTime::parse_from_rfc2822(lm),
        ) {
            if modified <= since {
                return true;
            }
        }
    }
    false
}

fn pairs_from_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn headers_from_pairs(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_cache_hint_max_age() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=120"),
        );
        let (hint, no_store) = origin_cache_hint(&headers);
        assert_eq!(hint, Some(Duration::from_secs(120)));
        assert!(!no_store);
    }

    #[test]
    fn test_origin_cache_hint_no_store() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        );
        let (_, no_store) = origin_cache_hint(&headers);
        assert!(no_store);
    }

    #[test]
    fn test_origin_cache_hint_expires() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::DATE,
            HeaderValue::from_static("Mon, 01 Jun 2020 00:00:00 GMT"),
        );
        headers.insert(
            http::header::EXPIRES,
            HeaderValue::from_static("Mon, 01 Jun 2020 00:05:00 GMT"),
        );
        let (hint, _) = origin_cache_hint(&headers);
        assert_eq!(hint, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_client_no_cache_detection() {
        let mut headers = HeaderMap::new();
        assert!(!client_requests_no_cache(&headers));
        headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        );
        assert!(client_requests_no_cache(&headers));
    }

    #[test]
    fn test_conditional_etag_match() {
        let document = HttpDocument {
            status_code: 200,
            headers: Vec::new(),
            body: Vec::new(),
            stored_at: 0,
            fresh_until: 0,
            negative: false,
            etag: Some("\"v1\"".to_string()),
            last_modified: None,
        };
        let mut req_headers = HeaderMap::new();
        req_headers.insert(
            http::header::IF_NONE_MATCH,
            HeaderValue::from_static("\"v1\""),
        );
        assert!(client_conditional_matches(&req_headers, &document));
        req_headers.insert(
            http::header::IF_NONE_MATCH,
            HeaderValue::from_static("\"v2\""),
        );
        assert!(!client_conditional_matches(&req_headers, &document));
    }

    #[test]
    fn test_header_pairs_roundtrip() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.append("x-many", HeaderValue::from_static("a"));
        headers.append("x-many", HeaderValue::from_static("b"));
        let restored = headers_from_pairs(&pairs_from_headers(&headers));
        assert_eq!(restored.get("content-type").unwrap(), "text/plain");
        assert_eq!(restored.get_all("x-many").iter().count(), 2);
    }
}
