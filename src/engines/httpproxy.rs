//! Raw HTTP proxy engine
//!
//! Forwards requests to the origin with no caching. Paths configured with
//! progressive collapsed forwarding deduplicate concurrent identical
//! fetches through a [`ProgressiveCollapseForwarder`]: the first request
//! becomes the producer and later arrivals attach as consumers of the
//! same upstream byte stream.

use super::pcf::ProgressiveCollapseForwarder;
use super::{
    fetch, full_body, proxy_lookup_status, respond, Body, OriginContext, ProxyRequest,
};
use crate::config::{CollapsedForwarding, PathConfig};
use crate::headers;
use crate::origin::{cache_key_parts, derive_fingerprint};
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

const ENGINE: &str = "HTTPProxy";

/// Serve a proxy-only path
pub async fn handle(
    ctx: &Arc<OriginContext>,
    path_config: &PathConfig,
    req: ProxyRequest,
) -> http::Response<Body> {
    let start = Instant::now();
    let method = req.method.clone();
    let path = req.url.path().to_string();

    if path_config.collapsed_forwarding != CollapsedForwarding::Progressive {
        return match fetch(&ctx.http, &req).await {
            Ok(upstream) => {
                let mut response_headers = upstream.headers.clone();
                headers::update_headers(&mut response_headers, &path_config.response_headers);
                respond(
                    ctx,
                    path_config,
                    ENGINE,
                    proxy_lookup_status(upstream.status),
                    upstream.status,
                    response_headers,
                    full_body(upstream.body),
                    None,
                    None,
                    &method,
                    &path,
                    start.elapsed().as_secs_f64(),
                )
            }
            Err(e) => super::error_response(ctx, path_config, ENGINE, &e, &method, &path, start),
        };
    }

    // Progressive collapsed forwarding: at most one upstream fetch per key
    let mut parts = vec![req.method.to_string(), path.clone()];
    parts.extend(cache_key_parts(&req, path_config));
    let part_refs: Vec<&str> = parts.iter().map(|p| p.as_str()).collect();
    let key = format!("{}.{}", ctx.config.host, derive_fingerprint(&part_refs));

    // the keyed lock makes the check-and-create below atomic, so
    // concurrent first arrivals cannot each open an upstream fetch
    let guard = ctx.locks.acquire(&key).await;

    if let Some(pcf) = ctx.collapsed.get(&key).map(|entry| Arc::clone(&entry)) {
        drop(guard);
        debug!(key = %key, "joining in-flight collapsed fetch");
        let mut response_headers = pcf.headers().clone();
        headers::update_headers(&mut response_headers, &path_config.response_headers);
        let status = pcf.status();
        let body = pcf.add_client();
        return respond(
            ctx,
            path_config,
            ENGINE,
            proxy_lookup_status(status),
            status,
            response_headers,
            body,
            None,
            None,
            &method,
            &path,
            start.elapsed().as_secs_f64(),
        );
    }

    // This request is the producer: open the upstream stream
    let mut upstream_headers = req.headers.clone();
    headers::remove_hop_headers(&mut upstream_headers);
    upstream_headers.remove(http::header::HOST);
    headers::add_proxy_headers(req.remote_addr, &mut upstream_headers);
    let upstream = match ctx
        .http
        .request(req.method.clone(), req.url.clone())
        .headers(upstream_headers)
        .body(req.body.clone())
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            drop(guard);
            let err = super::classify_fetch_error(&req.url, e);
            return super::error_response(ctx, path_config, ENGINE, &err, &method, &path, start);
        }
    };

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut upstream_response_headers = upstream.headers().clone();
    headers::remove_hop_headers(&mut upstream_response_headers);
    headers::update_headers(&mut upstream_response_headers, &path_config.response_headers);

    let content_length = upstream.content_length();
    let body = match content_length {
        Some(cl) if cl > 0 && (cl as usize) < ctx.config.max_object_size_bytes => {
            let pcf =
                ProgressiveCollapseForwarder::new(status, upstream_response_headers.clone(), cl);
            ctx.collapsed.insert(key.clone(), Arc::clone(&pcf));
            drop(guard);
            let body = pcf.add_client();
            let producer_ctx = Arc::clone(ctx);
            let producer_key = key;
            tokio::spawn(async move {
                let mut upstream = upstream;
                loop {
                    match upstream.chunk().await {
                        Ok(Some(chunk)) => pcf.append(chunk),
                        Ok(None) => {
                            pcf.close();
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "collapsed forwarding upstream read failed");
                            pcf.fail();
                            break;
                        }
                    }
                }
                producer_ctx.collapsed.remove(&producer_key);
            });
            body
        }
        // unknown or oversize responses bypass the forwarder entirely
        _ => stream_direct(upstream),
    };

    respond(
        ctx,
        path_config,
        ENGINE,
        proxy_lookup_status(status),
        status,
        upstream_response_headers,
        body,
        None,
        None,
        &method,
        &path,
        start.elapsed().as_secs_f64(),
    )
}

/// Stream an upstream response straight through without buffering
fn stream_direct(upstream: reqwest::Response) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Frame<Bytes>, Infallible>>(16);
    tokio::spawn(async move {
        let mut upstream = upstream;
        loop {
            match upstream.chunk().await {
                Ok(Some(chunk)) => {
                    if tx.send(Ok(Frame::data(chunk))).await.is_err() {
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "upstream stream read failed");
                    return;
                }
            }
        }
    });
    StreamBody::new(ReceiverStream::new(rx)).boxed()
}
