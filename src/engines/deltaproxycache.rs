//! Delta proxy cache engine
//!
//! The read-through cache for range-scoped timeseries queries. A request
//! is parsed into its fingerprint, step and extent; the cached object for
//! that fingerprint tells us which sub-ranges are already held, and only
//! the missing deltas are fetched from the origin. Fresh fragments merge
//! into the cached object, which is trimmed to its retention bound and
//! stored back, and the client receives the merged series cropped to the
//! range it asked for.
//!
//! Writers to one fingerprint serialize on a keyed lock held from lookup
//! through store, so concurrent identical queries cannot double-fetch an
//! overlapping delta: the second request in observes the first one's
//! merge and usually reduces to a full hit.

use super::cache::{query_cache, remove_cached, write_cache};
use super::{
    error_response, fetch, full_body, now_epoch, respond, Body, FetchResponse, OriginContext,
    ProxyRequest,
};
use crate::cache::{CacheError, LookupStatus};
use crate::config::{PathConfig, TimeseriesEvictionMethod};
use crate::error::{Result, TricksterError};
use crate::headers;
use crate::origin::TimeseriesRequest;
use crate::timeseries::{Extent, ExtentList, Timeseries};
use bytes::Bytes;
use dashmap::DashSet;
use http::{HeaderValue, StatusCode};
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

const ENGINE: &str = "DeltaProxyCache";

/// Origins already warned about for clock skew
static CLOCK_WARNED: Lazy<DashSet<String>> = Lazy::new(DashSet::new);

enum Outcome {
    /// A merged timeseries response
    Served {
        status: LookupStatus,
        fetched: ExtentList,
        ff_status: &'static str,
        body: Vec<u8>,
    },
    /// An origin error response forwarded as-is
    UpstreamError(FetchResponse),
    /// The cache is unusable for this request; proxy it straight through
    Passthrough,
}

/// Serve a timeseries range query through the delta cache
pub async fn handle(
    ctx: &Arc<OriginContext>,
    path_config: &PathConfig,
    req: ProxyRequest,
) -> http::Response<Body> {
    let start = Instant::now();
    let method = req.method.clone();
    let path = req.url.path().to_string();

    let tsr = match ctx.client.parse_timeseries_request(&req, path_config) {
        Ok(tsr) => tsr,
        Err(e) => return error_response(ctx, path_config, ENGINE, &e, &method, &path, start),
    };

    let requested = tsr.extent.normalize(tsr.step);
    let now = now_epoch();
    let key = format!("{}.{}", ctx.name, tsr.fingerprint);

    // a range entirely in the future has nothing cacheable about it
    if requested.start > now {
        return passthrough(ctx, path_config, &req, start).await;
    }

    // serialize against other requests for the same fingerprint
    let _guard = ctx.locks.acquire(&key).await;

    let mut attempt = 0;
    let outcome = loop {
        match execute(ctx, &req, &tsr, requested, &key, now).await {
            Err(TricksterError::Merge(reason)) if attempt == 0 => {
                // evict the poisoned object and re-run as a full fetch
                warn!(origin = %ctx.name, key = %key, reason = %reason,
                      "merge invariant violated, evicting cached object");
                remove_cached(&ctx.cache, ctx.compression, &key);
                attempt += 1;
            }
            other => break other,
        }
    };

    match outcome {
        Ok(Outcome::Served {
            status,
            fetched,
            ff_status,
            body,
        }) => {
            let mut response_headers = http::HeaderMap::new();
            response_headers.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            headers::update_headers(&mut response_headers, &path_config.response_headers);
            respond(
                ctx,
                path_config,
                ENGINE,
                status,
                StatusCode::OK,
                response_headers,
                full_body(Bytes::from(body)),
                Some(ff_status),
                Some(&fetched),
                &method,
                &path,
                start.elapsed().as_secs_f64(),
            )
        }
        Ok(Outcome::UpstreamError(upstream)) => {
            let mut response_headers = upstream.headers.clone();
            headers::update_headers(&mut response_headers, &path_config.response_headers);
            respond(
                ctx,
                path_config,
                ENGINE,
                LookupStatus::ProxyError,
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
        Ok(Outcome::Passthrough) => passthrough(ctx, path_config, &req, start).await,
        Err(e) => error_response(ctx, path_config, ENGINE, &e, &method, &path, start),
    }
}

/// The delta algorithm proper: lookup, gap computation, parallel delta
/// fetch, merge, trim, store.
async fn execute(
    ctx: &Arc<OriginContext>,
    req: &ProxyRequest,
    tsr: &TimeseriesRequest,
    requested: Extent,
    key: &str,
    now: i64,
) -> Result<Outcome> {
    let step = tsr.step;

    let cached = match query_cache(&ctx.cache, ctx.compression, key) {
        Ok(bytes) => match ctx.client.unmarshal_timeseries(&bytes) {
            Ok(ts) => Some(ts),
            Err(e) => {
                warn!(origin = %ctx.name, key = %key, error = %e,
                      "cached object unreadable, discarding");
                remove_cached(&ctx.cache, ctx.compression, key);
                None
            }
        },
        Err(CacheError::Unreachable(e)) => {
            warn!(origin = %ctx.name, error = %e, "cache unreachable, serving proxy-only");
            return Ok(Outcome::Passthrough);
        }
        Err(_) => None,
    };

    let (mut document, status) = match cached {
        None => (Timeseries::new(step), LookupStatus::KeyMiss),
        Some(ts) => {
            let status = if ts.extents.encompasses(&requested) {
                LookupStatus::Hit
            } else if ts.extents.overlaps(&requested) {
                LookupStatus::PartialHit
            } else {
                LookupStatus::RangeMiss
            };
            (ts, status)
        }
    };

    let gaps = document.extents.subtract(&requested);
    debug!(origin = %ctx.name, key = %key, status = %status,
           gaps = %gaps.to_header_value(), "delta computed");

    let mut fetched = ExtentList::new();
    if !gaps.is_empty() {
        let mut tasks = Vec::with_capacity(gaps.len());
        for gap in gaps.iter().copied() {
            let task_ctx = Arc::clone(ctx);
            let mut gap_req = req.clone();
            tasks.push(tokio::spawn(async move {
                task_ctx.client.set_extent(&mut gap_req, &gap);
                let upstream = fetch(&task_ctx.http, &gap_req).await?;
                if upstream.status.as_u16() >= 400 {
                    return Ok::<_, TricksterError>((gap, Err(upstream)));
                }
                warn_clock_offset(&task_ctx.name, &upstream.headers);
                let mut fragment = task_ctx.client.unmarshal_timeseries(&upstream.body)?;
                fragment.step = step;
                fragment.extents = ExtentList(vec![gap]);
                fragment.crop(&gap);
                Ok((gap, Ok(fragment)))
            }));
        }
        for task in tasks {
            let (gap, result) = task
                .await
                .map_err(|e| TricksterError::Upstream(format!("delta fetch task failed: {e}")))??;
            match result {
                Ok(fragment) => {
                    fetched.add(gap);
                    document.merge(fragment);
                }
                Err(upstream) => return Ok(Outcome::UpstreamError(upstream)),
            }
        }
        document
            .validate()
            .map_err(TricksterError::Merge)?;
    }

    // fast-forward: a real-time point for requests reaching the present
    let mut ff_status = "off";
    let mut volatile = Timeseries::new(step);
    let mut ff_end: Option<i64> = None;
    let backfill_tolerance = ctx.config.backfill_tolerance().as_secs() as i64;
    let volatile_after = now - backfill_tolerance;
    if requested.end + step > now {
        if let Some(ff_req) = ctx.client.fast_forward_request(req) {
            match fast_forward_fetch(ctx, &ff_req, step).await {
                Ok(points) => {
                    ff_status = "hit";
                    for (extent, fragment) in points {
                        ff_end = Some(ff_end.map_or(extent.end, |e: i64| e.max(extent.end)));
                        // recent samples are volatile: the origin may still
                        // backfill them, so they are served but not stored
                        if extent.start < volatile_after {
                            document.merge(fragment);
                        } else {
                            volatile.merge(fragment);
                        }
                    }
                }
                Err(e) => {
                    debug!(origin = %ctx.name, error = %e, "fast forward fetch failed");
                    ff_status = "err";
                }
            }
        }
    }

    // snapshot the response before any cache-side trimming
    let mut response = document.clone();
    response.merge(volatile);
    let crop_end = ff_end
        .map(|e| e.max(requested.end))
        .unwrap_or(requested.end);
    response.crop(&Extent::new(requested.start, crop_end));

    // exclude not-yet-settled samples from the stored object: the origin
    // may still backfill them
    if backfill_tolerance > 0 {
        if let Some(start) = document.extents.start() {
            if start < volatile_after {
                document.crop(&Extent::new(start, volatile_after));
            } else {
                document = Timeseries::new(step);
            }
        }
    }

    // retention trim, anchored at the newest cached timestamp
    let retention = ctx.config.timeseries_retention_factor();
    match ctx.config.timeseries_eviction_method() {
        TimeseriesEvictionMethod::Oldest => {
            if let (Some(start), Some(end)) = (document.extents.start(), document.extents.end()) {
                let cutoff = end - step * retention;
                if start < cutoff {
                    document.crop(&Extent::new(cutoff, end));
                }
            }
        }
        TimeseriesEvictionMethod::Lru => {
            document.extents.touch(&requested, now);
            evict_coldest_extents(&mut document, retention, step);
        }
    }

    // store unless nothing about the object changed
    let dirty = status != LookupStatus::Hit
        || ctx.config.timeseries_eviction_method() == TimeseriesEvictionMethod::Lru;
    if dirty && !document.extents.is_empty() {
        let ttl = ctx.config.timeseries_ttl().min(ctx.config.max_ttl());
        let bytes = ctx.client.marshal_timeseries(&document)?;
        if let Err(e) = write_cache(&ctx.cache, ctx.compression, key, Bytes::from(bytes), ttl) {
            warn!(origin = %ctx.name, key = %key, error = %e, "could not store timeseries object");
        }
    }

    let body = ctx.client.marshal_timeseries(&response)?;

    Ok(Outcome::Served {
        status,
        fetched,
        ff_status,
        body,
    })
}

/// Fetch the fast-forward point query and grid-align its samples.
///
/// Returns one (extent, fragment) pair per step-aligned timestamp so the
/// caller can split settled from volatile samples.
async fn fast_forward_fetch(
    ctx: &Arc<OriginContext>,
    ff_req: &ProxyRequest,
    step: i64,
) -> Result<Vec<(Extent, Timeseries)>> {
    let upstream = fetch(&ctx.http, ff_req).await?;
    if upstream.status.as_u16() >= 400 {
        return Err(TricksterError::Upstream(format!(
            "fast forward fetch returned status {}",
            upstream.status
        )));
    }
    let mut fragment = ctx.client.unmarshal_timeseries(&upstream.body)?;
    fragment.step = step;

    // instant-query samples land off the grid; snap them down to it
    let mut aligned = Timeseries::new(step);
    for series in &mut fragment.series {
        for point in &mut series.points {
            point.timestamp = point.timestamp.div_euclid(step) * step;
        }
    }
    aligned.series = fragment.series;
    aligned.sort();

    let mut out = Vec::new();
    let timestamps: std::collections::BTreeSet<i64> = aligned
        .series
        .iter()
        .flat_map(|s| s.points.iter().map(|p| p.timestamp))
        .collect();
    for timestamp in timestamps {
        let extent = Extent::new(timestamp, timestamp + step);
        let mut slice = aligned.clone();
        slice.extents = ExtentList(vec![extent]);
        slice.crop(&extent);
        out.push((extent, slice));
    }
    Ok(out)
}

/// Drop the least recently served extents until the object's sample
/// capacity fits the retention factor.
fn evict_coldest_extents(ts: &mut Timeseries, max_cardinality: i64, step: i64) {
    while ts.extents.cardinality(step) > max_cardinality && ts.extents.len() > 1 {
        let coldest = ts
            .extents
            .0
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let removed = ts.extents.0.remove(coldest);
        for series in &mut ts.series {
            series.points.retain(|p| !removed.contains(p.timestamp));
        }
        ts.series.retain(|s| !s.points.is_empty());
    }
    // a single oversized extent shrinks from its oldest edge
    if ts.extents.cardinality(step) > max_cardinality {
        if let Some(end) = ts.extents.end() {
            ts.crop(&Extent::new(end - max_cardinality * step, end));
        }
    }
}

/// Proxy the request through untouched when caching is not possible
async fn passthrough(
    ctx: &Arc<OriginContext>,
    path_config: &PathConfig,
    req: &ProxyRequest,
    start: Instant,
) -> http::Response<Body> {
    match fetch(&ctx.http, req).await {
        Ok(upstream) => {
            let mut response_headers = upstream.headers.clone();
            headers::update_headers(&mut response_headers, &path_config.response_headers);
            let status = if upstream.status.as_u16() >= 400 {
                LookupStatus::ProxyError
            } else {
                LookupStatus::ProxyOnly
            };
            respond(
                ctx,
                path_config,
                ENGINE,
                status,
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
        Err(e) => error_response(
            ctx,
            path_config,
            ENGINE,
            &e,
            &req.method,
            req.url.path(),
            start,
        ),
    }
}

/// Warn once per origin when its clock disagrees with ours enough to
/// skew extent arithmetic.
fn warn_clock_offset(origin: &str, response_headers: &http::HeaderMap) {
    let Some(date) = response_headers
        .get(http::header::DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| chrono::DateTime::parse_from_rfc2822(s).ok())
    else {
        return;
    };
    let offset = (now_epoch() - date.timestamp()).abs();
    if offset > 60 && CLOCK_WARNED.insert(origin.to_string()) {
        warn!(
            origin = %origin,
            offset_secs = offset,
            "clock offset between trickster host and origin is high and may cause data anomalies"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeseries::{DataPoint, Series};

    fn object(step: i64, extents: &[(i64, i64, i64)]) -> Timeseries {
        let mut ts = Timeseries::new(step);
        for &(start, end, last_used) in extents {
            let mut extent = Extent::new(start, end);
            extent.last_used = last_used;
            ts.extents.0.push(extent);
            let mut t = start;
            let mut points = Vec::new();
            while t < end {
                points.push(DataPoint {
                    timestamp: t,
                    value: t as f64,
                });
                t += step;
            }
            match ts.series.first_mut() {
                Some(series) => series.points.extend(points),
                None => ts.series.push(Series {
                    metric: [("__name__".to_string(), "up".to_string())]
                        .into_iter()
                        .collect(),
                    points,
                }),
            }
        }
        ts.sort();
        ts
    }

    #[test]
    fn test_evict_coldest_extent_first() {
        // two extents of 10 samples each; capacity allows only one
        let mut ts = object(10, &[(1000, 1100, 5), (2000, 2100, 50)]);
        evict_coldest_extents(&mut ts, 10, 10);
        assert_eq!(ts.extents.0, vec![Extent::new(2000, 2100)]);
        assert!(ts
            .series
            .iter()
            .all(|s| s.points.iter().all(|p| p.timestamp >= 2000)));
    }

    #[test]
    fn test_single_extent_shrinks_from_oldest_edge() {
        let mut ts = object(10, &[(1000, 1500, 5)]);
        evict_coldest_extents(&mut ts, 20, 10);
        assert_eq!(ts.extents.0, vec![Extent::new(1300, 1500)]);
        assert_eq!(ts.extents.cardinality(10), 20);
    }

    #[test]
    fn test_eviction_preserves_validity() {
        let mut ts = object(10, &[(0, 200, 1), (500, 700, 2), (900, 1000, 3)]);
        evict_coldest_extents(&mut ts, 25, 10);
        assert!(ts.extents.cardinality(10) <= 25);
        assert!(ts.validate().is_ok());
    }
}
