//! Prometheus origin client
//!
//! Parses `/api/v1/query_range` requests into canonical timeseries
//! requests and translates between the in-memory model and the Prometheus
//! matrix JSON wire format. Cached objects are stored in the same wire
//! format, extended with `extents` and `step` fields Prometheus clients
//! ignore.

use super::{cache_key_parts, derive_fingerprint, OriginClient, TimeseriesRequest};
use crate::config::{CollapsedForwarding, OriginConfig, PathConfig, PathMatchType};
use crate::engines::ProxyRequest;
use crate::error::{Result, TricksterError};
use crate::timeseries::{DataPoint, Extent, ExtentList, Series, Timeseries};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const PARAM_QUERY: &str = "query";
const PARAM_START: &str = "start";
const PARAM_END: &str = "end";
const PARAM_STEP: &str = "step";
const PARAM_TIME: &str = "time";

pub struct PrometheusClient {
    name: String,
    config: Arc<OriginConfig>,
}

pub fn new_client(
    name: &str,
    config: Arc<OriginConfig>,
) -> Result<Arc<dyn OriginClient>> {
    Ok(Arc::new(PrometheusClient {
        name: name.to_string(),
        config,
    }))
}

/// Parse a Prometheus timestamp: epoch seconds (integer or float) or an
/// RFC 3339 datetime.
fn parse_time(value: &str) -> Result<i64> {
    if let Ok(seconds) = value.parse::<f64>() {
        if !seconds.is_finite() {
            return Err(TricksterError::Parse(format!("invalid time '{value}'")));
        }
        return Ok(seconds.trunc() as i64);
    }
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp())
        .map_err(|e| TricksterError::Parse(format!("invalid time '{value}': {e}")))
}

/// Parse a step: seconds (integer or float) or a single-unit duration
/// such as `15s`, `5m`, `1h`.
fn parse_step(value: &str) -> Result<i64> {
    if let Ok(seconds) = value.parse::<f64>() {
        return Ok(seconds.trunc() as i64);
    }
    let (digits, unit) = value.split_at(value.len().saturating_sub(1));
    let n: i64 = digits
        .parse()
        .map_err(|_| TricksterError::Parse(format!("invalid step '{value}'")))?;
    let multiplier = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        "w" => 604800,
        "y" => 31536000,
        _ => return Err(TricksterError::Parse(format!("invalid step '{value}'"))),
    };
    Ok(n * multiplier)
}

// Wire format structures. Serialization field order is fixed so that a
// stored object marshals byte-identically after an unmarshal round trip.

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    status: String,
    data: WireData,
    #[serde(default, skip_serializing_if = "ExtentList::is_empty")]
    extents: ExtentList,
    #[serde(default, skip_serializing_if = "step_is_zero")]
    step: i64,
}

fn step_is_zero(step: &i64) -> bool {
    *step == 0
}

#[derive(Debug, Serialize, Deserialize)]
struct WireData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<WireSeries>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireSeries {
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(serde_json::Number, String)>,
    /// Instant-query (vector) results carry a single `value` instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<(serde_json::Number, String)>,
}

fn wire_point(number: &serde_json::Number, value: &str) -> Result<DataPoint> {
    let timestamp = number
        .as_f64()
        .ok_or_else(|| TricksterError::Parse(format!("invalid timestamp '{number}'")))?
        .trunc() as i64;
    let value = value
        .parse::<f64>()
        .map_err(|e| TricksterError::Parse(format!("invalid sample value '{value}': {e}")))?;
    Ok(DataPoint { timestamp, value })
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else {
        format!("{value}")
    }
}

impl OriginClient for PrometheusClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn origin_type(&self) -> &'static str {
        "prometheus"
    }

    fn origin_config(&self) -> &OriginConfig {
        &self.config
    }

    fn build_upstream_url(&self, path: &str, query: Option<&str>) -> Result<url::Url> {
        let base = format!(
            "{}://{}{}{}",
            self.config.scheme, self.config.host, self.config.path_prefix, path
        );
        let mut url = url::Url::parse(&base)
            .map_err(|e| TricksterError::Parse(format!("invalid upstream url: {e}")))?;
        url.set_query(query.filter(|q| !q.is_empty()));
        Ok(url)
    }

    fn parse_timeseries_request(
        &self,
        req: &ProxyRequest,
        path_config: &PathConfig,
    ) -> Result<TimeseriesRequest> {
        let query = req
            .param(PARAM_QUERY)
            .ok_or_else(|| TricksterError::Parse("missing parameter 'query'".to_string()))?;
        let start = parse_time(&req.param(PARAM_START).ok_or_else(|| {
            TricksterError::Parse("missing parameter 'start'".to_string())
        })?)?;
        let end = parse_time(&req.param(PARAM_END).ok_or_else(|| {
            TricksterError::Parse("missing parameter 'end'".to_string())
        })?)?;
        let step = parse_step(&req.param(PARAM_STEP).ok_or_else(|| {
            TricksterError::Parse("missing parameter 'step'".to_string())
        })?)?;

        if step <= 0 {
            return Err(TricksterError::Parse(format!(
                "step must be positive, got {step}"
            )));
        }
        if end < start {
            return Err(TricksterError::Parse(format!(
                "end {end} precedes start {start}"
            )));
        }

        let query = query.trim().to_string();
        let mut parts = cache_key_parts(req, path_config);
        if parts.is_empty() {
            parts.push(format!("{PARAM_QUERY}={query}"));
        }
        parts.push(format!("{PARAM_STEP}={step}"));
        let part_refs: Vec<&str> = parts.iter().map(|p| p.as_str()).collect();

        Ok(TimeseriesRequest {
            query,
            step,
            extent: Extent::new(start, end),
            fingerprint: derive_fingerprint(&part_refs),
        })
    }

    fn set_extent(&self, req: &mut ProxyRequest, extent: &Extent) {
        req.set_param(PARAM_START, &extent.start.to_string());
        req.set_param(PARAM_END, &extent.end.to_string());
    }

    fn unmarshal_timeseries(&self, data: &[u8]) -> Result<Timeseries> {
        let envelope: WireEnvelope = serde_json::from_slice(data)
            .map_err(|e| TricksterError::Parse(format!("invalid prometheus payload: {e}")))?;
        if envelope.status != "success" {
            return Err(TricksterError::Parse(format!(
                "prometheus response status '{}'",
                envelope.status
            )));
        }
        let mut ts = Timeseries::new(envelope.step);
        ts.extents = envelope.extents;
        for wire in envelope.data.result {
            let mut points = Vec::with_capacity(wire.values.len());
            for (number, value) in &wire.values {
                points.push(wire_point(number, value)?);
            }
            if let Some((number, value)) = &wire.value {
                points.push(wire_point(number, value)?);
            }
            ts.series.push(Series {
                metric: wire.metric,
                points,
            });
        }
        ts.sort();
        Ok(ts)
    }

    fn marshal_timeseries(&self, ts: &Timeseries) -> Result<Vec<u8>> {
        let envelope = WireEnvelope {
            status: "success".to_string(),
            data: WireData {
                result_type: "matrix".to_string(),
                result: ts
                    .series
                    .iter()
                    .map(|series| WireSeries {
                        metric: series.metric.clone(),
                        values: series
                            .points
                            .iter()
                            .map(|p| {
                                (
                                    serde_json::Number::from(p.timestamp),
                                    format_value(p.value),
                                )
                            })
                            .collect(),
                        value: None,
                    })
                    .collect(),
            },
            extents: ts.extents.clone(),
            step: ts.step,
        };
        serde_json::to_vec(&envelope)
            .map_err(|e| TricksterError::Encode(format!("could not encode timeseries: {e}")))
    }

    fn fast_forward_request(&self, req: &ProxyRequest) -> Option<ProxyRequest> {
        if self.config.fast_forward_disabled() {
            return None;
        }
        let mut ff = req.clone();
        let path = ff.url.path().replace("/query_range", "/query");
        ff.url.set_path(&path);
        ff.remove_param(PARAM_START);
        ff.remove_param(PARAM_END);
        ff.remove_param(PARAM_STEP);
        ff.set_param(PARAM_TIME, &crate::engines::now_epoch().to_string());
        ff.method = Method::GET;
        Some(ff)
    }

    fn default_path_configs(&self) -> BTreeMap<String, PathConfig> {
        let mut paths = BTreeMap::new();
        paths.insert(
            "/api/v1/query_range".to_string(),
            PathConfig {
                path: "/api/v1/query_range".to_string(),
                match_type: PathMatchType::Exact,
                handler_name: "deltaproxycache".to_string(),
                methods: vec!["GET".to_string(), "POST".to_string()],
                cache_key_params: vec![PARAM_QUERY.to_string(), PARAM_STEP.to_string()],
                ..Default::default()
            },
        );
        paths.insert(
            "/api/v1/query".to_string(),
            PathConfig {
                path: "/api/v1/query".to_string(),
                match_type: PathMatchType::Exact,
                handler_name: "objectproxycache".to_string(),
                methods: vec!["GET".to_string(), "POST".to_string()],
                cache_key_params: vec![PARAM_QUERY.to_string(), PARAM_TIME.to_string()],
                default_ttl_secs: Some(30),
                ..Default::default()
            },
        );
        paths.insert(
            "/api/v1/".to_string(),
            PathConfig {
                path: "/api/v1/".to_string(),
                match_type: PathMatchType::Prefix,
                handler_name: "objectproxycache".to_string(),
                methods: vec!["GET".to_string(), "POST".to_string()],
                ..Default::default()
            },
        );
        paths.insert(
            "/".to_string(),
            PathConfig {
                path: "/".to_string(),
                match_type: PathMatchType::Prefix,
                handler_name: "proxy".to_string(),
                methods: vec!["GET".to_string(), "POST".to_string()],
                collapsed_forwarding: CollapsedForwarding::Basic,
                ..Default::default()
            },
        );
        paths
    }

    fn health_check_request(&self) -> Option<ProxyRequest> {
        let path = if self.config.health_check_upstream_path.is_empty() {
            "/api/v1/query"
        } else {
            &self.config.health_check_upstream_path
        };
        let query = if self.config.health_check_query.is_empty() {
            "query=up"
        } else {
            &self.config.health_check_query
        };
        let method = if self.config.health_check_verb.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(self.config.health_check_verb.as_bytes()).ok()?
        };
        let url = self.build_upstream_url(path, Some(query)).ok()?;
        Some(ProxyRequest {
            method,
            url,
            headers: HeaderMap::new(),
            body: bytes::Bytes::new(),
            remote_addr: None,
        })
    }
}
