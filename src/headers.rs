//! HTTP header handling shared by the proxy engines

use crate::timeseries::ExtentList;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;

/// Response header describing how the request was served
pub const NAME_TRICKSTER_RESULT: &str = "x-trickster-result";

const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "proxy-authorization", "set-cookie"];

/// Hop-by-hop headers stripped before forwarding in either direction
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "te",
    "trailer",
];

pub fn is_sensitive(name: &str) -> bool {
    SENSITIVE_HEADERS.contains(&name.to_lowercase().as_str())
}

/// Add the headers every trickster response carries
pub fn add_response_headers(headers: &mut HeaderMap) {
    headers.insert(
        http::header::SERVER,
        HeaderValue::from_static(concat!("trickster/", env!("CARGO_PKG_VERSION"))),
    );
}

/// Set the `X-Trickster-Result` header describing the cache outcome
pub fn set_results_header(
    headers: &mut HeaderMap,
    engine: &str,
    status: &str,
    ff_status: Option<&str>,
    fetched: Option<&ExtentList>,
) {
    let mut value = format!("engine={engine}; status={status}");
    if let Some(extents) = fetched {
        value.push_str("; fetched=");
        if extents.is_empty() {
            value.push_str("[]");
        } else {
            value.push_str(&extents.to_header_value());
        }
    }
    if let Some(ff) = ff_status {
        value.push_str("; ffstatus=");
        value.push_str(ff);
    }
    if let Ok(v) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(NAME_TRICKSTER_RESULT), v);
    }
}

/// Add forwarding headers to an upstream request
pub fn add_proxy_headers(remote_addr: Option<std::net::SocketAddr>, headers: &mut HeaderMap) {
    if let Some(addr) = remote_addr {
        let ip = addr.ip().to_string();
        let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip,
        };
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static("x-forwarded-for"), v);
        }
    }
    headers.insert(
        HeaderName::from_static("via"),
        HeaderValue::from_static(concat!("1.1 trickster/", env!("CARGO_PKG_VERSION"))),
    );
}

/// Strip hop-by-hop headers before forwarding
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Apply a path rule's header mutations: a value sets the header, an
/// empty value removes it.
pub fn update_headers(headers: &mut HeaderMap, mutations: &BTreeMap<String, String>) {
    for (name, value) in mutations {
        let Ok(header_name) = HeaderName::from_bytes(name.to_lowercase().as_bytes()) else {
            continue;
        };
        if value.is_empty() {
            headers.remove(&header_name);
        } else if let Ok(v) = HeaderValue::from_str(value) {
            headers.insert(header_name, v);
        }
    }
}
