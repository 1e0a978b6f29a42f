//! Reverse proxy cache origin client
//!
//! A plain HTTP origin with no timeseries surface: everything routes
//! through the object proxy cache or the raw proxy.

use super::{OriginClient, TimeseriesRequest};
use crate::config::{OriginConfig, PathConfig, PathMatchType};
use crate::engines::ProxyRequest;
use crate::error::{Result, TricksterError};
use crate::timeseries::{Extent, Timeseries};
use http::{HeaderMap, Method};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct ReverseProxyCacheClient {
    name: String,
    config: Arc<OriginConfig>,
}

pub fn new_client(
    name: &str,
    config: Arc<OriginConfig>,
) -> Result<Arc<dyn OriginClient>> {
    Ok(Arc::new(ReverseProxyCacheClient {
        name: name.to_string(),
        config,
    }))
}

impl OriginClient for ReverseProxyCacheClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn origin_type(&self) -> &'static str {
        "rpc"
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
        _req: &ProxyRequest,
        _path_config: &PathConfig,
    ) -> Result<TimeseriesRequest> {
        Err(TricksterError::Parse(
            "reverse proxy cache origin has no timeseries surface".to_string(),
        ))
    }

    fn set_extent(&self, _req: &mut ProxyRequest, _extent: &Extent) {}

    fn unmarshal_timeseries(&self, _data: &[u8]) -> Result<Timeseries> {
        Err(TricksterError::Parse(
            "reverse proxy cache origin has no timeseries codec".to_string(),
        ))
    }

    fn marshal_timeseries(&self, _ts: &Timeseries) -> Result<Vec<u8>> {
        Err(TricksterError::Encode(
            "reverse proxy cache origin has no timeseries codec".to_string(),
        ))
    }

    fn fast_forward_request(&self, _req: &ProxyRequest) -> Option<ProxyRequest> {
        None
    }

    fn default_path_configs(&self) -> BTreeMap<String, PathConfig> {
        let mut paths = BTreeMap::new();
        paths.insert(
            "/".to_string(),
            PathConfig {
                path: "/".to_string(),
                match_type: PathMatchType::Prefix,
                handler_name: "objectproxycache".to_string(),
                ..Default::default()
            },
        );
        paths
    }

    fn health_check_request(&self) -> Option<ProxyRequest> {
        if self.config.health_check_upstream_path.is_empty() {
            return None;
        }
        let method = if self.config.health_check_verb.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(self.config.health_check_verb.as_bytes()).ok()?
        };
        let query = if self.config.health_check_query.is_empty() {
            None
        } else {
            Some(self.config.health_check_query.as_str())
        };
        let url = self
            .build_upstream_url(&self.config.health_check_upstream_path, query)
            .ok()?;
        Some(ProxyRequest {
            method,
            url,
            headers: HeaderMap::new(),
            body: bytes::Bytes::new(),
            remote_addr: None,
        })
    }
}
