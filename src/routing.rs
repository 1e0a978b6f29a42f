//! Request routing
//!
//! Each origin's resolved path rules are registered twice: host-routed
//! (`Host: <originName>`) and path-prefixed (`/<originName>/...`). The
//! default origin also answers at the root. Rules are ordered so that
//! longer paths shadow shorter ones and exact matches shadow prefixes; a
//! matched path whose method set excludes the request yields 405.

use crate::config::{Config, PathConfig, PathMatchType};
use crate::error::{Result, TricksterError};
use crate::origin::OriginClient;
use http::Method;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// One registered route
#[derive(Debug, Clone)]
struct Route {
    origin: String,
    /// Some(origin name) for host-routed registration
    host: Option<String>,
    /// Full pattern the request path is matched against
    pattern: String,
    match_type: PathMatchType,
    methods: Vec<String>,
    /// Bytes stripped from the matched path to recover the
    /// origin-relative path
    strip_prefix: usize,
    path_config: Arc<PathConfig>,
}

impl Route {
    fn matches_path(&self, path: &str) -> bool {
        match self.match_type {
            PathMatchType::Exact => path == self.pattern,
            PathMatchType::Prefix => path.starts_with(&self.pattern),
        }
    }

    fn allows_method(&self, method: &Method) -> bool {
        self.methods.iter().any(|m| m == method.as_str())
    }
}

/// Result of a routing decision
pub enum RouteMatch {
    Found {
        origin: String,
        path_config: Arc<PathConfig>,
        /// Origin-relative request path
        stripped_path: String,
    },
    MethodNotAllowed,
    NotFound,
}

/// Immutable routing table built once at startup
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Build the table from every origin's resolved path map
    pub fn new(
        config: &Config,
        clients: &BTreeMap<String, Arc<dyn OriginClient>>,
    ) -> Result<Self> {
        let mut routes = Vec::new();
        for (name, origin) in &config.origins {
            let client = clients.get(name).ok_or_else(|| {
                TricksterError::Config(format!("no client constructed for origin '{name}'"))
            })?;
            let paths = resolve_paths(client.as_ref(), origin.paths.clone());
            info!(origin = %name, origin_type = %origin.origin_type,
                  upstream = %origin.host, paths = paths.len(), "registering route paths");

            for path_config in paths.into_values() {
                let path_config = Arc::new(path_config);
                let methods = path_config.effective_methods();

                // host-routed registration
                routes.push(Route {
                    origin: name.clone(),
                    host: Some(name.clone()),
                    pattern: path_config.path.clone(),
                    match_type: path_config.match_type,
                    methods: methods.clone(),
                    strip_prefix: 0,
                    path_config: Arc::clone(&path_config),
                });
                // path-prefixed registration
                routes.push(Route {
                    origin: name.clone(),
                    host: None,
                    pattern: format!("/{name}{}", path_config.path),
                    match_type: path_config.match_type,
                    methods: methods.clone(),
                    strip_prefix: name.len() + 1,
                    path_config: Arc::clone(&path_config),
                });
                // the default origin also answers unprefixed
                if origin.is_default {
                    routes.push(Route {
                        origin: name.clone(),
                        host: None,
                        pattern: path_config.path.clone(),
                        match_type: path_config.match_type,
                        methods,
                        strip_prefix: 0,
                        path_config,
                    });
                }
            }
        }

        // host-specific routes first, then longest path, exact over prefix
        routes.sort_by(|a, b| {
            b.host
                .is_some()
                .cmp(&a.host.is_some())
                .then(b.pattern.len().cmp(&a.pattern.len()))
                .then_with(|| match (a.match_type, b.match_type) {
                    (PathMatchType::Exact, PathMatchType::Prefix) => std::cmp::Ordering::Less,
                    (PathMatchType::Prefix, PathMatchType::Exact) => std::cmp::Ordering::Greater,
                    _ => std::cmp::Ordering::Equal,
                })
        });

        for route in &routes {
            debug!(origin = %route.origin, pattern = %route.pattern,
                   host_routed = route.host.is_some(),
                   handler = %route.path_config.handler_name, "registered route");
        }

        Ok(Router { routes })
    }

    /// Select the route for a request. `host` is the Host header without
    /// any port.
    pub fn select(&self, host: &str, path: &str, method: &Method) -> RouteMatch {
        let mut path_matched = false;
        for route in &self.routes {
            if let Some(required_host) = &route.host {
                if required_host != host {
                    continue;
                }
            }
            if !route.matches_path(path) {
                continue;
            }
            path_matched = true;
            if !route.allows_method(method) {
                continue;
            }
            let stripped = &path[route.strip_prefix..];
            let stripped_path = if stripped.is_empty() {
                "/".to_string()
            } else {
                stripped.to_string()
            };
            return RouteMatch::Found {
                origin: route.origin.clone(),
                path_config: Arc::clone(&route.path_config),
                stripped_path,
            };
        }
        if path_matched {
            RouteMatch::MethodNotAllowed
        } else {
            RouteMatch::NotFound
        }
    }
}

/// Merge the client's default paths with the origin's configured
/// overrides. An override with the same `path` replaces the default;
/// others are added.
fn resolve_paths(
    client: &dyn OriginClient,
    overrides: BTreeMap<String, PathConfig>,
) -> BTreeMap<String, PathConfig> {
    let mut paths = client.default_path_configs();
    for (_, path_config) in overrides {
        paths.insert(path_config.path.clone(), path_config);
    }
    paths
}
