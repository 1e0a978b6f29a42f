//! Configuration loading from TOML files: defaults, full documents,
//! and the startup failure modes.

use std::io::Write;
use trickster::config::{
    CollapsedForwarding, Config, PathMatchType, TimeseriesEvictionMethod,
};

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_minimal_file() {
    let file = write_config(
        r#"
        [origins.default]
        origin_type = "prometheus"
        origin_url = "http://prometheus:9090"
        "#,
    );
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.default_origin(), "default");
    assert_eq!(config.frontend.listen_port, 8480);
    assert_eq!(config.metrics.listen_port, 8481);
    assert_eq!(config.logging.log_level, "info");
}

#[test]
fn test_load_full_document() {
    let file = write_config(
        r#"
        [main]
        instance_id = 2

        [frontend]
        listen_address = "127.0.0.1"
        listen_port = 9090
        connections_limit = 512

        [logging]
        log_level = "debug"

        [metrics]
        listen_port = 9091

        [caches.default]
        cache_type = "memory"
        compression = false

        [caches.default.index]
        reap_interval_secs = 1
        max_size_bytes = 1048576
        max_size_backoff_bytes = 1024

        [negative_caches.general]
        404 = 3
        504 = 1

        [origins.default]
        origin_type = "prometheus"
        origin_url = "https://prom.example.com/cluster-a"
        timeout_secs = 30
        timeseries_retention_factor = 2048
        timeseries_eviction_method = "lru"
        timeseries_ttl_secs = 7200
        backfill_tolerance_secs = 60
        negative_cache_name = "general"

        [origins.default.paths.debug]
        path = "/debug"
        match_type = "prefix"
        handler_name = "proxy"
        collapsed_forwarding = "progressive"
        no_metrics = true
        "#,
    );
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.main.instance_id, 2);
    assert_eq!(config.frontend.connections_limit, 512);
    assert_eq!(config.caches["default"].index.max_size_bytes, 1048576);
    assert!(!config.caches["default"].compression);

    let origin = &config.origins["default"];
    assert_eq!(origin.scheme, "https");
    assert_eq!(origin.host, "prom.example.com");
    assert_eq!(origin.path_prefix, "/cluster-a");
    assert_eq!(origin.timeout_secs, 30);
    assert_eq!(origin.timeseries_retention_factor(), 2048);
    assert_eq!(
        origin.timeseries_eviction_method(),
        TimeseriesEvictionMethod::Lru
    );
    assert_eq!(origin.negative_cache[&404].as_secs(), 3);

    let debug_path = &origin.paths["debug"];
    assert_eq!(debug_path.match_type, PathMatchType::Prefix);
    assert_eq!(debug_path.collapsed_forwarding, CollapsedForwarding::Progressive);
    assert!(debug_path.no_metrics);
}

#[test]
fn test_defaults_applied_per_origin() {
    let file = write_config(
        r#"
        [origins.default]
        origin_type = "prometheus"
        origin_url = "http://p:9090"
        "#,
    );
    let config = Config::from_file(file.path()).unwrap();
    let origin = &config.origins["default"];
    assert_eq!(origin.timeout_secs, 180);
    assert_eq!(origin.max_ttl_secs, 86400);
    assert_eq!(origin.timeseries_retention_factor(), 1024);
    assert_eq!(
        origin.timeseries_eviction_method(),
        TimeseriesEvictionMethod::Oldest
    );
    assert!(!origin.fast_forward_disabled());
    assert_eq!(origin.backfill_tolerance().as_secs(), 0);
}

#[test]
fn test_missing_file_fails() {
    assert!(Config::from_file("/nonexistent/trickster.conf").is_err());
}

#[test]
fn test_malformed_toml_fails() {
    let file = write_config("this is not toml [");
    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn test_two_defaults_fail() {
    let file = write_config(
        r#"
        [origins.a]
        origin_type = "prometheus"
        origin_url = "http://a:9090"
        is_default = true

        [origins.b]
        origin_type = "prometheus"
        origin_url = "http://b:9090"
        is_default = true
        "#,
    );
    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn test_unknown_origin_type_fails() {
    let file = write_config(
        r#"
        [origins.default]
        origin_type = "carbon"
        origin_url = "http://c:2003"
        "#,
    );
    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn test_unknown_negative_cache_reference_fails() {
    let file = write_config(
        r#"
        [origins.default]
        origin_type = "prometheus"
        origin_url = "http://p:9090"
        negative_cache_name = "missing"
        "#,
    );
    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn test_redacted_dump_masks_secrets() {
    let file = write_config(
        r#"
        [origins.default]
        origin_type = "prometheus"
        origin_url = "http://p:9090"

        [origins.default.tls]
        full_chain_cert_path = "/etc/tls/cert.pem"
        private_key_path = "/etc/tls/key.pem"

        [origins.default.paths.authed]
        path = "/private"
        [origins.default.paths.authed.request_headers]
        Authorization = "Basic c2VjcmV0"
        "#,
    );
    let config = Config::from_file(file.path()).unwrap();
    let rendered = config.to_redacted_toml();
    assert!(!rendered.contains("key.pem"));
    assert!(!rendered.contains("c2VjcmV0"));
    assert!(rendered.contains("*****"));
    // non-sensitive settings are still visible
    assert!(rendered.contains("http://p:9090"));
}
