//! Progressive collapsed forwarding against a simulated origin
//!
//! Many concurrent downloads of the same non-cacheable object must share
//! one upstream connection and all receive byte-identical responses.

use bytes::Bytes;
use http::{HeaderMap, Method};
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;
use trickster::cache::{CacheIndex, IndexOptions, MemoryByteStore};
use trickster::config::{CollapsedForwarding, Config, PathConfig, PathMatchType};
use trickster::engines::{httpproxy, OriginContext, ProxyRequest};
use trickster::origin::ClientRegistry;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn progressive_path() -> PathConfig {
    PathConfig {
        path: "/blob".to_string(),
        match_type: PathMatchType::Exact,
        handler_name: "proxy".to_string(),
        collapsed_forwarding: CollapsedForwarding::Progressive,
        ..Default::default()
    }
}

fn test_context(origin_url: &str, max_object_size: usize) -> Arc<OriginContext> {
    let config = Config::from_origin_flags(origin_url, "rpc").unwrap();
    let mut origin = config.origins["default"].clone();
    origin.max_object_size_bytes = max_object_size;
    let origin = Arc::new(origin);
    let client = ClientRegistry::default()
        .new_client("default", Arc::clone(&origin))
        .unwrap();
    let cache = Arc::new(CacheIndex::new(
        "default",
        Arc::new(MemoryByteStore::new()),
        IndexOptions::default(),
    ));
    Arc::new(OriginContext::new("default", origin, client, cache, false).unwrap())
}

fn blob_request(ctx: &OriginContext) -> ProxyRequest {
    ProxyRequest {
        method: Method::GET,
        url: ctx.client.build_upstream_url("/blob", None).unwrap(),
        headers: HeaderMap::new(),
        body: Bytes::new(),
        remote_addr: None,
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_concurrent_fetches_collapse_to_one_upstream_call() {
    let server = MockServer::start().await;
    let body = payload(4_000_000);
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body.clone())
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let ctx = test_context(&server.uri(), 10_000_000);
    let path_config = progressive_path();

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let ctx = Arc::clone(&ctx);
        let path_config = path_config.clone();
        tasks.push(tokio::spawn(async move {
            let response = httpproxy::handle(&ctx, &path_config, blob_request(&ctx)).await;
            assert_eq!(response.status(), 200);
            response.into_body().collect().await.unwrap().to_bytes()
        }));
    }

    for task in tasks {
        let received = task.await.unwrap();
        assert_eq!(received, Bytes::from(body.clone()));
    }
    // the mock's expect(1) verifies a single upstream connection

    // the forwarder slot is released once the fetch completes
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ctx.collapsed.is_empty());
}

#[tokio::test]
async fn test_oversize_responses_bypass_the_forwarder() {
    let server = MockServer::start().await;
    let body = payload(100_000);
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(2)
        .mount(&server)
        .await;

    // max object size below the payload: each request streams directly
    let ctx = test_context(&server.uri(), 1_000);
    let path_config = progressive_path();

    for _ in 0..2 {
        let response = httpproxy::handle(&ctx, &path_config, blob_request(&ctx)).await;
        assert_eq!(response.status(), 200);
        let received = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(received, Bytes::from(body.clone()));
        assert!(ctx.collapsed.is_empty());
    }
}

#[tokio::test]
async fn test_non_progressive_path_proxies_normally() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain"))
        .expect(2)
        .mount(&server)
        .await;

    let ctx = test_context(&server.uri(), 10_000_000);
    let path_config = PathConfig {
        collapsed_forwarding: CollapsedForwarding::Off,
        ..progressive_path()
    };

    for _ in 0..2 {
        let response = httpproxy::handle(&ctx, &path_config, blob_request(&ctx)).await;
        assert_eq!(response.status(), 200);
        let header = response
            .headers()
            .get("x-trickster-result")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(header.contains("status=proxy-only"), "header was {header}");
    }
}

#[tokio::test]
async fn test_upstream_error_status_is_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/blob"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad origin"))
        .mount(&server)
        .await;

    let ctx = test_context(&server.uri(), 10_000_000);
    let response = httpproxy::handle(&ctx, &progressive_path(), blob_request(&ctx)).await;
    assert_eq!(response.status(), 502);
    let header = response
        .headers()
        .get("x-trickster-result")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(header.contains("status=proxy-error"), "header was {header}");
}
