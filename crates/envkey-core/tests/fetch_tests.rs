//! Fetch client behavior against a mocked server: retries, failover,
//! auth-failure cache deletion, offline cache fallback, and the rotation
//! acknowledgement POST.

use envkey_core::fetch::UPDATE_TRUSTED_ROOT_ACTION_TYPE;
use envkey_core::test_fixtures::{signed_trust_map, TestGraph};
use envkey_core::{fetch_map, Cache, Error, FetchOptions, RootPubkeyReplacement};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn options(cache_dir: Option<&std::path::Path>, retries: u8) -> FetchOptions {
    FetchOptions {
        should_cache: cache_dir.is_some(),
        cache_dir: cache_dir.map(|p| p.to_path_buf()),
        timeout_seconds: 3.0,
        retries,
        retry_backoff: 0.0,
        ..Default::default()
    }
}

/// An ENVKEY whose host override points at the mock server by IP, so
/// failover hosts (`127-2.0.0.1`) are unreachable.
fn envkey_for(graph: &TestGraph, uri: &str) -> String {
    format!("testid-{}-{}", graph.password, uri)
}

/// An ENVKEY whose host has no dot, so every failover endpoint resolves to
/// the same mock server.
fn dotless_envkey_for(graph: &TestGraph, server: &MockServer) -> String {
    format!(
        "testid-{}-http://localhost:{}",
        graph.password,
        server.address().port()
    )
}

#[tokio::test]
async fn test_fetch_success() {
    let graph = TestGraph::new();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(graph.basic_response()))
        .expect(1)
        .mount(&server)
        .await;

    let env = fetch_map(&envkey_for(&graph, &server.uri()), options(None, 0))
        .await
        .unwrap();

    assert_eq!(env.get("GO_TEST").map(String::as_str), Some("it"));
    assert_eq!(env.get("GO_TEST_2").map(String::as_str), Some("works!"));
}

#[tokio::test]
async fn test_retry_until_success() {
    let graph = TestGraph::new();
    let server = MockServer::start().await;

    // Two 500s, then a good response: exactly three requests land.
    Mock::given(method("GET"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(graph.basic_response()))
        .expect(1)
        .mount(&server)
        .await;

    let env = fetch_map(&envkey_for(&graph, &server.uri()), options(None, 3))
        .await
        .unwrap();

    assert_eq!(env.get("GO_TEST").map(String::as_str), Some("it"));
}

#[tokio::test]
async fn test_exhausted_retries_surface_network_error() {
    let graph = TestGraph::new();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = fetch_map(&envkey_for(&graph, &server.uri()), options(None, 1)).await;
    assert!(matches!(result, Err(Error::Network(_))));
}

#[tokio::test]
async fn test_auth_failure_never_retries_and_deletes_cache() {
    let graph = TestGraph::new();
    let server = MockServer::start().await;
    let temp = tempfile::tempdir().unwrap();

    let cache = Cache::new(Some(temp.path())).unwrap();
    cache.write("testid", b"stale encrypted body").await.unwrap();

    Mock::given(method("GET"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let result = fetch_map(
        &envkey_for(&graph, &server.uri()),
        options(Some(temp.path()), 3),
    )
    .await;

    assert!(matches!(result, Err(Error::EnvkeyInvalid)));
    assert!(cache.read("testid").await.is_err());
}

#[tokio::test]
async fn test_upgrade_required_and_throttled_statuses() {
    let graph = TestGraph::new();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(426))
        .mount(&server)
        .await;
    let result = fetch_map(&envkey_for(&graph, &server.uri()), options(None, 0)).await;
    assert!(matches!(result, Err(Error::UpgradeRequired)));

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    let result = fetch_map(&envkey_for(&graph, &server.uri()), options(None, 0)).await;
    assert!(matches!(result, Err(Error::Throttled)));
}

#[tokio::test]
async fn test_cache_write_through_then_offline_fallback() {
    let graph = TestGraph::new();
    let server = MockServer::start().await;
    let temp = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(graph.basic_response()))
        .mount(&server)
        .await;

    // Online fetch populates the cache.
    let env = fetch_map(
        &envkey_for(&graph, &server.uri()),
        options(Some(temp.path()), 0),
    )
    .await
    .unwrap();
    assert_eq!(env.get("GO_TEST").map(String::as_str), Some("it"));

    // Server gone: the cached body still decrypts.
    let offline_envkey = envkey_for(&graph, "http://127.0.0.1:1");
    let env = fetch_map(&offline_envkey, options(Some(temp.path()), 0))
        .await
        .unwrap();
    assert_eq!(env.get("GO_TEST_2").map(String::as_str), Some("works!"));
}

#[tokio::test]
async fn test_invalid_blob_from_cache_is_deleted() {
    let graph = TestGraph::new();
    let temp = tempfile::tempdir().unwrap();

    // A cached body that decodes as JSON but fails decryption.
    let mut bad = graph.basic_response();
    bad.encrypted_privkey = Some(envkey_crypto::EncryptedData {
        data: "AAAA".into(),
        nonce: "AAAA".into(),
    });
    let cache = Cache::new(Some(temp.path())).unwrap();
    cache
        .write("testid", &serde_json::to_vec(&bad).unwrap())
        .await
        .unwrap();

    let offline_envkey = envkey_for(&graph, "http://127.0.0.1:1");
    let result = fetch_map(&offline_envkey, options(Some(temp.path()), 0)).await;

    assert!(matches!(result, Err(Error::EnvkeyInvalid)));
    assert!(cache.read("testid").await.is_err());
}

#[tokio::test]
async fn test_failover_follows_signed_url() {
    let graph = TestGraph::new();
    let server = MockServer::start().await;

    // Base endpoint fails once; the first failover hop (marked with the
    // in-region header) hands back a pre-signed url holding the payload.
    Mock::given(method("GET"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fetch"))
        .and(header("Failover", "in-region"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "signedUrl": format!("{}/signed-payload", server.uri()),
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/signed-payload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(graph.basic_response()))
        .expect(1)
        .mount(&server)
        .await;

    let env = fetch_map(&dotless_envkey_for(&graph, &server), options(None, 0))
        .await
        .unwrap();

    assert_eq!(env.get("GO_TEST").map(String::as_str), Some("it"));
}

#[tokio::test]
async fn test_root_replacement_posts_acknowledgement() {
    let graph = TestGraph::new();
    let server = MockServer::start().await;

    let mut response = graph.basic_response();
    response.root_pubkey_replacements = vec![RootPubkeyReplacement {
        id: "replacement1".into(),
        replacing_pubkey_id: graph.admin.id.clone(),
        replacing_pubkey: Some(graph.admin.pubkey().clone()),
        signed_replacing_trust_chain: Some(signed_trust_map(
            &[&graph.admin],
            &graph.admin.keypair.privkey,
        )),
    }];

    Mock::given(method("GET"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(response))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/action"))
        .and(wiremock::matchers::body_partial_json(serde_json::json!({
            "type": UPDATE_TRUSTED_ROOT_ACTION_TYPE,
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = fetch_map(&envkey_for(&graph, &server.uri()), options(None, 0))
        .await
        .unwrap();
    assert_eq!(env.get("GO_TEST").map(String::as_str), Some("it"));
}

#[tokio::test]
async fn test_failed_acknowledgement_is_swallowed() {
    let graph = TestGraph::new();
    let server = MockServer::start().await;

    let mut response = graph.basic_response();
    response.root_pubkey_replacements = vec![RootPubkeyReplacement {
        id: "replacement1".into(),
        replacing_pubkey_id: graph.admin.id.clone(),
        replacing_pubkey: Some(graph.admin.pubkey().clone()),
        signed_replacing_trust_chain: Some(signed_trust_map(
            &[&graph.admin],
            &graph.admin.keypair.privkey,
        )),
    }];

    Mock::given(method("GET"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(response))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/action"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    // The env still comes back even though the acknowledgement failed.
    let env = fetch_map(&envkey_for(&graph, &server.uri()), options(None, 0))
        .await
        .unwrap();
    assert_eq!(env.get("GO_TEST").map(String::as_str), Some("it"));
}

#[tokio::test]
async fn test_malformed_envkey_rejected_before_any_request() {
    let result = fetch_map("notwodashes", FetchOptions::default()).await;
    assert!(matches!(result, Err(Error::EnvkeyInvalid)));
}
