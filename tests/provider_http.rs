mod common;

use common::{assemble, TestOptions, ACME_KEY};
use modelgate::connectors::{ModelHostingClient, ModelSearchQuery, ProviderConfig};
use modelgate::services::circuit_breaker::ResponseSource;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn components(server: &MockServer) -> common::Components {
    let client = ModelHostingClient::new(&ProviderConfig {
        base_url: server.uri(),
        retry_attempts: 2,
        ..Default::default()
    })
    .expect("Failed to build provider client");

    let components = assemble(TestOptions::default(), Arc::new(client));
    components
        .integration
        .credentials()
        .store_api_key("acme", ACME_KEY, None)
        .await
        .expect("Failed to store acme key");
    components
}

fn page() -> serde_json::Value {
    json!({
        "results": [
            {"owner": "meta", "name": "llama-2-70b-chat", "run_count": 1200},
            {"owner": "mistralai", "name": "mixtral-chat", "run_count": 300}
        ],
        "next": null
    })
}

#[tokio::test]
async fn live_search_is_fetched_once_then_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .and(query_param("query", "chat"))
        .and(header("authorization", format!("Bearer {}", ACME_KEY).as_str()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(page())
                .insert_header("x-ratelimit-limit", "600")
                .insert_header("x-ratelimit-remaining", "599"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let app = components(&server).await;
    let first = app.integration.search_models("acme", ModelSearchQuery::new("chat")).await;
    let second = app.integration.search_models("acme", ModelSearchQuery::new("chat")).await;

    assert_eq!(first.source, Some(ResponseSource::Live));
    assert_eq!(second.source, Some(ResponseSource::Cache));
    assert_eq!(second.data.unwrap().results[0].full_name(), "meta/llama-2-70b-chat");
}

#[tokio::test]
async fn exhausted_quota_headers_block_the_organization() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models/meta/llama-2-70b-chat"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"owner": "meta", "name": "llama-2-70b-chat"}))
                .insert_header("x-ratelimit-remaining", "0")
                .insert_header("x-ratelimit-reset", "30"),
        )
        .mount(&server)
        .await;

    let app = components(&server).await;
    let response = app
        .integration
        .get_model_info("acme", "meta", "llama-2-70b-chat")
        .await;
    assert!(response.success);

    let stats = app.integration.limiter().stats("acme").await;
    assert_eq!(stats.available_tokens, 0);
    assert!(stats.blocked_for_ms.unwrap() > 0);
}

#[tokio::test]
async fn persistent_server_errors_surface_as_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let app = components(&server).await;
    let response = app.integration.search_models("acme", ModelSearchQuery::new("chat")).await;

    let error = response.error.unwrap();
    assert_eq!(error.kind, "transient");
    assert_eq!(error.status, 502);
    assert_eq!(app.integration.stats().await.upstream_calls, 1);
}

#[tokio::test]
async fn revoked_key_is_a_credential_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "Invalid token."})))
        .mount(&server)
        .await;

    let app = components(&server).await;
    let response = app.integration.search_models("acme", ModelSearchQuery::new("chat")).await;

    let error = response.error.unwrap();
    assert_eq!(error.kind, "credentials");
    assert_eq!(error.status, 401);
}
