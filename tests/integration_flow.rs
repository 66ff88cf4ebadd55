mod common;

use common::{TestApp, TestOptions, ACME_KEY};
use modelgate::connectors::{ConnectorError, DeploymentConfiguration, DeploymentRequest, ModelSearchQuery};
use modelgate::health::ComponentStatus;
use modelgate::services::circuit_breaker::{CircuitState, ResponseSource};
use modelgate::services::credentials::CredentialValidation;
use modelgate::services::rate_limiter::RateLimitInfo;
use serde_json::json;
use std::time::Duration;

fn chat() -> ModelSearchQuery {
    ModelSearchQuery::new("chat")
}

#[tokio::test]
async fn acme_search_is_cached_until_a_model_webhook_arrives() {
    let app = TestApp::spawn().await;

    let first = app.integration.search_models("acme", chat()).await;
    assert!(first.success);
    assert_eq!(first.source, Some(ResponseSource::Live));
    assert_eq!(first.data.as_ref().unwrap().results.len(), 2);
    assert_eq!(app.connector.calls("search_models"), 1);
    assert_eq!(app.integration.limiter().stats("acme").await.admitted, 1);

    // Served from cache without consuming rate-limit capacity
    let second = app.integration.search_models("acme", chat()).await;
    assert_eq!(second.source, Some(ResponseSource::Cache));
    assert_eq!(second.data, first.data);
    assert_eq!(app.connector.calls("search_models"), 1);
    assert_eq!(app.integration.limiter().stats("acme").await.admitted, 1);

    let body = serde_json::to_vec(&json!({
        "id": "evt_model_updated",
        "type": "model.updated",
        "data": {"model": "meta/llama-2-70b-chat"}
    }))
    .unwrap();
    let result = app
        .webhooks
        .process_webhook(&body, Some(&app.sign(&body)), Some("acme"))
        .await;
    assert!(result.success);
    assert_eq!(result.events_processed, 1);

    let third = app.integration.search_models("acme", chat()).await;
    assert_eq!(third.source, Some(ResponseSource::Live));
    assert_eq!(app.connector.calls("search_models"), 2);

    let stats = app.integration.stats().await;
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 2);
    assert_eq!(stats.upstream_calls, 2);
    assert_eq!(stats.organizations["acme"].requests, 3);
    assert_eq!(stats.latency.samples, 3);
}

#[tokio::test]
async fn model_updates_refresh_every_organizations_listing() {
    let app = TestApp::spawn().await;
    app.integration
        .credentials()
        .store_api_key("globex", "r8_globex_key", None)
        .await
        .unwrap();
    app.integration.search_models("acme", chat()).await;
    app.integration.search_models("globex", chat()).await;

    // delivered to acme's endpoint, the model is still in globex's cached page
    let body = serde_json::to_vec(&json!({
        "type": "model.updated",
        "data": {"model": "meta/llama-2-70b-chat"}
    }))
    .unwrap();
    app.webhooks
        .process_webhook(&body, Some(&app.sign(&body)), Some("acme"))
        .await;

    let globex = app.integration.search_models("globex", chat()).await;
    assert_eq!(globex.source, Some(ResponseSource::Live));
    assert_eq!(app.connector.calls("search_models"), 3);
}

#[tokio::test]
async fn search_results_are_tagged_with_models_and_organization() {
    let app = TestApp::spawn().await;
    app.integration.search_models("acme", chat()).await;

    let cache = app.integration.cache();
    assert_eq!(cache.invalidate_by_tags(&["globex".to_string()]).await, 0);
    assert!(cache.invalidate_by_tags(&["acme".to_string()]).await >= 1);

    let again = app.integration.search_models("acme", chat()).await;
    assert_eq!(again.source, Some(ResponseSource::Live));
}

#[tokio::test]
async fn equivalent_queries_share_a_cache_entry() {
    let app = TestApp::spawn().await;
    app.integration.search_models("acme", ModelSearchQuery::new("chat")).await;
    let padded = app
        .integration
        .search_models("acme", ModelSearchQuery::new("  chat "))
        .await;

    assert_eq!(padded.source, Some(ResponseSource::Cache));
    assert_eq!(app.connector.calls("search_models"), 1);
}

#[tokio::test]
async fn organizations_do_not_share_cached_results() {
    let app = TestApp::spawn().await;
    app.integration
        .credentials()
        .store_api_key("globex", "r8_globex_key", None)
        .await
        .unwrap();

    app.integration.search_models("acme", chat()).await;
    let globex = app.integration.search_models("globex", chat()).await;

    assert_eq!(globex.source, Some(ResponseSource::Live));
    assert_eq!(app.connector.last_api_key().as_deref(), Some("r8_globex_key"));
    assert_eq!(app.connector.calls("search_models"), 2);
}

#[tokio::test]
async fn empty_organization_uses_the_default() {
    let app = TestApp::spawn().await;
    app.integration
        .credentials()
        .store_api_key("default", "r8_default_key", None)
        .await
        .unwrap();

    let response = app.integration.search_models("  ", chat()).await;
    assert!(response.success);

    let stats = app.integration.stats().await;
    assert!(stats.organizations.contains_key("default"));
}

#[tokio::test]
async fn missing_credentials_never_reach_the_provider() {
    let app = TestApp::spawn().await;

    let response = app.integration.search_models("initech", chat()).await;
    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.kind, "credentials");
    assert_eq!(error.status, 401);
    assert_eq!(app.connector.total_calls(), 0);

    let stats = app.integration.stats().await;
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.errors_by_kind["credentials"], 1);
}

#[tokio::test]
async fn rejected_key_is_reported_as_a_credential_problem() {
    let app = TestApp::spawn().await;
    app.connector.reject_api_key(ACME_KEY);

    let response = app
        .integration
        .get_model_info("acme", "meta", "llama-2-70b-chat")
        .await;
    let error = response.error.unwrap();
    assert_eq!(error.kind, "credentials");
    assert!(error.message.contains("Invalid token"));
}

#[tokio::test(start_paused = true)]
async fn provider_throttling_reschedules_the_call() {
    let app = TestApp::spawn().await;
    app.connector.fail_next(ConnectorError::RateLimited {
        message: "Too many requests".to_string(),
        info: Some(RateLimitInfo {
            retry_after: Some(Duration::from_millis(200)),
            ..RateLimitInfo::default()
        }),
    });

    let response = app.integration.search_models("acme", chat()).await;
    assert!(response.success);
    assert_eq!(response.source, Some(ResponseSource::Live));
    assert_eq!(app.connector.calls("search_models"), 2);

    let stats = app.integration.stats().await;
    assert_eq!(stats.rate_limit_retries, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test(start_paused = true)]
async fn persistent_throttling_gives_up_after_the_retry_budget() {
    let app = TestApp::spawn().await;
    app.connector.fail_times(
        10,
        ConnectorError::RateLimited {
            message: "Too many requests".to_string(),
            info: Some(RateLimitInfo {
                retry_after: Some(Duration::from_millis(100)),
                ..RateLimitInfo::default()
            }),
        },
    );

    let response = app.integration.search_models("acme", chat()).await;
    let error = response.error.unwrap();
    assert_eq!(error.kind, "rate_limited");
    assert_eq!(error.status, 429);
    // first attempt plus three re-schedules
    assert_eq!(app.connector.calls("search_models"), 4);
    assert_eq!(app.integration.stats().await.rate_limit_retries, 3);
}

#[tokio::test]
async fn breaker_replays_last_good_response_when_the_provider_fails() {
    let app = TestApp::spawn().await;
    let live = app.integration.search_models("acme", chat()).await;
    app.integration
        .cache()
        .invalidate_by_tags(&["models".to_string()])
        .await;

    app.connector
        .fail_next(ConnectorError::Transient("upstream 502".to_string()));
    let degraded = app.integration.search_models("acme", chat()).await;

    assert!(degraded.success);
    assert_eq!(degraded.source, Some(ResponseSource::CachedFallback));
    assert_eq!(degraded.data, live.data);

    // Fallbacks are not written back to the response cache
    let recovered = app.integration.search_models("acme", chat()).await;
    assert_eq!(recovered.source, Some(ResponseSource::Live));

    let stats = app.integration.stats().await;
    assert_eq!(stats.degraded, 1);
    assert_eq!(stats.cached_fallbacks, 1);
    assert_eq!(stats.organizations["acme"].fallbacks, 1);
}

#[tokio::test]
async fn last_good_fallback_is_scoped_to_the_organization() {
    let app = TestApp::spawn().await;
    let acme = app.integration.search_models("acme", chat()).await;
    assert_eq!(acme.source, Some(ResponseSource::Live));

    app.integration
        .breakers()
        .force_state("search_models", CircuitState::Open);

    // globex has no credentials and no history of its own
    let globex = app.integration.search_models("globex", chat()).await;
    assert!(!globex.success);
    assert!(globex.data.is_none());
    assert_eq!(globex.error.unwrap().kind, "circuit_open");

    app.integration
        .credentials()
        .store_api_key("globex", "r8_globex_key", None)
        .await
        .unwrap();
    let globex = app.integration.search_models("globex", chat()).await;
    assert_eq!(globex.error.unwrap().kind, "circuit_open");
    assert_eq!(app.connector.calls("search_models"), 1);

    // acme's own entry is still replayed once its cached copy is gone
    app.integration
        .cache()
        .invalidate_by_tags(&["acme".to_string()])
        .await;
    let replay = app.integration.search_models("acme", chat()).await;
    assert_eq!(replay.source, Some(ResponseSource::CachedFallback));
    assert_eq!(replay.data, acme.data);
}

#[tokio::test]
async fn open_circuit_without_fallback_fails_fast() {
    let app = TestApp::spawn().await;
    app.integration
        .breakers()
        .force_state("get_model", CircuitState::Open);

    let response = app
        .integration
        .get_model_info("acme", "meta", "llama-2-70b-chat")
        .await;
    let error = response.error.unwrap();
    assert_eq!(error.kind, "circuit_open");
    assert_eq!(error.status, 503);
    assert_eq!(app.connector.calls("get_model"), 0);

    let health = app.integration.health_check().await;
    assert_eq!(health.components["circuit_breakers"].status, ComponentStatus::Degraded);
}

#[tokio::test]
async fn deployment_writes_invalidate_cached_status() {
    let app = TestApp::spawn().await;
    let request = DeploymentRequest {
        name: "chat-prod".to_string(),
        model: "meta/llama-2-70b-chat".to_string(),
        version: "v1".to_string(),
        configuration: DeploymentConfiguration {
            hardware: "gpu-a40-large".to_string(),
            min_instances: 1,
            max_instances: 2,
        },
    };

    let created = app.integration.create_deployment("acme", request).await;
    assert!(created.success);
    let deployment = created.data.unwrap();

    let status = app
        .integration
        .get_deployment_status("acme", &deployment.owner, &deployment.name)
        .await;
    assert_eq!(status.source, Some(ResponseSource::Live));
    let cached = app
        .integration
        .get_deployment_status("acme", &deployment.owner, &deployment.name)
        .await;
    assert_eq!(cached.source, Some(ResponseSource::Cache));

    let deleted = app
        .integration
        .delete_deployment("acme", &deployment.owner, &deployment.name)
        .await;
    assert!(deleted.success);

    let gone = app
        .integration
        .get_deployment_status("acme", &deployment.owner, &deployment.name)
        .await;
    assert_eq!(gone.error.unwrap().kind, "not_found");
    assert_eq!(app.connector.calls("get_deployment"), 2);
}

#[tokio::test]
async fn credential_passthroughs() {
    let app = TestApp::spawn().await;

    let validation = app.integration.validate_credentials("acme").await;
    assert_eq!(validation.data, Some(CredentialValidation::Valid { version: 1 }));

    let rotated = app.integration.rotate_credentials("acme").await;
    let outcome = rotated.data.unwrap();
    assert_eq!(outcome.previous_version, Some(1));
    assert_eq!(outcome.version, 2);

    app.integration.search_models("acme", chat()).await;
    let used = app.connector.last_api_key().unwrap();
    assert_ne!(used, ACME_KEY);
}

#[tokio::test]
async fn health_check_reports_every_component() {
    let app = TestApp::spawn().await;
    let health = app.integration.health_check().await;

    assert!(health.is_healthy());
    for component in ["cache", "credential_store", "provider", "circuit_breakers"] {
        assert!(health.components.contains_key(component), "missing {}", component);
    }

    app.distributed.set_available(false);
    let health = app.integration.health_check().await;
    assert_eq!(health.components["cache"].status, ComponentStatus::Degraded);
}

#[tokio::test]
async fn shutdown_refuses_new_calls() {
    let options = TestOptions::default();
    let app = TestApp::spawn_with(options).await;
    app.integration.shutdown().await;

    let response = app.integration.search_models("acme", chat()).await;
    assert!(!response.success);
    assert_eq!(response.error.unwrap().kind, "internal");
    assert_eq!(app.connector.total_calls(), 0);
}
