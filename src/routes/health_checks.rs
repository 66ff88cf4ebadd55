use crate::health::ComponentStatus;
use crate::services::integration::IntegrationService;
use crate::services::webhook::WebhookService;
use actix_web::{get, web, HttpResponse};
use serde_json::json;

/// Unhealthy answers 503 so load balancers stop routing here
#[get("")]
pub async fn health_check(integration: web::Data<IntegrationService>) -> HttpResponse {
    let health = integration.health_check().await;
    match health.status {
        ComponentStatus::Unhealthy => HttpResponse::ServiceUnavailable().json(health),
        _ => HttpResponse::Ok().json(health),
    }
}

#[get("/metrics")]
pub async fn health_metrics(integration: web::Data<IntegrationService>) -> HttpResponse {
    let all = integration.health().metrics().get_all_stats().await;
    HttpResponse::Ok().json(all)
}

#[tracing::instrument(name = "Collect statistics", skip_all)]
#[get("/stats")]
pub async fn stats(
    integration: web::Data<IntegrationService>,
    webhooks: web::Data<WebhookService>,
) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "integration": integration.stats().await,
        "webhooks": webhooks.stats(),
        "rotation_failures": integration.credentials().rotation_failures(),
        "health_probes": integration.breakers().probe_status(),
    }))
}
