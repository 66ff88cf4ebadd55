use crate::services::webhook::{WebhookService, WebhookStatus, ORGANIZATION_HEADER, SIGNATURE_HEADER};
use actix_web::{post, web, HttpRequest, HttpResponse};

#[tracing::instrument(name = "Provider webhook.", skip_all)]
#[post("/provider")]
pub async fn provider(
    req: HttpRequest,
    body: web::Bytes,
    webhooks: web::Data<WebhookService>,
) -> HttpResponse {
    let header = |name: &str| req.headers().get(name).and_then(|value| value.to_str().ok());

    let result = webhooks
        .process_webhook(&body, header(SIGNATURE_HEADER), header(ORGANIZATION_HEADER))
        .await;

    match result.status {
        WebhookStatus::Accepted => HttpResponse::Ok().json(result),
        WebhookStatus::Unauthorized => HttpResponse::Unauthorized().json(result),
        WebhookStatus::Malformed => HttpResponse::BadRequest().json(result),
    }
}
