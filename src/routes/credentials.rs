use crate::routes::models::OrganizationPath;
use crate::services::integration::IntegrationService;
use actix_web::{get, post, web, Responder};

#[tracing::instrument(name = "Rotate credentials.", skip(integration))]
#[post("/credentials/rotate")]
pub async fn rotate(path: web::Path<OrganizationPath>, integration: web::Data<IntegrationService>) -> impl Responder {
    integration.rotate_credentials(&path.organization).await
}

#[tracing::instrument(name = "Validate credentials.", skip(integration))]
#[get("/credentials/validate")]
pub async fn validate(path: web::Path<OrganizationPath>, integration: web::Data<IntegrationService>) -> impl Responder {
    integration.validate_credentials(&path.organization).await
}
