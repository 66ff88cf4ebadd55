use crate::connectors::DeploymentRequest;
use crate::routes::models::OrganizationPath;
use crate::services::integration::IntegrationService;
use actix_web::{delete, get, post, web, Responder};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct DeploymentPath {
    pub organization: String,
    pub owner: String,
    pub name: String,
}

#[tracing::instrument(name = "Create deployment.", skip(integration, form), fields(organization = %path.organization))]
#[post("/deployments")]
pub async fn create(
    path: web::Path<OrganizationPath>,
    form: web::Json<DeploymentRequest>,
    integration: web::Data<IntegrationService>,
) -> impl Responder {
    integration
        .create_deployment(&path.organization, form.into_inner())
        .await
}

#[tracing::instrument(name = "Get deployment status.", skip(integration))]
#[get("/deployments/{owner}/{name}")]
pub async fn status(path: web::Path<DeploymentPath>, integration: web::Data<IntegrationService>) -> impl Responder {
    integration
        .get_deployment_status(&path.organization, &path.owner, &path.name)
        .await
}

#[tracing::instrument(name = "Delete deployment.", skip(integration))]
#[delete("/deployments/{owner}/{name}")]
pub async fn delete(path: web::Path<DeploymentPath>, integration: web::Data<IntegrationService>) -> impl Responder {
    integration
        .delete_deployment(&path.organization, &path.owner, &path.name)
        .await
}
