use crate::connectors::ModelSearchQuery;
use crate::services::integration::IntegrationService;
use actix_web::{get, post, web, Responder};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct OrganizationPath {
    pub organization: String,
}

#[derive(Debug, Deserialize)]
pub struct ModelPath {
    pub organization: String,
    pub owner: String,
    pub name: String,
}

#[tracing::instrument(name = "Search models.", skip(integration, form), fields(organization = %path.organization))]
#[post("/models/search")]
pub async fn search(
    path: web::Path<OrganizationPath>,
    form: web::Json<ModelSearchQuery>,
    integration: web::Data<IntegrationService>,
) -> impl Responder {
    integration
        .search_models(&path.organization, form.into_inner())
        .await
}

#[tracing::instrument(name = "Get model.", skip(integration))]
#[get("/models/{owner}/{name}")]
pub async fn item(path: web::Path<ModelPath>, integration: web::Data<IntegrationService>) -> impl Responder {
    integration
        .get_model_info(&path.organization, &path.owner, &path.name)
        .await
}
