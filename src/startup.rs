use crate::configuration::Settings;
use crate::connectors::{self, ModelHostingConnector};
use crate::health::HealthMetrics;
use crate::routes;
use crate::services::cache::CacheService;
use crate::services::circuit_breaker::{CircuitBreakerService, HealthProbe};
use crate::services::credentials::{
    CredentialStore, CredentialsService, InMemoryCredentialStore, PostgresCredentialStore,
};
use crate::services::integration::{self, IntegrationService};
use crate::services::rate_limiter::RateLimiter;
use crate::services::webhook::WebhookService;
use actix_web::{dev::Server, error, http, web, App, HttpServer};
use futures::FutureExt;
use sqlx::postgres::PgPoolOptions;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tracing_actix_web::TracingLogger;

/// Operations probed in the background while their circuit is open
const PROBED_OPERATIONS: [&str; 5] = [
    integration::SEARCH_MODELS,
    integration::GET_MODEL,
    integration::CREATE_DEPLOYMENT,
    integration::GET_DEPLOYMENT,
    integration::DELETE_DEPLOYMENT,
];

/// Everything the HTTP surface and the console need, wired once
#[derive(Clone)]
pub struct Services {
    pub integration: Arc<IntegrationService>,
    pub webhooks: Arc<WebhookService>,
}

impl Services {
    pub async fn build(settings: &Settings) -> anyhow::Result<Self> {
        let connector = connectors::init(&settings.connectors)?;
        let store = credential_store(settings).await?;
        Self::assemble(settings, connector, store).await
    }

    /// Wire the components around an explicit connector and store
    pub async fn assemble(
        settings: &Settings,
        connector: Arc<dyn ModelHostingConnector>,
        store: Arc<dyn CredentialStore>,
    ) -> anyhow::Result<Self> {
        let limiter = Arc::new(RateLimiter::new(settings.rate_limiter.clone()));
        let cache = Arc::new(CacheService::init(settings.cache.clone()).await);
        let breakers = Arc::new(CircuitBreakerService::new(
            settings.circuit_breakers.clone(),
            Arc::new(HealthMetrics::new(settings.app.health_history)),
        ));

        let credentials = Arc::new(CredentialsService::new(
            settings.credentials.clone(),
            store,
            Some(connector.clone()),
        )?);
        if let Some(token) = &settings.bootstrap_api_key {
            let organization = &settings.integration.default_organization;
            if credentials.bootstrap(organization, token).await? {
                tracing::info!(organization = %organization, "Bootstrap API key stored");
            }
        }
        if settings.credentials.auto_rotate {
            credentials.start_auto_rotation().await;
        }

        for operation in PROBED_OPERATIONS {
            let connector = connector.clone();
            let probe: HealthProbe = Arc::new(move || {
                let connector = connector.clone();
                async move { connector.ping().await }.boxed()
            });
            breakers.start_health_probe(operation, probe).await;
        }

        let webhooks = Arc::new(WebhookService::new(
            settings.webhook.clone(),
            cache.clone(),
            limiter.clone(),
        ));
        let integration = Arc::new(IntegrationService::new(
            settings.integration.clone(),
            limiter,
            cache,
            credentials,
            breakers,
            connector,
        ));

        Ok(Self {
            integration,
            webhooks,
        })
    }

    pub async fn shutdown(&self) {
        self.integration.shutdown().await;
    }
}

async fn credential_store(settings: &Settings) -> anyhow::Result<Arc<dyn CredentialStore>> {
    let Some(database) = &settings.database else {
        tracing::warn!("No database configured, credentials are kept in memory");
        return Ok(Arc::new(InMemoryCredentialStore::new()));
    };

    tracing::info!(
        db_host = %database.host,
        db_port = database.port,
        db_name = %database.database_name,
        "Connecting to PostgreSQL"
    );
    let pool = PgPoolOptions::new()
        .max_connections(database.max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&database.connection_string())
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(Arc::new(PostgresCredentialStore::new(pool)))
}

/// Route table, shared by the server and the route tests
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/health_check")
            .service(routes::health_check)
            .service(routes::health_metrics),
    )
    .service(routes::stats)
    .service(web::scope("/webhooks").service(routes::webhook::provider))
    .service(
        web::scope("/api/v1/{organization}")
            .service(routes::models::search)
            .service(routes::models::item)
            .service(routes::deployments::create)
            .service(routes::deployments::status)
            .service(routes::deployments::delete)
            .service(routes::credentials::rotate)
            .service(routes::credentials::validate),
    );
}

pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        let msg = match &err {
            error::JsonPayloadError::Deserialize(inner) => serde_json::json!({
                "success": false,
                "error": {
                    "kind": "deserialize",
                    "message": inner.to_string(),
                    "line": inner.line(),
                    "column": inner.column(),
                }
            }),
            _ => serde_json::json!({
                "success": false,
                "error": { "kind": "other", "message": err.to_string() }
            }),
        };
        error::InternalError::from_response(
            err,
            actix_web::HttpResponse::build(http::StatusCode::BAD_REQUEST).json(msg),
        )
        .into()
    })
}

pub async fn run(listener: TcpListener, services: Services) -> Result<Server, std::io::Error> {
    let integration = web::Data::from(services.integration.clone());
    let webhooks = web::Data::from(services.webhooks.clone());

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .app_data(json_config())
            .app_data(integration.clone())
            .app_data(webhooks.clone())
            .configure(configure)
    })
    .listen(listener)?
    .run();

    Ok(server)
}
