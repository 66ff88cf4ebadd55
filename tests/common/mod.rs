use actix_web::web;
use modelgate::connectors::{MockModelHostingConnector, ModelHostingConnector};
use modelgate::health::HealthMetrics;
use modelgate::services::cache::{CacheConfig, CacheService, InMemoryDistributedCache};
use modelgate::services::circuit_breaker::{CircuitBreakerService, CircuitBreakerSettings};
use modelgate::services::credentials::{CredentialsConfig, CredentialsService, InMemoryCredentialStore};
use modelgate::services::integration::{IntegrationConfig, IntegrationService};
use modelgate::services::rate_limiter::{BucketConfig, RateLimiter, RateLimiterConfig};
use modelgate::services::webhook::{sign_payload, WebhookConfig, WebhookService};
use std::sync::Arc;

pub const WEBHOOK_SECRET: &str = "whsec_integration_tests";
pub const ACME_KEY: &str = "r8_acme_initial_key";

pub struct TestOptions {
    pub rate_limiter: RateLimiterConfig,
    pub breakers: CircuitBreakerSettings,
    pub integration: IntegrationConfig,
    pub credentials: CredentialsConfig,
    pub webhook: WebhookConfig,
    pub cache: CacheConfig,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            rate_limiter: RateLimiterConfig {
                default: BucketConfig {
                    capacity: 100,
                    refill_amount: 100,
                    refill_interval_ms: 1_000,
                    high_water: None,
                    max_concurrent: None,
                    ..BucketConfig::default()
                },
                ..RateLimiterConfig::default()
            },
            breakers: CircuitBreakerSettings::default(),
            integration: IntegrationConfig::default(),
            credentials: CredentialsConfig {
                master_secret: Some("integration-master-secret".to_string()),
                kdf_iterations: 1_000,
                ..CredentialsConfig::default()
            },
            webhook: WebhookConfig {
                secret: Some(WEBHOOK_SECRET.to_string()),
                retry_base_delay_ms: 1,
                ..WebhookConfig::default()
            },
            cache: CacheConfig::default(),
        }
    }
}

pub struct Components {
    pub store: Arc<InMemoryCredentialStore>,
    pub distributed: Arc<InMemoryDistributedCache>,
    pub integration: Arc<IntegrationService>,
    pub webhooks: Arc<WebhookService>,
}

/// Wire every component around `connector`, backed by in-memory stores
pub fn assemble(options: TestOptions, connector: Arc<dyn ModelHostingConnector>) -> Components {
    let store = Arc::new(InMemoryCredentialStore::new());
    let distributed = Arc::new(InMemoryDistributedCache::new());

    let limiter = Arc::new(RateLimiter::new(options.rate_limiter));
    let cache = Arc::new(CacheService::new(options.cache, Some(distributed.clone())));
    let breakers = Arc::new(CircuitBreakerService::new(
        options.breakers,
        Arc::new(HealthMetrics::new(100)),
    ));
    let credentials = Arc::new(
        CredentialsService::new(options.credentials, store.clone(), Some(connector.clone()))
            .expect("Failed to build credentials service"),
    );
    let webhooks = Arc::new(WebhookService::new(options.webhook, cache.clone(), limiter.clone()));
    let integration = Arc::new(IntegrationService::new(
        options.integration,
        limiter,
        cache,
        credentials,
        breakers,
        connector,
    ));

    Components {
        store,
        distributed,
        integration,
        webhooks,
    }
}

pub struct TestApp {
    pub connector: Arc<MockModelHostingConnector>,
    pub store: Arc<InMemoryCredentialStore>,
    pub distributed: Arc<InMemoryDistributedCache>,
    pub integration: Arc<IntegrationService>,
    pub webhooks: Arc<WebhookService>,
}

impl TestApp {
    /// Mock provider, in-memory backends, `acme` holding [`ACME_KEY`]
    pub async fn spawn() -> Self {
        Self::spawn_with(TestOptions::default()).await
    }

    pub async fn spawn_with(options: TestOptions) -> Self {
        let connector = Arc::new(MockModelHostingConnector::default());
        let components = assemble(options, connector.clone());
        components
            .integration
            .credentials()
            .store_api_key("acme", ACME_KEY, None)
            .await
            .expect("Failed to store acme key");

        Self {
            connector,
            store: components.store,
            distributed: components.distributed,
            integration: components.integration,
            webhooks: components.webhooks,
        }
    }

    pub fn sign(&self, body: &[u8]) -> String {
        sign_payload(WEBHOOK_SECRET.as_bytes(), body).expect("Failed to sign payload")
    }

    /// App data for `actix_web::test::init_service` with `startup::configure`
    pub fn app_data(&self) -> (web::Data<IntegrationService>, web::Data<WebhookService>) {
        (
            web::Data::from(self.integration.clone()),
            web::Data::from(self.webhooks.clone()),
        )
    }
}
