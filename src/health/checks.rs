use super::metrics::HealthMetrics;
use super::models::{ComponentHealth, HealthCheckResponse};
use crate::connectors::ModelHostingConnector;
use crate::services::cache::CacheService;
use crate::services::circuit_breaker::{CircuitBreakerService, CircuitState};
use crate::services::credentials::CredentialStore;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthChecker {
    cache: Arc<CacheService>,
    credential_store: Arc<dyn CredentialStore>,
    connector: Arc<dyn ModelHostingConnector>,
    breakers: Arc<CircuitBreakerService>,
    metrics: Arc<HealthMetrics>,
    start_time: Instant,
}

impl HealthChecker {
    pub fn new(
        cache: Arc<CacheService>,
        credential_store: Arc<dyn CredentialStore>,
        connector: Arc<dyn ModelHostingConnector>,
        breakers: Arc<CircuitBreakerService>,
    ) -> Self {
        let metrics = breakers.health_metrics().clone();
        Self {
            cache,
            credential_store,
            connector,
            breakers,
            metrics,
            start_time: Instant::now(),
        }
    }

    pub fn metrics(&self) -> &Arc<HealthMetrics> {
        &self.metrics
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let version = env!("CARGO_PKG_VERSION").to_string();
        let uptime = self.start_time.elapsed().as_secs();
        let mut response = HealthCheckResponse::new(version, uptime);

        let (cache_result, store_result, provider_result) = tokio::join!(
            timeout(CHECK_TIMEOUT, self.check_cache()),
            timeout(CHECK_TIMEOUT, self.check_credential_store()),
            timeout(CHECK_TIMEOUT, self.check_provider()),
        );
        let timed_out = |_| ComponentHealth::unhealthy("Timeout".to_string());

        let checks = [
            ("cache", cache_result.unwrap_or_else(timed_out)),
            ("credential_store", store_result.unwrap_or_else(timed_out)),
            ("provider", provider_result.unwrap_or_else(timed_out)),
            ("circuit_breakers", self.check_breakers()),
        ];

        for (name, health) in checks {
            self.metrics.record(name.to_string(), &health).await;
            response.add_component(name, health);
        }

        response
    }

    /// Losing tier 2 degrades, the local tier keeps serving
    #[tracing::instrument(name = "Check cache health", skip(self))]
    async fn check_cache(&self) -> ComponentHealth {
        let stats = self.cache.stats();
        if !self.cache.has_distributed_tier() {
            return ComponentHealth::healthy(0)
                .with_detail("tiers", json!(["local"]))
                .with_detail("local_entries", json!(stats.local_entries));
        }

        let start = Instant::now();
        match self.cache.ping().await {
            Ok(()) => ComponentHealth::responded("Cache", start.elapsed().as_millis() as u64)
                .with_detail("tiers", json!(["local", stats.distributed_backend]))
                .with_detail("local_entries", json!(stats.local_entries)),
            Err(e) => {
                tracing::warn!("Distributed cache health check failed: {}", e);
                ComponentHealth::degraded(format!("Distributed cache unavailable: {}", e), None)
                    .with_detail("tiers", json!(["local"]))
                    .with_detail("distributed_errors", json!(stats.distributed_errors))
            }
        }
    }

    #[tracing::instrument(name = "Check credential store health", skip(self))]
    async fn check_credential_store(&self) -> ComponentHealth {
        let start = Instant::now();
        match self.credential_store.ping().await {
            Ok(()) => ComponentHealth::responded("Credential store", start.elapsed().as_millis() as u64)
                .with_detail("backend", json!(self.credential_store.backend())),
            Err(e) => {
                tracing::error!("Credential store health check failed: {:?}", e);
                ComponentHealth::unhealthy(format!("Credential store error: {}", e))
            }
        }
    }

    #[tracing::instrument(name = "Check provider health", skip(self))]
    async fn check_provider(&self) -> ComponentHealth {
        let start = Instant::now();
        match self.connector.ping().await {
            Ok(()) => ComponentHealth::responded("Provider", start.elapsed().as_millis() as u64)
                .with_detail("backend", json!(self.connector.backend())),
            Err(e) => {
                tracing::warn!("Provider health check failed: {}", e);
                ComponentHealth::unhealthy(format!("Provider error: {}", e))
            }
        }
    }

    /// Open circuits mean callers get fallbacks
    fn check_breakers(&self) -> ComponentHealth {
        let stats = self.breakers.stats();
        let tripped: Vec<&str> = stats
            .iter()
            .filter(|s| s.state != CircuitState::Closed)
            .map(|s| s.operation.as_str())
            .collect();

        let health = if tripped.is_empty() {
            ComponentHealth::healthy(0)
        } else {
            ComponentHealth::degraded(format!("{} circuit(s) not closed", tripped.len()), None)
                .with_detail("operations", json!(tripped))
        };
        health.with_detail("tracked", json!(stats.len()))
    }
}
