//! Entry point for domain calls against the provider
//!
//! Reads: cache, then rate limiter, then circuit breaker, then credentials
//! and the provider call. Live results are cached with the operation's TTL
//! and tags. Writes skip the cache read and invalidate related tags once
//! they succeed. Every call returns an [`ApiResponse`]; nothing expected
//! escapes as a raw error.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::connectors::{
    ConnectorError, CredentialIssue, Deployment, DeploymentRequest, ModelHostingConnector, ModelInfo, ModelPage,
    ModelSearchQuery, ProviderResponse,
};
use crate::health::{HealthCheckResponse, HealthChecker};
use crate::services::cache::{CacheService, CacheStats, SetOptions};
use crate::services::circuit_breaker::{BreakerStats, CircuitBreakerService, ResponseSource};
use crate::services::credentials::{ApiKey, CredentialValidation, CredentialsService, RotationOutcome};
use crate::services::rate_limiter::{RateLimiter, RateLimiterStats, ScheduleOptions};

pub const SEARCH_MODELS: &str = "search_models";
pub const GET_MODEL: &str = "get_model";
pub const CREATE_DEPLOYMENT: &str = "create_deployment";
pub const GET_DEPLOYMENT: &str = "get_deployment";
pub const DELETE_DEPLOYMENT: &str = "delete_deployment";
pub const VALIDATE_CREDENTIALS: &str = "validate_credentials";
pub const ROTATE_CREDENTIALS: &str = "rotate_credentials";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Used when a caller passes an empty organization
    #[serde(default = "IntegrationConfig::default_organization")]
    pub default_organization: String,
    /// Re-schedules after a provider 429
    #[serde(default = "IntegrationConfig::default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    /// Latency samples kept for percentiles
    #[serde(default = "IntegrationConfig::default_latency_samples")]
    pub latency_samples: usize,
    #[serde(default = "IntegrationConfig::default_read_priority")]
    pub read_priority: u8,
    #[serde(default = "IntegrationConfig::default_write_priority")]
    pub write_priority: u8,
}

impl IntegrationConfig {
    fn default_organization() -> String {
        "default".to_string()
    }

    const fn default_max_rate_limit_retries() -> u32 {
        3
    }

    const fn default_latency_samples() -> usize {
        1_000
    }

    const fn default_read_priority() -> u8 {
        5
    }

    const fn default_write_priority() -> u8 {
        3
    }
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            default_organization: Self::default_organization(),
            max_rate_limit_retries: Self::default_max_rate_limit_retries(),
            latency_samples: Self::default_latency_samples(),
            read_priority: Self::default_read_priority(),
            write_priority: Self::default_write_priority(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ApiError {
    pub kind: String,
    pub message: String,
    /// HTTP status the error maps to
    #[serde(skip)]
    pub status: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ResponseSource>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, source: ResponseSource) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            source: Some(source),
        }
    }

    pub fn failed(err: &ConnectorError) -> Self {
        use actix_web::ResponseError;

        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                kind: err.kind().to_string(),
                message: err.to_string(),
                status: err.status_code().as_u16(),
            }),
            source: None,
        }
    }

    fn from_result(result: Result<(T, ResponseSource), ConnectorError>) -> Self {
        match result {
            Ok((data, source)) => Self::ok(data, source),
            Err(err) => Self::failed(&err),
        }
    }
}

/// Deterministic key: operation plus SHA-256 of the normalized parameters.
/// Object keys are sorted, nulls dropped and strings trimmed, so
/// semantically equal requests share an entry.
pub fn cache_key<P: Serialize>(operation: &str, params: &P) -> Result<String, ConnectorError> {
    let value = serde_json::to_value(params)
        .map_err(|err| ConnectorError::Internal(format!("Cannot encode parameters: {}", err)))?;
    let digest = Sha256::digest(normalize(value).to_string().as_bytes());
    Ok(format!("{}:{}", operation, hex::encode(digest)))
}

fn normalize(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(s.trim().to_string()),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, normalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect::<Map<String, Value>>())
        }
        other => other,
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct OrganizationStats {
    pub requests: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub fallbacks: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct LatencySummary {
    pub samples: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

impl LatencySummary {
    fn from_samples(samples: &VecDeque<u64>) -> Self {
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        Self {
            samples: sorted.len(),
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
            max_ms: sorted.last().copied().unwrap_or(0),
        }
    }
}

/// Nearest-rank percentile of an ascending slice
fn percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrationStats {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    /// Answered from a breaker fallback
    pub degraded: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub upstream_calls: u64,
    pub rate_limit_retries: u64,
    pub cached_fallbacks: u64,
    pub default_fallbacks: u64,
    pub latency: LatencySummary,
    pub operations: BTreeMap<String, u64>,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub organizations: BTreeMap<String, OrganizationStats>,
    pub cache: CacheStats,
    pub circuit_breakers: Vec<BreakerStats>,
    pub rate_limits: Vec<RateLimiterStats>,
}

#[derive(Default)]
struct StatsInner {
    total_requests: u64,
    successful: u64,
    failed: u64,
    cache_hits: u64,
    cache_misses: u64,
    rate_limit_retries: u64,
    cached_fallbacks: u64,
    default_fallbacks: u64,
    latencies: VecDeque<u64>,
    operations: BTreeMap<String, u64>,
    errors_by_kind: BTreeMap<String, u64>,
    organizations: BTreeMap<String, OrganizationStats>,
}

struct StatsRecorder {
    inner: Mutex<StatsInner>,
    max_samples: usize,
}

impl StatsRecorder {
    fn new(max_samples: usize) -> Self {
        Self {
            inner: Mutex::new(StatsInner::default()),
            max_samples: max_samples.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rate_limit_retry(&self) {
        self.lock().rate_limit_retries += 1;
    }

    fn finish(
        &self,
        organization: &str,
        operation: &str,
        outcome: Result<ResponseSource, &ConnectorError>,
        elapsed: Duration,
    ) {
        let mut stats = self.lock();
        stats.total_requests += 1;
        *stats.operations.entry(operation.to_string()).or_insert(0) += 1;

        stats.latencies.push_back(elapsed.as_millis() as u64);
        while stats.latencies.len() > self.max_samples {
            stats.latencies.pop_front();
        }

        let mut org = stats.organizations.remove(organization).unwrap_or_default();
        org.requests += 1;

        match outcome {
            Ok(source) => {
                stats.successful += 1;
                match source {
                    ResponseSource::Cache => {
                        stats.cache_hits += 1;
                        org.cache_hits += 1;
                    }
                    ResponseSource::Live => {}
                    ResponseSource::CachedFallback => stats.cached_fallbacks += 1,
                    ResponseSource::DefaultFallback => stats.default_fallbacks += 1,
                }
                if source.is_fallback() {
                    org.fallbacks += 1;
                }
            }
            Err(err) => {
                stats.failed += 1;
                org.failures += 1;
                *stats.errors_by_kind.entry(err.kind().to_string()).or_insert(0) += 1;
            }
        }
        stats.organizations.insert(organization.to_string(), org);
    }

    fn cache_miss(&self) {
        self.lock().cache_misses += 1;
    }
}

pub struct IntegrationService {
    config: IntegrationConfig,
    limiter: Arc<RateLimiter>,
    cache: Arc<CacheService>,
    credentials: Arc<CredentialsService>,
    breakers: Arc<CircuitBreakerService>,
    connector: Arc<dyn ModelHostingConnector>,
    health: HealthChecker,
    recorder: StatsRecorder,
    upstream_calls: AtomicU64,
    shutting_down: AtomicBool,
}

impl IntegrationService {
    pub fn new(
        config: IntegrationConfig,
        limiter: Arc<RateLimiter>,
        cache: Arc<CacheService>,
        credentials: Arc<CredentialsService>,
        breakers: Arc<CircuitBreakerService>,
        connector: Arc<dyn ModelHostingConnector>,
    ) -> Self {
        let health = HealthChecker::new(
            cache.clone(),
            credentials.store().clone(),
            connector.clone(),
            breakers.clone(),
        );
        Self {
            recorder: StatsRecorder::new(config.latency_samples),
            config,
            limiter,
            cache,
            credentials,
            breakers,
            connector,
            health,
            upstream_calls: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    pub fn credentials(&self) -> &Arc<CredentialsService> {
        &self.credentials
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerService> {
        &self.breakers
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    fn organization<'a>(&'a self, organization: &'a str) -> &'a str {
        match organization.trim() {
            "" => &self.config.default_organization,
            org => org,
        }
    }

    fn ensure_running(&self) -> Result<(), ConnectorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ConnectorError::Internal("integration service is shutting down".to_string()));
        }
        Ok(())
    }

    /// Credentials plus one provider call. Quota headers on success
    /// correct the limiter, a rejected key becomes a credential error.
    async fn attempt<T, F, Fut>(&self, organization: &str, call: &F) -> Result<T, ConnectorError>
    where
        F: Fn(Arc<dyn ModelHostingConnector>, ApiKey) -> Fut,
        Fut: Future<Output = Result<ProviderResponse<T>, ConnectorError>>,
    {
        let key = self.credentials.get_api_key(organization).await?;
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);

        match call(self.connector.clone(), key).await {
            Ok(response) => {
                if let Some(info) = &response.rate_limit {
                    self.limiter
                        .update_rate_limit_from_response(organization, info)
                        .await;
                }
                Ok(response.data)
            }
            Err(ConnectorError::Client { status: 401 | 403, message }) => Err(ConnectorError::Credentials {
                organization: organization.to_string(),
                issue: CredentialIssue::LiveCheckFailed(message),
            }),
            Err(err) => Err(err),
        }
    }

    /// Schedule through the limiter, re-scheduling when the provider
    /// answers 429 with quota information.
    async fn scheduled<T, Op, OpFut>(
        &self,
        organization: &str,
        operation: &str,
        options: ScheduleOptions,
        op: Op,
    ) -> Result<T, ConnectorError>
    where
        Op: Fn() -> OpFut,
        OpFut: Future<Output = Result<T, ConnectorError>>,
    {
        let mut retries = 0;
        loop {
            match self.limiter.schedule(organization, options, &op).await {
                Err(ConnectorError::RateLimited { info: Some(info), .. })
                    if retries < self.config.max_rate_limit_retries =>
                {
                    retries += 1;
                    self.recorder.rate_limit_retry();
                    tracing::warn!(
                        organization,
                        operation,
                        retries,
                        retry_after_ms = info.retry_after.map(|d| d.as_millis() as u64),
                        "Provider rate limited the call, re-scheduling"
                    );
                    self.limiter
                        .update_rate_limit_from_response(organization, &info)
                        .await;
                }
                other => return other,
            }
        }
    }

    async fn read<T, P, F, Fut>(
        &self,
        organization: &str,
        operation: &'static str,
        params: &P,
        tags: Vec<String>,
        call: F,
    ) -> ApiResponse<T>
    where
        T: Serialize + DeserializeOwned,
        P: Serialize,
        F: Fn(Arc<dyn ModelHostingConnector>, ApiKey) -> Fut,
        Fut: Future<Output = Result<ProviderResponse<T>, ConnectorError>>,
    {
        let started = Instant::now();
        let result = self.read_inner(organization, operation, params, tags, call).await;
        self.recorder.finish(
            organization,
            operation,
            result.as_ref().map(|(_, source)| *source),
            started.elapsed(),
        );
        if let Err(err) = &result {
            tracing::warn!(organization, operation, error = %err, "Read operation failed");
        }
        ApiResponse::from_result(result)
    }

    async fn read_inner<T, P, F, Fut>(
        &self,
        organization: &str,
        operation: &'static str,
        params: &P,
        tags: Vec<String>,
        call: F,
    ) -> Result<(T, ResponseSource), ConnectorError>
    where
        T: Serialize + DeserializeOwned,
        P: Serialize,
        F: Fn(Arc<dyn ModelHostingConnector>, ApiKey) -> Fut,
        Fut: Future<Output = Result<ProviderResponse<T>, ConnectorError>>,
    {
        self.ensure_running()?;
        let key = cache_key(operation, params)?;

        if let Some(hit) = self.cache.get::<T>(organization, &key).await {
            tracing::debug!(organization, operation, "Served from cache");
            return Ok((hit, ResponseSource::Cache));
        }
        self.recorder.cache_miss();

        let options = ScheduleOptions::default().with_priority(self.config.read_priority);
        let fallback_key = self.cache.physical_key(organization, &key);
        let fallback_key = fallback_key.as_str();
        let call = &call;
        let outcome = self
            .scheduled(organization, operation, options, move || {
                self.breakers
                    .execute(operation, fallback_key, move || self.attempt(organization, call))
            })
            .await?;

        if outcome.source == ResponseSource::Live {
            let ttl = self.cache.config().ttl_for(operation);
            self.cache
                .set(organization, &key, &outcome.value, SetOptions::ttl(ttl).with_tags(tags))
                .await;
        }
        Ok((outcome.value, outcome.source))
    }

    async fn write<T, F, Fut, I>(&self, organization: &str, operation: &'static str, call: F, invalidate: I) -> ApiResponse<T>
    where
        F: Fn(Arc<dyn ModelHostingConnector>, ApiKey) -> Fut,
        Fut: Future<Output = Result<ProviderResponse<T>, ConnectorError>>,
        I: FnOnce(&T) -> Vec<String>,
    {
        let started = Instant::now();
        let result = async {
            self.ensure_running()?;
            let options = ScheduleOptions::default().with_priority(self.config.write_priority);
            let call = &call;
            let value = self
                .scheduled(organization, operation, options, move || {
                    self.breakers
                        .execute_without_fallback(operation, move || self.attempt(organization, call))
                })
                .await?;

            let tags = invalidate(&value);
            let removed = self.cache.invalidate_by_tags(&tags).await;
            tracing::info!(organization, operation, ?tags, removed, "Write succeeded, related cache entries invalidated");
            Ok::<_, ConnectorError>((value, ResponseSource::Live))
        }
        .await;

        self.recorder.finish(
            organization,
            operation,
            result.as_ref().map(|(_, source)| *source),
            started.elapsed(),
        );
        if let Err(err) = &result {
            tracing::warn!(organization, operation, error = %err, "Write operation failed");
        }
        ApiResponse::from_result(result)
    }

    #[tracing::instrument(name = "Search models", skip(self, query), fields(query = %query.query))]
    pub async fn search_models(&self, organization: &str, query: ModelSearchQuery) -> ApiResponse<ModelPage> {
        let organization = self.organization(organization);
        let tags = vec!["models".to_string(), organization.to_string()];
        self.read(organization, SEARCH_MODELS, &query, tags, |connector, key| {
            let query = query.clone();
            async move { connector.search_models(key.expose(), &query).await }
        })
        .await
    }

    #[tracing::instrument(name = "Get model info", skip(self))]
    pub async fn get_model_info(&self, organization: &str, owner: &str, name: &str) -> ApiResponse<ModelInfo> {
        let organization = self.organization(organization);
        let tags = vec![
            "models".to_string(),
            organization.to_string(),
            format!("model:{}/{}", owner, name),
        ];
        let params = json!({ "owner": owner, "name": name });
        self.read(organization, GET_MODEL, &params, tags, |connector, key| {
            let (owner, name) = (owner.to_string(), name.to_string());
            async move { connector.get_model(key.expose(), &owner, &name).await }
        })
        .await
    }

    #[tracing::instrument(name = "Create deployment", skip(self, request), fields(deployment = %request.name, model = %request.model))]
    pub async fn create_deployment(&self, organization: &str, request: DeploymentRequest) -> ApiResponse<Deployment> {
        let organization = self.organization(organization);
        self.write(
            organization,
            CREATE_DEPLOYMENT,
            |connector, key| {
                let request = request.clone();
                async move { connector.create_deployment(key.expose(), &request).await }
            },
            |deployment| deployment_tags(organization, &deployment.owner, &deployment.name),
        )
        .await
    }

    #[tracing::instrument(name = "Get deployment status", skip(self))]
    pub async fn get_deployment_status(&self, organization: &str, owner: &str, name: &str) -> ApiResponse<Deployment> {
        let organization = self.organization(organization);
        let mut tags = deployment_tags(organization, owner, name);
        tags.push(organization.to_string());
        let params = json!({ "owner": owner, "name": name });
        self.read(organization, GET_DEPLOYMENT, &params, tags, |connector, key| {
            let (owner, name) = (owner.to_string(), name.to_string());
            async move { connector.get_deployment(key.expose(), &owner, &name).await }
        })
        .await
    }

    #[tracing::instrument(name = "Delete deployment", skip(self))]
    pub async fn delete_deployment(&self, organization: &str, owner: &str, name: &str) -> ApiResponse<()> {
        let organization = self.organization(organization);
        self.write(
            organization,
            DELETE_DEPLOYMENT,
            |connector, key| {
                let (owner, name) = (owner.to_string(), name.to_string());
                async move { connector.delete_deployment(key.expose(), &owner, &name).await }
            },
            |_| deployment_tags(organization, owner, name),
        )
        .await
    }

    /// Live credential probe, scheduled like any other provider call
    #[tracing::instrument(name = "Validate credentials passthrough", skip(self))]
    pub async fn validate_credentials(&self, organization: &str) -> ApiResponse<CredentialValidation> {
        let organization = self.organization(organization);
        let started = Instant::now();
        let result = async {
            self.ensure_running()?;
            let options = ScheduleOptions::default().with_priority(self.config.write_priority);
            self.scheduled(organization, VALIDATE_CREDENTIALS, options, move || async move {
                self.credentials
                    .validate_credentials(organization)
                    .await
                    .map_err(ConnectorError::from)
            })
            .await
            .map(|validation| (validation, ResponseSource::Live))
        }
        .await;

        self.recorder.finish(
            organization,
            VALIDATE_CREDENTIALS,
            result.as_ref().map(|(_, source)| *source),
            started.elapsed(),
        );
        ApiResponse::from_result(result)
    }

    #[tracing::instrument(name = "Rotate credentials passthrough", skip(self))]
    pub async fn rotate_credentials(&self, organization: &str) -> ApiResponse<RotationOutcome> {
        let organization = self.organization(organization);
        let started = Instant::now();
        let result = match self.ensure_running() {
            Ok(()) => self
                .credentials
                .rotate_credentials(organization)
                .await
                .map(|outcome| (outcome, ResponseSource::Live))
                .map_err(ConnectorError::from),
            Err(err) => Err(err),
        };

        self.recorder.finish(
            organization,
            ROTATE_CREDENTIALS,
            result.as_ref().map(|(_, source)| *source),
            started.elapsed(),
        );
        ApiResponse::from_result(result)
    }

    pub async fn stats(&self) -> IntegrationStats {
        let mut rate_limits = Vec::new();
        for organization in self.limiter.organizations().await {
            rate_limits.push(self.limiter.stats(&organization).await);
        }

        let stats = self.recorder.lock();
        IntegrationStats {
            total_requests: stats.total_requests,
            successful: stats.successful,
            failed: stats.failed,
            degraded: stats.cached_fallbacks + stats.default_fallbacks,
            cache_hits: stats.cache_hits,
            cache_misses: stats.cache_misses,
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            rate_limit_retries: stats.rate_limit_retries,
            cached_fallbacks: stats.cached_fallbacks,
            default_fallbacks: stats.default_fallbacks,
            latency: LatencySummary::from_samples(&stats.latencies),
            operations: stats.operations.clone(),
            errors_by_kind: stats.errors_by_kind.clone(),
            organizations: stats.organizations.clone(),
            cache: self.cache.stats(),
            circuit_breakers: self.breakers.stats(),
            rate_limits,
        }
    }

    pub async fn health_check(&self) -> HealthCheckResponse {
        self.health.check_all().await
    }

    /// Refuse new calls and stop every background task
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Integration service shutting down");
        self.limiter.stop().await;
        self.credentials.stop_auto_rotation().await;
        self.breakers.stop().await;
        self.cache.disconnect();
    }
}

fn deployment_tags(organization: &str, owner: &str, name: &str) -> Vec<String> {
    vec![
        format!("deployments:{}", organization),
        format!("deployment:{}/{}", owner, name),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_ignore_key_order_whitespace_and_nulls() {
        let a = cache_key(SEARCH_MODELS, &json!({"query": " chat ", "limit": 10, "cursor": null})).unwrap();
        let b = cache_key(SEARCH_MODELS, &json!({"limit": 10, "query": "chat"})).unwrap();
        let c = cache_key(SEARCH_MODELS, &json!({"limit": 11, "query": "chat"})).unwrap();
        let d = cache_key(GET_MODEL, &json!({"limit": 10, "query": "chat"})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.starts_with("search_models:"));
        assert_eq!(a.len(), "search_models:".len() + 64);
    }

    #[test]
    fn nearest_rank_percentiles() {
        let samples: VecDeque<u64> = (1..=100).collect();
        let summary = LatencySummary::from_samples(&samples);
        assert_eq!(summary.p50_ms, 50);
        assert_eq!(summary.p95_ms, 95);
        assert_eq!(summary.p99_ms, 99);
        assert_eq!(summary.max_ms, 100);
        assert_eq!(LatencySummary::from_samples(&VecDeque::new()), LatencySummary::default());
        assert_eq!(percentile(&[7], 99.0), 7);
    }

    #[test]
    fn failures_map_to_api_errors() {
        let response: ApiResponse<()> = ApiResponse::failed(&ConnectorError::CircuitOpen("search_models".into()));
        assert!(!response.success);
        let error = response.error.unwrap();
        assert_eq!(error.kind, "circuit_open");
        assert_eq!(error.status, 503);
    }
}
