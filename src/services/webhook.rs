//! Inbound provider notifications
//!
//! Verifies `X-Hub-Signature-256` before anything is parsed, normalizes the
//! payload into events and applies the built-in effects (cache
//! invalidation, rate-limit correction, alerts) followed by any registered
//! handlers.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::connectors::ConnectorError;
use crate::services::cache::CacheService;
use crate::services::rate_limiter::{RateLimitInfo, RateLimiter};

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const ORGANIZATION_HEADER: &str = "X-Organization-Id";

/// Event type matching every event
pub const WILDCARD: &str = "*";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Shared secret, taken from `MODELGATE_WEBHOOK_SECRET`
    #[serde(skip)]
    pub secret: Option<String>,
    #[serde(default = "WebhookConfig::default_verify_signatures")]
    pub verify_signatures: bool,
    /// Deadline for one handler invocation
    #[serde(default = "WebhookConfig::default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,
    #[serde(default = "WebhookConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "WebhookConfig::default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// How many recent event ids are remembered for deduplication
    #[serde(default = "WebhookConfig::default_dedupe_window")]
    pub dedupe_window: usize,
    /// Block applied on `rate_limit.exceeded` when the event names no delay
    #[serde(default = "WebhookConfig::default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,
}

impl WebhookConfig {
    const fn default_verify_signatures() -> bool {
        true
    }

    const fn default_handler_timeout_ms() -> u64 {
        5_000
    }

    const fn default_max_retries() -> u32 {
        3
    }

    const fn default_retry_base_delay_ms() -> u64 {
        100
    }

    const fn default_dedupe_window() -> usize {
        1_000
    }

    const fn default_rate_limit_backoff_secs() -> u64 {
        60
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            verify_signatures: Self::default_verify_signatures(),
            handler_timeout_ms: Self::default_handler_timeout_ms(),
            max_retries: Self::default_max_retries(),
            retry_base_delay_ms: Self::default_retry_base_delay_ms(),
            dedupe_window: Self::default_dedupe_window(),
            rate_limit_backoff_secs: Self::default_rate_limit_backoff_secs(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing X-Hub-Signature-256 header")]
    MissingSignature,
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("webhook secret is not configured")]
    MissingSecret,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("handler {handler} failed: {message}")]
    Handler { handler: String, message: String },
    #[error("handler {handler} exceeded {timeout:?}")]
    Timeout { handler: String, timeout: Duration },
}

impl From<WebhookError> for ConnectorError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Handler { .. } | WebhookError::Timeout { .. } | WebhookError::MissingSecret => {
                ConnectorError::Internal(err.to_string())
            }
            other => ConnectorError::Integrity(other.to_string()),
        }
    }
}

/// One normalized provider notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub organization: Option<String>,
    pub data: Value,
    #[serde(default)]
    pub retry_count: u32,
}

impl WebhookEvent {
    fn from_value(value: &Value, organization_header: Option<&str>) -> Result<Self, WebhookError> {
        let object = value
            .as_object()
            .ok_or_else(|| WebhookError::Malformed("event is not an object".to_string()))?;

        let event_type = object
            .get("type")
            .or_else(|| object.get("event"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| WebhookError::Malformed("event has no type".to_string()))?
            .to_string();

        let id = match object.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };

        let timestamp = match object.get("timestamp").or_else(|| object.get("created_at")) {
            Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            Some(Value::Number(secs)) => secs
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .unwrap_or_else(Utc::now),
            _ => Utc::now(),
        };

        let organization = object
            .get("organization")
            .or_else(|| object.get("organization_id"))
            .and_then(Value::as_str)
            .or(organization_header)
            .map(str::trim)
            .filter(|org| !org.is_empty())
            .map(str::to_string);

        Ok(Self {
            id,
            event_type,
            timestamp,
            organization,
            data: object.get("data").cloned().unwrap_or(Value::Null),
            retry_count: 0,
        })
    }

    fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    fn data_u64(&self, key: &str) -> Option<u64> {
        self.data.get(key).and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f.ceil() as u64))
                .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
        })
    }

    /// `owner/name` from `data.<field>` or `data.owner` + `data.name`
    fn qualified_name(&self, field: &str) -> Option<String> {
        if let Some(full) = self.data_str(field).filter(|s| s.contains('/')) {
            return Some(full.to_string());
        }
        match (self.data_str("owner"), self.data_str("name")) {
            (Some(owner), Some(name)) => Some(format!("{}/{}", owner, name)),
            _ => None,
        }
    }
}

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &WebhookEvent) -> Result<(), WebhookError>;
}

struct Registration {
    event_type: String,
    priority: i32,
    seq: u64,
    handler: Arc<dyn WebhookHandler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    QuotaWarning,
    QuotaExceeded,
    DeploymentFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub organization: Option<String>,
    pub event_id: String,
    pub message: String,
    pub data: Value,
    pub raised_at: DateTime<Utc>,
}

/// How the route should answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStatus {
    Accepted,
    Unauthorized,
    Malformed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookResult {
    pub success: bool,
    pub message: String,
    pub events_processed: usize,
    pub events_received: usize,
    #[serde(skip)]
    pub status: WebhookStatus,
}

impl WebhookResult {
    fn rejected(status: WebhookStatus, err: &WebhookError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            events_processed: 0,
            events_received: 0,
            status,
        }
    }
}

#[derive(Default)]
struct WebhookCounters {
    requests: AtomicU64,
    events_received: AtomicU64,
    events_processed: AtomicU64,
    events_failed: AtomicU64,
    duplicates: AtomicU64,
    rejected_signatures: AtomicU64,
    malformed_payloads: AtomicU64,
    handler_retries: AtomicU64,
    invalidated_entries: AtomicU64,
    alerts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookStats {
    pub requests: u64,
    pub events_received: u64,
    pub events_processed: u64,
    pub events_failed: u64,
    pub duplicates: u64,
    pub rejected_signatures: u64,
    pub malformed_payloads: u64,
    pub handler_retries: u64,
    pub invalidated_entries: u64,
    pub alerts: u64,
    pub registered_handlers: usize,
}

#[derive(Default)]
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

/// Longest pause between handler attempts
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// `base_ms * 2^attempt`, saturating and capped at [`MAX_RETRY_DELAY`]
fn retry_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
}

/// Compute the `X-Hub-Signature-256` value for a body
pub fn sign_payload(secret: &[u8], payload: &[u8]) -> Result<String, WebhookError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .map_err(|err| WebhookError::Malformed(format!("hmac key: {}", err)))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Constant-time check of a `sha256=<hex>` header against the body
pub fn verify_signature(secret: &[u8], payload: &[u8], header: &str) -> Result<(), WebhookError> {
    let digest = header
        .trim()
        .strip_prefix("sha256=")
        .ok_or(WebhookError::InvalidSignature)?;
    let expected = hex::decode(digest).map_err(|_| WebhookError::InvalidSignature)?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(payload);
    mac.verify_slice(&expected).map_err(|_| WebhookError::InvalidSignature)
}

pub struct WebhookService {
    config: WebhookConfig,
    cache: Arc<CacheService>,
    limiter: Arc<RateLimiter>,
    handlers: RwLock<Vec<Registration>>,
    next_seq: AtomicU64,
    recent: Mutex<RecentIds>,
    alerts: broadcast::Sender<Alert>,
    counters: WebhookCounters,
}

impl WebhookService {
    pub fn new(config: WebhookConfig, cache: Arc<CacheService>, limiter: Arc<RateLimiter>) -> Self {
        if config.verify_signatures && config.secret.is_none() {
            tracing::warn!("Webhook signature verification enabled without a secret, every delivery will be rejected");
        }
        let (alerts, _) = broadcast::channel(128);
        Self {
            config,
            cache,
            limiter,
            handlers: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            recent: Mutex::new(RecentIds::default()),
            alerts,
            counters: WebhookCounters::default(),
        }
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Add a handler for `event_type` (or [`WILDCARD`]). Higher priority
    /// runs first, equal priority in registration order.
    pub fn register_handler(&self, event_type: &str, priority: i32, handler: Arc<dyn WebhookHandler>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        tracing::info!(event_type, priority, handler = handler.name(), "Webhook handler registered");
        handlers.push(Registration {
            event_type: event_type.to_string(),
            priority,
            seq,
            handler,
        });
        handlers.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
    }

    fn handlers_for(&self, event_type: &str) -> Vec<Arc<dyn WebhookHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.event_type == event_type || r.event_type == WILDCARD)
            .map(|r| r.handler.clone())
            .collect()
    }

    fn verify(&self, payload: &[u8], signature: Option<&str>) -> Result<(), WebhookError> {
        if !self.config.verify_signatures {
            return Ok(());
        }
        let secret = self.config.secret.as_deref().ok_or(WebhookError::MissingSecret)?;
        let signature = signature.ok_or(WebhookError::MissingSignature)?;
        verify_signature(secret.as_bytes(), payload, signature)
    }

    #[tracing::instrument(name = "Process provider webhook", skip(self, payload, signature), fields(bytes = payload.len()))]
    pub async fn process_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        organization_header: Option<&str>,
    ) -> WebhookResult {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        if let Err(err) = self.verify(payload, signature) {
            tracing::warn!(error = %err, "Webhook rejected");
            self.counters.rejected_signatures.fetch_add(1, Ordering::Relaxed);
            return WebhookResult::rejected(WebhookStatus::Unauthorized, &err);
        }

        let items = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Array(items)) => items,
            Ok(item @ Value::Object(_)) => vec![item],
            Ok(_) => {
                return self.malformed(WebhookError::Malformed("expected an event object or array".to_string()))
            }
            Err(err) => return self.malformed(WebhookError::Malformed(err.to_string())),
        };

        let received = items.len();
        self.counters
            .events_received
            .fetch_add(received as u64, Ordering::Relaxed);

        let mut processed = 0;
        for item in &items {
            let outcome = match WebhookEvent::from_value(item, organization_header) {
                Ok(event) => self.dispatch(event).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => processed += 1,
                Err(err) => {
                    self.counters.events_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %err, "Webhook event not processed");
                }
            }
        }
        self.counters
            .events_processed
            .fetch_add(processed as u64, Ordering::Relaxed);

        WebhookResult {
            success: true,
            message: format!("processed {} of {} events", processed, received),
            events_processed: processed,
            events_received: received,
            status: WebhookStatus::Accepted,
        }
    }

    fn malformed(&self, err: WebhookError) -> WebhookResult {
        tracing::warn!(error = %err, "Webhook payload could not be parsed");
        self.counters.malformed_payloads.fetch_add(1, Ordering::Relaxed);
        WebhookResult::rejected(WebhookStatus::Malformed, &err)
    }

    fn already_seen(&self, id: &str) -> bool {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .seen
            .contains(id)
    }

    fn remember(&self, id: &str) {
        let window = self.config.dedupe_window.max(1);
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if recent.seen.insert(id.to_string()) {
            recent.order.push_back(id.to_string());
        }
        while recent.order.len() > window {
            if let Some(evicted) = recent.order.pop_front() {
                recent.seen.remove(&evicted);
            }
        }
    }

    async fn dispatch(&self, mut event: WebhookEvent) -> Result<(), WebhookError> {
        if self.already_seen(&event.id) {
            tracing::debug!(event_id = %event.id, "Duplicate webhook event acknowledged");
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            organization = event.organization.as_deref().unwrap_or("-"),
            "Dispatching webhook event"
        );

        self.apply_builtin(&event).await?;

        let mut failure = None;
        for handler in self.handlers_for(&event.event_type) {
            if let Err(err) = self.invoke(handler.as_ref(), &mut event).await {
                tracing::error!(event_id = %event.id, handler = handler.name(), error = %err, "Webhook handler gave up");
                failure = Some(err);
            }
        }

        match failure {
            Some(err) => Err(err),
            None => {
                self.remember(&event.id);
                Ok(())
            }
        }
    }

    /// One handler with timeout and exponential backoff between attempts
    async fn invoke(&self, handler: &dyn WebhookHandler, event: &mut WebhookEvent) -> Result<(), WebhookError> {
        let timeout = Duration::from_millis(self.config.handler_timeout_ms.max(1));
        let mut attempt = 0u32;
        loop {
            let err = match tokio::time::timeout(timeout, handler.handle(event)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => err,
                Err(_) => WebhookError::Timeout {
                    handler: handler.name().to_string(),
                    timeout,
                },
            };
            if attempt >= self.config.max_retries {
                return Err(err);
            }

            let backoff = retry_delay(self.config.retry_base_delay_ms, attempt);
            tracing::debug!(handler = handler.name(), attempt, error = %err, "Retrying webhook handler");
            self.counters.handler_retries.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(backoff).await;
            attempt += 1;
            event.retry_count = attempt;
        }
    }

    async fn apply_builtin(&self, event: &WebhookEvent) -> Result<(), WebhookError> {
        let event_type = event.event_type.as_str();
        match event_type {
            t if t.starts_with("model.") => {
                // the catalog is shared, any organization's listing may include this model
                let mut tags = vec!["models".to_string()];
                if let Some(model) = event.qualified_name("model") {
                    tags.push(format!("model:{}", model));
                }
                self.invalidate(event, &tags).await;
            }
            t if t.starts_with("deployment.") => {
                let mut tags = Vec::new();
                if let Some(org) = &event.organization {
                    tags.push(format!("deployments:{}", org));
                }
                if let Some(deployment) = event.qualified_name("deployment") {
                    tags.push(format!("deployment:{}", deployment));
                }
                if !tags.is_empty() {
                    self.invalidate(event, &tags).await;
                }
                if t == "deployment.failed" {
                    let reason = event.data_str("error").or_else(|| event.data_str("reason"));
                    let message = match (event.qualified_name("deployment"), reason) {
                        (Some(deployment), Some(reason)) => format!("deployment {} failed: {}", deployment, reason),
                        (Some(deployment), None) => format!("deployment {} failed", deployment),
                        (None, _) => "deployment failed".to_string(),
                    };
                    self.alert(AlertKind::DeploymentFailed, event, message);
                }
            }
            "quota.warning" => self.alert(AlertKind::QuotaWarning, event, "quota nearly exhausted".to_string()),
            "quota.exceeded" => self.alert(AlertKind::QuotaExceeded, event, "quota exceeded".to_string()),
            "rate_limit.exceeded" => {
                let organization = event
                    .organization
                    .as_deref()
                    .ok_or_else(|| WebhookError::Malformed("rate_limit.exceeded without organization".to_string()))?;
                let info = self.rate_limit_info(event);
                self.limiter
                    .update_rate_limit_from_response(organization, &info)
                    .await;
            }
            _ => {}
        }
        Ok(())
    }

    fn rate_limit_info(&self, event: &WebhookEvent) -> RateLimitInfo {
        let mut info = RateLimitInfo {
            limit: event.data_u64("limit").map(|v| v.min(u32::MAX as u64) as u32),
            remaining: event.data_u64("remaining").map(|v| v.min(u32::MAX as u64) as u32),
            reset: event.data_u64("reset").map(Duration::from_secs),
            retry_after: event.data_u64("retry_after").map(Duration::from_secs),
        };
        if info.retry_after.is_none() && info.reset.is_none() {
            info.retry_after = Some(Duration::from_secs(self.config.rate_limit_backoff_secs));
        }
        info
    }

    async fn invalidate(&self, event: &WebhookEvent, tags: &[String]) {
        let removed = self.cache.invalidate_by_tags(tags).await;
        self.counters
            .invalidated_entries
            .fetch_add(removed as u64, Ordering::Relaxed);
        tracing::info!(event_id = %event.id, ?tags, removed, "Cache invalidated by webhook");
    }

    fn alert(&self, kind: AlertKind, event: &WebhookEvent, message: String) {
        tracing::warn!(?kind, organization = event.organization.as_deref().unwrap_or("-"), %message, "Provider alert");
        self.counters.alerts.fetch_add(1, Ordering::Relaxed);
        let _ = self.alerts.send(Alert {
            kind,
            organization: event.organization.clone(),
            event_id: event.id.clone(),
            message,
            data: event.data.clone(),
            raised_at: Utc::now(),
        });
    }

    pub fn stats(&self) -> WebhookStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        WebhookStats {
            requests: load(&self.counters.requests),
            events_received: load(&self.counters.events_received),
            events_processed: load(&self.counters.events_processed),
            events_failed: load(&self.counters.events_failed),
            duplicates: load(&self.counters.duplicates),
            rejected_signatures: load(&self.counters.rejected_signatures),
            malformed_payloads: load(&self.counters.malformed_payloads),
            handler_retries: load(&self.counters.handler_retries),
            invalidated_entries: load(&self.counters.invalidated_entries),
            alerts: load(&self.counters.alerts),
            registered_handlers: self.handlers.read().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }
}
