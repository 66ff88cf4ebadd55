use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde::Serialize;
use serde_json::json;
use std::fmt;

use crate::services::rate_limiter::RateLimitInfo;

/// Why a credential cannot be used for an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum CredentialIssue {
    /// No credential has ever been configured (or the stored record is unreadable).
    Missing,
    /// The latest record was deactivated by an operator.
    Deactivated,
    /// The record passed its expiry timestamp.
    Expired,
    /// The provider refused the key during a live probe.
    LiveCheckFailed(String),
}

impl fmt::Display for CredentialIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "credentials missing"),
            Self::Deactivated => write!(f, "credentials deactivated"),
            Self::Expired => write!(f, "credentials expired"),
            Self::LiveCheckFailed(reason) => write!(f, "live check failed: {}", reason),
        }
    }
}

/// Errors that can occur while talking to the model hosting provider
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectorError {
    /// 5xx responses, connection resets
    #[error("Transient upstream error: {0}")]
    Transient(String),
    /// Request exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),
    /// 429 from the provider or local limiter rejection
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        info: Option<RateLimitInfo>,
    },
    /// 4xx other than 401/403/404/429
    #[error("Client error {status}: {message}")]
    Client { status: u16, message: String },
    #[error("Not found: {0}")]
    NotFound(String),
    /// Missing, expired or rejected API key
    #[error("Credentials error for {organization}: {issue}")]
    Credentials {
        organization: String,
        issue: CredentialIssue,
    },
    /// Bad webhook signature, malformed payload
    #[error("Integrity error: {0}")]
    Integrity(String),
    /// Provider answered with something we could not parse
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    /// Short-circuited with no fallback available
    #[error("Circuit open for {0}")]
    CircuitOpen(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConnectorError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            info: None,
        }
    }

    /// Transient failures may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout(_) | Self::RateLimited { .. }
        )
    }

    /// Whether the error says something about the availability of the
    /// destination. Only these feed the circuit breaker's failure count.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::Timeout(_) | Self::InvalidResponse(_)
        )
    }

    /// Stable machine-readable kind, used in API responses and statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Timeout(_) => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::Client { .. } => "client",
            Self::NotFound(_) => "not_found",
            Self::Credentials { .. } => "credentials",
            Self::Integrity(_) => "integrity",
            Self::InvalidResponse(_) => "invalid_response",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Internal(_) => "internal",
        }
    }
}

impl ResponseError for ConnectorError {
    fn error_response(&self) -> HttpResponse {
        let message = match self {
            Self::Transient(_) => "Upstream service error",
            Self::Timeout(_) => "Upstream service timed out",
            Self::RateLimited { .. } => "Rate limit exceeded",
            Self::Client { .. } => "Request rejected by upstream service",
            Self::NotFound(_) => "Resource not found",
            Self::Credentials { .. } => "Provider credentials unavailable",
            Self::Integrity(_) => "Request failed integrity checks",
            Self::InvalidResponse(_) => "Invalid upstream response",
            Self::CircuitOpen(_) => "Service temporarily unavailable",
            Self::Internal(_) => "Internal error",
        };

        HttpResponse::build(self.status_code()).json(json!({
            "success": false,
            "error": {
                "kind": self.kind(),
                "message": message,
                "details": self.to_string(),
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Transient(_) | Self::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Client { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Credentials { .. } => StatusCode::UNAUTHORIZED,
            Self::Integrity(_) => StatusCode::BAD_REQUEST,
            Self::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(format!("Request timeout: {}", err))
        } else if err.is_connect() {
            Self::Transient(format!("Connection failed: {}", err))
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transient(err.to_string())
        }
    }
}
