use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Responses slower than this mark a component degraded
pub const SLOW_RESPONSE_THRESHOLD_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    fn severity(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Unhealthy => 2,
        }
    }

    /// The worse of the two
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub message: Option<String>,
    pub response_time_ms: Option<u64>,
    pub last_checked: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, serde_json::Value>>,
}

impl ComponentHealth {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            response_time_ms: Some(response_time_ms),
            last_checked: Utc::now(),
            details: None,
        }
    }

    pub fn unhealthy(error: String) -> Self {
        Self {
            status: ComponentStatus::Unhealthy,
            message: Some(error),
            response_time_ms: None,
            last_checked: Utc::now(),
            details: None,
        }
    }

    pub fn degraded(message: String, response_time_ms: Option<u64>) -> Self {
        Self {
            status: ComponentStatus::Degraded,
            message: Some(message),
            response_time_ms,
            last_checked: Utc::now(),
            details: None,
        }
    }

    /// Healthy, or degraded when `elapsed_ms` crosses the slow threshold
    pub fn responded(component: &str, elapsed_ms: u64) -> Self {
        if elapsed_ms > SLOW_RESPONSE_THRESHOLD_MS {
            Self::degraded(format!("{} responding slowly", component), Some(elapsed_ms))
        } else {
            Self::healthy(elapsed_ms)
        }
    }

    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.details
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: ComponentStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthCheckResponse {
    pub fn new(version: String, uptime_seconds: u64) -> Self {
        Self {
            status: ComponentStatus::Healthy,
            timestamp: Utc::now(),
            version,
            uptime_seconds,
            components: HashMap::new(),
        }
    }

    pub fn add_component(&mut self, name: &str, health: ComponentHealth) {
        self.status = self.status.worst(health.status);
        self.components.insert(name.to_string(), health);
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ComponentStatus::Healthy
    }
}
