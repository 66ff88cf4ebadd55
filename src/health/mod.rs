mod checks;
mod metrics;
mod models;

pub use checks::HealthChecker;
pub use metrics::{ComponentStats, HealthMetrics, MetricSnapshot};
pub use models::{ComponentHealth, ComponentStatus, HealthCheckResponse, SLOW_RESPONSE_THRESHOLD_MS};
