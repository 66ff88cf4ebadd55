pub mod cache;
pub mod circuit_breaker;
pub mod credentials;
pub mod integration;
pub mod rate_limiter;
pub mod webhook;

pub use cache::CacheService;
pub use circuit_breaker::CircuitBreakerService;
pub use credentials::CredentialsService;
pub use integration::IntegrationService;
pub use rate_limiter::RateLimiter;
pub use webhook::WebhookService;
