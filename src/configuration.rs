use crate::connectors::ConnectorConfig;
use crate::services::cache::CacheConfig;
use crate::services::circuit_breaker::CircuitBreakerSettings;
use crate::services::credentials::CredentialsConfig;
use crate::services::integration::IntegrationConfig;
use crate::services::rate_limiter::RateLimiterConfig;
use crate::services::webhook::WebhookConfig;
use serde;

pub const MASTER_SECRET_ENV: &str = "MODELGATE_MASTER_SECRET";
pub const WEBHOOK_SECRET_ENV: &str = "MODELGATE_WEBHOOK_SECRET";
pub const BOOTSTRAP_TOKEN_ENV: &str = "MODELGATE_BOOTSTRAP_TOKEN";

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub app: AppSettings,
    /// Credentials live in memory when no database is configured
    #[serde(default)]
    pub database: Option<DatabaseSettings>,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub circuit_breakers: CircuitBreakerSettings,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub connectors: ConnectorConfig,
    #[serde(default)]
    pub integration: IntegrationConfig,
    /// Provider key stored for the default organization on first start
    #[serde(skip)]
    pub bootstrap_api_key: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AppSettings {
    #[serde(default = "AppSettings::default_host")]
    pub host: String,
    #[serde(default = "AppSettings::default_port")]
    pub port: u16,
    /// Health snapshots kept for `/health_check/metrics`
    #[serde(default = "AppSettings::default_health_history")]
    pub health_history: usize,
}

impl AppSettings {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    const fn default_port() -> u16 {
        8000
    }

    const fn default_health_history() -> usize {
        1_000
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            health_history: Self::default_health_history(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    #[serde(default = "DatabaseSettings::default_max_connections")]
    pub max_connections: u32,
}

impl DatabaseSettings {
    const fn default_max_connections() -> u32 {
        5
    }

    // Connection string: postgresql://<username>:<password>@<host>:<port>/<database_name>
    pub fn connection_string(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database_name,
        )
    }

    pub fn connection_string_without_db(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}",
            self.username, self.password, self.host, self.port,
        )
    }
}

impl Settings {
    /// Secrets are never read from the configuration file
    pub fn apply_secrets_from_env(&mut self) {
        if let Ok(secret) = std::env::var(MASTER_SECRET_ENV) {
            self.credentials.master_secret = Some(secret);
        }
        if let Ok(secret) = std::env::var(WEBHOOK_SECRET_ENV) {
            self.webhook.secret = Some(secret);
        }
        if let Ok(token) = std::env::var(BOOTSTRAP_TOKEN_ENV) {
            self.bootstrap_api_key = Some(token).filter(|t| !t.trim().is_empty());
        }
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // `configuration.yaml` is optional, `MODELGATE__CACHE__REDIS_URL` style
    // variables override it
    let settings = config::Config::builder()
        .add_source(config::File::with_name("configuration").required(false))
        .add_source(
            config::Environment::with_prefix("MODELGATE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mut config: Settings = settings.try_deserialize()?;
    config.apply_secrets_from_env();

    Ok(config)
}
