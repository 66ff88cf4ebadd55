use serde::{Deserialize, Serialize};

/// Configuration for external service connectors
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// Model hosting provider connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Serve scripted responses instead of calling the provider. Local runs only.
    #[serde(default)]
    pub mock: bool,
    /// Provider API base URL, without trailing slash
    #[serde(default = "ProviderConfig::default_base_url")]
    pub base_url: String,
    /// HTTP request timeout in seconds
    #[serde(default = "ProviderConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per request for transient failures (5xx, connection errors)
    #[serde(default = "ProviderConfig::default_retry_attempts")]
    pub retry_attempts: usize,
    /// Page size for model search when the caller does not set one
    #[serde(default = "ProviderConfig::default_page_size")]
    pub page_size: u32,
}

impl ProviderConfig {
    fn default_base_url() -> String {
        "https://api.replicate.com/v1".to_string()
    }

    const fn default_timeout_secs() -> u64 {
        30
    }

    const fn default_retry_attempts() -> usize {
        3
    }

    const fn default_page_size() -> u32 {
        20
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            mock: false,
            base_url: Self::default_base_url(),
            timeout_secs: Self::default_timeout_secs(),
            retry_attempts: Self::default_retry_attempts(),
            page_size: Self::default_page_size(),
        }
    }
}
