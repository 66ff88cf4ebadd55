//! External Service Connectors
//!
//! Adapters for the model hosting provider. Everything that talks to the
//! provider goes through [`ModelHostingConnector`], so services and routes
//! can run against [`MockModelHostingConnector`] in tests.
//!
//! ## Architecture Pattern
//!
//! 1. Trait and HTTP client in `provider.rs`
//! 2. Scripted mock in `mock.rs`
//! 3. Configuration in `config.rs`, the mock answers only when `mock` is set
//! 4. Services receive `Arc<dyn ModelHostingConnector>` and never see HTTP details

pub mod config;
pub mod errors;
pub mod mock;
pub mod provider;

use std::sync::Arc;

pub use config::{ConnectorConfig, ProviderConfig};
pub use errors::{ConnectorError, CredentialIssue};
pub use mock::MockModelHostingConnector;
pub use provider::{
    Deployment, DeploymentConfiguration, DeploymentRelease, DeploymentRequest, ModelHostingClient,
    ModelHostingConnector, ModelInfo, ModelPage, ModelSearchQuery, ModelSummary, ModelVersion,
    ProviderResponse,
};

/// Build the provider connector from configuration. A client that cannot
/// be built is a startup error, the mock is only used when asked for.
pub fn init(connector_config: &ConnectorConfig) -> Result<Arc<dyn ModelHostingConnector>, ConnectorError> {
    let config = &connector_config.provider;
    if config.mock {
        tracing::warn!("Provider connector in mock mode - every response is scripted");
        return Ok(Arc::new(MockModelHostingConnector::default()));
    }

    let client = ModelHostingClient::new(config).map_err(|err| {
        tracing::error!(error = %err, "Failed to initialize provider connector");
        err
    })?;
    tracing::info!("Provider connector initialized ({})", config.base_url);
    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_is_opt_in() {
        let config: ConnectorConfig = serde_json::from_value(serde_json::json!({"provider": {}})).unwrap();
        assert!(!config.provider.mock);
        let connector = init(&config).unwrap();
        assert_eq!(connector.backend(), "http");

        let mock: ConnectorConfig =
            serde_json::from_value(serde_json::json!({"provider": {"mock": true}})).unwrap();
        assert_eq!(init(&mock).unwrap().backend(), "mock");
    }
}
