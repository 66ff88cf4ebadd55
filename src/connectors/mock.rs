//! Scripted provider used by tests and by local runs with the provider
//! connector disabled.

use super::errors::ConnectorError;
use super::provider::{
    Deployment, DeploymentRelease, DeploymentRequest, ModelHostingConnector, ModelInfo, ModelPage,
    ModelSearchQuery, ModelSummary, ModelVersion, ProviderResponse,
};
use crate::services::rate_limiter::RateLimitInfo;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

const ACCOUNT: &str = "modelgate";

fn seed_catalog() -> Vec<ModelSummary> {
    let model = |owner: &str, name: &str, description: &str, runs: u64| ModelSummary {
        owner: owner.to_string(),
        name: name.to_string(),
        description: Some(description.to_string()),
        visibility: Some("public".to_string()),
        run_count: Some(runs),
        url: Some(format!("https://replicate.com/{}/{}", owner, name)),
    };
    vec![
        model("meta", "llama-2-70b-chat", "70 billion parameter chat model", 12_000_000),
        model("meta", "llama-2-13b-chat", "13 billion parameter chat model", 4_500_000),
        model("stability-ai", "sdxl", "Text-to-image diffusion model", 60_000_000),
        model("openai", "whisper", "Speech recognition", 8_000_000),
    ]
}

#[derive(Default)]
struct MockState {
    catalog: Vec<ModelSummary>,
    deployments: HashMap<String, Deployment>,
    scripted_failures: VecDeque<ConnectorError>,
    rejected_keys: HashSet<String>,
    calls: HashMap<&'static str, u64>,
    last_api_key: Option<String>,
    rate_limit: Option<RateLimitInfo>,
    latency: Option<Duration>,
    unreachable: bool,
}

pub struct MockModelHostingConnector {
    state: Mutex<MockState>,
}

impl Default for MockModelHostingConnector {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState {
                catalog: seed_catalog(),
                ..Default::default()
            }),
        }
    }
}

impl MockModelHostingConnector {
    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next call fails with `err`. Failures queue up in order.
    pub fn fail_next(&self, err: ConnectorError) {
        self.state().scripted_failures.push_back(err);
    }

    pub fn fail_times(&self, times: usize, err: ConnectorError) {
        let mut state = self.state();
        for _ in 0..times {
            state.scripted_failures.push_back(err.clone());
        }
    }

    pub fn reject_api_key(&self, key: &str) {
        self.state().rejected_keys.insert(key.to_string());
    }

    /// Quota headers attached to every successful response
    pub fn set_rate_limit(&self, info: Option<RateLimitInfo>) {
        self.state().rate_limit = info;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    pub fn add_model(&self, model: ModelSummary) {
        self.state().catalog.push(model);
    }

    pub fn calls(&self, operation: &str) -> u64 {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.state().calls.values().sum()
    }

    pub fn last_api_key(&self) -> Option<String> {
        self.state().last_api_key.clone()
    }

    /// Shared preamble: count, delay, scripted failure, key check
    async fn enter(&self, operation: &'static str, api_key: &str) -> Result<Option<RateLimitInfo>, ConnectorError> {
        let latency = {
            let mut state = self.state();
            *state.calls.entry(operation).or_insert(0) += 1;
            state.last_api_key = Some(api_key.to_string());
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if let Some(err) = state.scripted_failures.pop_front() {
            return Err(err);
        }
        if api_key.is_empty() || state.rejected_keys.contains(api_key) {
            return Err(ConnectorError::Client {
                status: 401,
                message: "Invalid token".to_string(),
            });
        }
        Ok(state.rate_limit.clone())
    }
}

#[async_trait]
impl ModelHostingConnector for MockModelHostingConnector {
    async fn search_models(
        &self,
        api_key: &str,
        query: &ModelSearchQuery,
    ) -> Result<ProviderResponse<ModelPage>, ConnectorError> {
        let rate_limit = self.enter("search_models", api_key).await?;
        let needle = query.query.trim().to_lowercase();
        let mut results: Vec<ModelSummary> = self
            .state()
            .catalog
            .iter()
            .filter(|model| {
                needle.is_empty()
                    || model.name.to_lowercase().contains(&needle)
                    || model
                        .description
                        .as_deref()
                        .map(|d| d.to_lowercase().contains(&needle))
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            results.truncate(limit as usize);
        }

        Ok(ProviderResponse {
            data: ModelPage { results, next: None },
            rate_limit,
        })
    }

    async fn get_model(
        &self,
        api_key: &str,
        owner: &str,
        name: &str,
    ) -> Result<ProviderResponse<ModelInfo>, ConnectorError> {
        let rate_limit = self.enter("get_model", api_key).await?;
        let summary = self
            .state()
            .catalog
            .iter()
            .find(|m| m.owner == owner && m.name == name)
            .cloned()
            .ok_or_else(|| ConnectorError::NotFound(format!("model {}/{}", owner, name)))?;

        Ok(ProviderResponse {
            data: ModelInfo {
                github_url: None,
                license_url: None,
                latest_version: Some(ModelVersion {
                    id: format!("{:x}", summary.full_name().len() * 7919),
                    created_at: None,
                    cog_version: None,
                }),
                summary,
            },
            rate_limit,
        })
    }

    async fn create_deployment(
        &self,
        api_key: &str,
        request: &DeploymentRequest,
    ) -> Result<ProviderResponse<Deployment>, ConnectorError> {
        let rate_limit = self.enter("create_deployment", api_key).await?;
        let mut state = self.state();
        let key = format!("{}/{}", ACCOUNT, request.name);
        if state.deployments.contains_key(&key) {
            return Err(ConnectorError::Client {
                status: 409,
                message: format!("deployment {} already exists", key),
            });
        }

        let deployment = Deployment {
            owner: ACCOUNT.to_string(),
            name: request.name.clone(),
            current_release: Some(DeploymentRelease {
                number: 1,
                model: request.model.clone(),
                version: request.version.clone(),
                created_at: Some(chrono::Utc::now().to_rfc3339()),
                configuration: request.configuration.clone(),
            }),
        };
        state.deployments.insert(key, deployment.clone());
        Ok(ProviderResponse {
            data: deployment,
            rate_limit,
        })
    }

    async fn get_deployment(
        &self,
        api_key: &str,
        owner: &str,
        name: &str,
    ) -> Result<ProviderResponse<Deployment>, ConnectorError> {
        let rate_limit = self.enter("get_deployment", api_key).await?;
        let deployment = self
            .state()
            .deployments
            .get(&format!("{}/{}", owner, name))
            .cloned()
            .ok_or_else(|| ConnectorError::NotFound(format!("deployment {}/{}", owner, name)))?;
        Ok(ProviderResponse {
            data: deployment,
            rate_limit,
        })
    }

    async fn delete_deployment(
        &self,
        api_key: &str,
        owner: &str,
        name: &str,
    ) -> Result<ProviderResponse<()>, ConnectorError> {
        let rate_limit = self.enter("delete_deployment", api_key).await?;
        self.state()
            .deployments
            .remove(&format!("{}/{}", owner, name))
            .ok_or_else(|| ConnectorError::NotFound(format!("deployment {}/{}", owner, name)))?;
        Ok(ProviderResponse { data: (), rate_limit })
    }

    async fn verify_api_key(&self, api_key: &str) -> Result<(), ConnectorError> {
        self.enter("verify_api_key", api_key).await.map(|_| ())
    }

    async fn ping(&self) -> Result<(), ConnectorError> {
        if self.state().unreachable {
            return Err(ConnectorError::Transient("provider unreachable".to_string()));
        }
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "mock"
    }
}
