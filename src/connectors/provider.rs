use super::config::ProviderConfig;
use super::errors::ConnectorError;
use crate::services::rate_limiter::RateLimitInfo;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::Instrument;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ModelSummary {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub run_count: Option<u64>,
    #[serde(default)]
    pub url: Option<String>,
}

impl ModelSummary {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ModelPage {
    #[serde(default)]
    pub results: Vec<ModelSummary>,
    /// Cursor for the next page
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ModelVersion {
    pub id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub cog_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ModelInfo {
    #[serde(flatten)]
    pub summary: ModelSummary,
    #[serde(default)]
    pub github_url: Option<String>,
    #[serde(default)]
    pub license_url: Option<String>,
    #[serde(default)]
    pub latest_version: Option<ModelVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelSearchQuery {
    pub query: String,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub cursor: Option<String>,
}

impl ModelSearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentConfiguration {
    pub hardware: String,
    #[serde(default)]
    pub min_instances: u32,
    #[serde(default = "DeploymentConfiguration::default_max_instances")]
    pub max_instances: u32,
}

impl DeploymentConfiguration {
    const fn default_max_instances() -> u32 {
        1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRequest {
    pub name: String,
    /// `owner/name` of the model to serve
    pub model: String,
    pub version: String,
    #[serde(flatten)]
    pub configuration: DeploymentConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRelease {
    pub number: u32,
    pub model: String,
    pub version: String,
    #[serde(default)]
    pub created_at: Option<String>,
    pub configuration: DeploymentConfiguration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub current_release: Option<DeploymentRelease>,
}

/// Parsed provider payload plus the quota headers that came with it
#[derive(Debug, Clone)]
pub struct ProviderResponse<T> {
    pub data: T,
    pub rate_limit: Option<RateLimitInfo>,
}

impl<T> ProviderResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data, rate_limit: None }
    }
}

#[async_trait]
pub trait ModelHostingConnector: Send + Sync {
    async fn search_models(
        &self,
        api_key: &str,
        query: &ModelSearchQuery,
    ) -> Result<ProviderResponse<ModelPage>, ConnectorError>;

    async fn get_model(
        &self,
        api_key: &str,
        owner: &str,
        name: &str,
    ) -> Result<ProviderResponse<ModelInfo>, ConnectorError>;

    async fn create_deployment(
        &self,
        api_key: &str,
        request: &DeploymentRequest,
    ) -> Result<ProviderResponse<Deployment>, ConnectorError>;

    async fn get_deployment(
        &self,
        api_key: &str,
        owner: &str,
        name: &str,
    ) -> Result<ProviderResponse<Deployment>, ConnectorError>;

    async fn delete_deployment(
        &self,
        api_key: &str,
        owner: &str,
        name: &str,
    ) -> Result<ProviderResponse<()>, ConnectorError>;

    /// Succeeds when the provider accepts the key
    async fn verify_api_key(&self, api_key: &str) -> Result<(), ConnectorError>;

    /// Unauthenticated reachability check
    async fn ping(&self) -> Result<(), ConnectorError>;

    fn backend(&self) -> &'static str {
        "http"
    }
}

pub struct ModelHostingClient {
    base_url: String,
    http_client: reqwest::Client,
    retry_attempts: usize,
    page_size: u32,
    user_agent: String,
}

/// A 429 without quota headers still has to slow us down
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

impl ModelHostingClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ConnectorError> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ConnectorError::Internal(format!("HTTP client error: {}", err)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http_client,
            retry_attempts: config.retry_attempts.max(1),
            page_size: config.page_size.clamp(1, 100),
            user_agent: format!("modelgate/{}", env!("CARGO_PKG_VERSION")),
        })
    }

    fn encode_segment(segment: &str) -> String {
        urlencoding::encode(segment).into_owned()
    }

    fn error_for(status: StatusCode, text: String, rate_limit: Option<RateLimitInfo>) -> ConnectorError {
        match status {
            StatusCode::NOT_FOUND => ConnectorError::NotFound(text),
            StatusCode::TOO_MANY_REQUESTS => ConnectorError::RateLimited {
                message: text,
                info: Some(rate_limit.unwrap_or(RateLimitInfo {
                    retry_after: Some(DEFAULT_RETRY_AFTER),
                    ..Default::default()
                })),
            },
            status if status.is_server_error() => {
                ConnectorError::Transient(format!("Provider error {}: {}", status, text))
            }
            status => ConnectorError::Client {
                status: status.as_u16(),
                message: text,
            },
        }
    }

    /// Send with retries on 5xx and connection failures, doubling the
    /// backoff from 100ms. Other failures return immediately.
    async fn send_request(
        &self,
        method: Method,
        path: &str,
        api_key: Option<&str>,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<ProviderResponse<Option<Value>>, ConnectorError> {
        let mut attempt = 0usize;
        let mut last_error: Option<ConnectorError> = None;

        while attempt < self.retry_attempts {
            attempt += 1;
            let mut builder = self
                .http_client
                .request(method.clone(), format!("{}{}", self.base_url, path))
                .header("User-Agent", &self.user_agent);

            if let Some(key) = api_key {
                builder = builder.bearer_auth(key);
            }
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let span = tracing::info_span!("provider_http_request", path, attempt, method = %method);

            match builder.send().instrument(span).await {
                Ok(resp) => {
                    let status = resp.status();
                    let rate_limit = RateLimitInfo::from_headers(resp.headers());
                    let text = resp.text().await.map_err(ConnectorError::from)?;

                    if status.is_success() {
                        let data = if text.trim().is_empty() {
                            None
                        } else {
                            Some(
                                serde_json::from_str::<Value>(&text)
                                    .map_err(|_| ConnectorError::InvalidResponse(text))?,
                            )
                        };
                        return Ok(ProviderResponse { data, rate_limit });
                    }

                    let error = Self::error_for(status, text, rate_limit);
                    if !status.is_server_error() {
                        return Err(error);
                    }
                    tracing::debug!(attempt, %status, "Provider returned server error");
                    last_error = Some(error);
                }
                Err(err) => {
                    let error = ConnectorError::from(err);
                    if !error.counts_as_failure() {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
            }

            if attempt < self.retry_attempts {
                let backoff = Duration::from_millis(100 * (1_u64 << (attempt - 1)));
                tokio::time::sleep(backoff).await;
            }
        }

        Err(last_error.unwrap_or_else(|| ConnectorError::Transient("Provider request failed".to_string())))
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        api_key: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<ProviderResponse<T>, ConnectorError> {
        let response = self.send_request(method, path, Some(api_key), query, body).await?;
        let payload = response
            .data
            .ok_or_else(|| ConnectorError::InvalidResponse(format!("{} returned an empty body", path)))?;
        let data = serde_json::from_value::<T>(payload)
            .map_err(|err| ConnectorError::InvalidResponse(format!("{}: {}", path, err)))?;
        Ok(ProviderResponse {
            data,
            rate_limit: response.rate_limit,
        })
    }
}

#[async_trait]
impl ModelHostingConnector for ModelHostingClient {
    #[tracing::instrument(name = "Provider search models", skip(self, api_key))]
    async fn search_models(
        &self,
        api_key: &str,
        query: &ModelSearchQuery,
    ) -> Result<ProviderResponse<ModelPage>, ConnectorError> {
        let mut params = vec![
            ("query".to_string(), query.query.trim().to_string()),
            ("limit".to_string(), query.limit.unwrap_or(self.page_size).to_string()),
        ];
        if let Some(cursor) = &query.cursor {
            params.push(("cursor".to_string(), cursor.clone()));
        }
        self.request_json(Method::GET, "/models", api_key, &params, None).await
    }

    #[tracing::instrument(name = "Provider get model", skip(self, api_key))]
    async fn get_model(
        &self,
        api_key: &str,
        owner: &str,
        name: &str,
    ) -> Result<ProviderResponse<ModelInfo>, ConnectorError> {
        let path = format!(
            "/models/{}/{}",
            Self::encode_segment(owner),
            Self::encode_segment(name)
        );
        self.request_json(Method::GET, &path, api_key, &[], None).await
    }

    #[tracing::instrument(name = "Provider create deployment", skip(self, api_key, request), fields(deployment = %request.name))]
    async fn create_deployment(
        &self,
        api_key: &str,
        request: &DeploymentRequest,
    ) -> Result<ProviderResponse<Deployment>, ConnectorError> {
        let body = serde_json::to_value(request)
            .map_err(|err| ConnectorError::Internal(format!("Deployment encode failed: {}", err)))?;
        self.request_json(Method::POST, "/deployments", api_key, &[], Some(&body))
            .await
    }

    #[tracing::instrument(name = "Provider get deployment", skip(self, api_key))]
    async fn get_deployment(
        &self,
        api_key: &str,
        owner: &str,
        name: &str,
    ) -> Result<ProviderResponse<Deployment>, ConnectorError> {
        let path = format!(
            "/deployments/{}/{}",
            Self::encode_segment(owner),
            Self::encode_segment(name)
        );
        self.request_json(Method::GET, &path, api_key, &[], None).await
    }

    #[tracing::instrument(name = "Provider delete deployment", skip(self, api_key))]
    async fn delete_deployment(
        &self,
        api_key: &str,
        owner: &str,
        name: &str,
    ) -> Result<ProviderResponse<()>, ConnectorError> {
        let path = format!(
            "/deployments/{}/{}",
            Self::encode_segment(owner),
            Self::encode_segment(name)
        );
        let response = self
            .send_request(Method::DELETE, &path, Some(api_key), &[], None)
            .await?;
        Ok(ProviderResponse {
            data: (),
            rate_limit: response.rate_limit,
        })
    }

    async fn verify_api_key(&self, api_key: &str) -> Result<(), ConnectorError> {
        self.send_request(Method::GET, "/account", Some(api_key), &[], None)
            .await
            .map(|_| ())
    }

    async fn ping(&self) -> Result<(), ConnectorError> {
        // any HTTP answer, even 401, means the provider is reachable
        match self.send_request(Method::GET, "/account", None, &[], None).await {
            Ok(_) | Err(ConnectorError::Client { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}
