//! Registry Client
//!
//! HTTP client for a remote registry server.

use super::{
    ComponentRegistration, ComponentSummary, HeartbeatAck, ListFilter, RegisterAck,
    ServiceEndpoint, ServiceRecord, StatusFilter,
};
use crate::discovery::ServiceDiscoveryResponse;
use crate::error::RegistryClientError;
use crate::protocol::{ErrorBody, HeartbeatRequest, RegisterRequest, VersionsResponse};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const DEFAULT_REGISTRY_URL: &str = "http://localhost:8001";

#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    pub registry_url: String,

    pub timeout: Duration,

    pub max_retries: u32,

    pub user_agent: String,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            registry_url: DEFAULT_REGISTRY_URL.to_string(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
            user_agent: format!("hermes/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl RegistryClientConfig {
    pub fn with_url(url: &str) -> Self {
        Self {
            registry_url: url.trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

pub struct RegistryClient {
    config: RegistryClientConfig,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(config: RegistryClientConfig) -> Result<Self, RegistryClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| RegistryClientError::Setup(e.to_string()))?;

        Ok(Self { config, http })
    }

    pub fn base_url(&self) -> &str {
        &self.config.registry_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.registry_url, path)
    }

    pub async fn register(
        &self,
        registration: &ComponentRegistration,
        session: Option<&str>,
    ) -> Result<RegisterAck, RegistryClientError> {
        let body = RegisterRequest {
            registration: registration.clone(),
            session: session.map(str::to_string),
        };
        let url = self.url("/register");
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;

        decode(&url, &registration.id, response).await
    }

    /// Without an explicit `timestamp` the registry stamps the heartbeat
    /// with its own clock, the same one that aged the registration.
    pub async fn heartbeat(
        &self,
        id: &str,
        timestamp: Option<DateTime<Utc>>,
        unhealthy_endpoints: &[String],
    ) -> Result<HeartbeatAck, RegistryClientError> {
        let body = HeartbeatRequest {
            id: id.to_string(),
            timestamp,
            unhealthy_endpoints: unhealthy_endpoints.to_vec(),
        };
        let url = self.url("/heartbeat");

        self.with_retries(|| async {
            let response = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| unavailable(&url, e))?;
            decode(&url, id, response).await
        })
        .await
    }

    pub async fn unregister(&self, id: &str) -> Result<(), RegistryClientError> {
        let url = self.url(&format!("/unregister/{}", urlencoding::encode(id)));
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;

        let _: serde_json::Value = decode(&url, id, response).await?;
        Ok(())
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<ServiceRecord>, RegistryClientError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(ref component_type) = filter.component_type {
            query.push(("type", component_type.clone()));
        }
        if let Some(ref capability) = filter.capability {
            query.push(("capability", capability.clone()));
        }
        query.push(("status", status_param(filter.status).to_string()));

        let url = self.url("/services");
        self.with_retries(|| async {
            let response = self
                .http
                .get(&url)
                .query(&query)
                .send()
                .await
                .map_err(|e| unavailable(&url, e))?;
            decode(&url, "services", response).await
        })
        .await
    }

    pub async fn resolve(&self, name: &str) -> Result<ServiceDiscoveryResponse, RegistryClientError> {
        self.with_retries(|| self.resolve_once(name)).await
    }

    /// Single attempt, no retries. The invocation client tracks discovery
    /// failures itself.
    pub async fn resolve_once(
        &self,
        name: &str,
    ) -> Result<ServiceDiscoveryResponse, RegistryClientError> {
        let url = self.url(&format!("/services/{}/url", urlencoding::encode(name)));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable(&url, e))?;
        decode(&url, name, response).await
    }

    pub async fn endpoints(&self, name: &str) -> Result<Vec<ServiceEndpoint>, RegistryClientError> {
        let url = self.url(&format!("/services/{}/endpoints", urlencoding::encode(name)));
        self.with_retries(|| async {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| unavailable(&url, e))?;
            decode(&url, name, response).await
        })
        .await
    }

    pub async fn search(&self, query: &str) -> Result<Vec<ComponentSummary>, RegistryClientError> {
        let url = self.url("/search");
        self.with_retries(|| async {
            let response = self
                .http
                .get(&url)
                .query(&[("q", query)])
                .send()
                .await
                .map_err(|e| unavailable(&url, e))?;
            decode(&url, query, response).await
        })
        .await
    }

    /// Catalog metadata for `id`, from whichever registry source knows it.
    pub async fn metadata(&self, id: &str) -> Result<ComponentRegistration, RegistryClientError> {
        let url = self.url(&format!("/catalog/{}", urlencoding::encode(id)));
        self.with_retries(|| async {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| unavailable(&url, e))?;
            decode(&url, id, response).await
        })
        .await
    }

    pub async fn versions(&self, name: &str) -> Result<VersionsResponse, RegistryClientError> {
        let url = self.url(&format!("/catalog/{}/versions", urlencoding::encode(name)));
        self.with_retries(|| async {
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| unavailable(&url, e))?;
            decode(&url, name, response).await
        })
        .await
    }

    async fn with_retries<T, F, Fut>(&self, op: F) -> Result<T, RegistryClientError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RegistryClientError>>,
    {
        let attempts = self.config.max_retries.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err) if err.is_recoverable() && attempt + 1 < attempts => {
                    let delay = Duration::from_millis(100 * 2u64.pow(attempt));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn status_param(status: StatusFilter) -> &'static str {
    match status {
        StatusFilter::Healthy => "healthy",
        StatusFilter::Live => "live",
        StatusFilter::Degraded => "degraded",
        StatusFilter::Expired => "expired",
        StatusFilter::Any => "any",
    }
}

fn unavailable(url: &str, err: reqwest::Error) -> RegistryClientError {
    RegistryClientError::Unavailable {
        url: url.to_string(),
        reason: err.to_string(),
    }
}

async fn decode<T: DeserializeOwned>(
    url: &str,
    subject: &str,
    response: reqwest::Response,
) -> Result<T, RegistryClientError> {
    let status = response.status();

    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| RegistryClientError::InvalidResponse(e.to_string()));
    }

    let message = response
        .json::<ErrorBody>()
        .await
        .map(|body| body.message)
        .unwrap_or_else(|_| status.to_string());

    Err(match status.as_u16() {
        404 => RegistryClientError::NotFound(subject.to_string()),
        409 => RegistryClientError::DuplicateId(subject.to_string()),
        code if status.is_server_error() => RegistryClientError::Unavailable {
            url: url.to_string(),
            reason: format!("{} {}", code, message),
        },
        code => RegistryClientError::Rejected {
            status: code,
            message,
        },
    })
}
