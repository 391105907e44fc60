use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub job_id: i64,
    pub name: String,
    pub output_location: String,
}

/// Starts a deployment of a finished job's output and returns the live URL.
#[async_trait]
pub trait DeploymentTrigger: Send + Sync {
    async fn deploy(&self, request: &DeployRequest) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct DeployResponse {
    url: String,
}

/// POSTs the request as JSON to a webhook that answers `{"url": "..."}`.
pub struct WebhookDeployTrigger {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookDeployTrigger {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            token,
        }
    }
}

#[async_trait]
impl DeploymentTrigger for WebhookDeployTrigger {
    async fn deploy(&self, request: &DeployRequest) -> Result<String> {
        let mut req = self
            .client
            .post(&self.url)
            .header("Accept", "application/json")
            .json(request);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        let resp = req
            .send()
            .await
            .context("Failed to send deployment request")?
            .error_for_status()
            .context("Deployment webhook returned error status")?
            .json::<DeployResponse>()
            .await
            .context("Failed to parse deployment response")?;

        tracing::info!(job_id = request.job_id, url = %resp.url, "Deployment triggered");
        Ok(resp.url)
    }
}
