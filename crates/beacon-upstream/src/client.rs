//! HTTP client for the hub's upstream endpoints.

use crate::UpstreamError;
use beacon_types::{AgentStatus, PullResponse, PushData};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Connection settings for the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub agent_name: String,
    pub labels: Vec<String>,
}

impl UpstreamConfig {
    /// True when every field needed to talk to the hub is set.
    pub fn is_complete(&self) -> bool {
        !self.host.is_empty()
            && !self.username.is_empty()
            && !self.password.is_empty()
            && !self.agent_name.is_empty()
    }

    /// True when some but not all required fields are set.
    pub fn is_partial(&self) -> bool {
        let set = [&self.host, &self.username, &self.password, &self.agent_name]
            .iter()
            .filter(|v| !v.is_empty())
            .count();
        set > 0 && set < 4
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    config: UpstreamConfig,
    host: String,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        let host = config.host.trim_end_matches('/').to_string();
        Self {
            client,
            config,
            host,
        }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Sends one batch. Any non-2xx response is an error.
    pub async fn push(&self, data: &PushData) -> Result<(), UpstreamError> {
        let response = self
            .client
            .post(format!("{}/upstream/push", self.host))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(data)
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    /// Fetches rows the hub holds for this agent, changed after `since`.
    pub async fn pull(&self, since: Option<&str>) -> Result<PullResponse, UpstreamError> {
        let mut request = self
            .client
            .get(format!("{}/upstream/pull/{}", self.host, self.config.agent_name))
            .basic_auth(&self.config.username, Some(&self.config.password));
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }
        json(check(request.send().await?).await?).await
    }

    pub async fn status(&self) -> Result<AgentStatus, UpstreamError> {
        let response = self
            .client
            .get(format!("{}/upstream/status/{}", self.host, self.config.agent_name))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;
        json(check(response).await?).await
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::Rejected {
        status: status.as_u16(),
        body,
    })
}

async fn json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, UpstreamError> {
    Ok(response.json().await?)
}
