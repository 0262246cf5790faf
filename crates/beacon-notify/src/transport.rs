//! The contract for handing a rendered message to a delivery channel.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// One rendered message for one recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Delivery {
    /// Channel kind, e.g. `email`, `slack`. Empty when the target URL says it all.
    pub connection: String,
    /// Address or URL of the recipient.
    pub target: String,
    pub message: String,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no delivery endpoint for target '{0}'")]
    NoEndpoint(String),

    #[error("delivery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("delivery rejected with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, delivery: &Delivery) -> Result<(), TransportError>;
}

/// Posts deliveries as JSON.
///
/// An `http(s)` target receives the post directly; any other target (an
/// email address, a channel name) goes through the relay, if one is set.
pub struct HttpTransport {
    client: reqwest::Client,
    relay_url: Option<String>,
}

impl HttpTransport {
    pub fn new(relay_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client, relay_url }
    }

    fn endpoint<'a>(&'a self, delivery: &'a Delivery) -> Option<&'a str> {
        let target = delivery.target.as_str();
        if target.starts_with("http://") || target.starts_with("https://") {
            Some(target)
        } else {
            self.relay_url.as_deref()
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, delivery: &Delivery) -> Result<(), TransportError> {
        let endpoint = self
            .endpoint(delivery)
            .ok_or_else(|| TransportError::NoEndpoint(delivery.target.clone()))?;

        let response = self.client.post(endpoint).json(delivery).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected(status.as_u16()));
        }

        tracing::debug!(connection = %delivery.connection, endpoint, "delivered notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_selection() {
        let direct = HttpTransport::new(None);
        let url = Delivery {
            target: "https://hooks.example/x".to_string(),
            ..Default::default()
        };
        let email = Delivery {
            connection: "email".to_string(),
            target: "ada@example.com".to_string(),
            ..Default::default()
        };
        assert_eq!(direct.endpoint(&url), Some("https://hooks.example/x"));
        assert_eq!(direct.endpoint(&email), None);

        let relayed = HttpTransport::new(Some("http://relay.local/send".to_string()));
        assert_eq!(relayed.endpoint(&email), Some("http://relay.local/send"));
    }

    #[tokio::test]
    async fn non_url_target_without_relay_fails() {
        let err = HttpTransport::new(None)
            .send(&Delivery {
                target: "ops".to_string(),
                ..Default::default()
            })
            .await
            .expect_err("nowhere to send");
        assert!(matches!(err, TransportError::NoEndpoint(t) if t == "ops"));
    }
}
