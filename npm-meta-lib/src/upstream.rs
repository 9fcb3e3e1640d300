//! HTTP client for the Nginx Proxy Manager REST API
//!
//! Wraps the token endpoint and the stream (port-forward) endpoints. Every
//! call is bounded by the client timeout; timeouts and connection failures
//! surface as `UpstreamUnavailable`.

use crate::error::{MetaError, Result};
use crate::types::{Config, ForwardingRule, RuleId, RuleSpec};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Token returned by a successful upstream login.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamToken {
    pub token: String,
    /// Expiry as reported by NPM, if any
    #[serde(default)]
    pub expires: Option<String>,
}

/// Operations the reconciliation layer needs from NPM.
#[async_trait]
pub trait StreamApi: Send + Sync {
    /// Exchange credentials for an API token
    async fn login(&self, identity: &str, secret: &str) -> Result<UpstreamToken>;

    /// All streams currently configured upstream
    async fn list_streams(&self, token: &str) -> Result<Vec<ForwardingRule>>;

    /// Create a stream; upstream assigns the id
    async fn create_stream(&self, token: &str, spec: &RuleSpec) -> Result<ForwardingRule>;

    /// Delete a stream by id
    async fn delete_stream(&self, token: &str, id: RuleId) -> Result<()>;
}

/// reqwest-based client for NPM
pub struct NpmClient {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl NpmClient {
    /// Create a client for the API at `base_url` (e.g. `http://npm.lan:81/api`)
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MetaError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::from_reqwest_client(base_url, timeout, client))
    }

    /// Create a client from the runtime configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.npm_url, config.upstream_timeout)
    }

    /// Create a new NpmClient from an existing reqwest Client
    pub fn from_reqwest_client(base_url: &str, timeout: Duration, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn send_error(&self, e: reqwest::Error) -> MetaError {
        if e.is_timeout() {
            MetaError::unavailable(format!(
                "NPM did not answer within {}s",
                self.timeout.as_secs_f32()
            ))
        } else {
            MetaError::unavailable(format!("Request to NPM failed: {}", e))
        }
    }

    async fn parse_json<T: for<'de> Deserialize<'de>>(&self, response: reqwest::Response) -> Result<T> {
        response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.send_error(e)
            } else {
                MetaError::Other(anyhow::anyhow!("Unexpected response from NPM: {}", e))
            }
        })
    }
}

/// Pull the human-readable message out of an NPM error body.
///
/// NPM answers `{"error": {"code": 400, "message": "..."}}`; anything else is
/// passed through as raw text.
pub(crate) fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value
            .pointer("/error/message")
            .or_else(|| value.get("message"))
            .and_then(|m| m.as_str())
        {
            return message.to_string();
        }
    }
    if body.trim().is_empty() {
        format!("HTTP {}", status)
    } else {
        body.trim().to_string()
    }
}

/// Map a non-success status to the error taxonomy.
async fn failure(response: reqwest::Response) -> MetaError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = error_message(status, &body);

    if status == StatusCode::UNAUTHORIZED {
        MetaError::auth(message)
    } else if status.is_server_error() {
        MetaError::unavailable(format!("NPM returned {}: {}", status, message))
    } else {
        MetaError::rejected(status.as_u16(), message)
    }
}

#[async_trait]
impl StreamApi for NpmClient {
    async fn login(&self, identity: &str, secret: &str) -> Result<UpstreamToken> {
        tracing::debug!(identity, "Requesting NPM token");
        let response = self
            .client
            .post(self.url("/tokens"))
            .json(&json!({ "identity": identity, "secret": secret }))
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        let status = response.status();
        if status.is_success() {
            return self.parse_json(response).await;
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(MetaError::auth(error_message(status, &body)));
        }
        Err(failure(response).await)
    }

    async fn list_streams(&self, token: &str) -> Result<Vec<ForwardingRule>> {
        let response = self
            .client
            .get(self.url("/nginx/streams"))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        if !response.status().is_success() {
            return Err(failure(response).await);
        }
        let rules: Vec<ForwardingRule> = self.parse_json(response).await?;
        tracing::debug!(count = rules.len(), "Fetched NPM streams");
        Ok(rules)
    }

    async fn create_stream(&self, token: &str, spec: &RuleSpec) -> Result<ForwardingRule> {
        let payload = json!({
            "incoming_port": spec.incoming_port,
            "forwarding_host": spec.forwarding_host,
            "forwarding_port": spec.forwarding_port,
            "tcp_forwarding": spec.tcp_forwarding,
            "udp_forwarding": spec.udp_forwarding,
            "certificate_id": 0,
            "meta": {},
        });
        tracing::debug!(
            incoming_port = spec.incoming_port,
            forwarding_host = %spec.forwarding_host,
            forwarding_port = spec.forwarding_port,
            "Creating NPM stream"
        );

        let response = self
            .client
            .post(self.url("/nginx/streams"))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        if !response.status().is_success() {
            return Err(failure(response).await);
        }
        self.parse_json(response).await
    }

    async fn delete_stream(&self, token: &str, id: RuleId) -> Result<()> {
        tracing::debug!(rule_id = id, "Deleting NPM stream");
        let response = self
            .client
            .delete(self.url(&format!("/nginx/streams/{}", id)))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(MetaError::RuleNotFound(id)),
            _ => Err(failure(response).await),
        }
    }
}
