//! Upstream tool-server client.
//!
//! Forwards allowed requests to the protected MCP server verbatim — the
//! gateway never rewrites payloads. Failures surface as gateway errors which
//! the dispatcher maps to a `-32002` reply with the original request id.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use portcullis_types::config::UpstreamConfig;
use portcullis_types::errors::GatewayError;
use portcullis_types::traits::UpstreamClient;

/// HTTP POST forwarder for MCP-over-HTTP upstreams.
pub struct HttpUpstream {
    client: Client,
    endpoint: String,
}

impl HttpUpstream {
    /// Build a forwarder from configuration.
    pub fn new(config: &UpstreamConfig) -> Result<Self, GatewayError> {
        Self::with_endpoint(
            format!("{}/mcp", config.base_url()),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Build a forwarder for an explicit endpoint URL.
    pub fn with_endpoint(endpoint: String, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Upstream(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn forward(&self, raw: &[u8]) -> Result<Vec<u8>, GatewayError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .header("x-forwarded-by", "portcullis")
            .body(raw.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(format!("upstream forward timed out: {e}"))
                } else {
                    GatewayError::Upstream(format!("upstream request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Upstream(format!(
                "upstream returned HTTP {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::Upstream(format!("failed to read upstream body: {e}")))?;
        debug!(bytes = body.len(), "upstream response relayed");
        Ok(body.to_vec())
    }
}
