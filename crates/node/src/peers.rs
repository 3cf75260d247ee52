use std::time::Duration;

use in3_node_types::{BlockRequest, SignatureAttestation};
use serde_json::{Value, json};

use crate::upstream::{UpstreamError, UpstreamFuture};

const MAX_PEER_RESPONSE_BYTES: usize = 1024 * 1024;

/// Asks other registered nodes for block attestations.
pub trait PeerClient: Send + Sync {
    fn request_signatures(
        &self,
        url: String,
        blocks: Vec<BlockRequest>,
    ) -> UpstreamFuture<'_, Vec<SignatureAttestation>>;
}

#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    http: reqwest::Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| UpstreamError::Transport {
                method: "in3_sign".to_string(),
                message: format!("failed to build HTTP client: {error}"),
            })?;
        Ok(Self { http })
    }

    async fn sign(
        &self,
        url: String,
        blocks: Vec<BlockRequest>,
    ) -> Result<Vec<SignatureAttestation>, UpstreamError> {
        let transport = |message: String| UpstreamError::Transport {
            method: "in3_sign".to_string(),
            message,
        };
        let invalid = |message: String| UpstreamError::InvalidResponse {
            method: "in3_sign".to_string(),
            message,
        };

        let response = self
            .http
            .post(&url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "in3_sign",
                "params": blocks,
            }))
            .send()
            .await
            .map_err(|error| transport(format!("{url}: {error}")))?;
        let status = response.status();
        if let Some(length) = response.content_length()
            && length > MAX_PEER_RESPONSE_BYTES as u64
        {
            return Err(invalid(format!("{url}: response of {length} bytes is too large")));
        }
        let raw = response
            .bytes()
            .await
            .map_err(|error| transport(format!("{url}: {error}")))?;
        if raw.len() > MAX_PEER_RESPONSE_BYTES {
            return Err(invalid(format!("{url}: response of {} bytes is too large", raw.len())));
        }
        if !status.is_success() {
            return Err(UpstreamError::Http {
                method: "in3_sign".to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&raw).into_owned(),
            });
        }

        let body: Value =
            serde_json::from_slice(&raw).map_err(|error| invalid(format!("{url}: {error}")))?;
        if let Some(error) = body.get("error") {
            return Err(UpstreamError::Rpc {
                method: "in3_sign".to_string(),
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error.to_string(),
            });
        }
        let result = body
            .get("result")
            .cloned()
            .ok_or_else(|| invalid(format!("{url}: response missing `result`")))?;
        serde_json::from_value(result).map_err(|error| invalid(format!("{url}: {error}")))
    }
}

impl PeerClient for HttpPeerClient {
    fn request_signatures(
        &self,
        url: String,
        blocks: Vec<BlockRequest>,
    ) -> UpstreamFuture<'_, Vec<SignatureAttestation>> {
        Box::pin(self.sign(url, blocks))
    }
}
