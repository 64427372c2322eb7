//! Client for the downstream JSON-RPC service that publishes processed uploads.

use async_trait::async_trait;
use mediapub_core::models::{RpcRequest, RpcResponse};
use std::time::Duration;

/// Header carrying the acting user to the downstream service.
pub const USER_ID_HEADER: &str = "X-User-Id";

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Connection failure, timeout, 5xx, 408 or 429. Worth retrying.
    #[error("rpc transport error: {0}")]
    Transport(String),

    /// Any other 4xx: the same request will be refused again.
    #[error("rpc request rejected with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("rpc response could not be decoded: {0}")]
    Decode(String),
}

impl RpcError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}

fn rejects_request(status: reqwest::StatusCode) -> bool {
    status.is_client_error()
        && status != reqwest::StatusCode::REQUEST_TIMEOUT
        && status != reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// A JSON-RPC error in the response body is not an `RpcError`: it comes back
/// as `Ok` with `RpcResponse::error` set.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn call(&self, user_id: i64, request: &RpcRequest) -> Result<RpcResponse, RpcError>;
}

#[derive(Debug, Clone)]
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
}

impl JsonRpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RpcClient for JsonRpcClient {
    #[tracing::instrument(skip(self, request), fields(rpc.method = %request.method))]
    async fn call(&self, user_id: i64, request: &RpcRequest) -> Result<RpcResponse, RpcError> {
        let response = self
            .client
            .post(&self.url)
            .header(USER_ID_HEADER, user_id.to_string())
            .json(request)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if rejects_request(status) {
                return Err(RpcError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }
            return Err(RpcError::Transport(format!(
                "{} returned {status}: {body}",
                self.url
            )));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| RpcError::Decode(e.to_string()))?;
        if let Some(err) = &body.error {
            tracing::info!(code = err.code, message = %err.message, "RPC call returned an error");
        }
        Ok(body)
    }
}
