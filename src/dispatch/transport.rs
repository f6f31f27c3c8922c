//! HTTP transport abstraction.

use async_trait::async_trait;
use reqwest::Client;
use tracing::trace;

use super::request::OutboundRequest;
use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};

/// HTTP status the upstream uses to signal throttling.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// A raw response from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Human-readable status description
    pub reason: String,
    /// Undecoded body
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16, reason: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            reason: reason.into(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_throttled(&self) -> bool {
        self.status == STATUS_TOO_MANY_REQUESTS
    }

    /// Status plus description, e.g. `500 Internal Server Error`.
    pub fn status_text(&self) -> String {
        if self.reason.is_empty() {
            self.status.to_string()
        } else {
            format!("{} {}", self.status, self.reason)
        }
    }
}

/// Trait for issuing GET requests.
///
/// Implementations report network-level failures as `Err`; any response that
/// arrived, whatever its status, is `Ok`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: &OutboundRequest) -> Result<TransportResponse>;
}

/// Transport backed by a `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Build a client from the dispatcher configuration.
    pub fn new(config: &DispatcherConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| DispatchError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, request: &OutboundRequest) -> Result<TransportResponse> {
        let mut builder = self.client.get(request.url.clone());
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| DispatchError::network(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| DispatchError::network(e.without_url().to_string()))?;

        trace!(
            status = status.as_u16(),
            bytes = body.len(),
            "Transport response received"
        );

        Ok(TransportResponse::new(
            status.as_u16(),
            status.canonical_reason().unwrap_or_default(),
            body.to_vec(),
        ))
    }
}
