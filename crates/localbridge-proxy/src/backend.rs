//! HTTP client for the local OpenAI-compatible backend.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::ProxyError;
use crate::types::{ChatCompletion, ChatCompletionRequest, Usage};

/// Text and usage extracted from a buffered completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionOutput {
    pub text: String,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl BackendClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ProxyError> {
        // No client-level timeout: each call is bounded by `timeout` as a
        // whole, including the time spent reading a streamed body.
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    pub(crate) fn timeout_error(&self) -> ProxyError {
        ProxyError::BackendTimeout {
            timeout_ms: self.timeout_ms(),
        }
    }

    /// Buffered completion. The whole exchange is bounded by the timeout;
    /// on expiry the request future is dropped, which aborts the connection.
    pub async fn complete(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<CompletionOutput, ProxyError> {
        let exchange = async {
            let response = self.send(request).await?;
            let completion: ChatCompletion = response
                .json()
                .await
                .map_err(|e| ProxyError::BackendDecode(e.to_string()))?;
            Ok(CompletionOutput {
                text: completion.first_text().to_string(),
                usage: completion.usage(),
            })
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .unwrap_or_else(|_| {
                warn!(timeout_ms = self.timeout_ms(), model = %request.model, "backend call timed out");
                Err(self.timeout_error())
            })
    }

    /// Issue a streaming request and return the response once headers arrive.
    ///
    /// The caller is responsible for bounding the body read with the same
    /// deadline.
    pub async fn open_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, ProxyError> {
        self.send(request).await
    }

    async fn send(&self, request: &ChatCompletionRequest) -> Result<reqwest::Response, ProxyError> {
        debug!(
            endpoint = %self.endpoint,
            model = %request.model,
            stream = request.stream,
            messages = request.messages.len(),
            "calling backend"
        );

        let response = self.http.post(&self.endpoint).json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = %body, "backend error");
            return Err(ProxyError::BackendHttp {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}
