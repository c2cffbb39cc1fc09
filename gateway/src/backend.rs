//! Client for the OpenAI-compatible inference backend.
//!
//! The request pipeline only needs three capabilities from the backend, so
//! they sit behind the [`ChatBackend`] trait. [`HttpBackend`] is the real
//! implementation on top of `reqwest`.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};

use crate::envelope::ChatRequest;

/// Body chunks of a streamed backend response. Dropping the stream cancels the call.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BackendError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Failed to create HTTP client: {0}")]
    Client(String),

    #[error("{0}")]
    Transport(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        BackendError::Transport(e.to_string())
    }
}

/// A fully read backend response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// A backend response whose body is still arriving.
pub struct UpstreamStream {
    pub status: StatusCode,
    pub body: ByteStream,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// POST /v1/chat/completions and read the whole response.
    async fn chat_completion(&self, request: &ChatRequest) -> Result<UpstreamResponse, BackendError>;

    /// POST /v1/chat/completions and return once response headers arrive.
    async fn chat_completion_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<UpstreamStream, BackendError>;

    /// GET /v1/models with its own timeout.
    async fn list_models(&self, timeout: Duration) -> Result<UpstreamResponse, BackendError>;
}

/// Backend reached over HTTP.
pub struct HttpBackend {
    http_client: Client,
    base_url: String,
}

impl HttpBackend {
    /// Create a client; `request_timeout` bounds each call end to end, body included.
    pub fn new(
        base_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http_client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| BackendError::Client(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    async fn read(response: reqwest::Response) -> Result<UpstreamResponse, BackendError> {
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            content_type,
            body,
        })
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<UpstreamResponse, BackendError> {
        let url = self.chat_url();
        tracing::debug!(url = %url, model = %request.model(), "Forwarding chat completion");

        let response = self.http_client.post(&url).json(request).send().await?;
        Self::read(response).await
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<UpstreamStream, BackendError> {
        let url = self.chat_url();
        tracing::debug!(url = %url, model = %request.model(), "Forwarding streaming chat completion");

        let response = self.http_client.post(&url).json(request).send().await?;
        let status = response.status();
        let body = response.bytes_stream().map_err(BackendError::from).boxed();

        Ok(UpstreamStream { status, body })
    }

    async fn list_models(&self, timeout: Duration) -> Result<UpstreamResponse, BackendError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self.http_client.get(&url).timeout(timeout).send().await?;
        Self::read(response).await
    }
}
