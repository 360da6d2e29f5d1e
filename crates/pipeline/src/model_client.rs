//! Client for the generative model that describes a video.
//!
//! The pipeline only needs one call, `generate(video_uri, prompt?) -> text`.
//! [`HttpModelClient`] is a thin [`reqwest`] wrapper around a JSON endpoint
//! that fetches the video itself from the given URI.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Mime type sent when the source extension is not recognised.
pub const DEFAULT_MIME_TYPE: &str = "video/mp4";

/// One generation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRequest {
    pub video_uri: String,
    pub mime_type: String,
    /// `None` sends the video alone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl ModelRequest {
    pub fn new(video_uri: impl Into<String>, prompt: Option<String>) -> Self {
        let video_uri = video_uri.into();
        let mime_type = mime_type_for(&video_uri).to_string();
        Self {
            video_uri,
            mime_type,
            prompt,
        }
    }
}

/// Mime type for a video URI, by extension.
pub fn mime_type_for(uri: &str) -> &'static str {
    let ext = uri
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        _ => DEFAULT_MIME_TYPE,
    }
}

/// Errors from a model call.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The model service returned a non-2xx status code.
    #[error("model API error ({status}): {body}")]
    ApiError {
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The service answered without any text.
    #[error("model returned an empty response")]
    EmptyResponse,
}

/// A generative model that turns a video (and optional prompt) into text.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, request: &ModelRequest) -> Result<String, ModelError>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    text: String,
}

/// Model client for an HTTP endpoint accepting
/// `POST {video_uri, mime_type, prompt}` and answering `{text}`.
#[derive(Debug, Clone)]
pub struct HttpModelClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpModelClient {
    /// * `endpoint` - Full URL of the generation endpoint.
    /// * `api_key` - Sent as a bearer token when present.
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint, api_key)
    }

    /// Reuse an existing [`reqwest::Client`] so producers share one
    /// connection pool.
    pub fn with_client(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    // ---- private helpers ----

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ModelError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ModelError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ModelError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn generate(&self, request: &ModelRequest) -> Result<String, ModelError> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;
        let parsed: GenerateResponse = Self::parse_response(response).await?;

        let text = parsed.text.trim();
        if text.is_empty() {
            return Err(ModelError::EmptyResponse);
        }
        Ok(text.to_string())
    }
}
