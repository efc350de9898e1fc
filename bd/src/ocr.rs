//! OCR client trait and the HTTP endpoint driver
//!
//! Each configured OCR engine is a named provider behind the same trait;
//! the page pipeline fans one recognize call out per engine and blends the
//! results downstream.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::OcrProviderConfig;

/// Recognized text for one page image
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcrOutput {
    /// Plain recognized text
    pub text: String,

    /// Markdown rendition, when the engine produces one
    pub markdown: Option<String>,

    pub cost_usd: f64,

    pub tokens: u64,
}

/// Errors from OCR drivers
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("api error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("cannot read page image {path}: {source}")]
    Image {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl OcrError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            OcrError::RateLimited { .. } => true,
            OcrError::ApiError { status, .. } => *status >= 500,
            OcrError::Network(_) => true,
            OcrError::Image { .. } => false,
            OcrError::InvalidResponse(_) => false,
        }
    }
}

/// Trait for OCR engines
#[async_trait]
pub trait OcrClient: Send + Sync {
    /// Recognize text on one page image
    async fn recognize(&self, image_path: &Path) -> Result<OcrOutput, OcrError>;
}

/// Generic HTTP OCR endpoint driver
///
/// Posts the page image as base64 JSON and expects
/// `{ "text": ..., "markdown"?: ..., "cost_usd"?: ..., "tokens"?: ... }`.
pub struct HttpOcrClient {
    endpoint: String,
    api_key: Option<String>,
    http: Client,
}

impl HttpOcrClient {
    /// Create a new client from provider configuration
    pub fn from_config(config: &OcrProviderConfig) -> Result<Self, OcrError> {
        let api_key = config
            .api_key_env
            .as_ref()
            .and_then(|env_var| std::env::var(env_var).ok());

        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(OcrError::Network)?;

        Ok(Self {
            endpoint: config.endpoint.clone(),
            api_key,
            http,
        })
    }
}

#[async_trait]
impl OcrClient for HttpOcrClient {
    async fn recognize(&self, image_path: &Path) -> Result<OcrOutput, OcrError> {
        let bytes = tokio::fs::read(image_path).await.map_err(|source| OcrError::Image {
            path: image_path.to_path_buf(),
            source,
        })?;

        let body = serde_json::json!({
            "image": BASE64.encode(&bytes),
            "filename": image_path.file_name().and_then(|n| n.to_str()),
        });

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;

        if response.status().as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(30);
            return Err(OcrError::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            });
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(OcrError::ApiError { status, message });
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| OcrError::InvalidResponse(e.to_string()))?;

        let text = parsed
            .get("text")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OcrError::InvalidResponse("missing text field".to_string()))?
            .to_string();

        Ok(OcrOutput {
            text,
            markdown: parsed.get("markdown").and_then(|v| v.as_str()).map(String::from),
            cost_usd: parsed.get("cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0),
            tokens: parsed.get("tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(
            OcrError::RateLimited {
                retry_after: Duration::from_secs(5)
            }
            .is_retryable()
        );
        assert!(
            OcrError::ApiError {
                status: 502,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !OcrError::ApiError {
                status: 422,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!OcrError::InvalidResponse("missing text".to_string()).is_retryable());
    }
}
