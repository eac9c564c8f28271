//! HTTP embedding provider for OpenAI/Azure OpenAI compatible `/embeddings` APIs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::EmbeddingProvider;
use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
    dimensions: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `api-key: <key>` (Azure OpenAI)
    ApiKey,
}

pub struct HttpEmbeddingProvider {
    endpoint: String,
    api_key: Option<String>,
    auth: AuthStyle,
    model: String,
    dimensions: usize,
    http_client: reqwest::Client,
}

impl HttpEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .filter(|e| !e.trim().is_empty())
            .context("embedding.endpoint is required for the http provider")?;
        let auth = match config.auth_style.as_str() {
            "bearer" => AuthStyle::Bearer,
            "api-key" => AuthStyle::ApiKey,
            other => anyhow::bail!("unknown embedding.auth_style: {other}. Supported: bearer, api-key"),
        };
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build embedding HTTP client")?;

        Ok(Self {
            endpoint,
            api_key: config.api_key.clone(),
            auth,
            model: config.model.clone(),
            dimensions: config.dimensions,
            http_client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_raw(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = EmbeddingRequest {
            input: text,
            model: &self.model,
            dimensions: self.dimensions,
        };

        let mut request = self.http_client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            request = match self.auth {
                AuthStyle::Bearer => request.bearer_auth(key),
                AuthStyle::ApiKey => request.header("api-key", key),
            };
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbeddingError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EmbeddingError::Status(status.as_u16()));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Response(e.to_string()))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::Response("no embeddings in response".into()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model(&self) -> &str {
        &self.model
    }
}
