//! HTTP embedding client: OpenAI-compatible text endpoint plus a DashScope-style multimodal
//! endpoint for images.

use super::{EmbeddingClient, EmbeddingClientError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

/// Connection settings for [`HttpEmbeddingClient`].
#[derive(Debug, Clone)]
pub struct HttpEmbeddingSettings {
    /// Base URL of the OpenAI-compatible API (the client appends `/embeddings`).
    pub api_url: String,
    /// Bearer token sent to both endpoints.
    pub api_key: Option<String>,
    /// Text embedding model.
    pub model: String,
    /// Full URL of the multimodal embedding endpoint.
    pub multimodal_url: Option<String>,
    /// Multimodal embedding model.
    pub multimodal_model: String,
    /// Dimension every vector must have.
    pub dimension: usize,
    /// Client-level request timeout.
    pub timeout: Duration,
}

/// Embedding client that calls remote HTTP APIs.
pub struct HttpEmbeddingClient {
    client: Client,
    settings: HttpEmbeddingSettings,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Deserialize)]
struct MultimodalResponse {
    output: MultimodalOutput,
}

#[derive(Deserialize)]
struct MultimodalOutput {
    #[serde(default)]
    embeddings: Vec<MultimodalEmbedding>,
}

#[derive(Deserialize)]
struct MultimodalEmbedding {
    embedding: Vec<f32>,
}

impl HttpEmbeddingClient {
    /// Build a client with the given settings.
    pub fn new(settings: HttpEmbeddingSettings) -> Result<Self, EmbeddingClientError> {
        let client = Client::builder()
            .user_agent("knowledge-ingest/0.1")
            .timeout(settings.timeout)
            .build()?;
        tracing::debug!(
            url = %settings.api_url,
            model = %settings.model,
            multimodal = settings.multimodal_url.is_some(),
            dimension = settings.dimension,
            "Initialized HTTP embedding client"
        );
        Ok(Self { client, settings })
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.post(url);
        if let Some(api_key) = &self.settings.api_key
            && !api_key.is_empty()
        {
            req = req.bearer_auth(api_key);
        }
        req
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), EmbeddingClientError> {
        if vector.len() != self.settings.dimension {
            return Err(EmbeddingClientError::DimensionMismatch {
                expected: self.settings.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

async fn error_for_status(response: reqwest::Response) -> EmbeddingClientError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let error = EmbeddingClientError::UnexpectedStatus { status, body };
    tracing::error!(error = %error, "Embedding request failed");
    error
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no texts provided".to_string(),
            ));
        }

        let sent = texts.len();
        let url = format!("{}/embeddings", self.settings.api_url.trim_end_matches('/'));
        let body = json!({
            "model": self.settings.model,
            "input": texts,
            "dimensions": self.settings.dimension,
            "encoding_format": "float",
        });

        let response = self.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let EmbeddingResponse { mut data } = response.json().await?;
        if data.len() != sent {
            return Err(EmbeddingClientError::CountMismatch {
                sent,
                received: data.len(),
            });
        }
        data.sort_by_key(|item| item.index);

        let vectors: Vec<Vec<f32>> = data.into_iter().map(|item| item.embedding).collect();
        for vector in &vectors {
            self.check_dimension(vector)?;
        }
        tracing::debug!(count = vectors.len(), model = %self.settings.model, "Generated embeddings");
        Ok(vectors)
    }

    async fn embed_image(&self, image_url: &str) -> Result<Vec<f32>, EmbeddingClientError> {
        let url = self.settings.multimodal_url.as_deref().ok_or_else(|| {
            EmbeddingClientError::Unsupported("MULTIMODAL_EMBEDDING_URL is not set".into())
        })?;
        let body = json!({
            "model": self.settings.multimodal_model,
            "input": { "contents": [ { "image": image_url } ] },
        });

        let response = self.post(url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let MultimodalResponse { output } = response.json().await?;
        let vector = output
            .embeddings
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| {
                EmbeddingClientError::GenerationFailed("multimodal response had no embeddings".into())
            })?;
        self.check_dimension(&vector)?;
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.settings.dimension
    }
}
