use crate::config::{Config, EmbeddingProvider};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;

mod http;

pub use http::{HttpEmbeddingClient, HttpEmbeddingSettings};

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingClientError {
    /// Provider was unable to produce embeddings for the supplied input.
    #[error("Failed to generate embeddings: {0}")]
    GenerationFailed(String),
    /// HTTP layer failed before receiving a response.
    #[error("Embedding request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Provider answered with a non-success status.
    #[error("Unexpected embedding response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the provider.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Returned vector length differs from the configured dimension.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension fixed for the vector collection.
        expected: usize,
        /// Dimension returned by the provider.
        actual: usize,
    },
    /// Provider returned a different number of vectors than inputs.
    #[error("Embedding count mismatch: sent {sent}, received {received}")]
    CountMismatch {
        /// Number of inputs sent.
        sent: usize,
        /// Number of vectors received.
        received: usize,
    },
    /// Requested modality is not configured.
    #[error("Embedding modality unavailable: {0}")]
    Unsupported(String),
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce an embedding vector for each supplied chunk of text, in input order.
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError>;

    /// Produce an embedding for a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingClientError> {
        let mut vectors = self.generate_embeddings(vec![text.to_string()]).await?;
        match (vectors.pop(), vectors.is_empty()) {
            (Some(vector), true) => Ok(vector),
            (None, _) => Err(EmbeddingClientError::CountMismatch {
                sent: 1,
                received: 0,
            }),
            (Some(_), false) => Err(EmbeddingClientError::CountMismatch {
                sent: 1,
                received: vectors.len() + 1,
            }),
        }
    }

    /// Produce an embedding for an image reachable at `image_url`.
    async fn embed_image(&self, image_url: &str) -> Result<Vec<f32>, EmbeddingClientError>;

    /// Dimension every returned vector must have.
    fn dimension(&self) -> usize;
}

/// Deterministic local embedding client: hashes bytes into a normalized vector.
///
/// Useful for development and tests; similar inputs do not produce similar vectors.
pub struct HashEmbeddingClient {
    dimension: usize,
}

impl HashEmbeddingClient {
    /// Construct a client producing vectors of `dimension` components.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(text: &str, dimension: usize) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; dimension];

        if text.is_empty() {
            return embedding;
        }

        for (idx, byte) in text.bytes().enumerate() {
            let position = idx % dimension;
            embedding[position] += f32::from(byte) / 255.0;
        }

        let norm = embedding
            .iter()
            .map(|value| value * value)
            .sum::<f32>()
            .sqrt();

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }

    fn check_dimension(&self) -> Result<(), EmbeddingClientError> {
        if self.dimension == 0 {
            return Err(EmbeddingClientError::GenerationFailed(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        self.check_dimension()?;
        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no texts provided".to_string(),
            ));
        }

        tracing::debug!(
            dimension = self.dimension,
            count = texts.len(),
            "Generating hash embeddings"
        );

        Ok(texts
            .into_iter()
            .map(|text| Self::encode(&text, self.dimension))
            .collect())
    }

    async fn embed_image(&self, image_url: &str) -> Result<Vec<f32>, EmbeddingClientError> {
        self.check_dimension()?;
        // Presigned query strings change per call; hash only the object location.
        let location = image_url.split('?').next().unwrap_or(image_url);
        Ok(Self::encode(location, self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Build an embedding client suitable for the current configuration.
pub fn get_embedding_client(
    config: &Config,
) -> Result<Arc<dyn EmbeddingClient>, EmbeddingClientError> {
    match config.embedding_provider {
        EmbeddingProvider::Hash => {
            tracing::info!(
                dimension = config.embedding_dimension,
                "Using local hash embeddings"
            );
            Ok(Arc::new(HashEmbeddingClient::new(config.embedding_dimension)))
        }
        EmbeddingProvider::OpenAI => {
            let api_url = config.embedding_api_url.clone().ok_or_else(|| {
                EmbeddingClientError::Unsupported("EMBEDDING_API_URL is not set".into())
            })?;
            let client = HttpEmbeddingClient::new(HttpEmbeddingSettings {
                api_url,
                api_key: config.embedding_api_key.clone(),
                model: config.embedding_model.clone(),
                multimodal_url: config.multimodal_embedding_url.clone(),
                multimodal_model: config.multimodal_embedding_model.clone(),
                dimension: config.embedding_dimension,
                timeout: config.http_timeout(),
            })?;
            Ok(Arc::new(client))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embeddings_are_normalized_and_deterministic() {
        let client = HashEmbeddingClient::new(16);
        let first = client
            .generate_embeddings(vec!["alpha".into(), "beta".into()])
            .await
            .expect("embeddings");
        let again = client.embed_one("alpha").await.expect("embedding");

        assert_eq!(first.len(), 2);
        assert_eq!(first[0], again);
        let norm: f32 = again.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hash_image_embedding_ignores_presign_query() {
        let client = HashEmbeddingClient::new(8);
        let a = client
            .embed_image("memory://kb/kb_1/f/scan.png?X-Amz-Expires=600&sig=1")
            .await
            .expect("embedding");
        let b = client
            .embed_image("memory://kb/kb_1/f/scan.png?X-Amz-Expires=600&sig=2")
            .await
            .expect("embedding");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[tokio::test]
    async fn zero_dimension_is_rejected() {
        let client = HashEmbeddingClient::new(0);
        let error = client.embed_one("x").await.expect_err("error");
        assert!(matches!(error, EmbeddingClientError::GenerationFailed(_)));
    }
}
