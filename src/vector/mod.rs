//! Vector store integration: chunk embeddings keyed by file and collection.

mod memory;
mod qdrant;

pub use memory::InMemoryVectorStore;
pub use qdrant::{QdrantService, QdrantSettings};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Errors returned while interacting with the vector store.
#[derive(Debug, Error)]
pub enum VectorStoreError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid Qdrant URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Qdrant responded with an unexpected status code.
    #[error("Unexpected Qdrant response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned from Qdrant.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Record vector length differs from the collection dimension.
    #[error("Vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension fixed for the collection.
        expected: usize,
        /// Dimension of the offending vector.
        actual: usize,
    },
    /// Backend is unavailable (used by the in-memory store to simulate outages).
    #[error("Vector store unavailable: {0}")]
    Unavailable(String),
}

/// One chunk ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    /// Knowledge file the chunk came from.
    pub file_id: Uuid,
    /// Collection the file belongs to.
    pub collection_id: Option<i64>,
    /// Chunk text stored alongside the vector.
    pub text: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
}

/// Scored search result.
#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    /// Point identifier assigned by the store.
    pub id: String,
    /// Similarity score.
    pub score: f32,
    /// Source file, when present in the payload.
    pub file_id: Option<Uuid>,
    /// Source collection, when present in the payload.
    pub collection_id: Option<i64>,
    /// Stored chunk text.
    pub text: Option<String>,
}

/// Operations the ingestion pipeline needs from a vector database.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert all records in one batch. Returns the number written.
    async fn insert(&self, records: Vec<VectorRecord>) -> Result<usize, VectorStoreError>;

    /// Remove every record referencing `file_id`. Returns the number removed.
    async fn delete_by_file(&self, file_id: Uuid) -> Result<usize, VectorStoreError>;

    /// Similarity search, optionally restricted to one collection.
    async fn search(
        &self,
        vector: Vec<f32>,
        collection_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<VectorHit>, VectorStoreError>;
}

pub(crate) fn check_dimensions(
    records: &[VectorRecord],
    expected: usize,
) -> Result<(), VectorStoreError> {
    match records.iter().find(|record| record.vector.len() != expected) {
        Some(record) => Err(VectorStoreError::DimensionMismatch {
            expected,
            actual: record.vector.len(),
        }),
        None => Ok(()),
    }
}
