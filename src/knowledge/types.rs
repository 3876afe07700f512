//! Requests, results, and the error taxonomy shared by the knowledge operations.

use super::status::FileStatus;
use crate::{
    embedding::EmbeddingClientError, metadata::KnowledgeFile, metadata::MetadataError,
    parsers::ParseError, storage::ObjectStoreError, vector::VectorStoreError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Coarse classification used for retry decisions and HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request parameters were rejected.
    Validation,
    /// Referenced file does not exist.
    NotFound,
    /// File is not in a state that allows the operation.
    InvalidState,
    /// A collaborator (object store, database, embedding, vector store) failed.
    Infrastructure,
    /// No parser exists for the file's MIME type.
    UnsupportedFormat,
    /// Upload was reconciled and rejected; the file is now FAILED.
    Rejected,
}

/// Errors surfaced by negotiation, finalization, vectorization, and search.
#[derive(Debug, Error)]
pub enum KnowledgeError {
    /// Request parameters were rejected before any side effect.
    #[error("Invalid request: {0}")]
    Validation(String),
    /// No knowledge file with this id.
    #[error("Knowledge file {0} not found")]
    NotFound(Uuid),
    /// Operation not allowed in the file's current state.
    #[error("Knowledge file {file_id} is in an invalid state: {reason}")]
    InvalidState {
        /// File concerned.
        file_id: Uuid,
        /// What made the state invalid.
        reason: String,
    },
    /// Finalization found the upload incomplete or the store refused it. FAILED is persisted.
    #[error("Upload of knowledge file {file_id} rejected: {reason}")]
    UploadRejected {
        /// File concerned.
        file_id: Uuid,
        /// Failure reason recorded on the file.
        reason: String,
    },
    /// No parser for the MIME type.
    #[error("Unsupported document type: {0}")]
    UnsupportedFormat(String),
    /// Downloaded bytes did not match the client-supplied hash.
    #[error("Content hash mismatch: expected {expected}, computed {actual}")]
    Integrity {
        /// Client-supplied hash.
        expected: String,
        /// Hash of the stored object.
        actual: String,
    },
    /// Document bytes could not be parsed.
    #[error("Failed to parse document: {0}")]
    Parse(#[source] ParseError),
    /// Object store failure.
    #[error("Object store request failed: {0}")]
    ObjectStore(#[from] ObjectStoreError),
    /// Metadata store failure.
    #[error("Metadata store request failed: {0}")]
    Metadata(#[from] MetadataError),
    /// Embedding provider failure.
    #[error("Failed to generate embeddings: {0}")]
    Embedding(#[from] EmbeddingClientError),
    /// Vector database failure.
    #[error("Vector store request failed: {0}")]
    VectorStore(#[from] VectorStoreError),
}

impl From<ParseError> for KnowledgeError {
    fn from(error: ParseError) -> Self {
        match error {
            ParseError::Unsupported(mime) => Self::UnsupportedFormat(mime),
            other => Self::Parse(other),
        }
    }
}

impl KnowledgeError {
    pub(crate) fn invalid_state(file_id: Uuid, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            file_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn unexpected_status(file_id: Uuid, status: FileStatus, operation: &str) -> Self {
        Self::invalid_state(file_id, format!("cannot {operation} a file in status {status}"))
    }

    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::UploadRejected { .. } | Self::Integrity { .. } | Self::Parse(_) => {
                ErrorKind::Rejected
            }
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Self::ObjectStore(ObjectStoreError::TooLarge { .. }) => ErrorKind::Rejected,
            Self::ObjectStore(_) | Self::Metadata(_) | Self::Embedding(_) | Self::VectorStore(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }
}

/// Parameters of an upload negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Administrator requesting the upload.
    pub owner_id: i64,
    /// Original filename.
    pub filename: String,
    /// Extension without the dot; derived from the filename when absent.
    pub file_ext: Option<String>,
    /// Declared MIME type; inferred from the extension when absent.
    pub mime_type: Option<String>,
    /// Declared size in bytes.
    pub size_in_bytes: Option<i64>,
    /// Number of parts the client will upload. `1` means a single PUT.
    pub part_count: u32,
    /// Client-supplied content hash.
    pub content_hash: Option<String>,
    /// Target knowledge collection.
    pub collection_id: Option<i64>,
}

/// Presigned URL for one multipart part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartUploadUrl {
    /// 1-based part number.
    pub part_number: u32,
    /// Presigned PUT URL bound to the upload id and part number.
    pub url: String,
}

/// Upload credentials handed back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadPlan {
    /// New knowledge file id.
    pub file_id: Uuid,
    /// Whether the client must upload parts.
    pub multipart: bool,
    /// Object store key the bytes land at.
    pub object_path: String,
    /// Multipart handle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    /// Single-shot PUT URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presigned_url: Option<String>,
    /// One URL per part, ordered by part number.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub presigned_urls: Vec<PartUploadUrl>,
    /// Lifetime of the issued URLs in seconds.
    pub expires_in_secs: u64,
}

/// Result of a vectorization run that reached a terminal status.
#[derive(Debug, Clone, Serialize)]
pub struct VectorizeOutcome {
    /// File after the run (VECTORIZED or FAILED).
    pub file: KnowledgeFile,
    /// Chunks produced by splitting (1 for images).
    pub chunk_count: usize,
    /// Records written to the vector store.
    pub inserted: usize,
    /// Failure reason when the run ended in FAILED.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl VectorizeOutcome {
    /// Whether the run ended in VECTORIZED.
    pub fn succeeded(&self) -> bool {
        self.file.status == FileStatus::Vectorized
    }
}

/// Similarity search parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchRequest {
    /// Natural language query.
    pub query: String,
    /// Restrict hits to one collection.
    #[serde(default, alias = "knowledge_base_id")]
    pub collection_id: Option<i64>,
    /// Maximum number of hits.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Tunables for negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSettings {
    /// Lifetime of presigned PUT URLs.
    pub upload_url_ttl: Duration,
    /// Upper bound on `part_count`.
    pub max_part_count: u32,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            upload_url_ttl: Duration::from_secs(20 * 60),
            max_part_count: 10_000,
        }
    }
}
