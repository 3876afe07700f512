//! Object store abstraction used for direct-to-storage uploads.
//!
//! Clients never stream bytes through this service. The negotiator hands out presigned URLs,
//! the finalizer reconciles what actually landed in the bucket, and the vectorizer downloads
//! the finished object.

mod memory;
mod s3;
pub mod sigv4;

pub use memory::{InMemoryObjectStore, StoreOperation};
pub use s3::{S3ObjectStore, S3Settings};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by object store backends.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// Endpoint URL failed to parse.
    #[error("Invalid object store URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Store answered with a non-success status.
    #[error("Unexpected object store response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the store.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Store returned an S3 `<Error>` document.
    #[error("Object store error {code}: {message}")]
    Api {
        /// S3 error code, e.g. `InvalidPart`.
        code: String,
        /// Human readable message from the store.
        message: String,
    },
    /// Response body could not be interpreted.
    #[error("Malformed object store response: {0}")]
    InvalidResponse(String),
    /// Referenced multipart upload does not exist.
    #[error("Unknown multipart upload: {0}")]
    NoSuchUpload(String),
    /// Referenced object does not exist.
    #[error("Object not found: {0}")]
    NoSuchKey(String),
    /// Object is larger than the caller is willing to buffer.
    #[error("Object {path} exceeds the {limit} byte download limit")]
    TooLarge {
        /// Object key.
        path: String,
        /// Download limit in bytes.
        limit: u64,
    },
    /// Backend is unavailable (used by the in-memory store to simulate outages).
    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

/// A part reported by the object store for an in-progress multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPart {
    /// 1-based part index.
    pub part_number: u32,
    /// Entity tag the store assigned to the part.
    pub etag: String,
}

/// Object metadata returned by a stat call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    /// Stored object size in bytes.
    pub size: u64,
    /// Entity tag, when reported.
    pub etag: Option<String>,
    /// Content type recorded by the store, when reported.
    pub content_type: Option<String>,
}

/// Operations the ingestion pipeline needs from an S3-compatible store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Presign a single-shot `PUT` for `path`.
    async fn presign_put(&self, path: &str, ttl: Duration) -> Result<String, ObjectStoreError>;

    /// Presign a `GET` for `path`.
    async fn presign_get(&self, path: &str, ttl: Duration) -> Result<String, ObjectStoreError>;

    /// Start a multipart upload and return its upload id.
    async fn create_multipart_upload(
        &self,
        path: &str,
        content_type: &str,
    ) -> Result<String, ObjectStoreError>;

    /// Presign a `PUT` for one part of a multipart upload.
    async fn presign_upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Result<String, ObjectStoreError>;

    /// List the parts the store has received for a multipart upload, ordered by part number.
    async fn list_parts(
        &self,
        path: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, ObjectStoreError>;

    /// Assemble the listed parts into the final object.
    async fn complete_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), ObjectStoreError>;

    /// Return object metadata, or `None` when the object does not exist.
    async fn stat_object(&self, path: &str) -> Result<Option<ObjectStat>, ObjectStoreError>;

    /// Download the full object, failing with [`ObjectStoreError::TooLarge`] once more than
    /// `max_bytes` would have to be buffered.
    async fn get_object(&self, path: &str, max_bytes: u64) -> Result<Vec<u8>, ObjectStoreError>;
}
