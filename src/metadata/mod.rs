//! Durable metadata for knowledge files.
//!
//! Every status change either happens inside a [`MetadataTransaction`] (negotiation) or as a
//! compare-and-set through [`MetadataStore::transition`], so two workers can never both move a
//! file out of the same state.

mod memory;
mod postgres;

pub use memory::InMemoryMetadataStore;
pub use postgres::PostgresMetadataStore;

use crate::knowledge::status::{FileStatus, UnknownStatus};
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Errors raised by metadata backends.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Database driver reported a failure.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Schema migration failed.
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    /// Stored row could not be mapped back into a record.
    #[error("Corrupt metadata row: {0}")]
    Corrupt(#[from] UnknownStatus),
    /// Caller asked for a transition the state machine forbids.
    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition {
        /// Current status.
        from: FileStatus,
        /// Requested status.
        to: FileStatus,
    },
    /// Update targeted a record that does not exist.
    #[error("Knowledge file {0} not found")]
    Missing(Uuid),
    /// Record with the same id already exists.
    #[error("Knowledge file {0} already exists")]
    Duplicate(Uuid),
    /// Backend is unavailable (used by the in-memory store to simulate outages).
    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),
}

/// Metadata row describing one uploaded document or image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeFile {
    /// Time-ordered unique identifier.
    pub id: Uuid,
    /// Knowledge collection the file belongs to, if any.
    pub collection_id: Option<i64>,
    /// Administrator that requested the upload.
    pub owner_id: i64,
    /// Sanitized original filename.
    pub filename: String,
    /// Lowercase extension without the dot.
    pub file_ext: Option<String>,
    /// MIME type declared by the client or inferred from the extension.
    pub mime_type: String,
    /// Declared size in bytes.
    pub size_in_bytes: Option<i64>,
    /// Client-supplied content hash.
    pub content_hash: Option<String>,
    /// Object store key; fixed once assigned.
    pub object_path: Option<String>,
    /// Multipart upload handle, present only for multipart uploads.
    pub upload_id: Option<String>,
    /// Number of parts negotiated.
    pub part_count: i32,
    /// Lifecycle status.
    pub status: FileStatus,
    /// Why the file ended up FAILED.
    pub failure_reason: Option<String>,
    /// Creation time.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Last modification time.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl KnowledgeFile {
    /// Whether the upload was negotiated as multipart.
    pub fn is_multipart(&self) -> bool {
        self.upload_id.is_some()
    }

    /// Whether the file is an image (embedded through the multimodal branch).
    pub fn is_image(&self) -> bool {
        self.mime_type.to_ascii_lowercase().starts_with("image/")
    }
}

/// Read and compare-and-set access to knowledge file metadata.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Open a transaction for multi-step writes.
    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, MetadataError>;

    /// Fetch one record.
    async fn get(&self, id: Uuid) -> Result<Option<KnowledgeFile>, MetadataError>;

    /// Move `id` from `from` to `to` only if it is currently in `from`.
    ///
    /// Returns the updated record, or `None` when the record is missing or its status no longer
    /// equals `from`. `failure_reason` is recorded alongside the new status when supplied.
    async fn transition(
        &self,
        id: Uuid,
        from: FileStatus,
        to: FileStatus,
        failure_reason: Option<&str>,
    ) -> Result<Option<KnowledgeFile>, MetadataError>;

    /// Reset `id` from `from` back to COMPLETED and clear its failure reason.
    ///
    /// Only statuses accepted by [`FileStatus::can_requeue`] may be requeued. Compare-and-set
    /// semantics match [`MetadataStore::transition`].
    async fn requeue(
        &self,
        id: Uuid,
        from: FileStatus,
    ) -> Result<Option<KnowledgeFile>, MetadataError>;
}

/// Unit of work; nothing is visible to readers until [`MetadataTransaction::commit`].
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait MetadataTransaction: Send {
    /// Insert a new record.
    async fn insert(&mut self, file: &KnowledgeFile) -> Result<(), MetadataError>;

    /// Overwrite the mutable fields of a record written earlier in this transaction.
    ///
    /// Covers `upload_id`, `part_count`, `status`, `failure_reason`, and `updated_at`.
    async fn update(&mut self, file: &KnowledgeFile) -> Result<(), MetadataError>;

    /// Make all writes durable.
    async fn commit(self: Box<Self>) -> Result<(), MetadataError>;

    /// Discard all writes.
    async fn rollback(self: Box<Self>) -> Result<(), MetadataError>;
}

pub(crate) fn check_requeue(from: FileStatus) -> Result<(), MetadataError> {
    if from.can_requeue() {
        Ok(())
    } else {
        Err(MetadataError::IllegalTransition {
            from,
            to: FileStatus::Completed,
        })
    }
}

pub(crate) fn check_transition(from: FileStatus, to: FileStatus) -> Result<(), MetadataError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(MetadataError::IllegalTransition { from, to })
    }
}
