//! Upload finalization: reconcile what landed in the bucket with the negotiated upload.

use super::status::FileStatus;
use super::types::KnowledgeError;
use crate::metadata::{KnowledgeFile, MetadataStore};
use crate::storage::{ObjectStore, ObjectStoreError, UploadedPart};
use std::sync::Arc;
use uuid::Uuid;

/// Reason recorded when a single-shot object is missing.
pub const OBJECT_NOT_FOUND: &str = "object not found in storage";

enum Reconciliation {
    Stored,
    Rejected(String),
}

/// Confirms uploads and moves files from UPLOADING to COMPLETED or FAILED.
pub struct UploadFinalizer {
    metadata: Arc<dyn MetadataStore>,
    store: Arc<dyn ObjectStore>,
}

impl UploadFinalizer {
    /// Wire the finalizer to its collaborators.
    pub fn new(metadata: Arc<dyn MetadataStore>, store: Arc<dyn ObjectStore>) -> Self {
        Self { metadata, store }
    }

    /// Reconcile the upload of `file_id` with the object store.
    ///
    /// Files already past UPLOADING (COMPLETED, PROCESSING, VECTORIZED) are returned as-is
    /// without touching storage. Transport failures leave the status unchanged so the call can
    /// be retried; an incomplete or refused upload marks the file FAILED and is reported as
    /// [`KnowledgeError::UploadRejected`].
    pub async fn finalize(&self, file_id: Uuid) -> Result<KnowledgeFile, KnowledgeError> {
        let file = self
            .metadata
            .get(file_id)
            .await?
            .ok_or(KnowledgeError::NotFound(file_id))?;

        let Some(object_path) = file.object_path.clone() else {
            return Err(KnowledgeError::invalid_state(
                file_id,
                "file has no object path",
            ));
        };

        match file.status {
            status if status.is_upload_settled() => {
                tracing::debug!(file_id = %file_id, status = %status, "Upload already finalized");
                return Ok(file);
            }
            FileStatus::Uploading => {}
            status => return Err(KnowledgeError::unexpected_status(file_id, status, "finalize")),
        }

        let verdict = match file.upload_id.as_deref() {
            Some(upload_id) => {
                self.reconcile_multipart(&file, &object_path, upload_id)
                    .await?
            }
            None => self.reconcile_single(&file, &object_path).await?,
        };

        match verdict {
            Reconciliation::Stored => self.mark_completed(file_id).await,
            Reconciliation::Rejected(reason) => Err(self.mark_failed(file_id, reason).await),
        }
    }

    async fn reconcile_multipart(
        &self,
        file: &KnowledgeFile,
        object_path: &str,
        upload_id: &str,
    ) -> Result<Reconciliation, KnowledgeError> {
        let parts = match self.store.list_parts(object_path, upload_id).await {
            Ok(parts) => parts,
            Err(ObjectStoreError::NoSuchUpload(_)) => {
                // Assembled by an earlier call whose status update was lost, or aborted.
                return match self.store.stat_object(object_path).await? {
                    Some(_) => Ok(Reconciliation::Stored),
                    None => Ok(Reconciliation::Rejected(format!(
                        "multipart upload {upload_id} no longer exists"
                    ))),
                };
            }
            Err(error) => return Err(error.into()),
        };

        let expected = u32::try_from(file.part_count).unwrap_or_default();
        let manifest = match build_manifest(parts, expected) {
            Ok(manifest) => manifest,
            Err(reason) => return Ok(Reconciliation::Rejected(reason)),
        };

        tracing::debug!(
            file_id = %file.id,
            upload_id,
            parts = manifest.len(),
            "Completing multipart upload"
        );
        match self
            .store
            .complete_multipart_upload(object_path, upload_id, &manifest)
            .await
        {
            Ok(()) => Ok(Reconciliation::Stored),
            Err(error) => Ok(Reconciliation::Rejected(format!(
                "failed to complete multipart upload: {error}"
            ))),
        }
    }

    async fn reconcile_single(
        &self,
        file: &KnowledgeFile,
        object_path: &str,
    ) -> Result<Reconciliation, KnowledgeError> {
        match self.store.stat_object(object_path).await? {
            Some(stat) => {
                if let Some(declared) = file.size_in_bytes
                    && u64::try_from(declared).ok() != Some(stat.size)
                {
                    tracing::warn!(
                        file_id = %file.id,
                        declared,
                        stored = stat.size,
                        "Stored object size differs from declared size"
                    );
                }
                Ok(Reconciliation::Stored)
            }
            None => Ok(Reconciliation::Rejected(OBJECT_NOT_FOUND.to_string())),
        }
    }

    async fn mark_completed(&self, file_id: Uuid) -> Result<KnowledgeFile, KnowledgeError> {
        if let Some(file) = self
            .metadata
            .transition(file_id, FileStatus::Uploading, FileStatus::Completed, None)
            .await?
        {
            tracing::info!(file_id = %file_id, "Upload finalized");
            return Ok(file);
        }

        // Lost the compare-and-set; report whatever the winner left behind.
        let current = self
            .metadata
            .get(file_id)
            .await?
            .ok_or(KnowledgeError::NotFound(file_id))?;
        if current.status.is_upload_settled() {
            Ok(current)
        } else {
            Err(KnowledgeError::unexpected_status(
                file_id,
                current.status,
                "finalize",
            ))
        }
    }

    async fn mark_failed(&self, file_id: Uuid, reason: String) -> KnowledgeError {
        tracing::warn!(file_id = %file_id, reason = %reason, "Upload rejected");
        match self
            .metadata
            .transition(
                file_id,
                FileStatus::Uploading,
                FileStatus::Failed,
                Some(&reason),
            )
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(file_id = %file_id, "File left UPLOADING before it could be failed")
            }
            Err(error) => return error.into(),
        }
        KnowledgeError::UploadRejected { file_id, reason }
    }
}

/// Order reported parts and require exactly `1..=expected`.
fn build_manifest(
    mut parts: Vec<UploadedPart>,
    expected: u32,
) -> Result<Vec<UploadedPart>, String> {
    parts.sort_by_key(|part| part.part_number);
    parts.dedup_by_key(|part| part.part_number);

    let missing: Vec<u32> = (1..=expected)
        .filter(|number| {
            parts
                .binary_search_by_key(number, |part| part.part_number)
                .is_err()
        })
        .collect();
    if !missing.is_empty() {
        return Err(format!(
            "missing parts {:?} of {expected}",
            missing.iter().take(20).collect::<Vec<_>>()
        ));
    }
    if let Some(extra) = parts.iter().find(|part| part.part_number > expected) {
        return Err(format!(
            "unexpected part {} beyond the negotiated {expected}",
            extra.part_number
        ));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::types::ErrorKind;
    use crate::metadata::InMemoryMetadataStore;
    use crate::storage::{InMemoryObjectStore, StoreOperation};
    use time::OffsetDateTime;

    struct Fixture {
        finalizer: UploadFinalizer,
        metadata: InMemoryMetadataStore,
        store: Arc<InMemoryObjectStore>,
    }

    fn fixture() -> Fixture {
        let metadata = InMemoryMetadataStore::new();
        let store = Arc::new(InMemoryObjectStore::new("knowledge"));
        let finalizer = UploadFinalizer::new(Arc::new(metadata.clone()), store.clone());
        Fixture {
            finalizer,
            metadata,
            store,
        }
    }

    fn file(status: FileStatus, upload_id: Option<String>, part_count: i32) -> KnowledgeFile {
        let now = OffsetDateTime::now_utc();
        let id = Uuid::now_v7();
        KnowledgeFile {
            id,
            collection_id: None,
            owner_id: 1,
            filename: "a.txt".into(),
            file_ext: Some("txt".into()),
            mime_type: "text/plain".into(),
            size_in_bytes: None,
            content_hash: None,
            object_path: Some(format!("kb_uncategorized/{id}/a.txt")),
            upload_id,
            part_count,
            status,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn status_of(metadata: &InMemoryMetadataStore, id: Uuid) -> KnowledgeFile {
        metadata.get(id).await.expect("get").expect("record")
    }

    #[tokio::test]
    async fn single_upload_present_completes() {
        let fx = fixture();
        let record = file(FileStatus::Uploading, None, 1);
        fx.store
            .put_object(record.object_path.as_deref().expect("path"), "hello");
        fx.metadata.seed(record.clone());

        let finalized = fx.finalizer.finalize(record.id).await.expect("finalize");
        assert_eq!(finalized.status, FileStatus::Completed);
    }

    #[tokio::test]
    async fn single_upload_missing_fails_file() {
        let fx = fixture();
        let record = file(FileStatus::Uploading, None, 1);
        fx.metadata.seed(record.clone());

        let error = fx.finalizer.finalize(record.id).await.expect_err("missing");
        assert_eq!(error.kind(), ErrorKind::Rejected);
        let stored = status_of(&fx.metadata, record.id).await;
        assert_eq!(stored.status, FileStatus::Failed);
        assert_eq!(stored.failure_reason.as_deref(), Some(OBJECT_NOT_FOUND));
    }

    #[tokio::test]
    async fn stat_outage_leaves_status_unchanged() {
        let fx = fixture();
        let record = file(FileStatus::Uploading, None, 1);
        fx.metadata.seed(record.clone());
        fx.store.fail_on(StoreOperation::Stat);

        let error = fx.finalizer.finalize(record.id).await.expect_err("outage");
        assert!(error.is_retryable());
        assert_eq!(status_of(&fx.metadata, record.id).await.status, FileStatus::Uploading);
    }

    #[tokio::test]
    async fn multipart_with_all_parts_assembles_object() {
        let fx = fixture();
        let mut record = file(FileStatus::Uploading, None, 2);
        let path = record.object_path.clone().expect("path");
        let upload_id = fx
            .store
            .create_multipart_upload(&path, "text/plain")
            .await
            .expect("create");
        fx.store.upload_part(&upload_id, 2, " world").expect("part");
        fx.store.upload_part(&upload_id, 1, "hello").expect("part");
        record.upload_id = Some(upload_id);
        fx.metadata.seed(record.clone());

        let finalized = fx.finalizer.finalize(record.id).await.expect("finalize");
        assert_eq!(finalized.status, FileStatus::Completed);
        assert_eq!(fx.store.get_object(&path, u64::MAX).await.expect("object"), b"hello world");
    }

    #[tokio::test]
    async fn multipart_missing_part_fails_file() {
        let fx = fixture();
        let mut record = file(FileStatus::Uploading, None, 3);
        let path = record.object_path.clone().expect("path");
        let upload_id = fx
            .store
            .create_multipart_upload(&path, "text/plain")
            .await
            .expect("create");
        fx.store.upload_part(&upload_id, 1, "a").expect("part");
        fx.store.upload_part(&upload_id, 3, "c").expect("part");
        record.upload_id = Some(upload_id);
        fx.metadata.seed(record.clone());

        let error = fx.finalizer.finalize(record.id).await.expect_err("missing part");
        assert!(matches!(error, KnowledgeError::UploadRejected { .. }));
        let stored = status_of(&fx.metadata, record.id).await;
        assert_eq!(stored.status, FileStatus::Failed);
        assert!(stored.failure_reason.expect("reason").contains("missing parts [2]"));
        assert!(!fx.store.contains(&path));
        assert_eq!(fx.store.open_uploads(), 1);
    }

    #[tokio::test]
    async fn list_parts_outage_is_retryable() {
        let fx = fixture();
        let mut record = file(FileStatus::Uploading, None, 2);
        let path = record.object_path.clone().expect("path");
        record.upload_id = Some(
            fx.store
                .create_multipart_upload(&path, "text/plain")
                .await
                .expect("create"),
        );
        fx.metadata.seed(record.clone());
        fx.store.fail_on(StoreOperation::ListParts);

        let error = fx.finalizer.finalize(record.id).await.expect_err("outage");
        assert!(error.is_retryable());
        assert_eq!(status_of(&fx.metadata, record.id).await.status, FileStatus::Uploading);
    }

    #[tokio::test]
    async fn complete_failure_fails_file() {
        let fx = fixture();
        let mut record = file(FileStatus::Uploading, None, 1);
        let path = record.object_path.clone().expect("path");
        let upload_id = fx
            .store
            .create_multipart_upload(&path, "text/plain")
            .await
            .expect("create");
        fx.store.upload_part(&upload_id, 1, "a").expect("part");
        record.upload_id = Some(upload_id);
        fx.metadata.seed(record.clone());
        fx.store.fail_on(StoreOperation::Complete);

        let error = fx.finalizer.finalize(record.id).await.expect_err("complete");
        assert_eq!(error.kind(), ErrorKind::Rejected);
        assert_eq!(status_of(&fx.metadata, record.id).await.status, FileStatus::Failed);
    }

    #[tokio::test]
    async fn settled_files_are_returned_without_storage_calls() {
        let fx = fixture();
        fx.store.fail_on(StoreOperation::Stat);
        for status in [
            FileStatus::Completed,
            FileStatus::Processing,
            FileStatus::Vectorized,
        ] {
            let record = file(status, None, 1);
            fx.metadata.seed(record.clone());
            let returned = fx.finalizer.finalize(record.id).await.expect("idempotent");
            assert_eq!(returned.status, status);
        }
    }

    #[tokio::test]
    async fn pending_and_failed_are_invalid_state() {
        let fx = fixture();
        for status in [FileStatus::Pending, FileStatus::Failed] {
            let record = file(status, None, 1);
            fx.metadata.seed(record.clone());
            let error = fx.finalizer.finalize(record.id).await.expect_err("invalid");
            assert_eq!(error.kind(), ErrorKind::InvalidState);
        }
    }

    #[tokio::test]
    async fn missing_path_is_checked_before_status() {
        let fx = fixture();
        let mut record = file(FileStatus::Completed, None, 1);
        record.object_path = None;
        fx.metadata.seed(record.clone());

        let error = fx.finalizer.finalize(record.id).await.expect_err("no path");
        assert_eq!(error.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn unknown_file_is_not_found() {
        let fx = fixture();
        let error = fx.finalizer.finalize(Uuid::now_v7()).await.expect_err("absent");
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn manifest_rejects_gaps_and_extras() {
        let part = |n: u32| UploadedPart {
            part_number: n,
            etag: format!("e{n}"),
        };
        let ordered = build_manifest(vec![part(2), part(1)], 2).expect("complete");
        assert_eq!(ordered.iter().map(|p| p.part_number).collect::<Vec<_>>(), vec![1, 2]);

        assert!(build_manifest(vec![part(1)], 2).is_err());
        assert!(build_manifest(vec![part(1), part(2), part(3)], 2).is_err());
        assert!(build_manifest(Vec::new(), 1).is_err());
    }
}
