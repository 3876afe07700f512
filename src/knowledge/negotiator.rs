//! Upload negotiation: record creation plus presigned upload credentials.

use super::status::FileStatus;
use super::types::{KnowledgeError, PartUploadUrl, UploadPlan, UploadRequest, UploadSettings};
use crate::metadata::{KnowledgeFile, MetadataStore, MetadataTransaction};
use crate::parsers::mime_from_extension;
use crate::storage::ObjectStore;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// Issues upload credentials and creates the PENDING → UPLOADING record atomically.
pub struct UploadNegotiator {
    metadata: Arc<dyn MetadataStore>,
    store: Arc<dyn ObjectStore>,
    settings: UploadSettings,
}

impl UploadNegotiator {
    /// Wire the negotiator to its collaborators.
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        store: Arc<dyn ObjectStore>,
        settings: UploadSettings,
    ) -> Self {
        Self {
            metadata,
            store,
            settings,
        }
    }

    /// Validate the request, create the record, and return upload credentials.
    ///
    /// The record is committed only after every object store call succeeded; on any failure the
    /// transaction is rolled back and nothing is persisted.
    pub async fn negotiate(&self, request: UploadRequest) -> Result<UploadPlan, KnowledgeError> {
        let mut file = self.build_record(&request)?;
        tracing::info!(
            file_id = %file.id,
            owner_id = file.owner_id,
            filename = %file.filename,
            part_count = request.part_count,
            "Negotiating upload"
        );

        let mut tx = self.metadata.begin().await?;
        match self.stage(&mut tx, &mut file, request.part_count).await {
            Ok(plan) => {
                tx.commit().await?;
                tracing::info!(
                    file_id = %file.id,
                    multipart = plan.multipart,
                    object_path = %plan.object_path,
                    "Upload credentials issued"
                );
                Ok(plan)
            }
            Err(error) => {
                tracing::warn!(file_id = %file.id, error = %error, "Upload negotiation failed");
                if let Err(rollback_error) = tx.rollback().await {
                    tracing::warn!(
                        file_id = %file.id,
                        error = %rollback_error,
                        "Failed to roll back negotiation transaction"
                    );
                }
                Err(error)
            }
        }
    }

    fn build_record(&self, request: &UploadRequest) -> Result<KnowledgeFile, KnowledgeError> {
        if request.part_count < 1 {
            return Err(KnowledgeError::Validation(
                "part_count must be at least 1".into(),
            ));
        }
        if request.part_count > self.settings.max_part_count {
            return Err(KnowledgeError::Validation(format!(
                "part_count {} exceeds the maximum of {}",
                request.part_count, self.settings.max_part_count
            )));
        }
        if let Some(size) = request.size_in_bytes
            && size < 0
        {
            return Err(KnowledgeError::Validation(
                "size_in_bytes must not be negative".into(),
            ));
        }

        let filename = sanitize_filename(&request.filename)
            .ok_or_else(|| KnowledgeError::Validation("filename must not be empty".into()))?;
        let file_ext = request
            .file_ext
            .as_deref()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .or_else(|| extension_of(&filename));
        let mime_type = request
            .mime_type
            .as_deref()
            .map(str::trim)
            .filter(|mime| !mime.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                mime_from_extension(file_ext.as_deref().unwrap_or_default()).to_string()
            });

        let id = Uuid::now_v7();
        let now = OffsetDateTime::now_utc();
        let part_count = i32::try_from(request.part_count).map_err(|_| {
            KnowledgeError::Validation(format!("part_count {} is too large", request.part_count))
        })?;

        Ok(KnowledgeFile {
            id,
            collection_id: request.collection_id,
            owner_id: request.owner_id,
            object_path: Some(object_path(request.collection_id, id, &filename)),
            filename,
            file_ext,
            mime_type,
            size_in_bytes: request.size_in_bytes,
            content_hash: request
                .content_hash
                .as_deref()
                .map(str::trim)
                .filter(|hash| !hash.is_empty())
                .map(str::to_string),
            upload_id: None,
            part_count,
            status: FileStatus::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn stage(
        &self,
        tx: &mut Box<dyn MetadataTransaction>,
        file: &mut KnowledgeFile,
        part_count: u32,
    ) -> Result<UploadPlan, KnowledgeError> {
        tx.insert(file).await?;

        let object_path = file
            .object_path
            .clone()
            .ok_or_else(|| KnowledgeError::invalid_state(file.id, "object path not assigned"))?;
        let ttl = self.settings.upload_url_ttl;

        let mut plan = UploadPlan {
            file_id: file.id,
            multipart: part_count > 1,
            object_path: object_path.clone(),
            upload_id: None,
            presigned_url: None,
            presigned_urls: Vec::new(),
            expires_in_secs: ttl.as_secs(),
        };

        if plan.multipart {
            let upload_id = self
                .store
                .create_multipart_upload(&object_path, &file.mime_type)
                .await?;
            tracing::debug!(file_id = %file.id, upload_id = %upload_id, "Multipart upload created");

            let mut urls = Vec::with_capacity(part_count as usize);
            for part_number in 1..=part_count {
                let url = self
                    .store
                    .presign_upload_part(&object_path, &upload_id, part_number, ttl)
                    .await?;
                urls.push(PartUploadUrl { part_number, url });
            }
            file.upload_id = Some(upload_id.clone());
            plan.upload_id = Some(upload_id);
            plan.presigned_urls = urls;
        } else {
            plan.presigned_url = Some(self.store.presign_put(&object_path, ttl).await?);
        }

        file.status = FileStatus::Uploading;
        file.updated_at = OffsetDateTime::now_utc();
        tx.update(file).await?;
        Ok(plan)
    }
}

/// `kb_{collection | uncategorized}/{file_id}/{filename}`.
pub(crate) fn object_path(collection_id: Option<i64>, file_id: Uuid, filename: &str) -> String {
    let collection = collection_id.map_or_else(|| "uncategorized".to_string(), |id| id.to_string());
    format!("kb_{collection}/{file_id}/{filename}")
}

/// Replace path separators and control characters; `None` when nothing usable remains.
pub(crate) fn sanitize_filename(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.' || c == '_') {
        None
    } else {
        Some(cleaned.to_string())
    }
}

fn extension_of(filename: &str) -> Option<String> {
    filename
        .rsplit_once('.')
        .map(|(stem, ext)| (stem, ext.to_ascii_lowercase()))
        .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
        .map(|(_, ext)| ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InMemoryMetadataStore;
    use crate::storage::{InMemoryObjectStore, StoreOperation};
    use crate::knowledge::types::ErrorKind;

    fn request(part_count: u32) -> UploadRequest {
        UploadRequest {
            owner_id: 7,
            filename: "guide.pdf".into(),
            file_ext: None,
            mime_type: None,
            size_in_bytes: Some(2048),
            part_count,
            content_hash: None,
            collection_id: Some(12),
        }
    }

    fn negotiator() -> (UploadNegotiator, InMemoryMetadataStore, Arc<InMemoryObjectStore>) {
        let metadata = InMemoryMetadataStore::new();
        let store = Arc::new(InMemoryObjectStore::new("knowledge"));
        let negotiator = UploadNegotiator::new(
            Arc::new(metadata.clone()),
            store.clone(),
            UploadSettings::default(),
        );
        (negotiator, metadata, store)
    }

    #[tokio::test]
    async fn single_part_returns_one_put_url() {
        let (negotiator, metadata, _) = negotiator();
        let plan = negotiator.negotiate(request(1)).await.expect("plan");

        assert!(!plan.multipart);
        assert!(plan.presigned_urls.is_empty());
        assert!(plan.upload_id.is_none());
        let url = plan.presigned_url.expect("url");
        assert!(url.contains("X-Amz-Expires=1200"));
        assert_eq!(plan.object_path, format!("kb_12/{}/guide.pdf", plan.file_id));

        let stored = metadata.get(plan.file_id).await.expect("get").expect("record");
        assert_eq!(stored.status, FileStatus::Uploading);
        assert_eq!(stored.mime_type, "application/pdf");
        assert_eq!(stored.file_ext.as_deref(), Some("pdf"));
        assert!(stored.upload_id.is_none());
    }

    #[tokio::test]
    async fn multipart_returns_one_url_per_part() {
        let (negotiator, metadata, store) = negotiator();
        let plan = negotiator.negotiate(request(3)).await.expect("plan");

        assert!(plan.multipart);
        let upload_id = plan.upload_id.clone().expect("upload id");
        let numbers: Vec<u32> = plan.presigned_urls.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        for part in &plan.presigned_urls {
            assert!(part.url.contains(&format!("partNumber={}", part.part_number)));
            assert!(part.url.contains(&upload_id));
        }
        assert_eq!(store.open_uploads(), 1);

        let stored = metadata.get(plan.file_id).await.expect("get").expect("record");
        assert_eq!(stored.upload_id.as_deref(), Some(upload_id.as_str()));
        assert_eq!(stored.part_count, 3);
        assert_eq!(stored.status, FileStatus::Uploading);
    }

    #[tokio::test]
    async fn invalid_part_counts_are_rejected_without_records() {
        let (negotiator, metadata, _) = negotiator();
        for count in [0, 10_001] {
            let error = negotiator.negotiate(request(count)).await.expect_err("invalid");
            assert_eq!(error.kind(), ErrorKind::Validation);
        }
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn empty_filename_is_rejected() {
        let (negotiator, metadata, _) = negotiator();
        let mut req = request(1);
        req.filename = " / ".into();
        let error = negotiator.negotiate(req).await.expect_err("invalid");
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn presign_failure_rolls_back_record() {
        let (negotiator, metadata, store) = negotiator();
        store.fail_on(StoreOperation::PresignPart);

        let error = negotiator.negotiate(request(4)).await.expect_err("failure");
        assert!(error.is_retryable());
        assert!(metadata.is_empty());

        store.fail_on(StoreOperation::Presign);
        let error = negotiator.negotiate(request(1)).await.expect_err("failure");
        assert_eq!(error.kind(), ErrorKind::Infrastructure);
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn commit_failure_leaves_no_record() {
        let (negotiator, metadata, _) = negotiator();
        metadata.set_fail_commits(true);
        let error = negotiator.negotiate(request(1)).await.expect_err("commit");
        assert!(error.is_retryable());
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn uncategorized_path_and_explicit_mime() {
        let (negotiator, metadata, _) = negotiator();
        let mut req = request(1);
        req.collection_id = None;
        req.filename = "scan.JPG".into();
        req.mime_type = Some("image/jpeg".into());
        let plan = negotiator.negotiate(req).await.expect("plan");
        assert!(plan.object_path.starts_with("kb_uncategorized/"));

        let stored = metadata.get(plan.file_id).await.expect("get").expect("record");
        assert_eq!(stored.file_ext.as_deref(), Some("jpg"));
        assert!(stored.is_image());
    }

    #[test]
    fn sanitize_replaces_separators_and_controls() {
        assert_eq!(
            sanitize_filename("../etc/passwd").as_deref(),
            Some(".._etc_passwd")
        );
        assert_eq!(sanitize_filename("a\tb\\c.txt").as_deref(), Some("a_b_c.txt"));
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename("   "), None);
    }

    #[test]
    fn extension_requires_stem() {
        assert_eq!(extension_of("report.DOCX").as_deref(), Some("docx"));
        assert_eq!(extension_of(".bashrc"), None);
        assert_eq!(extension_of("README"), None);
    }
}
