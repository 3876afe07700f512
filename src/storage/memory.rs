//! In-process object store used by tests and local development.

use super::{ObjectStat, ObjectStore, ObjectStoreError, UploadedPart};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    /// `presign_put` and `presign_get`.
    Presign,
    /// `create_multipart_upload`.
    CreateMultipart,
    /// `presign_upload_part`.
    PresignPart,
    /// `list_parts`.
    ListParts,
    /// `complete_multipart_upload`.
    Complete,
    /// `stat_object`.
    Stat,
    /// `get_object`.
    Get,
}

#[derive(Default)]
struct State {
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, PendingUpload>,
    failing: HashSet<StoreOperation>,
}

struct PendingUpload {
    path: String,
    parts: BTreeMap<u32, (String, Vec<u8>)>,
}

/// Object store that keeps everything in memory.
///
/// Presigned URLs use a `memory://` scheme and are not dereferenceable; tests simulate the
/// client upload with [`InMemoryObjectStore::put_object`] and
/// [`InMemoryObjectStore::upload_part`].
#[derive(Default)]
pub struct InMemoryObjectStore {
    bucket: String,
    state: Mutex<State>,
}

impl InMemoryObjectStore {
    /// Create an empty store for `bucket`.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Mutex::default(),
        }
    }

    /// Store an object directly, as a client PUT through a presigned URL would.
    pub fn put_object(&self, path: &str, bytes: impl Into<Vec<u8>>) {
        self.lock().objects.insert(path.to_string(), bytes.into());
    }

    /// Upload one part of a multipart upload. Returns the assigned etag.
    pub fn upload_part(
        &self,
        upload_id: &str,
        part_number: u32,
        bytes: impl Into<Vec<u8>>,
    ) -> Result<String, ObjectStoreError> {
        let bytes = bytes.into();
        let etag = format!("\"{}\"", hex::encode(&Sha256::digest(&bytes)[..16]));
        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| ObjectStoreError::NoSuchUpload(upload_id.to_string()))?;
        upload.parts.insert(part_number, (etag.clone(), bytes));
        Ok(etag)
    }

    /// Make every call of `operation` fail until [`Self::clear_failures`] is called.
    pub fn fail_on(&self, operation: StoreOperation) {
        self.lock().failing.insert(operation);
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Whether an object exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.lock().objects.contains_key(path)
    }

    /// Number of multipart uploads that are still open.
    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, operation: StoreOperation) -> Result<(), ObjectStoreError> {
        if self.lock().failing.contains(&operation) {
            return Err(ObjectStoreError::Unavailable(format!(
                "injected failure for {operation:?}"
            )));
        }
        Ok(())
    }

    fn url(&self, path: &str, query: &str, ttl: Duration) -> String {
        format!(
            "memory://{}/{}?{query}X-Amz-Expires={}",
            self.bucket,
            path,
            ttl.as_secs()
        )
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn presign_put(&self, path: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        self.check(StoreOperation::Presign)?;
        Ok(self.url(path, "", ttl))
    }

    async fn presign_get(&self, path: &str, ttl: Duration) -> Result<String, ObjectStoreError> {
        self.check(StoreOperation::Presign)?;
        Ok(self.url(path, "", ttl))
    }

    async fn create_multipart_upload(
        &self,
        path: &str,
        _content_type: &str,
    ) -> Result<String, ObjectStoreError> {
        self.check(StoreOperation::CreateMultipart)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        self.lock().uploads.insert(
            upload_id.clone(),
            PendingUpload {
                path: path.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn presign_upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Result<String, ObjectStoreError> {
        self.check(StoreOperation::PresignPart)?;
        if !self.lock().uploads.contains_key(upload_id) {
            return Err(ObjectStoreError::NoSuchUpload(upload_id.to_string()));
        }
        Ok(self.url(
            path,
            &format!("partNumber={part_number}&uploadId={upload_id}&"),
            ttl,
        ))
    }

    async fn list_parts(
        &self,
        _path: &str,
        upload_id: &str,
    ) -> Result<Vec<UploadedPart>, ObjectStoreError> {
        self.check(StoreOperation::ListParts)?;
        let state = self.lock();
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| ObjectStoreError::NoSuchUpload(upload_id.to_string()))?;
        Ok(upload
            .parts
            .iter()
            .map(|(part_number, (etag, _))| UploadedPart {
                part_number: *part_number,
                etag: etag.clone(),
            })
            .collect())
    }

    async fn complete_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<(), ObjectStoreError> {
        self.check(StoreOperation::Complete)?;
        let mut state = self.lock();
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| ObjectStoreError::NoSuchUpload(upload_id.to_string()))?;
        if upload.path != path {
            return Err(ObjectStoreError::NoSuchUpload(upload_id.to_string()));
        }

        let mut assembled = Vec::new();
        for part in parts {
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => assembled.extend_from_slice(bytes),
                _ => {
                    return Err(ObjectStoreError::Api {
                        code: "InvalidPart".into(),
                        message: format!("part {} not found", part.part_number),
                    });
                }
            }
        }

        state.uploads.remove(upload_id);
        state.objects.insert(path.to_string(), assembled);
        Ok(())
    }

    async fn stat_object(&self, path: &str) -> Result<Option<ObjectStat>, ObjectStoreError> {
        self.check(StoreOperation::Stat)?;
        Ok(self.lock().objects.get(path).map(|bytes| ObjectStat {
            size: bytes.len() as u64,
            etag: None,
            content_type: None,
        }))
    }

    async fn get_object(&self, path: &str, max_bytes: u64) -> Result<Vec<u8>, ObjectStoreError> {
        self.check(StoreOperation::Get)?;
        let state = self.lock();
        let bytes = state
            .objects
            .get(path)
            .ok_or_else(|| ObjectStoreError::NoSuchKey(path.to_string()))?;
        if bytes.len() as u64 > max_bytes {
            return Err(ObjectStoreError::TooLarge {
                path: path.to_string(),
                limit: max_bytes,
            });
        }
        Ok(bytes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multipart_upload_assembles_parts_in_order() {
        let store = InMemoryObjectStore::new("knowledge");
        let upload_id = store
            .create_multipart_upload("kb_1/f/a.txt", "text/plain")
            .await
            .expect("upload id");
        store.upload_part(&upload_id, 2, "world").expect("part 2");
        store.upload_part(&upload_id, 1, "hello ").expect("part 1");

        let parts = store.list_parts("kb_1/f/a.txt", &upload_id).await.expect("parts");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].part_number, 1);

        store
            .complete_multipart_upload("kb_1/f/a.txt", &upload_id, &parts)
            .await
            .expect("complete");
        let bytes = store.get_object("kb_1/f/a.txt", u64::MAX).await.expect("object");
        assert_eq!(bytes, b"hello world");
        assert_eq!(store.open_uploads(), 0);
    }

    #[tokio::test]
    async fn injected_failures_surface_as_unavailable() {
        let store = InMemoryObjectStore::new("knowledge");
        store.fail_on(StoreOperation::Stat);
        let error = store.stat_object("missing").await.expect_err("failure");
        assert!(matches!(error, ObjectStoreError::Unavailable(_)));

        store.clear_failures();
        assert!(store.stat_object("missing").await.expect("stat").is_none());
    }
}
