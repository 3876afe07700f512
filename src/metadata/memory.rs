use super::{
    KnowledgeFile, MetadataError, MetadataStore, MetadataTransaction, check_requeue,
    check_transition,
};
use crate::knowledge::status::FileStatus;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::OffsetDateTime;
use uuid::Uuid;

type Records = Arc<Mutex<Inner>>;

#[derive(Default)]
struct Inner {
    files: HashMap<Uuid, KnowledgeFile>,
    unavailable: bool,
    fail_commits: bool,
}

/// Metadata store held in process memory. Transactions buffer writes and apply them
/// atomically on commit.
#[derive(Clone, Default)]
pub struct InMemoryMetadataStore {
    records: Records,
}

impl InMemoryMetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record directly, bypassing transactions.
    pub fn seed(&self, file: KnowledgeFile) {
        lock(&self.records).files.insert(file.id, file);
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        lock(&self.records).files.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate an outage: every read and write fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.records).unavailable = unavailable;
    }

    /// Make transaction commits fail while set.
    pub fn set_fail_commits(&self, fail: bool) {
        lock(&self.records).fail_commits = fail;
    }
}

fn lock(records: &Records) -> MutexGuard<'_, Inner> {
    records.lock().unwrap_or_else(PoisonError::into_inner)
}

fn ensure_available(inner: &Inner) -> Result<(), MetadataError> {
    if inner.unavailable {
        Err(MetadataError::Unavailable("metadata store offline".into()))
    } else {
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn begin(&self) -> Result<Box<dyn MetadataTransaction>, MetadataError> {
        ensure_available(&lock(&self.records))?;
        Ok(Box::new(InMemoryTransaction {
            records: self.records.clone(),
            staged: Vec::new(),
        }))
    }

    async fn get(&self, id: Uuid) -> Result<Option<KnowledgeFile>, MetadataError> {
        let inner = lock(&self.records);
        ensure_available(&inner)?;
        Ok(inner.files.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: FileStatus,
        to: FileStatus,
        failure_reason: Option<&str>,
    ) -> Result<Option<KnowledgeFile>, MetadataError> {
        check_transition(from, to)?;
        let mut inner = lock(&self.records);
        ensure_available(&inner)?;

        let Some(file) = inner.files.get_mut(&id) else {
            return Ok(None);
        };
        if file.status != from {
            return Ok(None);
        }
        file.status = to;
        if let Some(reason) = failure_reason {
            file.failure_reason = Some(reason.to_string());
        }
        file.updated_at = OffsetDateTime::now_utc();
        Ok(Some(file.clone()))
    }

    async fn requeue(
        &self,
        id: Uuid,
        from: FileStatus,
    ) -> Result<Option<KnowledgeFile>, MetadataError> {
        check_requeue(from)?;
        let mut inner = lock(&self.records);
        ensure_available(&inner)?;

        match inner.files.get_mut(&id) {
            Some(file) if file.status == from => {
                file.status = FileStatus::Completed;
                file.failure_reason = None;
                file.updated_at = OffsetDateTime::now_utc();
                Ok(Some(file.clone()))
            }
            _ => Ok(None),
        }
    }
}

enum Staged {
    Insert(KnowledgeFile),
    Update(KnowledgeFile),
}

struct InMemoryTransaction {
    records: Records,
    staged: Vec<Staged>,
}

impl InMemoryTransaction {
    fn staged_contains(&self, id: Uuid) -> bool {
        self.staged.iter().any(|op| match op {
            Staged::Insert(file) | Staged::Update(file) => file.id == id,
        })
    }
}

#[async_trait]
impl MetadataTransaction for InMemoryTransaction {
    async fn insert(&mut self, file: &KnowledgeFile) -> Result<(), MetadataError> {
        let exists = lock(&self.records).files.contains_key(&file.id);
        if exists || self.staged_contains(file.id) {
            return Err(MetadataError::Duplicate(file.id));
        }
        self.staged.push(Staged::Insert(file.clone()));
        Ok(())
    }

    async fn update(&mut self, file: &KnowledgeFile) -> Result<(), MetadataError> {
        let exists = lock(&self.records).files.contains_key(&file.id);
        if !exists && !self.staged_contains(file.id) {
            return Err(MetadataError::Missing(file.id));
        }
        self.staged.push(Staged::Update(file.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), MetadataError> {
        let InMemoryTransaction { records, staged } = *self;
        let mut inner = lock(&records);
        ensure_available(&inner)?;
        if inner.fail_commits {
            return Err(MetadataError::Unavailable("commit rejected".into()));
        }
        for op in staged {
            match op {
                Staged::Insert(file) => {
                    inner.files.insert(file.id, file);
                }
                Staged::Update(file) => {
                    if let Some(existing) = inner.files.get_mut(&file.id) {
                        existing.upload_id = file.upload_id;
                        existing.part_count = file.part_count;
                        existing.status = file.status;
                        existing.failure_reason = file.failure_reason;
                        existing.updated_at = file.updated_at;
                    }
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), MetadataError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: FileStatus) -> KnowledgeFile {
        let now = OffsetDateTime::now_utc();
        KnowledgeFile {
            id: Uuid::now_v7(),
            collection_id: Some(3),
            owner_id: 1,
            filename: "notes.txt".into(),
            file_ext: Some("txt".into()),
            mime_type: "text/plain".into(),
            size_in_bytes: Some(10),
            content_hash: None,
            object_path: Some("kb_3/x/notes.txt".into()),
            upload_id: None,
            part_count: 1,
            status,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn uncommitted_transaction_leaves_no_trace() {
        let store = InMemoryMetadataStore::new();
        let file = sample(FileStatus::Pending);
        let mut tx = store.begin().await.expect("tx");
        tx.insert(&file).await.expect("insert");
        drop(tx);
        assert!(store.get(file.id).await.expect("get").is_none());

        let mut tx = store.begin().await.expect("tx");
        tx.insert(&file).await.expect("insert");
        tx.rollback().await.expect("rollback");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn commit_applies_insert_then_update() {
        let store = InMemoryMetadataStore::new();
        let mut file = sample(FileStatus::Pending);
        let mut tx = store.begin().await.expect("tx");
        tx.insert(&file).await.expect("insert");
        file.status = FileStatus::Uploading;
        file.upload_id = Some("u-1".into());
        tx.update(&file).await.expect("update");
        tx.commit().await.expect("commit");

        let stored = store.get(file.id).await.expect("get").expect("present");
        assert_eq!(stored.status, FileStatus::Uploading);
        assert_eq!(stored.upload_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = InMemoryMetadataStore::new();
        let file = sample(FileStatus::Completed);
        store.seed(file.clone());

        let won = store
            .transition(file.id, FileStatus::Completed, FileStatus::Processing, None)
            .await
            .expect("cas");
        assert_eq!(won.map(|f| f.status), Some(FileStatus::Processing));

        let lost = store
            .transition(file.id, FileStatus::Completed, FileStatus::Processing, None)
            .await
            .expect("cas");
        assert!(lost.is_none());
    }

    #[tokio::test]
    async fn transition_rejects_illegal_steps() {
        let store = InMemoryMetadataStore::new();
        let file = sample(FileStatus::Failed);
        store.seed(file.clone());
        let error = store
            .transition(file.id, FileStatus::Failed, FileStatus::Completed, None)
            .await
            .expect_err("illegal");
        assert!(matches!(error, MetadataError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn requeue_resets_failed_file_and_clears_reason() {
        let store = InMemoryMetadataStore::new();
        let mut file = sample(FileStatus::Failed);
        file.failure_reason = Some("embedding provider timed out".into());
        store.seed(file.clone());

        let requeued = store
            .requeue(file.id, FileStatus::Failed)
            .await
            .expect("requeue")
            .expect("won");
        assert_eq!(requeued.status, FileStatus::Completed);
        assert!(requeued.failure_reason.is_none());

        let lost = store.requeue(file.id, FileStatus::Failed).await.expect("cas");
        assert!(lost.is_none());

        let error = store
            .requeue(file.id, FileStatus::Vectorized)
            .await
            .expect_err("not requeueable");
        assert!(matches!(error, MetadataError::IllegalTransition { .. }));
    }
}
