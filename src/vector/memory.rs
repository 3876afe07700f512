use super::{VectorHit, VectorRecord, VectorStore, VectorStoreError, check_dimensions};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    points: Vec<(Uuid, VectorRecord)>,
    fail_inserts: bool,
    fail_deletes: bool,
}

/// Brute-force cosine-similarity store held in memory.
pub struct InMemoryVectorStore {
    dimension: usize,
    inner: Mutex<Inner>,
}

impl InMemoryVectorStore {
    /// Create an empty store for vectors of `dimension` components.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            inner: Mutex::default(),
        }
    }

    /// All records currently stored for `file_id`.
    pub fn records_for(&self, file_id: Uuid) -> Vec<VectorRecord> {
        self.lock()
            .points
            .iter()
            .filter(|(_, record)| record.file_id == file_id)
            .map(|(_, record)| record.clone())
            .collect()
    }

    /// Total number of stored records.
    pub fn len(&self) -> usize {
        self.lock().points.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make inserts fail while set.
    pub fn set_fail_inserts(&self, fail: bool) {
        self.lock().fail_inserts = fail;
    }

    /// Make deletes fail while set.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn insert(&self, records: Vec<VectorRecord>) -> Result<usize, VectorStoreError> {
        check_dimensions(&records, self.dimension)?;
        let mut inner = self.lock();
        if inner.fail_inserts {
            return Err(VectorStoreError::Unavailable("insert rejected".into()));
        }
        let count = records.len();
        inner
            .points
            .extend(records.into_iter().map(|record| (Uuid::new_v4(), record)));
        Ok(count)
    }

    async fn delete_by_file(&self, file_id: Uuid) -> Result<usize, VectorStoreError> {
        let mut inner = self.lock();
        if inner.fail_deletes {
            return Err(VectorStoreError::Unavailable("delete rejected".into()));
        }
        let before = inner.points.len();
        inner.points.retain(|(_, record)| record.file_id != file_id);
        Ok(before - inner.points.len())
    }

    async fn search(
        &self,
        vector: Vec<f32>,
        collection_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<VectorHit>, VectorStoreError> {
        if vector.len() != self.dimension {
            return Err(VectorStoreError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }

        let inner = self.lock();
        let mut hits: Vec<VectorHit> = inner
            .points
            .iter()
            .filter(|(_, record)| collection_id.is_none() || record.collection_id == collection_id)
            .map(|(id, record)| VectorHit {
                id: id.to_string(),
                score: cosine(&vector, &record.vector),
                file_id: Some(record.file_id),
                collection_id: record.collection_id,
                text: Some(record.text.clone()),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit.max(1));
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(file_id: Uuid, collection_id: Option<i64>, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            file_id,
            collection_id,
            text: "chunk".into(),
            vector,
        }
    }

    #[tokio::test]
    async fn delete_by_file_only_touches_that_file() {
        let store = InMemoryVectorStore::new(2);
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        store
            .insert(vec![
                record(a, None, vec![1.0, 0.0]),
                record(a, None, vec![0.0, 1.0]),
                record(b, None, vec![1.0, 1.0]),
            ])
            .await
            .expect("insert");

        assert_eq!(store.delete_by_file(a).await.expect("delete"), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.records_for(b).len(), 1);
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_within_collection() {
        let store = InMemoryVectorStore::new(2);
        let file = Uuid::now_v7();
        store
            .insert(vec![
                record(file, Some(1), vec![1.0, 0.0]),
                record(file, Some(1), vec![0.0, 1.0]),
                record(file, Some(2), vec![1.0, 0.0]),
            ])
            .await
            .expect("insert");

        let hits = store.search(vec![1.0, 0.1], Some(1), 5).await.expect("search");
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score > hits[1].score);
        assert!(hits.iter().all(|hit| hit.collection_id == Some(1)));
    }
}
