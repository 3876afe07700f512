use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion activity.
#[derive(Debug, Default)]
pub struct IngestionMetrics {
    uploads_negotiated: AtomicU64,
    uploads_finalized: AtomicU64,
    uploads_rejected: AtomicU64,
    files_vectorized: AtomicU64,
    files_failed: AtomicU64,
    chunks_embedded: AtomicU64,
    vectors_inserted: AtomicU64,
    embedding_fallbacks: AtomicU64,
}

impl IngestionMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record issued upload credentials.
    pub fn record_negotiated(&self) {
        self.uploads_negotiated.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upload that reached COMPLETED.
    pub fn record_finalized(&self) {
        self.uploads_finalized.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upload that finalization marked FAILED.
    pub fn record_rejected(&self) {
        self.uploads_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a file that reached VECTORIZED with its embedded chunks and inserted vectors.
    pub fn record_vectorized(&self, chunks_embedded: u64, vectors_inserted: u64) {
        self.files_vectorized.fetch_add(1, Ordering::Relaxed);
        self.chunks_embedded
            .fetch_add(chunks_embedded, Ordering::Relaxed);
        self.vectors_inserted
            .fetch_add(vectors_inserted, Ordering::Relaxed);
    }

    /// Record a vectorization run that ended in FAILED.
    pub fn record_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch embedding failure that fell back to per-chunk calls.
    pub fn record_embedding_fallback(&self) {
        self.embedding_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uploads_negotiated: self.uploads_negotiated.load(Ordering::Relaxed),
            uploads_finalized: self.uploads_finalized.load(Ordering::Relaxed),
            uploads_rejected: self.uploads_rejected.load(Ordering::Relaxed),
            files_vectorized: self.files_vectorized.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            chunks_embedded: self.chunks_embedded.load(Ordering::Relaxed),
            vectors_inserted: self.vectors_inserted.load(Ordering::Relaxed),
            embedding_fallbacks: self.embedding_fallbacks.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of ingestion counters used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Upload negotiations that issued credentials.
    pub uploads_negotiated: u64,
    /// Uploads confirmed as durably stored.
    pub uploads_finalized: u64,
    /// Uploads rejected during finalization.
    pub uploads_rejected: u64,
    /// Files that reached VECTORIZED since startup.
    pub files_vectorized: u64,
    /// Vectorization runs that ended in FAILED.
    pub files_failed: u64,
    /// Chunks that received an embedding.
    pub chunks_embedded: u64,
    /// Records written to the vector store.
    pub vectors_inserted: u64,
    /// Batch embedding calls that fell back to per-chunk requests.
    pub embedding_fallbacks: u64,
}
