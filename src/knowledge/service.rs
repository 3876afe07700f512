//! Knowledge service coordinating negotiation, finalization, vectorization, and search.

use super::chunking::ChunkSettings;
use super::finalizer::UploadFinalizer;
use super::negotiator::UploadNegotiator;
use super::types::{
    KnowledgeError, SearchRequest, UploadPlan, UploadRequest, UploadSettings, VectorizeOutcome,
};
use super::vectorizer::{Vectorizer, VectorizerSettings};
use crate::config::Config;
use crate::embedding::EmbeddingClient;
use crate::metadata::{KnowledgeFile, MetadataStore};
use crate::metrics::{IngestionMetrics, MetricsSnapshot};
use crate::parsers::{OcrEngine, ParseOptions, TesseractOcr};
use crate::storage::ObjectStore;
use crate::vector::{VectorHit, VectorStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

const DEFAULT_SEARCH_LIMIT: usize = 5;
const MAX_SEARCH_LIMIT: usize = 50;

/// Abstraction over the knowledge pipeline used by the HTTP surface and the CLI.
#[async_trait]
pub trait KnowledgeApi: Send + Sync {
    /// Create a file record and issue upload credentials.
    async fn negotiate(&self, request: UploadRequest) -> Result<UploadPlan, KnowledgeError>;

    /// Reconcile an upload with the object store.
    async fn finalize(&self, file_id: Uuid) -> Result<KnowledgeFile, KnowledgeError>;

    /// Run the ingestion pipeline for a file in the foreground.
    async fn vectorize(&self, file_id: Uuid) -> Result<VectorizeOutcome, KnowledgeError>;

    /// Run the ingestion pipeline as a detached task. Outcomes are logged.
    fn schedule_vectorize(&self, file_id: Uuid);

    /// Requeue a FAILED or stuck PROCESSING file and run the pipeline in the foreground.
    async fn reprocess(&self, file_id: Uuid) -> Result<VectorizeOutcome, KnowledgeError>;

    /// Detached variant of [`KnowledgeApi::reprocess`].
    fn schedule_reprocess(&self, file_id: Uuid);

    /// Current metadata snapshot of a file.
    async fn get_file(&self, file_id: Uuid) -> Result<KnowledgeFile, KnowledgeError>;

    /// Remove every vector derived from a file. Returns the number removed.
    async fn purge_vectors(&self, file_id: Uuid) -> Result<usize, KnowledgeError>;

    /// Similarity search over indexed chunks.
    async fn search(&self, request: SearchRequest) -> Result<Vec<VectorHit>, KnowledgeError>;

    /// Retrieve the current metrics snapshot.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// Settings for every component of the service.
#[derive(Clone, Default)]
pub struct ServiceSettings {
    /// Negotiation tunables.
    pub upload: UploadSettings,
    /// Pipeline tunables.
    pub vectorizer: VectorizerSettings,
}

impl ServiceSettings {
    /// Derive settings from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let ocr: Option<Arc<dyn OcrEngine>> = if config.ocr_enabled {
            Some(Arc::new(TesseractOcr::new(
                config.tesseract_path.clone(),
                config.ocr_languages.clone(),
            )))
        } else {
            None
        };

        Self {
            upload: UploadSettings {
                upload_url_ttl: config.upload_url_ttl(),
                max_part_count: config.max_part_count,
            },
            vectorizer: VectorizerSettings {
                download_url_ttl: config.download_url_ttl(),
                chunking: ChunkSettings {
                    chunk_size: config.text_splitter_chunk_size,
                    chunk_overlap: config.text_splitter_chunk_overlap,
                    max_chars: config.chunk_max_chars,
                },
                verify_content_hash: config.verify_content_hash,
                max_object_bytes: config.max_object_bytes,
                parse_options: ParseOptions { ocr },
                ..VectorizerSettings::default()
            },
        }
    }
}

/// Owns the knowledge components and shares collaborators between them.
///
/// Construct once near process start and share through an `Arc`.
pub struct KnowledgeService {
    metadata: Arc<dyn MetadataStore>,
    embedder: Arc<dyn EmbeddingClient>,
    vectors: Arc<dyn VectorStore>,
    negotiator: UploadNegotiator,
    finalizer: UploadFinalizer,
    vectorizer: Arc<Vectorizer>,
    metrics: Arc<IngestionMetrics>,
}

impl KnowledgeService {
    /// Wire the service to its collaborators.
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        store: Arc<dyn ObjectStore>,
        embedder: Arc<dyn EmbeddingClient>,
        vectors: Arc<dyn VectorStore>,
        settings: ServiceSettings,
    ) -> Self {
        let metrics = Arc::new(IngestionMetrics::new());
        let negotiator =
            UploadNegotiator::new(metadata.clone(), store.clone(), settings.upload);
        let finalizer = UploadFinalizer::new(metadata.clone(), store.clone());
        let vectorizer = Arc::new(Vectorizer::new(
            metadata.clone(),
            store,
            embedder.clone(),
            vectors.clone(),
            metrics.clone(),
            settings.vectorizer,
        ));
        Self {
            metadata,
            embedder,
            vectors,
            negotiator,
            finalizer,
            vectorizer,
            metrics,
        }
    }
}

#[async_trait]
impl KnowledgeApi for KnowledgeService {
    async fn negotiate(&self, request: UploadRequest) -> Result<UploadPlan, KnowledgeError> {
        let plan = self.negotiator.negotiate(request).await?;
        self.metrics.record_negotiated();
        Ok(plan)
    }

    async fn finalize(&self, file_id: Uuid) -> Result<KnowledgeFile, KnowledgeError> {
        match self.finalizer.finalize(file_id).await {
            Ok(file) => {
                self.metrics.record_finalized();
                Ok(file)
            }
            Err(error) => {
                if matches!(error, KnowledgeError::UploadRejected { .. }) {
                    self.metrics.record_rejected();
                }
                Err(error)
            }
        }
    }

    async fn vectorize(&self, file_id: Uuid) -> Result<VectorizeOutcome, KnowledgeError> {
        self.vectorizer.vectorize(file_id).await
    }

    fn schedule_vectorize(&self, file_id: Uuid) {
        let vectorizer = Arc::clone(&self.vectorizer);
        spawn_pipeline(
            tracing::info_span!("vectorize", file_id = %file_id),
            async move { vectorizer.vectorize(file_id).await },
        );
        tracing::debug!(file_id = %file_id, "Vectorization scheduled");
    }

    async fn reprocess(&self, file_id: Uuid) -> Result<VectorizeOutcome, KnowledgeError> {
        self.vectorizer.reprocess(file_id).await
    }

    fn schedule_reprocess(&self, file_id: Uuid) {
        let vectorizer = Arc::clone(&self.vectorizer);
        spawn_pipeline(
            tracing::info_span!("reprocess", file_id = %file_id),
            async move { vectorizer.reprocess(file_id).await },
        );
        tracing::debug!(file_id = %file_id, "Reprocessing scheduled");
    }

    async fn get_file(&self, file_id: Uuid) -> Result<KnowledgeFile, KnowledgeError> {
        self.metadata
            .get(file_id)
            .await?
            .ok_or(KnowledgeError::NotFound(file_id))
    }

    async fn purge_vectors(&self, file_id: Uuid) -> Result<usize, KnowledgeError> {
        let removed = self.vectors.delete_by_file(file_id).await?;
        tracing::info!(file_id = %file_id, removed, "Purged file vectors");
        Ok(removed)
    }

    async fn search(&self, request: SearchRequest) -> Result<Vec<VectorHit>, KnowledgeError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(KnowledgeError::Validation("query must not be empty".into()));
        }
        let limit = request
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);

        let vector = self.embedder.embed_one(query).await?;
        let hits = self
            .vectors
            .search(vector, request.collection_id, limit)
            .await?;
        tracing::debug!(
            collection_id = ?request.collection_id,
            limit,
            hits = hits.len(),
            "Search completed"
        );
        Ok(hits)
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

fn spawn_pipeline<F>(span: tracing::Span, run: F)
where
    F: Future<Output = Result<VectorizeOutcome, KnowledgeError>> + Send + 'static,
{
    tokio::spawn(
        async move {
            match run.await {
                Ok(outcome) if outcome.succeeded() => {
                    tracing::debug!(inserted = outcome.inserted, "Background vectorization done")
                }
                Ok(outcome) => tracing::warn!(
                    reason = outcome.failure.as_deref().unwrap_or_default(),
                    "Background vectorization ended in FAILED"
                ),
                Err(error) => tracing::warn!(
                    error = %error,
                    kind = ?error.kind(),
                    "Background vectorization did not run"
                ),
            }
        }
        .instrument(span),
    );
}
