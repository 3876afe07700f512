//! Ingestion pipeline: stored object → text units → chunks → embeddings → vector records.

use super::chunking::{ChunkSettings, chunk_text};
use super::lease::LeaseRegistry;
use super::status::FileStatus;
use super::types::{KnowledgeError, VectorizeOutcome};
use crate::embedding::{EmbeddingClient, EmbeddingClientError};
use crate::metadata::{KnowledgeFile, MetadataStore};
use crate::metrics::IngestionMetrics;
use crate::parsers::{DocumentFormat, ParseError, ParseOptions, join_units, parse_document};
use crate::storage::ObjectStore;
use crate::vector::{VectorRecord, VectorStore};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Tunables for the pipeline.
#[derive(Clone)]
pub struct VectorizerSettings {
    /// Lifetime of the presigned URL handed to the image embedding endpoint.
    pub download_url_ttl: Duration,
    /// Splitter parameters.
    pub chunking: ChunkSettings,
    /// Upper bound on chunks per embedding request. A document is embedded in as many bounded
    /// requests as it needs; a failed request is retried one chunk at a time.
    pub embedding_batch_size: usize,
    /// Reject documents whose SHA-256 differs from the client-supplied hash.
    pub verify_content_hash: bool,
    /// Documents larger than this are failed instead of downloaded.
    pub max_object_bytes: u64,
    /// Parser options (OCR engine for enriched formats).
    pub parse_options: ParseOptions,
}

impl Default for VectorizerSettings {
    fn default() -> Self {
        Self {
            download_url_ttl: Duration::from_secs(10 * 60),
            chunking: ChunkSettings::default(),
            embedding_batch_size: 10,
            verify_content_hash: false,
            max_object_bytes: 200 * 1024 * 1024,
            parse_options: ParseOptions::default(),
        }
    }
}

struct RunStats {
    chunk_count: usize,
    embedded: usize,
    inserted: usize,
}

/// Turns COMPLETED files into searchable vector records.
pub struct Vectorizer {
    metadata: Arc<dyn MetadataStore>,
    store: Arc<dyn ObjectStore>,
    embedder: Arc<dyn EmbeddingClient>,
    vectors: Arc<dyn VectorStore>,
    leases: Arc<LeaseRegistry>,
    metrics: Arc<IngestionMetrics>,
    settings: VectorizerSettings,
}

impl Vectorizer {
    /// Wire the pipeline to its collaborators.
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        store: Arc<dyn ObjectStore>,
        embedder: Arc<dyn EmbeddingClient>,
        vectors: Arc<dyn VectorStore>,
        metrics: Arc<IngestionMetrics>,
        settings: VectorizerSettings,
    ) -> Self {
        Self {
            metadata,
            store,
            embedder,
            vectors,
            leases: LeaseRegistry::new(),
            metrics,
            settings,
        }
    }

    /// Run the pipeline for one file.
    ///
    /// Only a file in COMPLETED is processed, and only by the caller that wins both the
    /// in-process lease and the COMPLETED → PROCESSING compare-and-set. Pipeline failures are
    /// recorded on the file (FAILED with a reason) and reported through
    /// [`VectorizeOutcome::failure`]; `Err` is returned when the run never started or its final
    /// status could not be written.
    pub async fn vectorize(&self, file_id: Uuid) -> Result<VectorizeOutcome, KnowledgeError> {
        let Some(_lease) = self.leases.try_acquire(file_id) else {
            return Err(KnowledgeError::invalid_state(
                file_id,
                "vectorization already running",
            ));
        };

        let file = self.load(file_id).await?;
        if file.status != FileStatus::Completed {
            return Err(KnowledgeError::unexpected_status(
                file_id,
                file.status,
                "vectorize",
            ));
        }
        self.claim_and_run(file_id).await
    }

    /// Run the pipeline again for a file an earlier run left behind.
    ///
    /// A FAILED file, or one stuck in PROCESSING because its worker died, is requeued to
    /// COMPLETED and then processed exactly as [`Vectorizer::vectorize`] would. COMPLETED files
    /// run directly. The stored object must still exist; files that never finished uploading
    /// have to be uploaded again. Vectors from earlier runs are replaced, not duplicated.
    pub async fn reprocess(&self, file_id: Uuid) -> Result<VectorizeOutcome, KnowledgeError> {
        let Some(_lease) = self.leases.try_acquire(file_id) else {
            return Err(KnowledgeError::invalid_state(
                file_id,
                "vectorization already running",
            ));
        };

        let file = self.load(file_id).await?;
        if file.status.can_requeue() {
            self.ensure_object_present(&file).await?;
            if self.metadata.requeue(file_id, file.status).await?.is_none() {
                return Err(KnowledgeError::invalid_state(
                    file_id,
                    "file changed status before it could be requeued",
                ));
            }
            tracing::info!(
                file_id = %file_id,
                from = %file.status,
                previous_failure = file.failure_reason.as_deref().unwrap_or_default(),
                "File requeued for vectorization"
            );
        } else if file.status != FileStatus::Completed {
            return Err(KnowledgeError::unexpected_status(
                file_id,
                file.status,
                "reprocess",
            ));
        }
        self.claim_and_run(file_id).await
    }

    async fn load(&self, file_id: Uuid) -> Result<KnowledgeFile, KnowledgeError> {
        match self.metadata.get(file_id).await? {
            Some(file) => Ok(file),
            None => {
                tracing::warn!(file_id = %file_id, "Vectorization requested for unknown file");
                Err(KnowledgeError::NotFound(file_id))
            }
        }
    }

    async fn ensure_object_present(&self, file: &KnowledgeFile) -> Result<(), KnowledgeError> {
        let object_path = file
            .object_path
            .as_deref()
            .ok_or_else(|| KnowledgeError::invalid_state(file.id, "file has no object path"))?;
        match self.store.stat_object(object_path).await? {
            Some(_) => Ok(()),
            None => Err(KnowledgeError::invalid_state(
                file.id,
                "stored object is missing; upload the file again",
            )),
        }
    }

    /// Caller must hold the file's lease.
    async fn claim_and_run(&self, file_id: Uuid) -> Result<VectorizeOutcome, KnowledgeError> {
        let Some(file) = self
            .metadata
            .transition(file_id, FileStatus::Completed, FileStatus::Processing, None)
            .await?
        else {
            return Err(KnowledgeError::invalid_state(
                file_id,
                "file was claimed by another worker",
            ));
        };

        tracing::info!(
            file_id = %file_id,
            mime_type = %file.mime_type,
            filename = %file.filename,
            "Vectorization started"
        );

        match self.run(&file).await {
            Ok(stats) => self.finish(file_id, stats).await,
            Err(error) => self.fail(file, error).await,
        }
    }

    async fn finish(
        &self,
        file_id: Uuid,
        stats: RunStats,
    ) -> Result<VectorizeOutcome, KnowledgeError> {
        let file = self
            .metadata
            .transition(file_id, FileStatus::Processing, FileStatus::Vectorized, None)
            .await?
            .ok_or_else(|| {
                KnowledgeError::invalid_state(file_id, "file left PROCESSING during vectorization")
            })?;

        self.metrics
            .record_vectorized(stats.embedded as u64, stats.inserted as u64);
        tracing::info!(
            file_id = %file_id,
            chunks = stats.chunk_count,
            inserted = stats.inserted,
            "Vectorization completed"
        );
        Ok(VectorizeOutcome {
            file,
            chunk_count: stats.chunk_count,
            inserted: stats.inserted,
            failure: None,
        })
    }

    async fn fail(
        &self,
        file: KnowledgeFile,
        error: KnowledgeError,
    ) -> Result<VectorizeOutcome, KnowledgeError> {
        let reason = failure_reason(&error);
        tracing::error!(file_id = %file.id, error = %error, "Vectorization failed");
        self.metrics.record_failed();

        let file = self
            .metadata
            .transition(
                file.id,
                FileStatus::Processing,
                FileStatus::Failed,
                Some(&reason),
            )
            .await?
            .ok_or_else(|| {
                KnowledgeError::invalid_state(file.id, "file left PROCESSING during vectorization")
            })?;

        Ok(VectorizeOutcome {
            file,
            chunk_count: 0,
            inserted: 0,
            failure: Some(reason),
        })
    }

    async fn run(&self, file: &KnowledgeFile) -> Result<RunStats, KnowledgeError> {
        let object_path = file
            .object_path
            .as_deref()
            .ok_or_else(|| KnowledgeError::invalid_state(file.id, "file has no object path"))?;

        let (chunk_count, records) = if file.is_image() {
            (1, self.image_records(file, object_path).await?)
        } else {
            let chunks = self.document_chunks(file, object_path).await?;
            let count = chunks.len();
            (count, self.chunk_records(file, chunks).await?)
        };

        let embedded = records.len();
        let removed = self.vectors.delete_by_file(file.id).await?;
        if removed > 0 {
            tracing::debug!(file_id = %file.id, removed, "Removed previous vectors");
        }
        let inserted = if records.is_empty() {
            tracing::info!(file_id = %file.id, "No content to index");
            0
        } else {
            self.vectors.insert(records).await?
        };

        Ok(RunStats {
            chunk_count,
            embedded,
            inserted,
        })
    }

    async fn image_records(
        &self,
        file: &KnowledgeFile,
        object_path: &str,
    ) -> Result<Vec<VectorRecord>, KnowledgeError> {
        let url = self
            .store
            .presign_get(object_path, self.settings.download_url_ttl)
            .await?;
        let vector = self.embedder.embed_image(&url).await?;
        let expected = self.embedder.dimension();
        if vector.len() != expected {
            return Err(EmbeddingClientError::DimensionMismatch {
                expected,
                actual: vector.len(),
            }
            .into());
        }
        Ok(vec![VectorRecord {
            file_id: file.id,
            collection_id: file.collection_id,
            text: format!("Image: {}", file.filename),
            vector,
        }])
    }

    async fn document_chunks(
        &self,
        file: &KnowledgeFile,
        object_path: &str,
    ) -> Result<Vec<String>, KnowledgeError> {
        let format = DocumentFormat::from_mime(&file.mime_type);
        if let DocumentFormat::Unsupported(mime) = format {
            return Err(KnowledgeError::UnsupportedFormat(mime));
        }

        let bytes = self
            .store
            .get_object(object_path, self.settings.max_object_bytes)
            .await?;
        self.check_content_hash(file, &bytes)?;

        tracing::debug!(
            file_id = %file.id,
            format = format.label(),
            bytes = bytes.len(),
            enriched = format.is_enriched(),
            "Parsing document"
        );
        let options = self.settings.parse_options.clone();
        let units = tokio::task::spawn_blocking(move || parse_document(&format, &bytes, &options))
            .await
            .map_err(|err| KnowledgeError::Parse(ParseError::malformed("document", err)))??;

        let text = join_units(&units);
        let chunks = chunk_text(&text, &self.settings.chunking);
        tracing::debug!(
            file_id = %file.id,
            units = units.len(),
            chars = text.chars().count(),
            chunks = chunks.len(),
            "Document split"
        );
        Ok(chunks)
    }

    fn check_content_hash(&self, file: &KnowledgeFile, bytes: &[u8]) -> Result<(), KnowledgeError> {
        let Some(claimed) = file.content_hash.as_deref() else {
            return Ok(());
        };
        let Some(expected) = normalize_sha256(claimed) else {
            tracing::debug!(file_id = %file.id, "Content hash is not SHA-256; skipping check");
            return Ok(());
        };

        let actual = hex::encode(Sha256::digest(bytes));
        if actual == expected {
            return Ok(());
        }
        if self.settings.verify_content_hash {
            return Err(KnowledgeError::Integrity { expected, actual });
        }
        tracing::warn!(
            file_id = %file.id,
            expected = %expected,
            actual = %actual,
            "Content hash mismatch"
        );
        Ok(())
    }

    async fn chunk_records(
        &self,
        file: &KnowledgeFile,
        chunks: Vec<String>,
    ) -> Result<Vec<VectorRecord>, KnowledgeError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let total = chunks.len();
        let batch_size = self.settings.embedding_batch_size.max(1);
        let mut records = Vec::with_capacity(total);
        for batch in chunks.chunks(batch_size) {
            for (text, vector) in self.embed_batch(file.id, batch).await {
                records.push(VectorRecord {
                    file_id: file.id,
                    collection_id: file.collection_id,
                    text,
                    vector,
                });
            }
        }

        if records.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(format!(
                "none of the {total} chunks could be embedded"
            ))
            .into());
        }
        if records.len() < total {
            tracing::warn!(
                file_id = %file.id,
                embedded = records.len(),
                total,
                "Skipped chunks that failed to embed"
            );
        }
        Ok(records)
    }

    /// Embed one batch; on failure or a malformed response, retry chunk by chunk and skip
    /// the chunks that still fail.
    async fn embed_batch(&self, file_id: Uuid, batch: &[String]) -> Vec<(String, Vec<f32>)> {
        let dimension = self.embedder.dimension();
        match self.embedder.generate_embeddings(batch.to_vec()).await {
            Ok(vectors)
                if vectors.len() == batch.len()
                    && vectors.iter().all(|vector| vector.len() == dimension) =>
            {
                return batch.iter().cloned().zip(vectors).collect();
            }
            Ok(vectors) => tracing::warn!(
                file_id = %file_id,
                sent = batch.len(),
                received = vectors.len(),
                "Malformed batch embedding response; retrying per chunk"
            ),
            Err(error) => tracing::warn!(
                file_id = %file_id,
                error = %error,
                "Batch embedding failed; retrying per chunk"
            ),
        }
        self.metrics.record_embedding_fallback();

        let mut embedded = Vec::with_capacity(batch.len());
        for (index, text) in batch.iter().enumerate() {
            match self.embedder.embed_one(text).await {
                Ok(vector) if vector.len() == dimension => embedded.push((text.clone(), vector)),
                Ok(vector) => tracing::warn!(
                    file_id = %file_id,
                    index,
                    actual = vector.len(),
                    expected = dimension,
                    "Skipping chunk with wrong embedding dimension"
                ),
                Err(error) => tracing::warn!(
                    file_id = %file_id,
                    index,
                    error = %error,
                    "Skipping chunk that failed to embed"
                ),
            }
        }
        embedded
    }
}

fn failure_reason(error: &KnowledgeError) -> String {
    match error {
        KnowledgeError::UnsupportedFormat(mime) => format!("unsupported type: {mime}"),
        other => other.to_string(),
    }
}

/// Lowercase hex digest when `claimed` looks like SHA-256 (optionally `sha256:`-prefixed).
fn normalize_sha256(claimed: &str) -> Option<String> {
    let trimmed = claimed.trim();
    let digest = trimmed
        .strip_prefix("sha256:")
        .or_else(|| trimmed.strip_prefix("SHA256:"))
        .unwrap_or(trimmed);
    (digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()))
        .then(|| digest.to_ascii_lowercase())
}
