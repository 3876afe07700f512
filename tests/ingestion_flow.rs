//! End-to-end ingestion flows over the in-memory collaborators.

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use knowledge_ingest::api::{ADMIN_USER_HEADER, create_router};
use knowledge_ingest::embedding::{EmbeddingClient, EmbeddingClientError, HashEmbeddingClient};
use knowledge_ingest::knowledge::chunking::ChunkSettings;
use knowledge_ingest::knowledge::finalizer::OBJECT_NOT_FOUND;
use knowledge_ingest::knowledge::{
    ErrorKind, FileStatus, KnowledgeApi, KnowledgeError, KnowledgeService, ServiceSettings,
    UploadRequest, VectorizerSettings,
};
use knowledge_ingest::metadata::InMemoryMetadataStore;
use knowledge_ingest::storage::InMemoryObjectStore;
use knowledge_ingest::vector::InMemoryVectorStore;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

const DIMENSION: usize = 32;

struct Harness {
    service: Arc<KnowledgeService>,
    store: Arc<InMemoryObjectStore>,
    vectors: Arc<InMemoryVectorStore>,
}

impl Harness {
    fn new() -> Self {
        Self::with(
            Arc::new(HashEmbeddingClient::new(DIMENSION)),
            ServiceSettings::default(),
        )
    }

    fn with(embedder: Arc<dyn EmbeddingClient>, settings: ServiceSettings) -> Self {
        let store = Arc::new(InMemoryObjectStore::new("knowledge"));
        let vectors = Arc::new(InMemoryVectorStore::new(DIMENSION));
        let service = Arc::new(KnowledgeService::new(
            Arc::new(InMemoryMetadataStore::new()),
            store.clone(),
            embedder,
            vectors.clone(),
            settings,
        ));
        Self {
            service,
            store,
            vectors,
        }
    }
}

fn upload(filename: &str, mime_type: Option<&str>, part_count: u32) -> UploadRequest {
    UploadRequest {
        owner_id: 7,
        filename: filename.into(),
        file_ext: None,
        mime_type: mime_type.map(str::to_string),
        size_in_bytes: None,
        part_count,
        content_hash: None,
        collection_id: Some(3),
    }
}

/// Rejects every batch call; single-text calls succeed.
struct BatchFailingEmbedder {
    inner: HashEmbeddingClient,
}

#[async_trait]
impl EmbeddingClient for BatchFailingEmbedder {
    async fn generate_embeddings(
        &self,
        _texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        Err(EmbeddingClientError::GenerationFailed("batch endpoint down".into()))
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingClientError> {
        self.inner.embed_one(text).await
    }

    async fn embed_image(&self, image_url: &str) -> Result<Vec<f32>, EmbeddingClientError> {
        self.inner.embed_image(image_url).await
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }
}

#[tokio::test]
async fn single_part_upload_finalizes_to_completed() {
    let harness = Harness::new();
    let plan = harness
        .service
        .negotiate(upload("notes.txt", None, 1))
        .await
        .expect("negotiate");
    assert!(!plan.multipart);
    assert!(plan.presigned_url.is_some());
    assert!(plan.presigned_urls.is_empty());

    harness.store.put_object(&plan.object_path, "hello");
    let file = harness.service.finalize(plan.file_id).await.expect("finalize");
    assert_eq!(file.status, FileStatus::Completed);
}

#[tokio::test]
async fn finalize_without_object_marks_file_failed() {
    let harness = Harness::new();
    let plan = harness
        .service
        .negotiate(upload("notes.txt", None, 1))
        .await
        .expect("negotiate");

    let error = harness
        .service
        .finalize(plan.file_id)
        .await
        .expect_err("object absent");
    assert!(matches!(error, KnowledgeError::UploadRejected { .. }));

    let file = harness.service.get_file(plan.file_id).await.expect("file");
    assert_eq!(file.status, FileStatus::Failed);
    assert_eq!(file.failure_reason.as_deref(), Some(OBJECT_NOT_FOUND));
}

#[tokio::test]
async fn short_text_becomes_one_vector() {
    let harness = Harness::new();
    let plan = harness
        .service
        .negotiate(upload("notes.txt", None, 1))
        .await
        .expect("negotiate");
    harness.store.put_object(
        &plan.object_path,
        "First paragraph about sleep.\n\nSecond paragraph about exercise.",
    );
    harness.service.finalize(plan.file_id).await.expect("finalize");

    let outcome = harness.service.vectorize(plan.file_id).await.expect("vectorize");
    assert!(outcome.succeeded());
    assert_eq!(outcome.chunk_count, 1);
    assert_eq!(outcome.inserted, 1);
    assert_eq!(outcome.file.status, FileStatus::Vectorized);

    let records = harness.vectors.records_for(plan.file_id);
    assert_eq!(records.len(), 1);
    assert!(records[0].text.contains("Second paragraph"));
}

#[tokio::test]
async fn unsupported_mime_type_fails_without_vectors() {
    let harness = Harness::new();
    let plan = harness
        .service
        .negotiate(upload("tool.bin", Some("application/x-msdownload"), 1))
        .await
        .expect("negotiate");
    harness.store.put_object(&plan.object_path, vec![0_u8, 1, 2, 3]);
    harness.service.finalize(plan.file_id).await.expect("finalize");

    let outcome = harness.service.vectorize(plan.file_id).await.expect("vectorize");
    assert!(!outcome.succeeded());
    assert_eq!(outcome.file.status, FileStatus::Failed);
    assert_eq!(outcome.inserted, 0);
    let reason = outcome.file.failure_reason.unwrap_or_default();
    assert!(reason.starts_with("unsupported type"), "{reason}");
    assert!(harness.vectors.records_for(plan.file_id).is_empty());
}

#[tokio::test]
async fn per_chunk_fallback_recovers_failed_batches() {
    let settings = ServiceSettings {
        vectorizer: VectorizerSettings {
            chunking: ChunkSettings {
                chunk_size: 60,
                chunk_overlap: 10,
                max_chars: 10_000,
            },
            ..VectorizerSettings::default()
        },
        ..ServiceSettings::default()
    };
    let harness = Harness::with(
        Arc::new(BatchFailingEmbedder {
            inner: HashEmbeddingClient::new(DIMENSION),
        }),
        settings,
    );
    let text = "Blood pressure should be measured twice a day. \
                Record each reading in the journal before breakfast. \
                Bring the journal to every follow-up appointment. \
                Call the clinic when readings stay above the target range.";
    let plan = harness
        .service
        .negotiate(upload("guide.txt", None, 1))
        .await
        .expect("negotiate");
    harness.store.put_object(&plan.object_path, text);
    harness.service.finalize(plan.file_id).await.expect("finalize");

    let outcome = harness.service.vectorize(plan.file_id).await.expect("vectorize");
    assert!(outcome.succeeded());
    assert!(outcome.chunk_count > 1);
    assert_eq!(outcome.inserted, outcome.chunk_count);
    assert!(harness.service.metrics_snapshot().embedding_fallbacks >= 1);
}

#[tokio::test]
async fn multipart_upload_is_assembled_and_vectorized() {
    let harness = Harness::new();
    let plan = harness
        .service
        .negotiate(upload("handbook.txt", None, 2))
        .await
        .expect("negotiate");
    assert!(plan.multipart);
    assert_eq!(plan.presigned_urls.len(), 2);
    let upload_id = plan.upload_id.clone().expect("upload id");

    harness
        .store
        .upload_part(&upload_id, 1, "Chapter one covers nutrition. ")
        .expect("part 1");
    harness
        .store
        .upload_part(&upload_id, 2, "Chapter two covers rest.")
        .expect("part 2");

    let file = harness.service.finalize(plan.file_id).await.expect("finalize");
    assert_eq!(file.status, FileStatus::Completed);
    assert!(harness.store.contains(&plan.object_path));

    let outcome = harness.service.vectorize(plan.file_id).await.expect("vectorize");
    assert!(outcome.succeeded());
    let records = harness.vectors.records_for(plan.file_id);
    assert!(records.iter().any(|record| record.text.contains("rest")));
}

#[tokio::test]
async fn multipart_upload_with_missing_part_is_rejected() {
    let harness = Harness::new();
    let plan = harness
        .service
        .negotiate(upload("handbook.txt", None, 3))
        .await
        .expect("negotiate");
    let upload_id = plan.upload_id.clone().expect("upload id");
    harness
        .store
        .upload_part(&upload_id, 1, "only the first part")
        .expect("part 1");

    let error = harness
        .service
        .finalize(plan.file_id)
        .await
        .expect_err("missing parts");
    assert_eq!(error.kind(), ErrorKind::Rejected);
    let file = harness.service.get_file(plan.file_id).await.expect("file");
    assert_eq!(file.status, FileStatus::Failed);

    let again = harness
        .service
        .vectorize(plan.file_id)
        .await
        .expect_err("failed files are not vectorized");
    assert_eq!(again.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn http_flow_runs_vectorization_in_background() {
    let harness = Harness::new();
    let router = create_router(harness.service.clone());

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/admin/file/v1/upload-request")
                .header("content-type", "application/json")
                .header(ADMIN_USER_HEADER, "7")
                .body(Body::from(
                    json!({ "filename": "faq.txt", "knowledge_base_id": 3 }).to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(
        &to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body"),
    )
    .expect("json");
    let file_id: Uuid = body["data"]["file_id"]
        .as_str()
        .and_then(|raw| raw.parse().ok())
        .expect("file id");
    let object_path = body["data"]["object_path"].as_str().expect("path").to_string();

    harness
        .store
        .put_object(&object_path, "Visiting hours are nine to five.");

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/admin/file/v1/finalize-upload")
                .header("content-type", "application/json")
                .body(Body::from(json!({ "file_id": file_id }).to_string()))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let mut status = FileStatus::Completed;
    for _ in 0..100 {
        status = harness.service.get_file(file_id).await.expect("file").status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, FileStatus::Vectorized);
    assert_eq!(harness.vectors.records_for(file_id).len(), 1);
}
