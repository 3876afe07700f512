//! HTTP surface for the knowledge ingestion pipeline.
//!
//! Admin routes live under `/api/admin/file/v1` and trust the `x-admin-user-id` header set by
//! the fronting authentication layer:
//!
//! - `POST /upload-request` – Create a file record and return presigned upload URLs.
//! - `POST /finalize-upload` – Reconcile the upload, then schedule vectorization.
//! - `POST /vectorize` – Schedule vectorization of a COMPLETED file manually, or requeue a
//!   FAILED or stuck PROCESSING file for another run.
//! - `GET /files/:file_id` – Status snapshot of one file.
//! - `DELETE /files/:file_id/vectors` – Remove every vector derived from a file.
//!
//! `POST /api/knowledge/search` runs a similarity search and `GET /metrics` returns ingestion
//! counters. Every JSON response uses the `{ "code", "data", "msg" }` envelope; `code` is `0`
//! on success and `-1` on failure.

use crate::knowledge::{
    ErrorKind, FileStatus, KnowledgeApi, KnowledgeError, SearchRequest, UploadRequest,
};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Header carrying the authenticated administrator id.
pub const ADMIN_USER_HEADER: &str = "x-admin-user-id";

/// Build the HTTP router exposing the knowledge API surface.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: KnowledgeApi + 'static,
{
    let admin = Router::new()
        .route("/upload-request", post(request_upload::<S>))
        .route("/finalize-upload", post(finalize_upload::<S>))
        .route("/vectorize", post(vectorize_file::<S>))
        .route("/files/:file_id", get(get_file::<S>))
        .route("/files/:file_id/vectors", delete(purge_vectors::<S>));

    Router::new()
        .nest("/api/admin/file/v1", admin)
        .route("/api/knowledge/search", post(search::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .with_state(service)
}

/// Success envelope.
#[derive(Serialize)]
struct JsonData<T> {
    code: i32,
    data: T,
    msg: String,
}

impl<T: Serialize> JsonData<T> {
    fn success(data: T) -> Json<Self> {
        Json(Self {
            code: 0,
            data,
            msg: String::new(),
        })
    }
}

/// Request body for `POST /upload-request`.
#[derive(Deserialize)]
struct UploadRequestBody {
    filename: String,
    #[serde(default)]
    file_ext: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    size_in_bytes: Option<i64>,
    #[serde(default = "default_part_count")]
    part_count: i64,
    #[serde(default, alias = "knowledge_base_id")]
    collection_id: Option<i64>,
    #[serde(default, alias = "file_hash")]
    content_hash: Option<String>,
}

fn default_part_count() -> i64 {
    1
}

/// Negotiate an upload for the calling administrator.
async fn request_upload<S>(
    State(service): State<Arc<S>>,
    headers: HeaderMap,
    Json(body): Json<UploadRequestBody>,
) -> Result<Response, AppError>
where
    S: KnowledgeApi,
{
    let owner_id = admin_user_id(&headers)?;
    let request = UploadRequest {
        owner_id,
        filename: body.filename,
        file_ext: body.file_ext,
        mime_type: body.mime_type,
        size_in_bytes: body.size_in_bytes,
        // Negative counts map to 0 and oversize counts saturate; both fail validation.
        part_count: u32::try_from(body.part_count.max(0)).unwrap_or(u32::MAX),
        content_hash: body.content_hash,
        collection_id: body.collection_id,
    };
    let plan = service.negotiate(request).await?;
    Ok(JsonData::success(plan).into_response())
}

/// Body carrying a single file id.
#[derive(Deserialize)]
struct FileIdBody {
    file_id: Uuid,
}

#[derive(Serialize)]
struct FinalizeResponse {
    file_id: Uuid,
    status: FileStatus,
    vectorization_scheduled: bool,
}

/// Confirm an upload and hand the file to the pipeline.
async fn finalize_upload<S>(
    State(service): State<Arc<S>>,
    Json(body): Json<FileIdBody>,
) -> Result<Response, AppError>
where
    S: KnowledgeApi,
{
    let file = service.finalize(body.file_id).await?;
    let scheduled = file.status == FileStatus::Completed;
    if scheduled {
        service.schedule_vectorize(file.id);
    }
    tracing::info!(file_id = %file.id, status = %file.status, scheduled, "Finalize request completed");
    Ok(JsonData::success(FinalizeResponse {
        file_id: file.id,
        status: file.status,
        vectorization_scheduled: scheduled,
    })
    .into_response())
}

/// Schedule vectorization for a COMPLETED file, or reprocessing for a FAILED or PROCESSING one.
async fn vectorize_file<S>(
    State(service): State<Arc<S>>,
    Json(body): Json<FileIdBody>,
) -> Result<Response, AppError>
where
    S: KnowledgeApi,
{
    let file = service.get_file(body.file_id).await?;
    if file.status == FileStatus::Completed {
        service.schedule_vectorize(file.id);
    } else if file.status.can_requeue() {
        tracing::info!(file_id = %file.id, status = %file.status, "Manual reprocessing requested");
        service.schedule_reprocess(file.id);
    } else {
        return Err(KnowledgeError::InvalidState {
            file_id: file.id,
            reason: format!("cannot vectorize a file in status {}", file.status),
        }
        .into());
    }
    Ok((
        StatusCode::ACCEPTED,
        JsonData::success(FinalizeResponse {
            file_id: file.id,
            status: file.status,
            vectorization_scheduled: true,
        }),
    )
        .into_response())
}

async fn get_file<S>(
    State(service): State<Arc<S>>,
    Path(file_id): Path<Uuid>,
) -> Result<Response, AppError>
where
    S: KnowledgeApi,
{
    let file = service.get_file(file_id).await?;
    Ok(JsonData::success(file).into_response())
}

#[derive(Serialize)]
struct PurgeResponse {
    file_id: Uuid,
    removed: usize,
}

async fn purge_vectors<S>(
    State(service): State<Arc<S>>,
    Path(file_id): Path<Uuid>,
) -> Result<Response, AppError>
where
    S: KnowledgeApi,
{
    let removed = service.purge_vectors(file_id).await?;
    Ok(JsonData::success(PurgeResponse { file_id, removed }).into_response())
}

async fn search<S>(
    State(service): State<Arc<S>>,
    Json(request): Json<SearchRequest>,
) -> Result<Response, AppError>
where
    S: KnowledgeApi,
{
    let hits = service.search(request).await?;
    Ok(JsonData::success(hits).into_response())
}

async fn get_metrics<S>(State(service): State<Arc<S>>) -> Response
where
    S: KnowledgeApi,
{
    JsonData::success(service.metrics_snapshot()).into_response()
}

fn admin_user_id(headers: &HeaderMap) -> Result<i64, AppError> {
    let value = headers
        .get(ADMIN_USER_HEADER)
        .ok_or_else(|| AppError::Unauthorized(format!("missing {ADMIN_USER_HEADER} header")))?;
    value
        .to_str()
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .ok_or_else(|| AppError::Unauthorized(format!("invalid {ADMIN_USER_HEADER} header")))
}

#[derive(Serialize)]
struct ErrorBody {
    code: i32,
    msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<ErrorKind>,
    retryable: bool,
}

enum AppError {
    Unauthorized(String),
    Knowledge(KnowledgeError),
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidState => StatusCode::CONFLICT,
        ErrorKind::Infrastructure => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorKind::Rejected => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                ErrorBody {
                    code: -1,
                    msg,
                    kind: None,
                    retryable: false,
                },
            ),
            Self::Knowledge(error) => {
                let kind = error.kind();
                if kind == ErrorKind::Infrastructure {
                    tracing::error!(error = %error, "Request failed on a collaborator");
                }
                (
                    status_for(kind),
                    ErrorBody {
                        code: -1,
                        msg: error.to_string(),
                        kind: Some(kind),
                        retryable: error.is_retryable(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<KnowledgeError> for AppError {
    fn from(inner: KnowledgeError) -> Self {
        Self::Knowledge(inner)
    }
}
