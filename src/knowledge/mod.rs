//! Knowledge file lifecycle: upload negotiation, finalization, and vectorization.
//!
//! A file moves through `PENDING → UPLOADING → COMPLETED → PROCESSING → VECTORIZED`, or into
//! `FAILED`. [`KnowledgeService`] is the entry point used by the HTTP surface and the CLI; the
//! individual components are exposed for embedding the pipeline elsewhere.

pub mod chunking;
pub mod finalizer;
pub mod lease;
pub mod negotiator;
pub mod service;
pub mod status;
pub mod types;
pub mod vectorizer;

pub use crate::metadata::KnowledgeFile;
pub use finalizer::UploadFinalizer;
pub use negotiator::UploadNegotiator;
pub use service::{KnowledgeApi, KnowledgeService, ServiceSettings};
pub use status::FileStatus;
pub use types::{
    ErrorKind, KnowledgeError, PartUploadUrl, SearchRequest, UploadPlan, UploadRequest,
    UploadSettings, VectorizeOutcome,
};
pub use vectorizer::{Vectorizer, VectorizerSettings};
