#![deny(missing_docs)]

//! Core library for the knowledge ingestion service.
//!
//! Clients negotiate presigned uploads, push bytes straight to the object store, then ask the
//! service to reconcile the upload. Reconciled files are parsed, chunked, embedded, and written
//! to the vector store in the background.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Embedding client abstraction and adapters.
pub mod embedding;
/// Upload negotiation, finalization, and the vectorization pipeline.
pub mod knowledge;
/// Structured logging and tracing setup.
pub mod logging;
/// File metadata persistence.
pub mod metadata;
/// Ingestion metrics helpers.
pub mod metrics;
/// Text extraction for supported document formats.
pub mod parsers;
/// S3-compatible object storage.
pub mod storage;
/// Vector store integration.
pub mod vector;
