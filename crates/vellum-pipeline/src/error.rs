//! Per-document failure taxonomy.

use thiserror::Error;

use crate::models::DocumentFormat;

/// A failure while processing one document. Never fatal to the batch:
/// the document is marked `error` with the rendered message and the run
/// moves on to the next document.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Download failed: {0}")]
    Download(String),

    #[error("Text extraction failed ({format})")]
    Extraction {
        format: DocumentFormat,
        reason: String,
    },

    #[error("Chunking produced no results")]
    EmptyChunking,

    #[error("Embedding failed: {0}")]
    Embedding(String),

    #[error("Embedding generation mismatch: {actual} vectors for {expected} chunks")]
    EmbeddingCount { expected: usize, actual: usize },

    #[error("Wrong embedding dimension: {actual} != {expected}")]
    EmbeddingDimension { expected: usize, actual: usize },

    #[error("Upload failed: {0}")]
    Upload(String),
}
