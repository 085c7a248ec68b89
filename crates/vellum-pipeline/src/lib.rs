//! vellum-pipeline — the document processing pipeline.
//!
//! Drives scientific documents (PDF or JATS/NLM XML archives) from
//! `pending` to `ready`:
//!
//! 1. Fetch pending documents from the remote metadata store
//! 2. Download the raw content
//! 3. Extract linear text with page boundaries
//! 4. Chunk into overlapping, token-budgeted segments
//! 5. Embed each chunk
//! 6. Upload chunks + vectors, mark the document `ready`
//!
//! Failures are isolated per document (`error` status with a short
//! diagnostic); the batch keeps going. Progress counters are persisted
//! to a checkpoint file so interrupted runs can be resumed.

pub mod checkpoint;
pub mod chunker;
pub mod error;
pub mod extract;
pub mod models;
pub mod pipeline;
pub mod store;

pub use checkpoint::{load_checkpoint, save_checkpoint, RunStats, StatsTracker};
pub use chunker::{chunk_text, ChunkerConfig};
pub use error::PipelineError;
pub use extract::{extract_document, DocumentExtractor, ExtractError};
pub use models::{Chunk, Document, DocumentFormat, DocumentStatus, ExtractedText};
pub use pipeline::{BatchProcessor, PipelineConfig, TextEmbedder};
pub use store::{DocumentFilter, RemoteStore, StoreConfig, StoreError};
