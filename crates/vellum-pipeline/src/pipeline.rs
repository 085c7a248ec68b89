//! Batch orchestration: fetch → download → extract → chunk → embed → upload.
//!
//! A single coordinator fetches batches of pending documents and fans
//! each batch out over a bounded worker pool. Workers share the store
//! client, the embedding handle and the stats tracker; nothing else is
//! shared, so a failure in one document never touches another.
//!
//! Crash behaviour is deliberate: a document caught mid-`processing` by a
//! crash stays in `processing` until an administrative requeue — there is
//! no lease or timeout reclaim. The checkpoint only reports progress;
//! resumed runs select work by remote status, which makes resumption
//! idempotent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tracing::{error, info, instrument, warn};

use crate::checkpoint::{RunStats, StatsTracker};
use crate::chunker::{chunk_text, ChunkerConfig};
use crate::error::PipelineError;
use crate::extract::extract_document;
use crate::models::{Document, DocumentStatus};
use crate::store::{DocumentFilter, RemoteStore, StoreError};

/// Batched text → vector interface the orchestrator drives.
///
/// Implementations are built once, before workers start, and shared by
/// reference across the pool; they must tolerate concurrent calls.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Expected output dimension; anything else is a hard failure for
    /// the document being processed.
    fn dimension(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum documents to process across all batches; 0 = unlimited.
    pub limit: usize,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub include_errors: bool,
    /// Concurrent document workers within a batch.
    pub workers: usize,
    /// Rows per pending-document fetch.
    pub fetch_size: usize,
    pub checkpoint_path: PathBuf,
    /// Persist the checkpoint every N attempted documents.
    pub checkpoint_interval: u64,
    /// Scratch directory for downloaded content.
    pub data_dir: PathBuf,
    /// Politeness pause between batch fetches.
    pub batch_pause: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            limit: 0,
            year: None,
            month: None,
            include_errors: false,
            workers: 1,
            fetch_size: 1000,
            checkpoint_path: PathBuf::from("data/checkpoint.json"),
            checkpoint_interval: 10,
            data_dir: PathBuf::from("data"),
            batch_pause: Duration::from_secs(1),
        }
    }
}

pub struct BatchProcessor {
    store: Arc<RemoteStore>,
    embedder: Arc<dyn TextEmbedder>,
    chunker: ChunkerConfig,
    config: PipelineConfig,
    stats: Arc<StatsTracker>,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<RemoteStore>,
        embedder: Arc<dyn TextEmbedder>,
        chunker: ChunkerConfig,
        config: PipelineConfig,
        stats: Arc<StatsTracker>,
    ) -> Self {
        Self {
            store,
            embedder,
            chunker,
            config,
            stats,
        }
    }

    /// Process batches until the pending set drains or the limit is hit.
    ///
    /// A store error on the pending fetch aborts the run; everything
    /// below that level is isolated per document.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<RunStats, StoreError> {
        std::fs::create_dir_all(&self.config.data_dir)?;

        let mut remaining = self.config.limit;
        loop {
            let fetch_limit = if self.config.limit == 0 {
                self.config.fetch_size
            } else {
                remaining.min(self.config.fetch_size)
            };

            let documents = self
                .store
                .pending_documents(&self.filter(fetch_limit))
                .await?;
            if documents.is_empty() {
                info!("no more pending documents");
                break;
            }

            info!(
                count = documents.len(),
                workers = self.config.workers,
                "processing batch"
            );
            let batch_size = documents.len();
            let checkpoint_interval = self.config.checkpoint_interval.max(1);

            stream::iter(documents)
                .for_each_concurrent(self.config.workers.max(1), |document| async move {
                    self.process_document(document).await;
                    if self.stats.attempted() % checkpoint_interval == 0 {
                        self.save_checkpoint();
                    }
                })
                .await;

            self.save_checkpoint();

            let so_far = self.stats.snapshot();
            info!(
                processed = so_far.documents_processed,
                failed = so_far.documents_failed,
                chunks = so_far.chunks_created,
                "batch complete"
            );

            if self.config.limit > 0 {
                remaining = remaining.saturating_sub(batch_size);
                if remaining == 0 {
                    break;
                }
            }

            tokio::time::sleep(self.config.batch_pause).await;
        }

        self.save_checkpoint();
        Ok(self.stats.snapshot())
    }

    /// The documents the next fetch would return, for `--dry-run`.
    pub async fn list_pending(&self) -> Result<Vec<Document>, StoreError> {
        let fetch_limit = if self.config.limit == 0 {
            self.config.fetch_size
        } else {
            self.config.limit.min(self.config.fetch_size)
        };
        self.store.pending_documents(&self.filter(fetch_limit)).await
    }

    fn filter(&self, limit: usize) -> DocumentFilter {
        DocumentFilter {
            limit,
            year: self.config.year,
            month: self.config.month,
            include_errors: self.config.include_errors,
        }
    }

    fn save_checkpoint(&self) {
        if let Err(e) = self.stats.persist(&self.config.checkpoint_path) {
            warn!(
                path = %self.config.checkpoint_path.display(),
                error = %e,
                "checkpoint write failed"
            );
        }
    }

    /// Drive one document through the pipeline and record the outcome.
    async fn process_document(&self, document: Document) {
        match self.run_document(&document).await {
            Ok(chunk_count) => {
                self.store
                    .update_status(&document.id, DocumentStatus::Ready, Some(chunk_count), None)
                    .await;
                if let Err(e) = self
                    .store
                    .mark_study_processed(
                        document.study_id,
                        document.pmid.as_deref(),
                        document.pmcid.as_deref(),
                    )
                    .await
                {
                    warn!(document = %document.id, error = %e, "study bookkeeping update failed");
                }
                self.stats
                    .record_success(&document.id, chunk_count as u64, chunk_count as u64);
                info!(document = %document.id, chunks = chunk_count, "document ready");
            }
            Err(pipeline_error) => {
                let message = pipeline_error.to_string();
                error!(document = %document.id, %message, "document failed");
                self.store
                    .update_status(&document.id, DocumentStatus::Error, None, Some(&message))
                    .await;
                self.stats.record_failure(&document.id);
            }
        }
    }

    /// The per-document step sequence. The first failing step wins; the
    /// rest are skipped.
    async fn run_document(&self, document: &Document) -> Result<usize, PipelineError> {
        self.store
            .update_status(&document.id, DocumentStatus::Processing, None, None)
            .await;

        // Downloaded content lives in this scope only; Drop removes the
        // file on every exit path, including the failing ones.
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", document.id))
            .suffix(document.format.file_extension())
            .tempfile_in(&self.config.data_dir)
            .map_err(|e| PipelineError::Download(e.to_string()))?;

        self.store
            .download_document(&document.id, scratch.path())
            .await
            .map_err(|e| PipelineError::Download(e.to_string()))?;

        let path = scratch.path().to_path_buf();
        let format = document.format;
        let extracted = tokio::task::spawn_blocking(move || extract_document(&path, format))
            .await
            .map_err(|e| PipelineError::Extraction {
                format,
                reason: e.to_string(),
            })?
            .map_err(|e| PipelineError::Extraction {
                format,
                reason: e.to_string(),
            })?;

        if extracted.is_empty() {
            return Err(PipelineError::Extraction {
                format,
                reason: "no text extracted".to_string(),
            });
        }

        let chunks = chunk_text(
            &extracted.text,
            &extracted.page_breaks,
            &document.id,
            &self.chunker,
        );
        if chunks.is_empty() {
            return Err(PipelineError::EmptyChunking);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let embeddings = self
            .embedder
            .embed(&texts)
            .await
            .map_err(|e| PipelineError::Embedding(e.to_string()))?;

        if embeddings.len() != chunks.len() {
            return Err(PipelineError::EmbeddingCount {
                expected: chunks.len(),
                actual: embeddings.len(),
            });
        }
        let expected_dim = self.embedder.dimension();
        if let Some(first) = embeddings.first() {
            if first.len() != expected_dim {
                return Err(PipelineError::EmbeddingDimension {
                    expected: expected_dim,
                    actual: first.len(),
                });
            }
        }

        self.store
            .upload_chunks(&document.id, &chunks, &embeddings)
            .await
            .map_err(|e| PipelineError::Upload(e.to_string()))?;

        Ok(chunks.len())
    }
}
