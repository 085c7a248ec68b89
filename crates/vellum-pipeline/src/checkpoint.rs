//! Run statistics and checkpoint persistence.
//!
//! The durable counters live in [`RunStats`], a plain value type;
//! [`StatsTracker`] owns one behind a mutex and gives concurrent workers
//! atomic record operations. Persistence always works on a snapshot taken
//! outside the lock.
//!
//! The checkpoint is progress reporting only: work selection on resume
//! goes by remote document status, so replaying a checkpoint can never
//! double-process a `ready` document.

use std::io;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Durable snapshot of one processing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub started_at: DateTime<Utc>,
    pub documents_processed: u64,
    pub documents_failed: u64,
    pub chunks_created: u64,
    pub vectors_uploaded: u64,
    /// Most recently completed document, for resume reporting.
    pub last_document_id: Option<String>,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            documents_processed: 0,
            documents_failed: 0,
            chunks_created: 0,
            vectors_uploaded: 0,
            last_document_id: None,
        }
    }

    pub fn attempted(&self) -> u64 {
        self.documents_processed + self.documents_failed
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrency-safe accumulator owning the run counters.
#[derive(Debug)]
pub struct StatsTracker {
    inner: Mutex<RunStats>,
}

impl StatsTracker {
    pub fn new(stats: RunStats) -> Self {
        Self {
            inner: Mutex::new(stats),
        }
    }

    pub fn record_success(&self, document_id: &str, chunks: u64, vectors: u64) {
        let mut stats = self.inner.lock().unwrap();
        stats.documents_processed += 1;
        stats.chunks_created += chunks;
        stats.vectors_uploaded += vectors;
        stats.last_document_id = Some(document_id.to_string());
    }

    pub fn record_failure(&self, document_id: &str) {
        let mut stats = self.inner.lock().unwrap();
        stats.documents_failed += 1;
        stats.last_document_id = Some(document_id.to_string());
    }

    pub fn attempted(&self) -> u64 {
        self.inner.lock().unwrap().attempted()
    }

    pub fn snapshot(&self) -> RunStats {
        self.inner.lock().unwrap().clone()
    }

    /// Write the current snapshot to `path`. File IO happens outside the
    /// lock.
    pub fn persist(&self, path: &Path) -> io::Result<()> {
        let snapshot = self.snapshot();
        save_checkpoint(path, &snapshot)
    }
}

pub fn save_checkpoint(path: &Path, stats: &RunStats) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(stats).map_err(io::Error::other)?;
    std::fs::write(path, json)
}

pub fn load_checkpoint(path: &Path) -> io::Result<Option<RunStats>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let stats = serde_json::from_str(&data).map_err(io::Error::other)?;
    Ok(Some(stats))
}
