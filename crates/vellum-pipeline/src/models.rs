//! Data models for the processing pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Source file format, chosen at upload time and stored with the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    /// JATS/NLM article XML, delivered as a `.tgz` archive.
    Xml,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Xml => "xml",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pdf" => Some(DocumentFormat::Pdf),
            "xml" => Some(DocumentFormat::Xml),
            _ => None,
        }
    }

    /// Extension for the locally downloaded copy.
    pub fn file_extension(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => ".pdf",
            DocumentFormat::Xml => ".tgz",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing lifecycle. Documents are created externally in `pending`;
/// the pipeline moves them to `processing` and then `ready` or `error`.
/// `error` documents can be requeued by a later run with
/// `--include-errors`. A document left in `processing` by a crash stays
/// there until an administrative reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "ready" => Some(DocumentStatus::Ready),
            "error" => Some(DocumentStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One source document as stored in the metadata store.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub pmcid: Option<String>,
    pub pmid: Option<String>,
    /// Owning study row, when the document has been linked.
    pub study_id: Option<i64>,
    pub filename: String,
    pub format: DocumentFormat,
    /// Object-store key of the raw content.
    pub object_key: String,
    pub status: DocumentStatus,
}

/// Optional title/author pulled from the source file.
#[derive(Debug, Clone, Default)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
}

/// Linear text plus page boundaries, as produced by an extractor.
/// Lives only for the duration of one document's processing.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub text: String,
    /// Cumulative character offsets, one per page (or per section unit
    /// for XML sources), strictly increasing.
    pub page_breaks: Vec<usize>,
    pub metadata: DocumentMetadata,
}

impl ExtractedText {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// A retrieval-sized slice of a document's text.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: String,
    /// Zero-based, contiguous per document.
    pub chunk_index: usize,
    pub content: String,
    pub start_page: u32,
    pub end_page: u32,
    /// Nearest preceding section header at the time this chunk's first
    /// unit entered the buffer.
    pub section_header: Option<String>,
    pub token_count: usize,
}
