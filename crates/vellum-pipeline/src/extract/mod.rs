//! Text extraction from source documents.
//!
//! Two extractors sit behind one contract: [`PdfExtractor`] for PDF files
//! and [`XmlExtractor`] for JATS/NLM article archives. Both produce the
//! same [`ExtractedText`] shape — linear text, page-break offsets, and
//! whatever title/author metadata the source carries — so everything
//! downstream is format-agnostic.

pub mod pdf;
pub mod xml;

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::models::{DocumentFormat, ExtractedText};

pub use pdf::PdfExtractor;
pub use xml::XmlExtractor;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("failed to read PDF: {0}")]
    Pdf(String),

    #[error("failed to unpack archive: {0}")]
    Archive(String),

    #[error("no .nxml article file in archive")]
    MissingArticle,

    #[error("XML parse error: {0}")]
    Xml(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Format-specific text extraction.
///
/// Implementations are synchronous; callers on an async runtime should
/// wrap extraction in `spawn_blocking`.
pub trait DocumentExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText, ExtractError>;
}

/// Extract a downloaded document according to its format tag.
///
/// An `Ok` result with empty text means the source parsed but contained
/// nothing usable; callers treat that as an extraction failure.
pub fn extract_document(path: &Path, format: DocumentFormat) -> Result<ExtractedText, ExtractError> {
    match format {
        DocumentFormat::Pdf => PdfExtractor.extract(path),
        DocumentFormat::Xml => XmlExtractor.extract(path),
    }
}

/// Collapse whitespace runs to single spaces and trim.
pub(crate) fn collapse_whitespace(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\s+").unwrap());
    re.replace_all(text, " ").trim().to_string()
}
