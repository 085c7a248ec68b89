//! PDF text extraction with page boundary tracking.

use std::path::Path;
use std::sync::OnceLock;

use lopdf::Document as PdfDocument;
use regex::Regex;
use tracing::debug;

use super::{collapse_whitespace, DocumentExtractor, ExtractError};
use crate::models::{DocumentMetadata, ExtractedText};

pub struct PdfExtractor;

impl DocumentExtractor for PdfExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText, ExtractError> {
        let doc = PdfDocument::load(path).map_err(|e| ExtractError::Pdf(e.to_string()))?;

        let mut text = String::new();
        let mut page_breaks = Vec::new();

        for (page_number, _) in doc.get_pages() {
            // A page that fails text extraction contributes nothing
            // rather than failing the whole document.
            let raw = doc.extract_text(&[page_number]).unwrap_or_default();
            let cleaned = clean_page_text(&raw);
            if cleaned.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(&cleaned);
            page_breaks.push(text.len());
        }

        debug!(
            path = %path.display(),
            chars = text.len(),
            pages = page_breaks.len(),
            "extracted PDF text"
        );

        Ok(ExtractedText {
            text,
            page_breaks,
            metadata: pdf_metadata(&doc),
        })
    }
}

/// Drop page-number-only lines and common header/footer boilerplate,
/// then collapse the page into whitespace-normalized running text.
fn clean_page_text(raw: &str) -> String {
    let kept: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !page_number_line().is_match(line) && !boilerplate_line().is_match(line)
        })
        .collect();
    collapse_whitespace(&kept.join(" "))
}

fn page_number_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+$").unwrap())
}

fn boilerplate_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:Page \d+ of \d+|www\..+|https?://.+)$").unwrap())
}

/// Title/author from the Info dictionary, when present and non-empty.
fn pdf_metadata(doc: &PdfDocument) -> DocumentMetadata {
    let info = doc
        .trailer
        .get(b"Info")
        .ok()
        .and_then(|obj| obj.as_reference().ok())
        .and_then(|id| doc.get_dictionary(id).ok());

    let field = |key: &[u8]| {
        info.and_then(|dict| dict.get(key).ok())
            .and_then(|obj| obj.as_str().ok())
            .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
            .filter(|s| !s.is_empty())
    };

    DocumentMetadata {
        title: field(b"Title"),
        author: field(b"Author"),
    }
}
