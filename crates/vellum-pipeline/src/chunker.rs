//! Token-budgeted text chunker.
//!
//! Splits extracted text into overlapping chunks sized for embedding:
//! paragraphs are accumulated up to a token budget, oversized paragraphs
//! are re-split at sentence boundaries, and consecutive chunks share a
//! configurable token overlap. Section headers seen along the way are
//! attached to the chunks they introduce.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;
use uuid::Uuid;

use crate::models::Chunk;

/// Fixed character-to-token ratio; no real tokenizer involved.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Token budget per chunk.
    pub max_tokens: usize,
    /// Minimum token overlap carried into the next chunk when a buffer
    /// is split.
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 600,
            overlap_tokens: 100,
        }
    }
}

/// Approximate token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// Map a character offset to a 1-based page number: the first page whose
/// break boundary lies beyond the offset, else the last page.
pub fn page_for_offset(offset: usize, page_breaks: &[usize]) -> u32 {
    for (i, brk) in page_breaks.iter().enumerate() {
        if offset < *brk {
            return (i + 1) as u32;
        }
    }
    page_breaks.len() as u32
}

/// Split on blank-line boundaries; empty paragraphs are dropped.
pub fn split_into_paragraphs(text: &str) -> Vec<String> {
    paragraph_boundary()
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Sentence boundary: `.`, `!` or `?` followed by whitespace and a
/// capital letter. Hand-rolled because the regex crate has no lookbehind.
pub fn split_into_sentences(text: &str) -> Vec<String> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if matches!(c, '.' | '!' | '?') {
            let mut j = i + 1;
            while j < chars.len() && chars[j].1.is_whitespace() {
                j += 1;
            }
            if j > i + 1 && j < chars.len() && chars[j].1.is_uppercase() {
                let sentence = text[start..pos + c.len_utf8()].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                start = chars[j].0;
                i = j;
                continue;
            }
        }
        i += 1;
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// If the paragraph's first line is a section header, return it.
/// Recognizes canonical academic section names and "N. Title" numbering.
pub fn detect_section_header(paragraph: &str) -> Option<String> {
    let first_line = paragraph.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return None;
    }
    if canonical_header().is_match(first_line) || numbered_header().is_match(first_line) {
        Some(first_line.to_string())
    } else {
        None
    }
}

/// Split `text` into overlapping chunks.
///
/// Paragraphs accumulate into a buffer until the next one would push the
/// joined token estimate past the budget; the buffer is then emitted and
/// reseeded with its smallest trailing slice whose token sum is at least
/// the configured overlap (the whole buffer when nothing smaller
/// suffices). A single paragraph over the budget flushes the buffer and
/// is re-split on sentence boundaries with the same accumulate/overlap
/// rule; its unfinished tail seeds the next paragraph buffer.
///
/// An empty input produces no chunks — the caller decides whether that is
/// an error. `overlap_tokens >= max_tokens` is a configuration error this
/// function does not validate.
pub fn chunk_text(
    text: &str,
    page_breaks: &[usize],
    document_id: &str,
    config: &ChunkerConfig,
) -> Vec<Chunk> {
    // separators used when joining buffered units back into chunk content
    const PARA_SEP: usize = 2; // "\n\n"
    const SENT_SEP: usize = 1; // " "

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut buffer: Vec<String> = Vec::new();
    let mut current_section: Option<String> = None;
    let mut buffer_section: Option<String> = None;

    for para in split_into_paragraphs(text) {
        if let Some(header) = detect_section_header(&para) {
            current_section = Some(header);
        }

        if estimate_tokens(&para) > config.max_tokens {
            // Flush whatever is pending, then work at sentence granularity.
            if !buffer.is_empty() {
                emit_unit_chunk(
                    &mut chunks,
                    text,
                    page_breaks,
                    document_id,
                    &buffer,
                    "\n\n",
                    buffer_section.clone(),
                );
                buffer.clear();
            }

            let mut sentence_buffer: Vec<String> = Vec::new();
            for sentence in split_into_sentences(&para) {
                if !sentence_buffer.is_empty()
                    && joined_tokens(&sentence_buffer, SENT_SEP, Some(sentence.len()))
                        > config.max_tokens
                {
                    emit_unit_chunk(
                        &mut chunks,
                        text,
                        page_breaks,
                        document_id,
                        &sentence_buffer,
                        " ",
                        current_section.clone(),
                    );
                    sentence_buffer =
                        overlap_suffix(&sentence_buffer, config.overlap_tokens, SENT_SEP);
                }
                sentence_buffer.push(sentence);
            }

            // The tail seeds the next paragraph-level buffer as one unit.
            if !sentence_buffer.is_empty() {
                buffer.push(sentence_buffer.join(" "));
                buffer_section = current_section.clone();
            }
            continue;
        }

        if !buffer.is_empty()
            && joined_tokens(&buffer, PARA_SEP, Some(para.len())) > config.max_tokens
        {
            emit_unit_chunk(
                &mut chunks,
                text,
                page_breaks,
                document_id,
                &buffer,
                "\n\n",
                buffer_section.clone(),
            );
            buffer = overlap_suffix(&buffer, config.overlap_tokens, PARA_SEP);
            buffer.push(para);
            buffer_section = current_section.clone();
        } else {
            if buffer.is_empty() {
                buffer_section = current_section.clone();
            }
            buffer.push(para);
        }
    }

    if !buffer.is_empty() {
        emit_unit_chunk(
            &mut chunks,
            text,
            page_breaks,
            document_id,
            &buffer,
            "\n\n",
            buffer_section,
        );
    }

    debug!(
        document = document_id,
        chunks = chunks.len(),
        chars = text.len(),
        "chunked document"
    );
    chunks
}

/// Token estimate of `units` joined by a `sep_len`-character separator,
/// optionally with one more unit of length `extra` appended.
fn joined_tokens(units: &[String], sep_len: usize, extra: Option<usize>) -> usize {
    let count = units.len() + usize::from(extra.is_some());
    if count == 0 {
        return 0;
    }
    let chars: usize = units.iter().map(String::len).sum::<usize>()
        + extra.unwrap_or(0)
        + sep_len * (count - 1);
    chars / CHARS_PER_TOKEN
}

/// Smallest trailing slice of `units` whose joined token estimate is at
/// least `overlap`. Falls back to the whole slice when even that is
/// below the bound.
fn overlap_suffix(units: &[String], overlap: usize, sep_len: usize) -> Vec<String> {
    let mut start = units.len();
    for i in (0..units.len()).rev() {
        start = i;
        if joined_tokens(&units[i..], sep_len, None) >= overlap {
            break;
        }
    }
    units[start..].to_vec()
}

/// Join buffered units into a chunk, locating it in the source text by
/// its first and last unit.
fn emit_unit_chunk(
    chunks: &mut Vec<Chunk>,
    text: &str,
    page_breaks: &[usize],
    document_id: &str,
    units: &[String],
    sep: &str,
    section: Option<String>,
) {
    let content = units.join(sep);
    let first = &units[0];
    let last = &units[units.len() - 1];

    let start = text.find(first.as_str()).unwrap_or(0);
    let end = text
        .find(last.as_str())
        .map(|p| p + last.len())
        .unwrap_or(start + content.len())
        .max(start);

    let chunk_index = chunks.len();
    chunks.push(Chunk {
        id: Uuid::new_v4(),
        document_id: document_id.to_string(),
        chunk_index,
        token_count: estimate_tokens(&content),
        start_page: page_for_offset(start, page_breaks),
        end_page: page_for_offset(end, page_breaks),
        section_header: section,
        content,
    });
}

fn paragraph_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").unwrap())
}

fn canonical_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:Abstract|Introduction|Background|Methods?|Materials?\s+and\s+Methods?|Results?|Discussion|Conclusions?|References|Acknowledgements?)\s*$",
        )
        .unwrap()
    })
}

fn numbered_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // e.g. "1. Introduction", "2 Materials"
    RE.get_or_init(|| Regex::new(r"^\d+\.?\s+[A-Z][A-Za-z\s]+$").unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_tokens: usize, overlap_tokens: usize) -> ChunkerConfig {
        ChunkerConfig {
            max_tokens,
            overlap_tokens,
        }
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("", &[], "doc", &ChunkerConfig::default()).is_empty());
        assert!(chunk_text("  \n\n  ", &[], "doc", &ChunkerConfig::default()).is_empty());
    }

    #[test]
    fn small_text_is_a_single_chunk() {
        let text = "A short paragraph.\n\nAnd another one.";
        let chunks = chunk_text(text, &[], "doc", &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].content, "A short paragraph.\n\nAnd another one.");
        assert_eq!(chunks[0].token_count, estimate_tokens(&chunks[0].content));
    }

    #[test]
    fn indices_are_contiguous_and_zero_based() {
        let para = "x".repeat(400); // 100 tokens
        let text = vec![para; 8].join("\n\n");
        let chunks = chunk_text(&text, &[], "doc", &cfg(250, 50));
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
        }
    }

    #[test]
    fn first_header_wins_for_a_combined_chunk() {
        let text = "Abstract\n\nShort intro.\n\nIntroduction\n\nLonger body text that still fits.";
        let chunks = chunk_text(text, &[], "doc", &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].section_header.as_deref(), Some("Abstract"));
    }

    #[test]
    fn header_tracks_the_buffer_not_the_emit_point() {
        // p1/p2 fill the budget; "Methods" arrives with p3. The first
        // chunk keeps the header current when it started accumulating.
        let p1 = format!("Introduction\n{}", "a".repeat(398));
        let p2 = "b".repeat(400);
        let p3 = format!("Methods\n{}", "c".repeat(392));
        let text = format!("{p1}\n\n{p2}\n\n{p3}");
        let chunks = chunk_text(&text, &[], "doc", &cfg(250, 50));
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].section_header.as_deref(), Some("Introduction"));
        assert_eq!(
            chunks.last().unwrap().section_header.as_deref(),
            Some("Methods")
        );
    }

    #[test]
    fn numbered_headers_are_detected() {
        assert_eq!(
            detect_section_header("1. Introduction\nBody follows."),
            Some("1. Introduction".to_string())
        );
        assert_eq!(
            detect_section_header("Materials and Methods"),
            Some("Materials and Methods".to_string())
        );
        assert_eq!(detect_section_header("We measured the response."), None);
    }

    #[test]
    fn sentence_splitting_requires_capital_after_punctuation() {
        let sentences = split_into_sentences("It was fine. The end.");
        assert_eq!(sentences, vec!["It was fine.", "The end."]);

        // no capital after the period → no boundary
        let sentences = split_into_sentences("approx. values e.g. here");
        assert_eq!(sentences, vec!["approx. values e.g. here"]);

        let sentences = split_into_sentences("Really! Is it? Yes.");
        assert_eq!(sentences, vec!["Really!", "Is it?", "Yes."]);
    }

    #[test]
    fn oversized_paragraph_splits_on_sentences_within_budget() {
        // ~5000 characters, one paragraph; budget 600 tokens ≈ 2400 chars
        let para = "The quick brown fox jumps over the lazy dog. ".repeat(110);
        let chunks = chunk_text(para.trim(), &[], "doc", &cfg(600, 100));
        assert!(chunks.len() >= 2, "expected a sentence-level split");
        for chunk in &chunks {
            assert!(
                chunk.token_count <= 600,
                "chunk {} over budget: {}",
                chunk.chunk_index,
                chunk.token_count
            );
        }
    }

    #[test]
    fn single_oversized_sentence_is_its_own_chunk_verbatim() {
        let sentence = "z".repeat(3000); // no sentence boundary inside
        let chunks = chunk_text(&sentence, &[], "doc", &cfg(600, 100));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, sentence);
        assert!(chunks[0].token_count > 600);
    }

    #[test]
    fn split_buffers_overlap_by_at_least_the_configured_amount() {
        // three 200-token paragraphs, budget 500, overlap 150:
        // chunk 0 = p1+p2, reseed with p2, chunk 1 = p2+p3
        let p1 = format!("Alpha {}", "a".repeat(794));
        let p2 = format!("Bravo {}", "b".repeat(794));
        let p3 = format!("Candy {}", "c".repeat(794));
        let text = format!("{p1}\n\n{p2}\n\n{p3}");
        let chunks = chunk_text(&text, &[], "doc", &cfg(500, 150));

        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.ends_with(&p2));
        assert!(chunks[1].content.starts_with(&p2));
        assert!(estimate_tokens(&p2) >= 150);
        for chunk in &chunks {
            assert!(chunk.token_count <= 500);
        }
    }

    #[test]
    fn every_chunk_content_appears_in_the_source_text() {
        let paras: Vec<String> = (0..6)
            .map(|i| format!("Paragraph number {i} talking about topic {i}. {}", "w".repeat(300)))
            .collect();
        let text = paras.join("\n\n");
        let chunks = chunk_text(&text, &[], "doc", &cfg(200, 40));
        for chunk in &chunks {
            for unit in chunk.content.split("\n\n") {
                assert!(text.contains(unit), "unit not found in source");
            }
        }
    }

    #[test]
    fn pages_are_assigned_and_monotonic() {
        // two "pages": break offsets at the end of each page's text
        let page1 = format!("First page content. {}", "p".repeat(780));
        let page2 = format!("Second page content. {}", "q".repeat(780));
        let text = format!("{page1}\n\n{page2}");
        let page_breaks = vec![page1.len(), text.len()];

        let chunks = chunk_text(&text, &page_breaks, "doc", &cfg(150, 30));
        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].start_page, 1);
        assert_eq!(chunks.last().unwrap().end_page, 2);

        let mut previous = (0u32, 0u32);
        for chunk in &chunks {
            assert!(chunk.start_page <= chunk.end_page);
            assert!(chunk.start_page >= previous.0);
            assert!(chunk.end_page >= previous.1);
            previous = (chunk.start_page, chunk.end_page);
        }
    }

    #[test]
    fn page_lookup_handles_boundaries() {
        let breaks = vec![10, 25, 40];
        assert_eq!(page_for_offset(0, &breaks), 1);
        assert_eq!(page_for_offset(9, &breaks), 1);
        assert_eq!(page_for_offset(10, &breaks), 2);
        assert_eq!(page_for_offset(39, &breaks), 3);
        assert_eq!(page_for_offset(40, &breaks), 3); // past the last break
        assert_eq!(page_for_offset(5, &[]), 0);
    }
}
