//! JATS/NLM XML extraction from PMC open-access archives.
//!
//! Archives arrive as `.tgz` files containing one `.nxml` article plus
//! assorted image assets. The article has no pagination, so section
//! boundaries stand in for page breaks: the abstract first, then each
//! top-level body section becomes one break unit.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use tar::Archive;
use tracing::debug;

use super::{collapse_whitespace, DocumentExtractor, ExtractError};
use crate::models::{DocumentMetadata, ExtractedText};

pub struct XmlExtractor;

impl DocumentExtractor for XmlExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedText, ExtractError> {
        let scratch = tempfile::tempdir()?;
        let archive_file = File::open(path)?;
        Archive::new(GzDecoder::new(archive_file))
            .unpack(scratch.path())
            .map_err(|e| ExtractError::Archive(e.to_string()))?;

        let nxml_path = find_nxml(scratch.path())?.ok_or(ExtractError::MissingArticle)?;
        debug!(file = %nxml_path.display(), "found article XML");

        let xml = std::fs::read_to_string(&nxml_path)?;
        parse_jats(&xml)
    }
}

/// First `.nxml` file anywhere under `dir`.
fn find_nxml(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(found) = find_nxml(&path)? {
                return Ok(Some(found));
            }
        } else if path.extension().is_some_and(|ext| ext == "nxml") {
            return Ok(Some(path));
        }
    }
    Ok(None)
}

/// Parse a JATS article into linear text with section-break offsets.
pub fn parse_jats(xml: &str) -> Result<ExtractedText, ExtractError> {
    let root = parse_tree(xml)?;
    let metadata = article_metadata(&root);

    let mut units: Vec<String> = Vec::new();

    if let Some(abstract_el) = root.find("abstract") {
        let abstract_text = collapse_whitespace(&text_of(abstract_el));
        if !abstract_text.is_empty() {
            units.push(format!("ABSTRACT\n\n{abstract_text}"));
        }
    }

    if let Some(body) = root.find("body") {
        for sec in body.elements().filter(|el| el.name == "sec") {
            let mut paragraphs = Vec::new();
            let mut p_nodes = Vec::new();
            sec.find_all("p", &mut p_nodes);
            for p in p_nodes {
                let para = collapse_whitespace(&text_of(p));
                if !para.is_empty() {
                    paragraphs.push(para);
                }
            }
            if paragraphs.is_empty() {
                continue;
            }

            let title = sec
                .elements()
                .find(|el| el.name == "title")
                .map(|t| collapse_whitespace(&text_of(t)))
                .filter(|t| !t.is_empty());

            let mut section_text = String::new();
            if let Some(title) = title {
                section_text.push_str(&title.to_uppercase());
                section_text.push_str("\n\n");
            }
            section_text.push_str(&paragraphs.join("\n\n"));
            units.push(section_text);
        }

        // Unstructured articles: everything in the body as one unit.
        if units.is_empty() {
            let body_text = collapse_whitespace(&text_of(body));
            if !body_text.is_empty() {
                units.push(body_text);
            }
        }
    }

    let mut text = String::new();
    let mut page_breaks = Vec::new();
    for unit in &units {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(unit);
        page_breaks.push(text.len());
    }

    debug!(
        chars = text.len(),
        sections = page_breaks.len(),
        "extracted XML text"
    );

    Ok(ExtractedText {
        text,
        page_breaks,
        metadata,
    })
}

/// Title and author list from `article-meta`.
fn article_metadata(root: &XmlNode) -> DocumentMetadata {
    let meta = root.find("article-meta");

    let title = meta
        .and_then(|m| m.find("article-title"))
        .map(|t| collapse_whitespace(&text_of(t)))
        .filter(|t| !t.is_empty());

    let mut authors = Vec::new();
    if let Some(meta) = meta {
        let mut contribs = Vec::new();
        meta.find_all("contrib", &mut contribs);
        for contrib in contribs
            .iter()
            .filter(|c| c.attr("contrib-type") == Some("author"))
        {
            let Some(name) = contrib.find("name") else {
                continue;
            };
            let surname = name
                .find("surname")
                .map(|n| collapse_whitespace(&n.direct_text()))
                .unwrap_or_default();
            let given = name
                .find("given-names")
                .map(|n| collapse_whitespace(&n.direct_text()))
                .unwrap_or_default();
            let full = if given.is_empty() {
                surname
            } else {
                format!("{given} {surname}")
            };
            if !full.is_empty() {
                authors.push(full);
            }
        }
    }

    DocumentMetadata {
        title,
        author: (!authors.is_empty()).then(|| authors.join(", ")),
    }
}

// ── Element tree ─────────────────────────────────────────────────────────

/// Minimal DOM built from quick-xml events. JATS articles are small
/// enough that a tree beats threading the flattening rules through a
/// streaming state machine.
struct XmlNode {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<XmlChild>,
}

enum XmlChild {
    Element(XmlNode),
    Text(String),
}

impl XmlNode {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Direct child elements.
    fn elements(&self) -> impl Iterator<Item = &XmlNode> {
        self.children.iter().filter_map(|c| match c {
            XmlChild::Element(el) => Some(el),
            XmlChild::Text(_) => None,
        })
    }

    /// First descendant with the given name, depth-first.
    fn find(&self, name: &str) -> Option<&XmlNode> {
        for el in self.elements() {
            if el.name == name {
                return Some(el);
            }
            if let Some(found) = el.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// All descendants with the given name, in document order.
    fn find_all<'a>(&'a self, name: &str, out: &mut Vec<&'a XmlNode>) {
        for el in self.elements() {
            if el.name == name {
                out.push(el);
            }
            el.find_all(name, out);
        }
    }

    /// Concatenated text children, without descending into elements.
    fn direct_text(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            if let XmlChild::Text(t) = child {
                out.push_str(t);
            }
        }
        out
    }
}

fn parse_tree(xml: &str) -> Result<XmlNode, ExtractError> {
    let mut reader = Reader::from_str(xml);
    let mut stack = vec![XmlNode::new("#document")];
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| ExtractError::Xml(e.to_string()))?;
        match event {
            Event::Start(ref e) => stack.push(node_from(e)),
            Event::Empty(ref e) => {
                let node = node_from(e);
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlChild::Element(node));
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| ExtractError::Xml("unbalanced element".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(XmlChild::Element(node)),
                    None => return Err(ExtractError::Xml("unbalanced element".to_string())),
                }
            }
            Event::Text(ref t) => {
                let text = t
                    .unescape()
                    .map_err(|e| ExtractError::Xml(e.to_string()))?
                    .into_owned();
                if !text.is_empty() {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlChild::Text(text));
                    }
                }
            }
            Event::CData(t) => {
                let text = String::from_utf8_lossy(&t.into_inner()).into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlChild::Text(text));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if stack.len() != 1 {
        return Err(ExtractError::Xml("unexpected end of document".to_string()));
    }
    stack
        .pop()
        .ok_or_else(|| ExtractError::Xml("empty document".to_string()))
}

fn node_from(start: &quick_xml::events::BytesStart<'_>) -> XmlNode {
    let mut node = XmlNode::new(local_name(start.name().as_ref()));
    for attr in start.attributes().flatten() {
        let key = local_name(attr.key.as_ref());
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_default();
        node.attrs.push((key, value));
    }
    node
}

fn local_name(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw);
    name.rsplit(':').next().unwrap_or("").to_string()
}

/// Recursively flatten element text. Cross-references and links keep
/// their inline text without the target; figures, tables and
/// supplementary material contribute only their captions.
fn flatten_text(node: &XmlNode, out: &mut String) {
    for child in &node.children {
        match child {
            XmlChild::Text(t) => out.push_str(t),
            XmlChild::Element(el) => match el.name.as_str() {
                "xref" | "ext-link" | "email" => out.push_str(&el.direct_text()),
                "fig" | "table-wrap" | "supplementary-material" => {
                    if let Some(caption) = el.find("caption") {
                        flatten_text(caption, out);
                    }
                }
                _ => flatten_text(el, out),
            },
        }
    }
}

fn text_of(node: &XmlNode) -> String {
    let mut out = String::new();
    flatten_text(node, &mut out);
    out
}
