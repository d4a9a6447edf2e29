//! Core data models used throughout Distill Harness.
//!
//! These types represent the documents, route decisions, extracted text,
//! chunks, and QA pairs that flow through the distillation pipeline.

use std::path::PathBuf;

/// Declared type of a source document, resolved from its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    Markdown,
    Word,
    Pdf,
    Image,
}

impl FileKind {
    /// Resolve a lowercase file extension to a kind. `None` for anything
    /// outside the supported set.
    pub fn from_extension(ext: &str) -> Option<FileKind> {
        match ext {
            "txt" => Some(FileKind::Text),
            "md" | "markdown" => Some(FileKind::Markdown),
            "docx" => Some(FileKind::Word),
            "pdf" => Some(FileKind::Pdf),
            "png" | "jpg" | "jpeg" => Some(FileKind::Image),
            _ => None,
        }
    }

    /// All extensions the pipeline accepts, for discovery globs and
    /// error messages.
    pub fn supported_extensions() -> &'static [&'static str] {
        &["txt", "md", "markdown", "docx", "pdf", "png", "jpg", "jpeg"]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Text => "text",
            FileKind::Markdown => "markdown",
            FileKind::Word => "word",
            FileKind::Pdf => "pdf",
            FileKind::Image => "image",
        }
    }
}

/// A source document as discovered on disk. Immutable once read.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub kind: FileKind,
}

/// Which extraction path a document should take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extractor {
    Native,
    Ocr,
}

impl Extractor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Extractor::Native => "native",
            Extractor::Ocr => "ocr",
        }
    }
}

/// Routing outcome for one document. Cheap to recompute, never persisted.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub document: Document,
    pub is_scanned: bool,
    pub extractor: Extractor,
}

/// One entry of a document's structural outline (heading list).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineEntry {
    /// Heading level, 1-based (`#` = 1).
    pub level: u8,
    pub title: String,
    /// Approximate character offset of the heading in the flattened text.
    pub offset: usize,
}

/// Flattened text plus structural outline for one document.
///
/// Can be megabytes for large sources; held only for the duration of a
/// single pipeline run.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    pub document_id: String,
    pub text: String,
    pub outline: Vec<OutlineEntry>,
}

/// A bounded, overlap-linked substring of a document's extracted text —
/// the unit of work sent to the completion service.
///
/// `start`/`end` are character offsets into the source text. For
/// `index > 0`, `start == previous.end - overlap` unless the source was
/// exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// One instruction/answer pair produced by distillation.
///
/// Both fields are trimmed and non-empty after a successful call; the
/// response parser drops anything else.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QaPair {
    pub question: String,
    pub answer: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_resolution() {
        assert_eq!(FileKind::from_extension("txt"), Some(FileKind::Text));
        assert_eq!(
            FileKind::from_extension("markdown"),
            Some(FileKind::Markdown)
        );
        assert_eq!(FileKind::from_extension("jpeg"), Some(FileKind::Image));
        assert_eq!(FileKind::from_extension("odt"), None);
        // Caller is responsible for lowercasing.
        assert_eq!(FileKind::from_extension("PDF"), None);
    }
}
