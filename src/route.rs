//! File-type detection and routing.
//!
//! Classifies a document by extension and, for PDFs, by sampled text
//! density, choosing native vs OCR handling. Native extraction on a
//! scanned PDF yields near-empty text and silently produces a
//! near-empty dataset, so the density probe reads only the first couple
//! of pages and fails the document over to OCR before any expensive
//! work happens.

use std::path::Path;

use uuid::Uuid;

use crate::config::RouterConfig;
use crate::models::{Document, Extractor, FileKind, RouteDecision};

/// Routing error (fatal setup errors in the pipeline taxonomy).
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("not a regular file: {0}")]
    NotAFile(String),
    #[error("unsupported file type '{ext}' (supported: {supported})")]
    Unsupported { ext: String, supported: String },
    #[error("failed to probe PDF: {0}")]
    Pdf(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classify `path` and decide which extractor should handle it.
pub fn route(path: &Path, config: &RouterConfig) -> Result<RouteDecision, RouteError> {
    if !path.exists() {
        return Err(RouteError::NotFound(path.display().to_string()));
    }
    if !path.is_file() {
        return Err(RouteError::NotAFile(path.display().to_string()));
    }

    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let kind = FileKind::from_extension(&ext).ok_or_else(|| RouteError::Unsupported {
        ext: ext.clone(),
        supported: FileKind::supported_extensions().join(", "),
    })?;

    let size_bytes = std::fs::metadata(path)?.len();
    let document = Document {
        id: Uuid::new_v4().to_string(),
        path: path.to_path_buf(),
        size_bytes,
        kind,
    };

    let (is_scanned, extractor) = match kind {
        FileKind::Image => (true, Extractor::Ocr),
        FileKind::Pdf => {
            let scanned = detect_scanned_pdf(path, config)?;
            (scanned, if scanned { Extractor::Ocr } else { Extractor::Native })
        }
        _ => (false, Extractor::Native),
    };

    Ok(RouteDecision {
        document,
        is_scanned,
        extractor,
    })
}

/// Probe the first `check_pages` pages of a PDF and classify it as
/// scanned when the average extracted-character count per page falls
/// below `scan_threshold`.
///
/// A page whose text layer cannot be decoded counts as zero characters —
/// that is exactly the scanned case the probe exists to catch.
fn detect_scanned_pdf(path: &Path, config: &RouterConfig) -> Result<bool, RouteError> {
    let doc = lopdf::Document::load(path).map_err(|e| RouteError::Pdf(e.to_string()))?;

    let pages = doc.get_pages();
    let mut page_numbers: Vec<u32> = pages.keys().copied().collect();
    page_numbers.sort_unstable();
    page_numbers.truncate(config.check_pages.max(1));

    if page_numbers.is_empty() {
        return Ok(true);
    }

    let mut total_chars = 0usize;
    for page in &page_numbers {
        if let Ok(text) = doc.extract_text(&[*page]) {
            total_chars += text.trim().chars().count();
        }
    }

    let avg = total_chars / page_numbers.len();
    Ok(avg < config.scan_threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use std::io::Write;

    fn router() -> RouterConfig {
        RouterConfig {
            check_pages: 2,
            scan_threshold: 100,
        }
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = route(Path::new("/nonexistent/file.txt"), &router()).unwrap_err();
        assert!(matches!(err, RouteError::NotFound(_)));
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"x")
            .unwrap();
        let err = route(&path, &router()).unwrap_err();
        match err {
            RouteError::Unsupported { ext, .. } => assert_eq!(ext, "bin"),
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }

    #[test]
    fn text_routes_native() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello").unwrap();
        let decision = route(&path, &router()).unwrap();
        assert_eq!(decision.document.kind, FileKind::Text);
        assert_eq!(decision.extractor, Extractor::Native);
        assert!(!decision.is_scanned);
        assert_eq!(decision.document.size_bytes, 5);
    }

    #[test]
    fn image_routes_ocr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        std::fs::write(&path, b"\x89PNG\r\n").unwrap();
        let decision = route(&path, &router()).unwrap();
        assert_eq!(decision.document.kind, FileKind::Image);
        assert_eq!(decision.extractor, Extractor::Ocr);
        assert!(decision.is_scanned);
    }

    #[test]
    fn garbage_pdf_is_a_probe_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"not a pdf at all").unwrap();
        let err = route(&path, &router()).unwrap_err();
        assert!(matches!(err, RouteError::Pdf(_)));
    }
}
