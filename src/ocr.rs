//! OCR extraction for scanned PDFs and images.
//!
//! The recognition algorithm itself is a black box behind
//! [`OcrEngine`]: pages in, text out. This module contributes the two
//! things the pipeline actually needs around it: **page batching**, so
//! peak memory stays bounded on very large scanned files, and
//! **per-batch checkpointing**, so OCR — typically the slowest, least
//! reliable stage — restarts at the last completed batch rather than
//! page 1. Recognized fragments are persisted with the progress record;
//! a resumed run re-reads them instead of re-recognizing paid-for
//! pages.

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::checkpoint::{key_for, CheckpointStore};
use crate::extract::{markdown_outline, ExtractError};
use crate::models::{ExtractedText, FileKind, RouteDecision};
use crate::progress::{ProgressEvent, ProgressReporter};

/// A black-box OCR engine: a page range of a document in, recognized
/// text out. Page numbers are 1-based and inclusive.
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;
    fn recognize(&self, path: &Path, first: usize, last: usize) -> Result<String, ExtractError>;
}

/// Runs a user-configured external OCR command and reads recognized
/// text from its stdout.
///
/// The command template is split on whitespace; the placeholders
/// `{input}`, `{first}` and `{last}` are substituted per token, so no
/// shell is involved. Example:
/// `mineru-cli --from {first} --to {last} {input}`.
pub struct CommandEngine {
    template: String,
}

impl CommandEngine {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl OcrEngine for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    fn recognize(&self, path: &Path, first: usize, last: usize) -> Result<String, ExtractError> {
        let input = path.display().to_string();
        let argv: Vec<String> = self
            .template
            .split_whitespace()
            .map(|tok| {
                tok.replace("{input}", &input)
                    .replace("{first}", &first.to_string())
                    .replace("{last}", &last.to_string())
            })
            .collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExtractError::OcrUnavailable("empty OCR command".to_string()))?;

        let output = std::process::Command::new(program)
            .args(args)
            .output()
            .map_err(|e| ExtractError::OcrFailed(format!("failed to run '{program}': {e}")))?;

        if !output.status.success() {
            return Err(ExtractError::OcrFailed(format!(
                "'{program}' exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| ExtractError::OcrFailed(format!("non-UTF-8 OCR output: {e}")))
    }
}

/// Per-batch OCR progress record, persisted through the
/// [`CheckpointStore`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OcrProgress {
    pub source_path: String,
    pub total_pages: usize,
    /// Highest 1-based page whose batch completed.
    pub last_completed_page: usize,
    /// Recognized text per completed batch, in order.
    pub fragments: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Drives an [`OcrEngine`] over a document in page batches.
pub struct OcrExtractor<'a> {
    engine: &'a dyn OcrEngine,
    batch_size: usize,
    store: &'a CheckpointStore,
}

impl<'a> OcrExtractor<'a> {
    pub fn new(engine: &'a dyn OcrEngine, batch_size: usize, store: &'a CheckpointStore) -> Self {
        Self {
            engine,
            batch_size: batch_size.max(1),
            store,
        }
    }

    pub fn extract(
        &self,
        decision: &RouteDecision,
        resume: bool,
        progress: &dyn ProgressReporter,
    ) -> Result<ExtractedText, ExtractError> {
        let path = &decision.document.path;
        let text = match decision.document.kind {
            FileKind::Image => self.engine.recognize(path, 1, 1)?,
            FileKind::Pdf => {
                let total = pdf_page_count(path)?;
                self.extract_pdf_pages(path, total, resume, progress)?
            }
            other => {
                return Err(ExtractError::OcrFailed(format!(
                    "OCR cannot handle {} documents",
                    other.as_str()
                )))
            }
        };

        if text.trim().is_empty() {
            return Err(ExtractError::Empty);
        }

        // Engines emit markdown-ish text; heading lines become the
        // outline just as for native markdown.
        let outline = markdown_outline(&text);
        Ok(ExtractedText {
            document_id: decision.document.id.clone(),
            text,
            outline,
        })
    }

    /// Batch loop, split out so the resume discipline is testable
    /// without real PDF bytes.
    fn extract_pdf_pages(
        &self,
        path: &Path,
        total_pages: usize,
        resume: bool,
        progress: &dyn ProgressReporter,
    ) -> Result<String, ExtractError> {
        let key = key_for(path, "ocr");
        let file = path.display().to_string();

        let mut fragments: Vec<String> = Vec::new();
        let mut next_page = 1usize;
        if resume {
            if let Ok(Some(record)) = self.store.load::<OcrProgress>(&key) {
                if record.source_path == file && record.total_pages == total_pages {
                    fragments = record.fragments;
                    next_page = record.last_completed_page + 1;
                }
            }
        }

        while next_page <= total_pages {
            let first = next_page;
            let last = (first + self.batch_size - 1).min(total_pages);

            match self.engine.recognize(path, first, last) {
                Ok(batch_text) => {
                    fragments.push(batch_text);
                    let record = OcrProgress {
                        source_path: file.clone(),
                        total_pages,
                        last_completed_page: last,
                        fragments: fragments.clone(),
                        timestamp: Utc::now(),
                        last_error: None,
                    };
                    self.store
                        .save(&key, &record)
                        .map_err(|e| ExtractError::OcrFailed(e.to_string()))?;
                    progress.report(ProgressEvent::OcrBatch {
                        file: file.clone(),
                        first,
                        last,
                        total: total_pages,
                    });
                    next_page = last + 1;
                }
                Err(e) => {
                    let record = OcrProgress {
                        source_path: file.clone(),
                        total_pages,
                        last_completed_page: first - 1,
                        fragments: fragments.clone(),
                        timestamp: Utc::now(),
                        last_error: Some(e.to_string()),
                    };
                    let _ = self.store.save(&key, &record);
                    return Err(e);
                }
            }
        }

        self.store
            .clear(&key)
            .map_err(|e| ExtractError::OcrFailed(e.to_string()))?;
        Ok(fragments.join("\n\n"))
    }
}

/// Page count of a PDF on disk.
pub fn pdf_page_count(path: &Path) -> Result<usize, ExtractError> {
    let doc = lopdf::Document::load(path).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(doc.get_pages().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use std::sync::Mutex;

    /// Engine that records requested ranges and fails on request.
    struct FakeEngine {
        calls: Mutex<Vec<(usize, usize)>>,
        fail_on_first_page: Option<usize>,
    }

    impl FakeEngine {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on_first_page: None,
            }
        }
        fn failing_at(first: usize) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on_first_page: Some(first),
            }
        }
    }

    impl OcrEngine for FakeEngine {
        fn name(&self) -> &str {
            "fake"
        }
        fn recognize(
            &self,
            _path: &Path,
            first: usize,
            last: usize,
        ) -> Result<String, ExtractError> {
            if self.fail_on_first_page == Some(first) {
                return Err(ExtractError::OcrFailed("engine crashed".to_string()));
            }
            self.calls.lock().unwrap().push((first, last));
            Ok(format!("pages {first}-{last}"))
        }
    }

    fn store() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn batches_cover_all_pages() {
        let (_dir, store) = store();
        let engine = FakeEngine::new();
        let ex = OcrExtractor::new(&engine, 10, &store);
        let text = ex
            .extract_pdf_pages(Path::new("/tmp/scan.pdf"), 25, true, &NoProgress)
            .unwrap();
        assert_eq!(
            *engine.calls.lock().unwrap(),
            vec![(1, 10), (11, 20), (21, 25)]
        );
        assert_eq!(text, "pages 1-10\n\npages 11-20\n\npages 21-25");
        // Completed run leaves no progress record behind.
        assert!(store.load::<OcrProgress>("scan.ocr").unwrap().is_none());
    }

    #[test]
    fn failure_retains_progress_and_resume_skips_done_batches() {
        let (_dir, store) = store();
        let engine = FakeEngine::failing_at(11);
        let ex = OcrExtractor::new(&engine, 10, &store);
        let err = ex
            .extract_pdf_pages(Path::new("/tmp/scan.pdf"), 25, true, &NoProgress)
            .unwrap_err();
        assert!(matches!(err, ExtractError::OcrFailed(_)));

        let record: OcrProgress = store.load("scan.ocr").unwrap().unwrap();
        assert_eq!(record.last_completed_page, 10);
        assert_eq!(record.fragments.len(), 1);
        assert!(record.last_error.is_some());

        // Second run with a healthy engine picks up at page 11.
        let engine2 = FakeEngine::new();
        let ex2 = OcrExtractor::new(&engine2, 10, &store);
        let text = ex2
            .extract_pdf_pages(Path::new("/tmp/scan.pdf"), 25, true, &NoProgress)
            .unwrap();
        assert_eq!(*engine2.calls.lock().unwrap(), vec![(11, 20), (21, 25)]);
        assert_eq!(text, "pages 1-10\n\npages 11-20\n\npages 21-25");
    }

    #[test]
    fn resume_disabled_restarts_from_page_one() {
        let (_dir, store) = store();
        let engine = FakeEngine::failing_at(11);
        let ex = OcrExtractor::new(&engine, 10, &store);
        ex.extract_pdf_pages(Path::new("/tmp/scan.pdf"), 20, true, &NoProgress)
            .unwrap_err();

        let engine2 = FakeEngine::new();
        let ex2 = OcrExtractor::new(&engine2, 10, &store);
        ex2.extract_pdf_pages(Path::new("/tmp/scan.pdf"), 20, false, &NoProgress)
            .unwrap();
        assert_eq!(*engine2.calls.lock().unwrap(), vec![(1, 10), (11, 20)]);
    }

    #[test]
    fn stale_progress_for_different_page_count_is_ignored() {
        let (_dir, store) = store();
        let engine = FakeEngine::failing_at(11);
        let ex = OcrExtractor::new(&engine, 10, &store);
        ex.extract_pdf_pages(Path::new("/tmp/scan.pdf"), 20, true, &NoProgress)
            .unwrap_err();

        // Same file name, different page count: record must not apply.
        let engine2 = FakeEngine::new();
        let ex2 = OcrExtractor::new(&engine2, 10, &store);
        ex2.extract_pdf_pages(Path::new("/tmp/scan.pdf"), 30, true, &NoProgress)
            .unwrap();
        assert_eq!(
            *engine2.calls.lock().unwrap(),
            vec![(1, 10), (11, 20), (21, 30)]
        );
    }

    #[test]
    fn command_engine_substitutes_placeholders() {
        // `echo` gives us a predictable external command everywhere the
        // test suite runs.
        let engine = CommandEngine::new("echo {input} {first} {last}");
        let text = engine
            .recognize(Path::new("/tmp/doc.pdf"), 1, 10)
            .unwrap();
        assert_eq!(text.trim(), "/tmp/doc.pdf 1 10");
    }

    #[test]
    fn command_engine_reports_missing_binary() {
        let engine = CommandEngine::new("definitely-not-a-real-ocr-binary {input}");
        let err = engine.recognize(Path::new("/tmp/doc.pdf"), 1, 1).unwrap_err();
        assert!(matches!(err, ExtractError::OcrFailed(_)));
    }
}
