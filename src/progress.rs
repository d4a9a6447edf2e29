//! Pipeline progress reporting.
//!
//! Reports observable progress while a document moves through the
//! pipeline so users see which stage is running and how many chunks are
//! left. Progress is emitted on **stderr** so stdout remains parseable
//! for scripts (the final summaries and the dataset path go to stdout).

use std::io::Write;

/// A single progress event for one document run.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Routing/classification of the named file.
    Routing { file: String },
    /// Extraction started with the chosen extractor (`native`/`ocr`).
    Extracting { file: String, extractor: String },
    /// One OCR page batch completed: pages `first..=last` of `total`.
    OcrBatch {
        file: String,
        first: usize,
        last: usize,
        total: usize,
    },
    /// Distilling chunk `n` of `total` (1-based for display).
    Distilling {
        file: String,
        n: usize,
        total: usize,
    },
    /// A chunk was permanently skipped after retry exhaustion.
    ChunkSkipped {
        file: String,
        index: usize,
        reason: String,
    },
}

/// Reports pipeline progress. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress: "distill policy.pdf  chunk 3 / 12".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Routing { file } => format!("route {}\n", file),
            ProgressEvent::Extracting { file, extractor } => {
                format!("extract {}  ({})\n", file, extractor)
            }
            ProgressEvent::OcrBatch {
                file,
                first,
                last,
                total,
            } => format!("ocr {}  pages {}-{} / {}\n", file, first, last, total),
            ProgressEvent::Distilling { file, n, total } => {
                format!("distill {}  chunk {} / {}\n", file, n, total)
            }
            ProgressEvent::ChunkSkipped {
                file,
                index,
                reason,
            } => format!("distill {}  chunk {} skipped: {}\n", file, index, reason),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Routing { file } => serde_json::json!({
                "event": "progress", "phase": "routing", "file": file
            }),
            ProgressEvent::Extracting { file, extractor } => serde_json::json!({
                "event": "progress", "phase": "extracting", "file": file,
                "extractor": extractor
            }),
            ProgressEvent::OcrBatch {
                file,
                first,
                last,
                total,
            } => serde_json::json!({
                "event": "progress", "phase": "ocr", "file": file,
                "first_page": first, "last_page": last, "total_pages": total
            }),
            ProgressEvent::Distilling { file, n, total } => serde_json::json!({
                "event": "progress", "phase": "distilling", "file": file,
                "chunk": n, "total": total
            }),
            ProgressEvent::ChunkSkipped {
                file,
                index,
                reason,
            } => serde_json::json!({
                "event": "progress", "phase": "distilling", "file": file,
                "skipped_chunk": index, "reason": reason
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
