//! Pipeline orchestration.
//!
//! Composes routing, extraction, chunking, and distillation into the
//! end-to-end flow for one document or a directory of documents:
//! route → extract → chunk → distill chunk-by-chunk, appending pairs to
//! the dataset file and checkpointing after every chunk. Chunks are
//! processed strictly in index order, one at a time — the checkpoint's
//! `last_completed_unit` is only meaningful under ordered completion,
//! and per-credential rate limits make intra-document parallelism a
//! wash anyway.
//!
//! Resume: with the same document and chunk parameters the chunk list
//! re-derives deterministically, so a run that died at chunk k picks up
//! at k+1 instead of paying for the same completions twice. A single
//! bad chunk never aborts a document; a failure fraction above the
//! configured policy threshold does, and the checkpoint is retained for
//! inspection and a later resume.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::checkpoint::{key_for, source_fingerprint, CheckpointRecord, CheckpointStore};
use crate::chunk;
use crate::config::Config;
use crate::credentials::CredentialPool;
use crate::discover;
use crate::distill::{DistillError, Distiller};
use crate::extract;
use crate::models::{Chunk, Extractor, QaPair, RouteDecision};
use crate::ocr::{CommandEngine, OcrExtractor};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::provider::ProviderFactory;
use crate::route;

/// Dataset line schema, stable per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSchema {
    /// `{"question": ..., "answer": ...}`
    Qa,
    /// `{"instruction": ..., "input": "", "output": ...}`
    Alpaca,
}

impl OutputSchema {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "qa" => Ok(OutputSchema::Qa),
            "alpaca" => Ok(OutputSchema::Alpaca),
            other => bail!("Unknown output schema: '{}'. Must be qa or alpaca.", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputSchema::Qa => "qa",
            OutputSchema::Alpaca => "alpaca",
        }
    }

    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            OutputSchema::Qa => &["question", "answer"],
            OutputSchema::Alpaca => &["instruction", "input", "output"],
        }
    }

    /// Render one pair as a JSON line value.
    fn line(&self, pair: &QaPair) -> serde_json::Value {
        match self {
            OutputSchema::Qa => serde_json::json!({
                "question": pair.question,
                "answer": pair.answer,
            }),
            OutputSchema::Alpaca => serde_json::json!({
                "instruction": pair.question,
                "input": "",
                "output": pair.answer,
            }),
        }
    }
}

/// Effective per-run knobs, resolved from config plus CLI overrides.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub chunk_size: usize,
    pub overlap: usize,
    pub pairs_per_chunk: usize,
    pub resume: bool,
    pub schema: OutputSchema,
    /// Output file override for single-document runs.
    pub output: Option<PathBuf>,
    /// Output directory override for batch runs.
    pub output_dir: Option<PathBuf>,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            chunk_size: config.chunking.chunk_size,
            overlap: config.chunking.overlap,
            pairs_per_chunk: config.distill.pairs_per_chunk,
            resume: true,
            schema: OutputSchema::parse(&config.output.schema)?,
            output: None,
            output_dir: None,
        })
    }
}

/// Terminal state of one document run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentStatus {
    Done,
    /// The step that failed: `routing`, `extracting`, or `distilling`.
    Failed(String),
}

/// Outcome of one document run.
#[derive(Debug, Clone)]
pub struct DocumentReport {
    pub source: PathBuf,
    pub status: DocumentStatus,
    pub total_chunks: usize,
    pub pairs_written: usize,
    pub skipped_chunks: Vec<usize>,
    pub output: Option<PathBuf>,
    /// Checkpoint retained for resume, present only on failure.
    pub checkpoint: Option<PathBuf>,
    /// First chunk index processed by this run, when resumed.
    pub resumed_from: Option<usize>,
}

/// Outcome of a directory batch.
#[derive(Debug)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub reports: Vec<DocumentReport>,
}

/// The orchestrator: owns the checkpoint store and the seams to the
/// credential pool and provider factory.
pub struct Pipeline<'a> {
    config: &'a Config,
    pool: &'a CredentialPool,
    factory: &'a dyn ProviderFactory,
    progress: &'a dyn ProgressReporter,
    store: CheckpointStore,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a Config,
        pool: &'a CredentialPool,
        factory: &'a dyn ProviderFactory,
        progress: &'a dyn ProgressReporter,
    ) -> Result<Self> {
        if pool.provider_len(&config.distill.provider) == 0 {
            bail!(
                "no credentials configured for provider '{}'",
                config.distill.provider
            );
        }
        let store = CheckpointStore::new(&config.checkpoints.dir)?;
        Ok(Self {
            config,
            pool,
            factory,
            progress,
            store,
        })
    }

    /// Run the full per-document state machine:
    /// Routing → Extracting → Chunking → Distilling(i) → Done/Failed.
    ///
    /// Fatal setup errors (missing file, unsupported type) return `Err`;
    /// everything downstream is absorbed into the report's status.
    pub fn process_document(&self, path: &Path, opts: &RunOptions) -> Result<DocumentReport> {
        let file = path.display().to_string();
        self.progress.report(ProgressEvent::Routing { file: file.clone() });

        let decision = route::route(path, &self.config.router)?;
        self.progress.report(ProgressEvent::Extracting {
            file: file.clone(),
            extractor: decision.extractor.as_str().to_string(),
        });

        let extracted = match self.extract(&decision, opts.resume) {
            Ok(t) => t,
            Err(e) => {
                let report = DocumentReport {
                    source: path.to_path_buf(),
                    status: DocumentStatus::Failed("extracting".to_string()),
                    total_chunks: 0,
                    pairs_written: 0,
                    skipped_chunks: Vec::new(),
                    output: None,
                    checkpoint: None,
                    resumed_from: None,
                };
                print_failure(&report, &e.to_string());
                return Ok(report);
            }
        };

        let chunks = chunk::split(&extracted.text, opts.chunk_size, opts.overlap);
        let report = self.distill_chunks(path, &chunks, &extracted.text, opts)?;
        print_report(&report);
        Ok(report)
    }

    fn extract(
        &self,
        decision: &RouteDecision,
        resume: bool,
    ) -> Result<crate::models::ExtractedText, extract::ExtractError> {
        match decision.extractor {
            Extractor::Native => extract::extract_native(decision),
            Extractor::Ocr => {
                let command = self.config.ocr.command.as_deref().ok_or_else(|| {
                    extract::ExtractError::OcrUnavailable(
                        "set ocr.command to process scanned documents".to_string(),
                    )
                })?;
                let engine = CommandEngine::new(command);
                let extractor =
                    OcrExtractor::new(&engine, self.config.ocr.batch_size, &self.store);
                extractor.extract(decision, resume, self.progress)
            }
        }
    }

    /// Distill every chunk in index order, appending pairs and
    /// checkpointing after each one.
    fn distill_chunks(
        &self,
        path: &Path,
        chunks: &[Chunk],
        source_text: &str,
        opts: &RunOptions,
    ) -> Result<DocumentReport> {
        let file = path.display().to_string();
        let key = key_for(path, "distill");
        let fingerprint = source_fingerprint(source_text, opts.chunk_size, opts.overlap);
        let output_path = self.output_path(path, opts);
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Resume only a checkpoint produced by the identical chunk
        // list; anything else would corrupt the dataset.
        let mut start_index = 0usize;
        let mut accumulated = 0usize;
        let mut skipped: Vec<usize> = Vec::new();
        let mut resumed_from = None;
        let prior: Option<CheckpointRecord> = if opts.resume { self.store.load(&key)? } else { None };
        match prior {
            Some(rec)
                if rec.source_hash == fingerprint && rec.total_units == chunks.len() =>
            {
                start_index = rec.last_completed_unit.map_or(0, |u| u + 1);
                accumulated = rec.accumulated_count;
                skipped = rec.failed_units;
                resumed_from = Some(start_index);
            }
            _ => {
                self.store.clear(&key)?;
                // Fresh start: truncate any stale dataset and document
                // its schema alongside it.
                std::fs::write(&output_path, b"")?;
                self.write_schema_sidecar(&output_path, path, opts)?;
            }
        }

        let distiller = Distiller::new(self.factory, self.config.distill.max_retries);
        let primary = self.config.distill.provider.as_str();
        let total = chunks.len();
        let mut last_error: Option<String> = None;
        let mut aborted = false;

        for chunk in &chunks[start_index..] {
            self.progress.report(ProgressEvent::Distilling {
                file: file.clone(),
                n: chunk.index + 1,
                total,
            });

            let outcome = self.distill_one(&distiller, chunk, primary, opts);
            match outcome {
                Ok(pairs) => {
                    append_pairs(&output_path, &pairs, opts.schema)?;
                    accumulated += pairs.len();
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.progress.report(ProgressEvent::ChunkSkipped {
                        file: file.clone(),
                        index: chunk.index,
                        reason: reason.clone(),
                    });
                    skipped.push(chunk.index);
                    last_error = Some(reason);
                }
            }

            self.store.save(
                &key,
                &CheckpointRecord {
                    source_path: file.clone(),
                    source_hash: fingerprint.clone(),
                    total_units: total,
                    last_completed_unit: Some(chunk.index),
                    accumulated_count: accumulated,
                    failed_units: skipped.clone(),
                    timestamp: chrono::Utc::now(),
                    last_error: last_error.clone(),
                },
            )?;

            if skipped.len() as f64 / total as f64 > self.config.distill.abort_fraction {
                aborted = true;
                break;
            }
        }

        let report = if aborted {
            DocumentReport {
                source: path.to_path_buf(),
                status: DocumentStatus::Failed("distilling".to_string()),
                total_chunks: total,
                pairs_written: accumulated,
                skipped_chunks: skipped,
                output: Some(output_path),
                checkpoint: Some(self.store.path_for(&key)),
                resumed_from,
            }
        } else {
            self.store.clear(&key)?;
            DocumentReport {
                source: path.to_path_buf(),
                status: DocumentStatus::Done,
                total_chunks: total,
                pairs_written: accumulated,
                skipped_chunks: skipped,
                output: Some(output_path),
                checkpoint: None,
                resumed_from,
            }
        };
        Ok(report)
    }

    /// One chunk through the distiller, with the alternate-provider
    /// path for oversized input: an `InputTooLarge` escalation retries
    /// the same chunk against each configured fallback provider instead
    /// of hammering the one that already refused it.
    fn distill_one(
        &self,
        distiller: &Distiller,
        chunk: &Chunk,
        primary: &str,
        opts: &RunOptions,
    ) -> Result<Vec<QaPair>, DistillError> {
        match distiller.distill(&chunk.text, opts.pairs_per_chunk, primary, self.pool) {
            Err(DistillError::InputTooLarge(_)) => {
                let mut last = DistillError::InputTooLarge(primary.to_string());
                for fallback in &self.config.distill.fallback_providers {
                    if fallback == primary || self.pool.provider_len(fallback) == 0 {
                        continue;
                    }
                    match distiller.distill(&chunk.text, opts.pairs_per_chunk, fallback, self.pool)
                    {
                        Ok(pairs) => return Ok(pairs),
                        Err(e) => last = e,
                    }
                }
                Err(last)
            }
            other => other,
        }
    }

    fn output_path(&self, source: &Path, opts: &RunOptions) -> PathBuf {
        if let Some(explicit) = &opts.output {
            return explicit.clone();
        }
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "dataset".to_string());
        let dir = opts
            .output_dir
            .clone()
            .unwrap_or_else(|| self.config.output.dir.clone());
        dir.join(format!("{stem}.jsonl"))
    }

    /// `<dataset>.schema.json` documents the line schema alongside the
    /// produced file.
    fn write_schema_sidecar(
        &self,
        output_path: &Path,
        source: &Path,
        opts: &RunOptions,
    ) -> Result<()> {
        let sidecar = output_path.with_extension("schema.json");
        let doc = serde_json::json!({
            "schema": opts.schema.as_str(),
            "fields": opts.schema.fields(),
            "format": "jsonl",
            "source": source.display().to_string(),
        });
        std::fs::write(&sidecar, serde_json::to_vec_pretty(&doc)?)
            .with_context(|| format!("failed to write {}", sidecar.display()))?;
        Ok(())
    }

    /// Apply the per-document state machine to every supported file
    /// under `root`. One file's failure never stops the batch.
    pub fn process_directory(&self, root: &Path, opts: &RunOptions) -> Result<BatchReport> {
        let files = discover::discover(root)?;
        if files.is_empty() {
            bail!(
                "no supported documents under {} (supported: {})",
                root.display(),
                crate::models::FileKind::supported_extensions().join(", ")
            );
        }

        let mut reports = Vec::new();
        for file in &files {
            match self.process_document(file, opts) {
                Ok(report) => reports.push(report),
                Err(e) => {
                    let report = DocumentReport {
                        source: file.clone(),
                        status: DocumentStatus::Failed("routing".to_string()),
                        total_chunks: 0,
                        pairs_written: 0,
                        skipped_chunks: Vec::new(),
                        output: None,
                        checkpoint: None,
                        resumed_from: None,
                    };
                    print_failure(&report, &e.to_string());
                    reports.push(report);
                }
            }
        }

        let succeeded = reports
            .iter()
            .filter(|r| r.status == DocumentStatus::Done)
            .count();
        let failed = reports.len() - succeeded;

        println!("batch {}", root.display());
        println!("  documents: {}", reports.len());
        println!("  succeeded: {}", succeeded);
        println!("  failed: {}", failed);
        let total_pairs: usize = reports.iter().map(|r| r.pairs_written).sum();
        println!("  pairs written: {}", total_pairs);

        Ok(BatchReport {
            succeeded,
            failed,
            reports,
        })
    }
}

/// Append one chunk's pairs to the dataset as a single write, so an
/// interrupt never leaves a partially-written batch behind.
fn append_pairs(path: &Path, pairs: &[QaPair], schema: OutputSchema) -> Result<()> {
    let mut batch = String::new();
    for pair in pairs {
        batch.push_str(&serde_json::to_string(&schema.line(pair))?);
        batch.push('\n');
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open dataset {}", path.display()))?;
    file.write_all(batch.as_bytes())?;
    file.flush()?;
    Ok(())
}

fn print_report(report: &DocumentReport) {
    println!("distill {}", report.source.display());
    match &report.status {
        DocumentStatus::Done => {
            println!(
                "  chunks: {} ({} skipped)",
                report.total_chunks,
                report.skipped_chunks.len()
            );
            if let Some(from) = report.resumed_from {
                println!("  resumed at chunk: {}", from);
            }
            println!("  pairs written: {}", report.pairs_written);
            if let Some(output) = &report.output {
                println!("  output: {}", output.display());
            }
            println!("ok");
        }
        DocumentStatus::Failed(step) => {
            println!(
                "  FAILED at {}: {}/{} chunks skipped",
                step,
                report.skipped_chunks.len(),
                report.total_chunks
            );
            println!("  pairs written: {}", report.pairs_written);
            if let Some(checkpoint) = &report.checkpoint {
                println!("  checkpoint retained: {}", checkpoint.display());
            }
        }
    }
}

fn print_failure(report: &DocumentReport, error: &str) {
    println!("distill {}", report.source.display());
    if let DocumentStatus::Failed(step) = &report.status {
        println!("  FAILED at {}: {}", step, error);
    }
}
