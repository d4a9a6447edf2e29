//! # Distill Harness CLI (`dst`)
//!
//! The `dst` binary drives the document-to-dataset distillation
//! pipeline: routing, extraction, chunking, and checkpointed
//! distillation against a pool of provider credentials.
//!
//! ## Usage
//!
//! ```bash
//! dst --config ./config/dst.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dst run <file>` | Distill one document into a JSONL dataset |
//! | `dst batch <root>` | Distill every supported document under a directory |
//! | `dst route <file>` | Show the routing decision for a document |
//! | `dst credentials` | Show credential pool configuration and health |
//!
//! Exit code is 0 only when no document ended in a failed state, so
//! batch invocations compose with shell scripting and CI.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use distill_harness::config::{self, Config};
use distill_harness::credentials::{self, PoolPolicy};
use distill_harness::pipeline::{DocumentStatus, OutputSchema, Pipeline, RunOptions};
use distill_harness::progress::ProgressMode;
use distill_harness::provider::HttpProviderFactory;
use distill_harness::{route, stats};

/// Distill Harness — turn documents into instruction/answer training
/// datasets through an external completion service.
///
/// All commands accept a `--config` flag pointing to a TOML
/// configuration file. A missing config file means built-in defaults;
/// credentials then come from environment variables
/// (`GEMINI_API_KEY_1..N`, `DEEPSEEK_API_KEYS`, ...).
#[derive(Parser)]
#[command(
    name = "dst",
    about = "Distill Harness — a checkpointed document-to-dataset distillation pipeline",
    version,
    long_about = "Distill Harness converts source documents (text, Markdown, docx, native and \
    scanned PDF, images) into line-delimited JSON instruction/answer datasets by chunking the \
    extracted text and distilling each chunk through an LLM completion provider, with API-key \
    rotation, per-chunk checkpoints, and crash-safe resume."
)]
struct Cli {
    /// Path to configuration file (TOML). Built-in defaults are used
    /// when the file does not exist.
    #[arg(long, global = true, default_value = "./config/dst.toml")]
    config: PathBuf,

    /// Progress reporting on stderr: `off`, `human`, or `json`.
    /// Defaults to `human` when stderr is a TTY, else `off`.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Distill one document into a JSONL dataset.
    ///
    /// Routes and extracts the document, splits it into overlapping
    /// chunks, and distills each chunk into QA pairs, appending to the
    /// output file as it goes. Interrupted runs resume at the last
    /// completed chunk unless `--no-resume` is given.
    Run {
        /// Source document (txt, md, docx, pdf, png, jpg).
        file: PathBuf,

        /// Output dataset path. Defaults to `<output.dir>/<stem>.jsonl`.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Target characters per chunk.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Characters of overlap between consecutive chunks.
        #[arg(long)]
        overlap: Option<usize>,

        /// QA pairs requested per chunk.
        #[arg(long)]
        pairs: Option<usize>,

        /// Ignore any existing checkpoint and restart from chunk 0.
        #[arg(long)]
        no_resume: bool,

        /// Dataset line schema: `qa` or `alpaca`.
        #[arg(long)]
        schema: Option<String>,
    },

    /// Distill every supported document under a directory.
    ///
    /// Applies the per-document pipeline to each file; one document's
    /// failure never stops the batch. The summary counts succeeded and
    /// failed documents, and the exit code is non-zero when any failed.
    Batch {
        /// Root directory to scan.
        root: PathBuf,

        /// Directory for the produced datasets (one per document).
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Target characters per chunk.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Characters of overlap between consecutive chunks.
        #[arg(long)]
        overlap: Option<usize>,

        /// QA pairs requested per chunk.
        #[arg(long)]
        pairs: Option<usize>,

        /// Ignore existing checkpoints and restart every document.
        #[arg(long)]
        no_resume: bool,

        /// Dataset line schema: `qa` or `alpaca`.
        #[arg(long)]
        schema: Option<String>,
    },

    /// Show the routing decision for a document without processing it.
    ///
    /// Prints the resolved type, the scan-detection verdict for PDFs,
    /// and the extractor the pipeline would use.
    Route {
        /// Source document.
        file: PathBuf,
    },

    /// Show credential pool configuration and health counters.
    Credentials,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        Config::minimal()
    };

    let progress_mode = match cli.progress.as_deref() {
        None => ProgressMode::default_for_tty(),
        Some("off") => ProgressMode::Off,
        Some("human") => ProgressMode::Human,
        Some("json") => ProgressMode::Json,
        Some(other) => anyhow::bail!("unknown progress mode '{}': off, human, json", other),
    };

    match cli.command {
        Commands::Route { file } => {
            let decision = route::route(&file, &cfg.router)?;
            println!("route {}", file.display());
            println!("  type: {}", decision.document.kind.as_str());
            println!("  size: {} bytes", decision.document.size_bytes);
            println!("  scanned: {}", decision.is_scanned);
            println!("  extractor: {}", decision.extractor.as_str());
            Ok(())
        }
        Commands::Credentials => {
            let pool = build_pool(&cfg)?;
            stats::print_credentials(&pool);
            Ok(())
        }
        Commands::Run {
            file,
            output,
            chunk_size,
            overlap,
            pairs,
            no_resume,
            schema,
        } => {
            let opts = resolve_options(&cfg, chunk_size, overlap, pairs, no_resume, schema)?;
            let opts = RunOptions { output, ..opts };

            let pool = build_pool(&cfg)?;
            let factory = HttpProviderFactory {
                timeout_secs: cfg.distill.timeout_secs,
            };
            let reporter = progress_mode.reporter();
            let pipeline = Pipeline::new(&cfg, &pool, &factory, reporter.as_ref())?;
            let report = pipeline.process_document(&file, &opts)?;
            if report.status != DocumentStatus::Done {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Batch {
            root,
            output_dir,
            chunk_size,
            overlap,
            pairs,
            no_resume,
            schema,
        } => {
            let opts = resolve_options(&cfg, chunk_size, overlap, pairs, no_resume, schema)?;
            let opts = RunOptions { output_dir, ..opts };

            let pool = build_pool(&cfg)?;
            let factory = HttpProviderFactory {
                timeout_secs: cfg.distill.timeout_secs,
            };
            let reporter = progress_mode.reporter();
            let pipeline = Pipeline::new(&cfg, &pool, &factory, reporter.as_ref())?;
            let report = pipeline.process_directory(&root, &opts)?;
            if report.failed > 0 {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Merge CLI overrides into the configured run options, re-validating
/// the knobs that interact.
fn resolve_options(
    cfg: &Config,
    chunk_size: Option<usize>,
    overlap: Option<usize>,
    pairs: Option<usize>,
    no_resume: bool,
    schema: Option<String>,
) -> anyhow::Result<RunOptions> {
    let mut opts = RunOptions::from_config(cfg)?;
    if let Some(size) = chunk_size {
        opts.chunk_size = size;
    }
    if let Some(ov) = overlap {
        opts.overlap = ov;
    }
    if let Some(p) = pairs {
        opts.pairs_per_chunk = p;
    }
    if let Some(s) = schema {
        opts.schema = OutputSchema::parse(&s)?;
    }
    opts.resume = !no_resume;

    if opts.chunk_size == 0 {
        anyhow::bail!("--chunk-size must be > 0");
    }
    if opts.overlap >= opts.chunk_size {
        anyhow::bail!(
            "--overlap ({}) must be smaller than --chunk-size ({})",
            opts.overlap,
            opts.chunk_size
        );
    }
    if opts.pairs_per_chunk == 0 {
        anyhow::bail!("--pairs must be > 0");
    }
    Ok(opts)
}

fn build_pool(cfg: &Config) -> anyhow::Result<credentials::CredentialPool> {
    credentials::load_pool(
        cfg.credentials.file.as_deref(),
        &cfg.credentials.providers,
        PoolPolicy {
            failure_threshold: cfg.credentials.failure_threshold,
            cooldown_minutes: cfg.credentials.cooldown_minutes,
        },
    )
}
