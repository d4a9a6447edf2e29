//! # Distill Harness
//!
//! A checkpointed document-to-dataset distillation pipeline for LLM
//! fine-tuning.
//!
//! Distill Harness turns source documents (plain text, Markdown,
//! word-processor files, native and scanned PDFs, images) into a
//! line-delimited JSON training dataset of instruction/answer pairs by
//! driving many small calls against an external completion service —
//! surviving partial failures, never losing already-produced work, and
//! spreading load across a pool of rate-limited API credentials.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌────────────┐   ┌─────────┐   ┌───────────┐
//! │ Router  │──▶│ Extractor  │──▶│ Chunker │──▶│ Distiller │──▶ dataset.jsonl
//! │ ext+scan│   │ native/OCR │   │ overlap │   │ LLM calls │
//! └─────────┘   └────────────┘   └─────────┘   └─────┬─────┘
//!                     │                              │
//!               ┌─────▼──────┐                ┌──────▼───────┐
//!               │ Checkpoint │◀───────────────│ Credential   │
//!               │   store    │  orchestrator  │   pool       │
//!               └────────────┘                └──────────────┘
//! ```
//!
//! Data flows strictly downstream; the orchestrator supervises and
//! checkpoints at chunk granularity, so an interrupted run resumes at
//! the last completed chunk instead of re-spending completions.
//!
//! ## Quick Start
//!
//! ```bash
//! export GEMINI_API_KEY_1=...   # one or more keys
//! export GEMINI_API_KEY_2=...
//! dst run docs/policy.pdf                 # one document
//! dst batch docs/ --output-dir data/out   # a directory
//! dst route docs/policy.pdf               # routing debug aid
//! dst credentials                         # pool health
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`route`] | File-type detection and scan probing |
//! | [`extract`] | Native text extraction (txt/md/docx/pdf) |
//! | [`ocr`] | Page-batched OCR with per-batch checkpoints |
//! | [`chunk`] | Boundary-aware overlapping chunker |
//! | [`credentials`] | API-key rotation, failover, cooldown |
//! | [`provider`] | Completion provider abstraction (HTTP) |
//! | [`distill`] | Chunk → QA pairs with retry policy |
//! | [`checkpoint`] | Atomic resume records |
//! | [`pipeline`] | Per-document orchestration and batch mode |
//! | [`discover`] | Directory discovery |
//! | [`progress`] | Stderr progress reporting |

pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod credentials;
pub mod discover;
pub mod distill;
pub mod extract;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod progress;
pub mod provider;
pub mod route;
pub mod stats;
