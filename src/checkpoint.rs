//! Durable progress records for resumable processing.
//!
//! One JSON document per in-flight source document, named
//! deterministically from the source file's base name. Every write is a
//! full atomic replace (write to a temp file, then rename), so a crash
//! mid-write leaves either the old record or the new one — never a
//! corrupt mix. Records are deleted only when every unit of work for
//! the document has been processed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Progress record for one document's distillation run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CheckpointRecord {
    pub source_path: String,
    /// Fingerprint of the extracted text plus chunking parameters. A
    /// mismatch on resume means the chunk list would differ, so the
    /// record must be discarded rather than resumed.
    pub source_hash: String,
    pub total_units: usize,
    /// Highest chunk index whose output has been appended, `None` when
    /// no chunk has completed yet.
    pub last_completed_unit: Option<usize>,
    pub accumulated_count: usize,
    /// Chunk indices permanently skipped after retry exhaustion.
    #[serde(default)]
    pub failed_units: Vec<usize>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// File-backed checkpoint store.
///
/// Keys are caller-chosen (`<stem>.distill`, `<stem>.ocr`); each key
/// maps to `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoint dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Atomically replace the record for `key`.
    pub fn save<T: Serialize>(&self, key: &str, record: &T) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{key}.json.tmp"));
        let bytes = serde_json::to_vec_pretty(record)?;
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("failed to write checkpoint {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace checkpoint {}", path.display()))?;
        Ok(())
    }

    /// Load the record for `key`. A missing file is `Ok(None)`; an
    /// unreadable or unparsable record is discarded with a warning
    /// rather than failing the run.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read checkpoint {}", path.display()))
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                eprintln!(
                    "warning: discarding corrupt checkpoint {}: {}",
                    path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Remove the record for `key`. Removing a record that does not
    /// exist is not an error.
    pub fn clear(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Checkpoint key for a source document at a given pipeline stage.
pub fn key_for(source: &Path, stage: &str) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    format!("{stem}.{stage}")
}

/// Fingerprint tying a checkpoint to one deterministic chunk list:
/// the extracted text plus the chunking parameters that shaped it.
pub fn source_fingerprint(text: &str, chunk_size: usize, overlap: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(chunk_size.to_le_bytes());
    hasher.update(overlap.to_le_bytes());
    format!("{:x}", hasher.finalize())
}
