//! Source document discovery for directory batch mode.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::models::FileKind;

/// Walk `root` and collect every supported document, sorted for
/// deterministic batch ordering.
pub fn discover(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        bail!("input directory does not exist: {}", root.display());
    }
    if !root.is_dir() {
        bail!("not a directory: {}", root.display());
    }

    let include_set = supported_globset()?;
    let exclude_set = build_globset(&[
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ])?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }
        files.push(path.to_path_buf());
    }

    files.sort();
    Ok(files)
}

fn supported_globset() -> Result<GlobSet> {
    let patterns: Vec<String> = FileKind::supported_extensions()
        .iter()
        .map(|ext| format!("**/*.{ext}"))
        .collect();
    build_globset(&patterns)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
