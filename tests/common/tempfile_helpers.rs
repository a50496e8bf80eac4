//! Scratch locations for the report, timeline and log artifacts

use std::path::{Path, PathBuf};

use anyhow::Context;

/// Create a temp directory with a helpful error message.
pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::tempdir().context("Failed to create temporary directory for test")
}

/// Path for an artifact inside `dir`; the file is not created.
pub fn artifact_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

/// Read an artifact the shim wrote, with the path in the error.
pub fn read_artifact(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Parse the unterminated trace-event array the timeline sink writes.
///
/// Each event sits on its own line with a trailing comma.
pub fn parse_timeline(text: &str) -> anyhow::Result<Vec<serde_json::Value>> {
    let mut lines = text.lines();
    anyhow::ensure!(lines.next() == Some("["), "timeline must open with '['");
    lines
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let event = line.trim_end().trim_end_matches(',');
            serde_json::from_str(event).with_context(|| format!("bad timeline line: {line}"))
        })
        .collect()
}

pub use tempfile::TempDir;
