//! Helper functions for tempfile/tempdir usage in tests

use anyhow::Context;
use std::path::PathBuf;

/// Create a temp directory with a helpful error message.
pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::tempdir().context("Failed to create temporary directory for test")
}

/// Create a temp file with a specific suffix (e.g. ".json").
pub fn create_temp_file_with_suffix(suffix: &str) -> anyhow::Result<tempfile::NamedTempFile> {
    tempfile::NamedTempFile::with_suffix(suffix).context("Failed to create temporary file with suffix")
}

/// Path inside `dir` for a report file that does not exist yet
pub fn report_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("ringforge_report.json")
}
