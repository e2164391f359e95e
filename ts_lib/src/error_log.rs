//! The run-scoped, append-only failure log.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ErrorLog {
    path: PathBuf,
}

impl ErrorLog {
    pub fn new(path: impl Into<PathBuf>) -> ErrorLog {
        ErrorLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Log `line` at error level and append it to the file, one entry per line.
    pub fn append(&self, line: &str) -> Result<()> {
        let line = line.replace(['\n', '\r'], " ");
        log::error!("{line}");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening error log {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("writing error log {}", self.path.display()))
    }

    pub fn stage_failure(&self, sample_id: &str, stage: &str, result: &str) -> Result<()> {
        self.append(&format!("{sample_id} Failed {stage}: {result}"))
    }
}
