//! Per-stage provenance documents.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use ts_types::{PipelineStage, ProvenanceRecord, StorageLayout};

pub const PROVENANCE_FILE: &str = "methods.json";

/// Writes one `methods.json` into each completed stage directory.
#[derive(Debug, Clone)]
pub struct ProvenanceRecorder {
    layout: StorageLayout,
    operator: String,
    orchestrator_version: String,
}

impl ProvenanceRecorder {
    pub fn new(
        layout: StorageLayout,
        operator: impl Into<String>,
        orchestrator_version: impl Into<String>,
    ) -> ProvenanceRecorder {
        ProvenanceRecorder {
            layout,
            operator: operator.into(),
            orchestrator_version: orchestrator_version.into(),
        }
    }

    /// Record a completed stage. The stage directory must already exist. A re-run replaces the
    /// previous record.
    pub fn record(
        &self,
        stage: &PipelineStage,
        sample_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        inputs: &[PathBuf],
        outputs: &[PathBuf],
    ) -> Result<PathBuf> {
        let relative = |paths: &[PathBuf]| -> Vec<String> {
            paths.iter().map(|p| self.layout.relative(p)).collect()
        };
        let record = ProvenanceRecord {
            user: self.operator.clone(),
            orchestrator_version: self.orchestrator_version.clone(),
            sample_id: sample_id.to_string(),
            start,
            end,
            inputs: relative(inputs),
            outputs: relative(outputs),
            pipeline: stage.tool.clone(),
        };

        let dir = self.layout.stage_dir(sample_id, &stage.stage_dir_name());
        let path = dir.join(PROVENANCE_FILE);
        let tmp = dir.join(format!(".{PROVENANCE_FILE}.tmp"));
        let text = serde_json::to_string_pretty(&record)?;
        fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

pub fn read_record(path: &Path) -> Result<ProvenanceRecord> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// All provenance records of a sample, ordered by stage directory name.
pub fn discover(layout: &StorageLayout, sample_id: &str) -> Result<Vec<(PathBuf, ProvenanceRecord)>> {
    let secondary = layout.secondary_dir(sample_id);
    if !secondary.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(&secondary)
        .with_context(|| format!("listing {}", secondary.display()))?
    {
        let path = entry?.path().join(PROVENANCE_FILE);
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    paths
        .into_iter()
        .map(|path| read_record(&path).map(|record| (path, record)))
        .collect()
}
