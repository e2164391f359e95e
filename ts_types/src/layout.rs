//! The storage hierarchy path convention.
//!
//! ```text
//! {base}/primary/original/{id}/*                     raw uploads
//! {base}/primary/derived/{id}/*                      canonical fastq pair and other sequence data
//! {base}/downstream/{id}/secondary/{stage-dir}/*     published stage outputs + provenance
//! ```

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    base: PathBuf,
}

impl StorageLayout {
    pub fn new(base: impl Into<PathBuf>) -> StorageLayout {
        StorageLayout { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn original_dir(&self, sample_id: &str) -> PathBuf {
        self.base.join("primary/original").join(sample_id)
    }

    pub fn derived_dir(&self, sample_id: &str) -> PathBuf {
        self.base.join("primary/derived").join(sample_id)
    }

    /// Staging area used while populating the derived cache.
    pub fn derived_staging_dir(&self, sample_id: &str) -> PathBuf {
        self.base
            .join("primary/derived")
            .join(format!("{sample_id}.partial"))
    }

    pub fn sample_dir(&self, sample_id: &str) -> PathBuf {
        self.base.join("downstream").join(sample_id)
    }

    pub fn secondary_dir(&self, sample_id: &str) -> PathBuf {
        self.sample_dir(sample_id).join("secondary")
    }

    pub fn stage_dir(&self, sample_id: &str, stage_dir_name: &str) -> PathBuf {
        self.secondary_dir(sample_id).join(stage_dir_name)
    }

    /// Staging area a stage's outputs are fetched into before publication.
    pub fn stage_staging_dir(&self, sample_id: &str, stage_dir_name: &str) -> PathBuf {
        self.secondary_dir(sample_id)
            .join(format!("{stage_dir_name}.partial"))
    }

    /// Express `path` relative to the storage base, as recorded in provenance documents.
    /// Paths outside the hierarchy are returned unchanged.
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.base)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}
