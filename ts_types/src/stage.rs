//! Pipeline stage definitions.
//!
//! Stages are statically defined and ordered; nothing here is mutated once a run starts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::Display;

/// Number of digest characters used in stage directory names.
const DIGEST_PREFIX_LEN: usize = 7;

/// A container image pinned by content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerImage {
    /// Repository of the image, e.g. `quay.io/ucsc_cgl/rnaseq-cgl-pipeline`.
    pub url: String,
    /// Semantic version tag.
    pub version: String,
    /// Content digest, e.g. `sha256:5f2d...`.
    pub hash: String,
}

impl DockerImage {
    /// Image reference pinned by digest; the tag is informational only.
    pub fn pinned(&self) -> String {
        format!("{}@{}", self.url, self.hash)
    }

    /// Vendor (organization) component of the repository.
    pub fn vendor(&self) -> &str {
        let mut parts = self.url.rsplit('/');
        parts.next();
        parts.next().unwrap_or("library")
    }

    /// Tool component of the repository.
    pub fn tool(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }

    pub fn digest_prefix(&self) -> &str {
        let digest = self
            .hash
            .split_once(':')
            .map_or(self.hash.as_str(), |(_, hex)| hex);
        digest
            .char_indices()
            .nth(DIGEST_PREFIX_LEN)
            .map_or(digest, |(end, _)| &digest[..end])
    }
}

/// Everything needed to exactly reproduce the tool that ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolIdentity {
    /// Source repository of the tool.
    pub source: String,
    pub docker: DockerImage,
}

impl ToolIdentity {
    /// `{vendor}-{tool}-{version}-{digest-prefix}`, unique per tool version.
    pub fn stage_dir_name(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.docker.vendor(),
            self.docker.tool(),
            self.docker.version,
            self.docker.digest_prefix()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Optionality {
    /// Failure abandons the remaining stages of the sample.
    Required,
    /// Failure only drops this stage's contribution.
    BestEffort,
}

/// Where a stage output lives once the stage has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Placement {
    /// In the published stage directory next to the provenance record.
    #[default]
    Publish,
    /// In the sample's derived cache. Used for bulky sequence data.
    Derived,
}

/// A file a stage is expected to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    /// Name later stages use to consume this artifact.
    pub key: String,
    /// File name glob as written by the tool; `{sample_id}` is substituted.
    pub pattern: String,
    /// Fixed name the file is renamed to, so consumers need not know the sample id.
    #[serde(default)]
    pub canonical: Option<String>,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub optional: bool,
}

impl ArtifactSpec {
    pub fn file_pattern(&self, sample_id: &str) -> String {
        self.pattern.replace("{sample_id}", sample_id)
    }

    /// Name of the file after normalization.
    pub fn final_name<'a>(&'a self, produced_name: &'a str) -> &'a str {
        self.canonical.as_deref().unwrap_or(produced_name)
    }
}

/// One step of the analysis chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineStage {
    pub name: String,
    pub optionality: Optionality,
    pub tool: ToolIdentity,
    /// Artifact keys consumed, in the order they are recorded.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Argument templates passed to the container.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment templates passed to the container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub outputs: Vec<ArtifactSpec>,
}

impl PipelineStage {
    pub fn is_required(&self) -> bool {
        self.optionality == Optionality::Required
    }

    pub fn stage_dir_name(&self) -> String {
        self.tool.stage_dir_name()
    }
}
