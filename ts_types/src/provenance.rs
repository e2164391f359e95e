use crate::stage::ToolIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What ran, on what, producing what. One per stage per sample, written next to the outputs it
/// describes and never edited afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Operator that launched the run.
    pub user: String,
    /// Revision of the orchestrator that ran the stage.
    pub orchestrator_version: String,
    pub sample_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Paths relative to the storage base.
    pub inputs: Vec<String>,
    /// Paths relative to the storage base.
    pub outputs: Vec<String>,
    pub pipeline: ToolIdentity,
}
