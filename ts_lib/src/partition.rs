//! Deterministic assignment of manifest ids to workers.

use ts_types::{ConfigError, Manifest, WorkerIdentity, WorkerShard};

/// The shard of `identity`: the id at global position `p` belongs to worker `p mod pool_size`.
///
/// Every worker computes this independently from the same manifest and pool size, which is
/// the only coordination there is between them.
pub fn partition(manifest: &Manifest, identity: WorkerIdentity) -> Result<WorkerShard, ConfigError> {
    if manifest.is_empty() {
        return Err(ConfigError::EmptyManifest);
    }
    let assigned_sample_ids = manifest
        .ids()
        .iter()
        .skip(identity.index())
        .step_by(identity.pool_size())
        .cloned()
        .collect();
    Ok(WorkerShard {
        worker_index: identity.index(),
        pool_size: identity.pool_size(),
        assigned_sample_ids,
    })
}
