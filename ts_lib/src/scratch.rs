//! Worker scratch space.
//!
//! Every worker has one scratch root (`/mnt` by default) that the orchestrator owns exclusively:
//! `samples/` receives the inputs of the current sample, `outputs/{stage}/` collects what each
//! tool writes and `references/` holds the reference data installed by
//! [`crate::maintenance::install_references`].
//! The root is mounted into every container at [`CONTAINER_DATA`].

use crate::command::CommandSpec;
use crate::remote::{ExecMode, Worker};
use anyhow::{Context, Result};

/// Where the scratch root appears inside containers.
pub const CONTAINER_DATA: &str = "/data";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerScratch {
    root: String,
    /// Prefix destructive commands with sudo.
    privileged: bool,
}

impl WorkerScratch {
    pub fn new(root: impl Into<String>, privileged: bool) -> WorkerScratch {
        let root: String = root.into();
        WorkerScratch {
            root: root.trim_end_matches('/').to_string(),
            privileged,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn samples_dir(&self) -> String {
        format!("{}/samples", self.root)
    }

    pub fn outputs_root(&self) -> String {
        format!("{}/outputs", self.root)
    }

    pub fn outputs_dir(&self, stage: &str) -> String {
        format!("{}/outputs/{stage}", self.root)
    }

    pub fn references_dir(&self) -> String {
        format!("{}/references", self.root)
    }

    /// Staged inputs live in one directory per artifact key, so equally named files produced
    /// by different stages do not collide.
    pub fn input_dir(&self, key: &str) -> String {
        format!("{}/samples/{key}", self.root)
    }

    pub fn input_path(&self, key: &str, file_name: &str) -> String {
        format!("{}/{file_name}", self.input_dir(key))
    }

    /// Translate a worker path below the scratch root into the path a container sees.
    pub fn to_container(&self, path: &str) -> String {
        match path.strip_prefix(&self.root) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                format!("{CONTAINER_DATA}{rest}")
            }
            _ => path.to_string(),
        }
    }

    fn admin(&self, program: &str) -> CommandSpec {
        if self.privileged {
            CommandSpec::new("sudo").arg(program)
        } else {
            CommandSpec::new(program)
        }
    }
}

/// Return a worker to a clean state: stop and remove the named containers, empty the samples
/// and outputs directories and hand them back to `owner`.
pub fn reset(worker: &Worker<'_>, containers: &[String], owner: &str) -> Result<()> {
    log::info!("Resetting {}", worker.machine);
    for name in containers {
        // Most of these are not running; a failure here only means there was nothing to remove.
        worker.execute(
            &CommandSpec::new("docker").args(["rm", "-f", name.as_str()]),
            ExecMode::WarnOnly,
        )?;
    }
    let scratch = &worker.scratch;
    let dirs = [scratch.samples_dir(), scratch.outputs_root()];
    let steps = [
        scratch.admin("rm").arg("-rf").args(dirs.clone()),
        scratch.admin("mkdir").arg("-p").args(dirs.clone()),
        scratch
            .admin("chown")
            .arg("-R")
            .arg(format!("{owner}:{owner}"))
            .args(dirs),
    ];
    for step in &steps {
        worker
            .execute(step, ExecMode::Strict)
            .with_context(|| format!("resetting scratch space on {}", worker.machine))?;
    }
    Ok(())
}
