//! Fan out `process` over the worker pool: one child per worker, all waited for.

use anyhow::{ensure, Context, Result};
use itertools::Itertools;
use log::{error, info};
use std::ffi::OsString;
use std::path::Path;
use std::process::{Child, Command};

/// Start `program` once per argument list, wait for every child and fail if any of them did.
/// Children run concurrently; a failure of one does not stop the others.
pub fn launch_workers(program: &Path, children: Vec<Vec<OsString>>) -> Result<()> {
    let mut running: Vec<(usize, Child)> = Vec::with_capacity(children.len());
    for (index, args) in children.into_iter().enumerate() {
        let child = Command::new(program)
            .args(&args)
            .spawn()
            .with_context(|| format!("starting worker {index}: {}", program.display()))?;
        info!("worker {index}: started pid {}", child.id());
        running.push((index, child));
    }

    let mut failed = Vec::new();
    for (index, mut child) in running {
        let status = child
            .wait()
            .with_context(|| format!("waiting for worker {index}"))?;
        if status.success() {
            info!("worker {index}: done");
        } else {
            error!("worker {index}: {status}");
            failed.push(index);
        }
    }
    ensure!(
        failed.is_empty(),
        "{} worker(s) failed: {}",
        failed.len(),
        failed.iter().join(", ")
    );
    Ok(())
}
