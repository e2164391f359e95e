//! Pool upkeep outside of sample processing: what a worker is busy with, installing the
//! reference data every stage reads from `references/`, and checking files on a worker against
//! an md5 checksum list.

use crate::command::CommandSpec;
use crate::remote::{ExecMode, Worker};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use ts_types::Machine;

/// Checksum list verified after installing references, when present among them.
pub const REFERENCE_CHECKSUMS: &str = "references.md5";

const TOP_PROCESSES: usize = 3;

/// A snapshot of the containers and busiest processes of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub machine: Machine,
    /// `name  image  status` of each running container.
    pub containers: Vec<String>,
    pub processes: Vec<String>,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.machine)?;
        if self.containers.is_empty() {
            writeln!(f, "  no containers running")?;
        }
        for container in &self.containers {
            writeln!(f, "  container {container}")?;
        }
        for process in &self.processes {
            writeln!(f, "  process   {process}")?;
        }
        Ok(())
    }
}

pub fn status(worker: &Worker<'_>) -> Result<WorkerStatus> {
    let ps = worker.execute(
        &CommandSpec::new("docker").args([
            "ps",
            "--format",
            "{{.Names}}  {{.Image}}  {{.Status}}",
        ]),
        ExecMode::Strict,
    )?;
    let top = worker.execute(
        &CommandSpec::new("top").args(["-b", "-n", "1"]),
        ExecMode::Strict,
    )?;
    Ok(WorkerStatus {
        machine: worker.machine.clone(),
        containers: ps
            .output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect(),
        processes: top_processes(&top.output, TOP_PROCESSES),
    })
}

/// The first `count` rows of the process table of `top -b` output.
fn top_processes(output: &str, count: usize) -> Vec<String> {
    output
        .lines()
        .skip_while(|l| l.split_whitespace().next() != Some("PID"))
        .skip(1)
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(count)
        .map(String::from)
        .collect()
}

/// Outcome of `md5sum -c` on a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumReport {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
}

impl ChecksumReport {
    /// At least one file was checked and none failed.
    pub fn ok(&self) -> bool {
        self.failed.is_empty() && !self.passed.is_empty()
    }

    fn parse(output: &str) -> ChecksumReport {
        let mut report = ChecksumReport::default();
        for line in output.lines() {
            // md5sum's own diagnostics also contain ": " but never end in a verdict
            let Some((file, verdict)) = line.trim().rsplit_once(": ") else {
                continue;
            };
            if verdict == "OK" {
                report.passed.push(file.to_string());
            } else if verdict.starts_with("FAILED") {
                report.failed.push(file.to_string());
            }
        }
        report
    }
}

impl fmt::Display for ChecksumReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for file in &self.passed {
            writeln!(f, "OK\t{file}")?;
        }
        for file in &self.failed {
            writeln!(f, "FAILED\t{file}")?;
        }
        Ok(())
    }
}

/// Run `md5sum -c {checksum_file}` inside `dir` on the worker. Mismatches are reported, not
/// returned as errors; a run that checked nothing is an error.
pub fn verify_checksums(worker: &Worker<'_>, dir: &str, checksum_file: &str) -> Result<ChecksumReport> {
    let result = worker.execute(
        &CommandSpec::new("md5sum")
            .args(["-c", checksum_file])
            .current_dir(dir),
        ExecMode::WarnOnly,
    )?;
    let report = ChecksumReport::parse(&result.output);
    if report.passed.is_empty() && report.failed.is_empty() {
        bail!(
            "md5sum -c {checksum_file} on {} checked nothing (status {}): {}",
            worker.machine,
            result.status,
            result.last_line()
        );
    }
    if !report.ok() {
        log::warn!(
            "{}: {} of {} files failed {checksum_file}",
            worker.machine,
            report.failed.len(),
            report.passed.len() + report.failed.len()
        );
    }
    Ok(report)
}

/// Copy every regular file of `local_dir` into the worker's reference directory. When the
/// directory carries a [`REFERENCE_CHECKSUMS`] list the installed files are verified with it.
pub fn install_references(worker: &Worker<'_>, local_dir: &Path) -> Result<Option<ChecksumReport>> {
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(local_dir).with_context(|| local_dir.display().to_string())? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    if files.is_empty() {
        bail!("no reference files in {}", local_dir.display());
    }
    files.sort();

    let references = worker.scratch.references_dir();
    worker.execute(
        &CommandSpec::new("mkdir").arg("-p").arg(references.as_str()),
        ExecMode::Strict,
    )?;
    let mut checksums = false;
    for file in &files {
        let Some(name) = file.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        log::info!("{}: installing {name}", worker.machine);
        worker.put(file, &format!("{references}/{name}"))?;
        checksums |= name == REFERENCE_CHECKSUMS;
    }
    if !checksums {
        return Ok(None);
    }
    verify_checksums(worker, &references, REFERENCE_CHECKSUMS).map(Some)
}

/// Check the outputs left on a worker's scratch space by its last sample against a local
/// checksum list whose paths are relative to the outputs directory.
pub fn verify_outputs(worker: &Worker<'_>, checksums: &Path) -> Result<ChecksumReport> {
    let Some(name) = checksums.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        bail!("{} is not a checksum file", checksums.display());
    };
    let outputs = worker.scratch.outputs_root();
    worker.put(checksums, &format!("{outputs}/{name}"))?;
    verify_checksums(worker, &outputs, &name)
}
