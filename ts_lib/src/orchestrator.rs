//! The per-worker drivers behind the `process` and `check` commands.

use crate::config::{Config, ExistingOutputs};
use crate::converter::{ContainerConverter, CONVERTER_CONTAINER};
use crate::error_log::ErrorLog;
use crate::executor::{StageExecutor, StageSelection};
use crate::partition::partition;
use crate::provenance::ProvenanceRecorder;
use crate::remote::Worker;
use crate::resolver::{plan, InputResolver, ResolutionPlan, ResolveError};
use crate::scratch;
use anyhow::Result;
use log::{info, warn};
use std::fmt;
use ts_types::{ConfigError, Manifest, StorageLayout, WorkerIdentity};

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub selection: StageSelection,
    /// Only consider the first `limit` ids of the manifest.
    pub limit: Option<usize>,
}

/// Counts for one worker's pass over its shard. Logged, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
    pub unresolved: usize,
    pub skipped: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} assigned, {} completed, {} failed, {} unresolved, {} skipped",
            self.assigned, self.completed, self.failed, self.unresolved, self.skipped
        )
    }
}

/// Process this worker's shard of `manifest`, one sample at a time.
///
/// Configuration errors abort before any sample is touched. Per-sample problems are logged to
/// the error log and counted; the next sample proceeds regardless.
pub fn process(
    config: &Config,
    manifest: &Manifest,
    identity: WorkerIdentity,
    worker: &Worker<'_>,
    options: &ProcessOptions,
) -> Result<RunSummary> {
    let manifest = manifest.clone().limited(options.limit);
    let shard = partition(&manifest, identity)?;
    info!(
        "{identity} on {}: {} of {} samples",
        worker.machine,
        shard.len(),
        manifest.len()
    );

    let layout = config.layout();
    let recorder = ProvenanceRecorder::new(
        layout.clone(),
        config.operator.as_str(),
        config.orchestrator_version.as_str(),
    );
    let errors = ErrorLog::new(&config.error_log);
    let converter = ContainerConverter::new(worker, &config.converter);
    let resolver = InputResolver::new(&layout, &converter);
    let executor = StageExecutor::new(&config.pipeline, &layout, worker, &recorder, &errors);
    let mut containers = config.pipeline.container_names();
    containers.push(CONVERTER_CONTAINER.to_string());

    let mut summary = RunSummary {
        assigned: shard.len(),
        ..RunSummary::default()
    };
    for id in &shard.assigned_sample_ids {
        if config.existing_outputs == ExistingOutputs::Skip && layout.secondary_dir(id).exists() {
            warn!("{id}: secondary outputs exist, skipping");
            summary.skipped += 1;
            continue;
        }
        info!("{id}: processing");
        scratch::reset(worker, &containers, &config.worker.chown_user)?;

        let sample = match resolver.resolve(id) {
            Ok(sample) => sample,
            Err(err) => {
                errors.stage_failure(id, "resolve", &format!("{:#}", anyhow::Error::from(err)))?;
                summary.unresolved += 1;
                continue;
            }
        };
        let outcome = executor.run_sample(&sample, &options.selection)?;
        if outcome.succeeded() {
            summary.completed += 1;
        } else {
            summary.failed += 1;
        }
    }
    info!("{}: {summary}", worker.machine);
    Ok(summary)
}

/// How each manifest id would resolve, without running anything.
#[derive(Debug)]
pub struct CheckReport {
    pub entries: Vec<(String, Result<ResolutionPlan, ResolveError>)>,
}

impl CheckReport {
    pub fn unresolved(&self) -> usize {
        self.entries.iter().filter(|(_, r)| r.is_err()).count()
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, result) in &self.entries {
            match result {
                Ok(plan) => writeln!(f, "{id}\t{plan}")?,
                Err(err) => writeln!(f, "{id}\tunresolved: {err}")?,
            }
        }
        Ok(())
    }
}

pub fn check(layout: &StorageLayout, manifest: &Manifest) -> Result<CheckReport, ConfigError> {
    if manifest.is_empty() {
        return Err(ConfigError::EmptyManifest);
    }
    let entries = manifest
        .ids()
        .iter()
        .map(|id| (id.clone(), plan(layout, id)))
        .collect();
    Ok(CheckReport { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overrides;
    use crate::pipeline::{Pipeline, CHECKSUM};
    use crate::provenance::discover;
    use crate::testing::FakeWorker;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn config(base: &Path, extra: &str) -> Config {
        let text = format!("[worker]\nkey_dir = '/keys'\n{extra}");
        Config::from_toml_str(
            &text,
            Overrides {
                storage_base: Some(base.to_path_buf()),
                operator: Some("jdoe".to_string()),
                orchestrator_version: Some("0.1.0-test".to_string()),
            },
        )
        .unwrap()
    }

    fn upload(layout: &StorageLayout, id: &str, names: &[&str]) {
        let dir = layout.original_dir(id);
        fs::create_dir_all(&dir).unwrap();
        for name in names {
            fs::write(dir.join(name), name).unwrap();
        }
    }

    #[test]
    fn test_process_shard() -> Result<()> {
        let dir = tempdir()?;
        let config = config(&dir.path().join("storage"), "");
        let layout = config.layout();
        upload(&layout, "S1", &["S1_R1.fastq.gz", "S1_R2.fastq.gz"]);
        upload(&layout, "S2", &["S2_R1.fastq.gz", "S2_R2.fastq.gz"]);
        upload(&layout, "S3", &["S3.bam"]);
        upload(&layout, "S5", &["notes.txt"]);
        let manifest = Manifest::parse("S1,S2,S3\nS4\nS5");

        let fake = FakeWorker::new(dir.path(), Pipeline::treehouse());
        let worker = fake.worker("/mnt");
        let summary = process(
            &config,
            &manifest,
            WorkerIdentity::new(0, 2)?,
            &worker,
            &ProcessOptions::default(),
        )?;
        assert_eq!(
            summary,
            RunSummary {
                assigned: 3,
                completed: 2,
                failed: 0,
                unresolved: 1,
                skipped: 0,
            }
        );
        for id in ["S1", "S3"] {
            let stages = discover(&layout, id)?;
            assert_eq!(stages.len(), 7, "{id}");
        }
        assert!(discover(&layout, "S2")?.is_empty());
        assert_eq!(fake.conversions(), 1);
        let errors = fs::read_to_string(&config.error_log)?;
        assert!(errors.starts_with("S5 Failed resolve: no paired-read or alignment files"), "{errors}");

        // each sample starts from a clean worker
        let resets = fake
            .commands()
            .iter()
            .filter(|c| c.to_string().starts_with("sudo rm -rf /mnt/samples /mnt/outputs"))
            .count();
        assert_eq!(resets, 3);
        Ok(())
    }

    #[test]
    fn test_existing_outputs_skip() -> Result<()> {
        let dir = tempdir()?;
        let config = config(&dir.path().join("storage"), "existing_outputs = 'skip'\n");
        let layout = config.layout();
        upload(&layout, "S1", &["S1_R1.fastq.gz", "S1_R2.fastq.gz"]);
        let manifest = Manifest::parse("S1");
        let fake = FakeWorker::new(dir.path(), Pipeline::treehouse());
        let worker = fake.worker("/mnt");
        let identity = WorkerIdentity::new(0, 1)?;
        let options = ProcessOptions {
            selection: StageSelection::new(true, Vec::<String>::new(), &config.pipeline)?,
            limit: None,
        };

        let first = process(&config, &manifest, identity, &worker, &options)?;
        assert_eq!(first.completed, 1);
        let recorded = discover(&layout, "S1")?;
        assert_eq!(recorded.len(), 1);
        assert_eq!(
            recorded[0].0.parent().and_then(|p| p.file_name()).unwrap(),
            config.pipeline.get(CHECKSUM).unwrap().stage_dir_name().as_str()
        );

        let second = process(&config, &manifest, identity, &worker, &options)?;
        assert_eq!(second.skipped, 1);
        assert_eq!(second.completed, 0);
        Ok(())
    }

    #[test]
    fn test_limit_applies_before_partition() -> Result<()> {
        let dir = tempdir()?;
        let config = config(&dir.path().join("storage"), "");
        let fake = FakeWorker::new(dir.path(), Pipeline::treehouse());
        let worker = fake.worker("/mnt");
        let options = ProcessOptions {
            limit: Some(2),
            ..ProcessOptions::default()
        };
        let summary = process(
            &config,
            &Manifest::parse("S1,S2,S3,S4"),
            WorkerIdentity::new(1, 2)?,
            &worker,
            &options,
        )?;
        assert_eq!(summary.assigned, 1);
        assert_eq!(summary.unresolved, 1);
        Ok(())
    }

    #[test]
    fn test_check() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        upload(&layout, "S1", &["a_R1.fastq.gz", "a_R2.fastq.gz"]);
        upload(&layout, "S2", &["S2.bam"]);
        let report = check(&layout, &Manifest::parse("S2,S1,S3")).unwrap();
        assert_eq!(report.unresolved(), 1);
        let text = report.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "S1\toriginal-pair: a_R1.fastq.gz a_R2.fastq.gz");
        assert_eq!(lines[1], "S2\tbam-converted: S2.bam");
        assert!(lines[2].starts_with("S3\tunresolved: no paired-read or alignment files"));
        assert!(matches!(
            check(&layout, &Manifest::parse("")),
            Err(ConfigError::EmptyManifest)
        ));
    }
}
