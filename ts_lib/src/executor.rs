//! Runs the stage chain of one sample on one worker.
//!
//! Each stage: stage its inputs on the worker, run the tool container, fetch what it wrote
//! into a `.partial` directory next to the published one, normalize names, move sequence data
//! into the derived cache, swap the partial directory into place and record provenance.
//!
//! A failed required stage abandons the rest of the sample. A failed best-effort stage only
//! loses its own outputs, and with them any later stage that consumes them. Nothing already
//! published is rolled back.

use crate::command::{CommandSpec, ContainerRun};
use crate::error_log::ErrorLog;
use crate::pipeline::{render_template, Pipeline, CHECKSUM, FASTQ_1, FASTQ_2};
use crate::provenance::{ProvenanceRecorder, PROVENANCE_FILE};
use crate::remote::{ExecMode, Worker};
use crate::scratch::CONTAINER_DATA;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use ts_types::{ArtifactSpec, PipelineStage, Placement, Sample, StorageLayout};

/// Which stages of the pipeline a run executes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSelection {
    checksum_only: bool,
    skip_stages: BTreeSet<String>,
}

impl StageSelection {
    pub fn all() -> StageSelection {
        StageSelection::default()
    }

    pub fn new<I, S>(checksum_only: bool, skip_stages: I, pipeline: &Pipeline) -> Result<StageSelection>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let skip_stages: BTreeSet<String> = skip_stages.into_iter().map(Into::into).collect();
        if let Some(unknown) = skip_stages.iter().find(|s| pipeline.get(s).is_none()) {
            bail!(
                "Unknown stage '{unknown}'. Stages are: {}",
                pipeline.stages().iter().map(|s| &s.name).join(", ")
            );
        }
        Ok(StageSelection {
            checksum_only,
            skip_stages,
        })
    }

    pub fn includes(&self, stage: &str) -> bool {
        if self.checksum_only {
            stage == CHECKSUM
        } else {
            !self.skip_stages.contains(stage)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub stage: String,
    pub result: String,
}

/// What happened to one sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleOutcome {
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<StageFailure>,
    /// A required stage failed and the remaining stages were not attempted.
    pub abandoned: bool,
}

impl SampleOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Artifact key to local path, for everything produced so far for the current sample.
type Artifacts = BTreeMap<String, PathBuf>;

pub struct StageExecutor<'a> {
    pipeline: &'a Pipeline,
    layout: &'a StorageLayout,
    worker: &'a Worker<'a>,
    recorder: &'a ProvenanceRecorder,
    errors: &'a ErrorLog,
}

impl<'a> StageExecutor<'a> {
    pub fn new(
        pipeline: &'a Pipeline,
        layout: &'a StorageLayout,
        worker: &'a Worker<'a>,
        recorder: &'a ProvenanceRecorder,
        errors: &'a ErrorLog,
    ) -> StageExecutor<'a> {
        StageExecutor {
            pipeline,
            layout,
            worker,
            recorder,
            errors,
        }
    }

    /// Run the selected stages for `sample`. Stage failures are reported in the outcome; only
    /// a failure to write the error log is returned as an error.
    pub fn run_sample(&self, sample: &Sample, selection: &StageSelection) -> Result<SampleOutcome> {
        let id = sample.id.as_str();
        let mut artifacts = Artifacts::new();
        artifacts.insert(FASTQ_1.to_string(), sample.inputs.r1.clone());
        artifacts.insert(FASTQ_2.to_string(), sample.inputs.r2.clone());
        let mut outcome = SampleOutcome::default();

        for stage in self.pipeline.stages() {
            if !selection.includes(&stage.name) {
                self.adopt_existing(id, stage, &mut artifacts);
                outcome.skipped.push(stage.name.clone());
                continue;
            }

            let result = match stage.inputs.iter().find(|k| !artifacts.contains_key(*k)) {
                Some(missing) => Err(anyhow::anyhow!("missing input {missing}")),
                None => {
                    log::info!("{id}: running {}", stage.name);
                    self.run_stage(id, stage, &artifacts)
                }
            };
            match result {
                Ok(produced) => {
                    artifacts.extend(produced);
                    outcome.completed.push(stage.name.clone());
                }
                Err(err) => {
                    let result = format!("{err:#}");
                    self.errors.stage_failure(id, &stage.name, &result)?;
                    outcome.failed.push(StageFailure {
                        stage: stage.name.clone(),
                        result,
                    });
                    if stage.is_required() {
                        outcome.abandoned = true;
                        break;
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Seed the artifact table with the outputs a previous run of a skipped stage left behind.
    fn adopt_existing(&self, id: &str, stage: &PipelineStage, artifacts: &mut Artifacts) {
        let stage_dir = self.layout.stage_dir(id, &stage.stage_dir_name());
        for spec in &stage.outputs {
            let dir = match spec.placement {
                Placement::Publish => stage_dir.clone(),
                Placement::Derived => self.layout.derived_dir(id),
            };
            let name = spec
                .canonical
                .clone()
                .unwrap_or_else(|| spec.file_pattern(id));
            if let Some(path) = find_file(&dir, &name) {
                log::debug!("{id}: reusing {} for {}", path.display(), spec.key);
                artifacts.insert(spec.key.clone(), path);
            }
        }
    }

    fn run_stage(&self, id: &str, stage: &PipelineStage, artifacts: &Artifacts) -> Result<Artifacts> {
        let start = Utc::now();
        let scratch = &self.worker.scratch;
        let out_dir = scratch.outputs_dir(&stage.name);

        let mut values: BTreeMap<String, String> = [
            ("sample_id", id.to_string()),
            ("output_dir", scratch.to_container(&out_dir)),
            ("samples_dir", scratch.to_container(&scratch.samples_dir())),
            ("references_dir", scratch.to_container(&scratch.references_dir())),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        let mut dirs = vec![out_dir.clone()];
        let mut transfers = Vec::with_capacity(stage.inputs.len());
        let mut inputs = Vec::with_capacity(stage.inputs.len());
        for key in &stage.inputs {
            let local = &artifacts[key];
            let remote = scratch.input_path(key, &staged_name(local));
            dirs.push(scratch.input_dir(key));
            values.insert(key.clone(), scratch.to_container(&remote));
            transfers.push((local, remote));
            inputs.push(local.clone());
        }
        self.worker
            .execute(&CommandSpec::new("mkdir").arg("-p").args(dirs), ExecMode::Strict)?;
        for (local, remote) in &transfers {
            self.worker.put(local, remote)?;
        }

        let mut run = ContainerRun::new(stage.name.as_str(), stage.tool.docker.pinned())
            .mount(scratch.root(), CONTAINER_DATA)
            .env("SAMPLE_ID", id);
        for (key, template) in &stage.env {
            run = run.env(key.as_str(), render_template(template, &values)?);
        }
        let args: Vec<String> = stage
            .args
            .iter()
            .map(|a| render_template(a, &values))
            .collect::<Result<_, _>>()?;
        let result = self
            .worker
            .execute(&run.args(args).into_command(), ExecMode::WarnOnly)?;
        if !result.success() {
            bail!("exit status {}: {}", result.status, result.last_line());
        }

        let dir_name = stage.stage_dir_name();
        let staging = self.layout.stage_staging_dir(id, &dir_name);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging).with_context(|| staging.display().to_string())?;
        let placed = match self.collect_outputs(id, stage, &out_dir, &staging) {
            Ok(placed) => placed,
            Err(err) => {
                discard(&staging);
                return Err(err);
            }
        };

        let stage_dir = self.layout.stage_dir(id, &dir_name);
        if stage_dir.exists() {
            fs::remove_dir_all(&stage_dir)
                .with_context(|| format!("replacing {}", stage_dir.display()))?;
        }
        fs::rename(&staging, &stage_dir)
            .with_context(|| format!("publishing {}", stage_dir.display()))?;

        let mut produced = Artifacts::new();
        let mut derived_outputs = Vec::new();
        for (spec, name) in placed {
            let path = match spec.placement {
                Placement::Publish => stage_dir.join(name),
                Placement::Derived => {
                    let path = self.layout.derived_dir(id).join(name);
                    derived_outputs.push(path.clone());
                    path
                }
            };
            produced.insert(spec.key.clone(), path);
        }
        let mut outputs = list_files(&stage_dir)?;
        outputs.extend(derived_outputs);

        self.recorder
            .record(stage, id, start, Utc::now(), &inputs, &outputs)?;
        Ok(produced)
    }

    /// Fetch what the tool wrote into `staging`, then normalize names and move derived
    /// artifacts into the sample's derived cache.
    fn collect_outputs<'s>(
        &self,
        id: &str,
        stage: &'s PipelineStage,
        out_dir: &str,
        staging: &Path,
    ) -> Result<Vec<(&'s ArtifactSpec, String)>> {
        let fetched = self.worker.get(&format!("{out_dir}/*"), staging)?;

        let mut placed = Vec::new();
        for spec in &stage.outputs {
            let Some(produced) = match_output(spec, id, &fetched)? else {
                continue;
            };
            let name = spec.final_name(&file_name(produced)).to_string();
            let dest = match spec.placement {
                Placement::Publish => staging.join(&name),
                Placement::Derived => {
                    let derived = self.layout.derived_dir(id);
                    fs::create_dir_all(&derived)?;
                    derived.join(&name)
                }
            };
            fs::rename(produced, &dest)
                .with_context(|| format!("moving {} to {}", produced.display(), dest.display()))?;
            placed.push((spec, name));
        }
        Ok(placed)
    }
}

/// Remove a staging directory left by a failed stage.
fn discard(staging: &Path) {
    if let Err(err) = fs::remove_dir_all(staging) {
        log::warn!("unable to remove {}: {err}", staging.display());
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Name an input is staged under. Tools expect upper case read designators.
fn staged_name(path: &Path) -> String {
    file_name(path).replace("r1.", "R1.").replace("r2.", "R2.")
}

/// The fetched file an output spec refers to. A required output that was not produced is an
/// error; a missing optional one is `None`.
fn match_output<'f>(spec: &ArtifactSpec, id: &str, fetched: &'f [PathBuf]) -> Result<Option<&'f PathBuf>> {
    let pattern = spec.file_pattern(id);
    let glob = glob::Pattern::new(&pattern)
        .with_context(|| format!("invalid output pattern '{pattern}'"))?;
    let matched = fetched
        .iter()
        .filter(|p| glob.matches(&file_name(p)))
        .sorted()
        .collect::<Vec<_>>();
    match matched.as_slice() {
        [] if spec.optional => Ok(None),
        [] => bail!("missing output {pattern}"),
        [first, rest @ ..] => {
            if !rest.is_empty() {
                log::warn!("{id}: {} files match {pattern}, using {}", matched.len(), first.display());
            }
            Ok(Some(*first))
        }
    }
}

fn find_file(dir: &Path, name_pattern: &str) -> Option<PathBuf> {
    let dir = dir.to_str()?;
    let pattern = format!("{}/{name_pattern}", glob::Pattern::escape(dir));
    glob::glob(&pattern)
        .ok()?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .sorted()
        .next()
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| dir.display().to_string())? {
        let path = entry?.path();
        if path.is_file() && path.file_name().map_or(true, |n| n != PROVENANCE_FILE) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{EXPRESSION, PIZZLY, QC, VARIANTS};
    use crate::provenance::{discover, read_record};
    use crate::testing::FakeWorker;
    use pretty_assertions::assert_eq;
    use tempfile::{tempdir, TempDir};
    use ts_types::{ProvenanceRecord, ReadPair, ResolutionMethod};

    struct Fixture {
        dir: TempDir,
        layout: StorageLayout,
        recorder: ProvenanceRecorder,
        errors: ErrorLog,
    }

    impl Fixture {
        fn new() -> Fixture {
            let dir = tempdir().unwrap();
            let layout = StorageLayout::new(dir.path().join("storage"));
            Fixture {
                recorder: ProvenanceRecorder::new(layout.clone(), "jdoe", "0.1.0-test"),
                errors: ErrorLog::new(dir.path().join("storage/errors.txt")),
                layout,
                dir,
            }
        }

        fn fake(&self) -> FakeWorker {
            FakeWorker::new(self.dir.path(), Pipeline::treehouse())
        }

        fn sample(&self, id: &str) -> Sample {
            let original = self.layout.original_dir(id);
            fs::create_dir_all(&original).unwrap();
            let r1 = original.join(format!("{id}_r1.fastq.gz"));
            let r2 = original.join(format!("{id}_r2.fastq.gz"));
            fs::write(&r1, "r1").unwrap();
            fs::write(&r2, "r2").unwrap();
            Sample {
                id: id.to_string(),
                inputs: ReadPair { r1, r2 },
                method: ResolutionMethod::OriginalPair,
            }
        }

        fn record(&self, pipeline: &Pipeline, id: &str, stage: &str) -> ProvenanceRecord {
            let dir = self
                .layout
                .stage_dir(id, &pipeline.get(stage).unwrap().stage_dir_name());
            read_record(&dir.join(PROVENANCE_FILE)).unwrap()
        }

        fn run(
            &self,
            pipeline: &Pipeline,
            fake: &FakeWorker,
            sample: &Sample,
            selection: &StageSelection,
        ) -> SampleOutcome {
            let worker = fake.worker("/mnt");
            StageExecutor::new(pipeline, &self.layout, &worker, &self.recorder, &self.errors)
                .run_sample(sample, selection)
                .unwrap()
        }
    }

    fn names(pipeline: &Pipeline) -> Vec<String> {
        pipeline.stages().iter().map(|s| s.name.clone()).collect()
    }

    #[test]
    fn test_full_chain() {
        let fx = Fixture::new();
        let fake = fx.fake();
        let pipeline = Pipeline::treehouse();
        let sample = fx.sample("S1");
        let outcome = fx.run(&pipeline, &fake, &sample, &StageSelection::all());
        assert!(outcome.succeeded());
        assert_eq!(outcome.completed, names(&pipeline));
        assert_eq!(discover(&fx.layout, "S1").unwrap().len(), 7);

        // the aligned bam goes to the derived cache, not the published directory
        let expression_dir = fx
            .layout
            .stage_dir("S1", &pipeline.get(EXPRESSION).unwrap().stage_dir_name());
        assert_eq!(
            list_files(&expression_dir).unwrap(),
            vec![expression_dir.join("expression.tar.gz")]
        );
        let derived_bam = fx.layout.derived_dir("S1").join("sortedByCoord.md.bam");
        assert!(derived_bam.is_file());
        let expression = fx.record(&pipeline, "S1", EXPRESSION);
        assert_eq!(
            expression.inputs,
            vec![
                "primary/original/S1/S1_r1.fastq.gz",
                "primary/original/S1/S1_r2.fastq.gz"
            ]
        );
        assert!(expression
            .outputs
            .contains(&"primary/derived/S1/sortedByCoord.md.bam".to_string()));

        // inputs staged with normalized read designators
        let rendered: Vec<String> = fake.commands().iter().map(ToString::to_string).collect();
        assert!(rendered.iter().any(|c| c.starts_with("docker run --rm --name expression ")
            && c.contains(" /data/samples/fastq_1/S1_R1.fastq.gz /data/samples/fastq_2/S1_R2.fastq.gz")));
        assert!(!fx
            .layout
            .stage_staging_dir("S1", &pipeline.get(EXPRESSION).unwrap().stage_dir_name())
            .exists());
    }

    #[test]
    fn test_published_dirs_hold_no_sequence_data() {
        let fx = Fixture::new();
        let fake = fx.fake();
        let pipeline = Pipeline::treehouse();
        let outcome = fx.run(&pipeline, &fake, &fx.sample("S1"), &StageSelection::all());
        assert!(outcome.succeeded());

        let secondary = fx.dir.path().join("storage/downstream/S1/secondary");
        let published: Vec<PathBuf> = glob::glob(&format!("{}/**/*", secondary.display()))
            .unwrap()
            .map(Result::unwrap)
            .filter(|p| p.is_file())
            .collect();
        assert!(!published.is_empty());
        let sequence: Vec<&PathBuf> = published
            .iter()
            .filter(|p| {
                let name = file_name(p);
                name.ends_with(".bam") || name.ends_with(".bai") || name.contains(".fastq")
            })
            .collect();
        assert!(sequence.is_empty(), "{sequence:?}");

        // the expression and qc alignments live side by side in the derived cache
        let derived = fx.layout.derived_dir("S1");
        assert!(derived.join("sortedByCoord.md.bam").is_file());
        assert!(derived.join("qc.sortedByCoord.md.bam").is_file());
    }

    #[test]
    fn test_provenance_chaining() {
        let fx = Fixture::new();
        let fake = fx.fake();
        let pipeline = Pipeline::treehouse();
        fx.run(&pipeline, &fake, &fx.sample("S1"), &StageSelection::all());

        let qc = fx.record(&pipeline, "S1", QC);
        let variants = fx.record(&pipeline, "S1", VARIANTS);
        assert_eq!(qc.inputs, vec!["primary/derived/S1/sortedByCoord.md.bam"]);
        assert_eq!(variants.inputs, vec!["primary/derived/S1/qc.sortedByCoord.md.bam"]);
        assert!(qc.outputs.contains(&variants.inputs[0]));
        assert_eq!(variants.sample_id, "S1");
        assert_eq!(variants.user, "jdoe");
        assert_eq!(variants.pipeline, pipeline.get(VARIANTS).unwrap().tool);
        assert!(variants.start <= variants.end);
    }

    #[test]
    fn test_required_failure_is_isolated() {
        let fx = Fixture::new();
        let mut fake = fx.fake();
        fake.fail("S1", EXPRESSION);
        let pipeline = Pipeline::treehouse();

        let s1 = fx.run(&pipeline, &fake, &fx.sample("S1"), &StageSelection::all());
        assert!(s1.abandoned);
        assert_eq!(s1.completed, vec![CHECKSUM]);
        assert_eq!(
            s1.failed,
            vec![StageFailure {
                stage: EXPRESSION.to_string(),
                result: "exit status 1: simulated failure".to_string(),
            }]
        );
        let recorded = discover(&fx.layout, "S1").unwrap();
        assert_eq!(recorded.len(), 1);

        let s2 = fx.run(&pipeline, &fake, &fx.sample("S2"), &StageSelection::all());
        assert!(s2.succeeded());
        assert_eq!(discover(&fx.layout, "S2").unwrap().len(), 7);

        assert_eq!(
            fs::read_to_string(fx.errors.path()).unwrap(),
            "S1 Failed expression: exit status 1: simulated failure\n"
        );
    }

    #[test]
    fn test_best_effort_failure_continues() {
        let fx = Fixture::new();
        let mut fake = fx.fake();
        fake.fail("S1", PIZZLY);
        let pipeline = Pipeline::treehouse();
        let outcome = fx.run(&pipeline, &fake, &fx.sample("S1"), &StageSelection::all());
        assert!(!outcome.abandoned);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].stage, PIZZLY);
        assert_eq!(outcome.completed.len(), 6);
        assert_eq!(outcome.completed.last().map(String::as_str), Some(VARIANTS));
        let pizzly_dir = fx
            .layout
            .stage_dir("S1", &pipeline.get(PIZZLY).unwrap().stage_dir_name());
        assert!(!pizzly_dir.exists());
    }

    #[test]
    fn test_missing_output_fails_stage() {
        let fx = Fixture::new();
        let fake = fx.fake();
        let mut stages = Pipeline::treehouse().stages().to_vec();
        stages[0].outputs[0].pattern = "{sample_id}.md5".to_string();
        let pipeline = Pipeline::new(stages).unwrap();
        let outcome = fx.run(&pipeline, &fake, &fx.sample("S1"), &StageSelection::all());
        assert!(outcome.abandoned);
        assert_eq!(outcome.failed[0].result, "missing output S1.md5");
        assert!(discover(&fx.layout, "S1").unwrap().is_empty());
        let checksum_dir = pipeline.get(CHECKSUM).unwrap().stage_dir_name();
        assert!(!fx.layout.stage_staging_dir("S1", &checksum_dir).exists());
        assert!(!fx.layout.stage_dir("S1", &checksum_dir).exists());
    }

    #[test]
    fn test_skipped_stages_feed_later_stages() {
        let fx = Fixture::new();
        let fake = fx.fake();
        let pipeline = Pipeline::treehouse();
        let sample = fx.sample("S1");

        // nothing to adopt yet
        let skip = StageSelection::new(false, [CHECKSUM, EXPRESSION], &pipeline).unwrap();
        let outcome = fx.run(&pipeline, &fake, &sample, &skip);
        assert!(outcome.abandoned);
        assert_eq!(outcome.failed[0].result, "missing input aligned_bam");

        fx.run(&pipeline, &fake, &sample, &StageSelection::all());
        let outcome = fx.run(&pipeline, &fake, &sample, &skip);
        assert!(outcome.succeeded());
        assert_eq!(outcome.skipped, vec![CHECKSUM, EXPRESSION]);
        assert_eq!(outcome.completed.len(), 5);
    }

    #[test]
    fn test_selection() {
        let pipeline = Pipeline::treehouse();
        let checksum_only = StageSelection::new(true, Vec::<String>::new(), &pipeline).unwrap();
        assert!(checksum_only.includes(CHECKSUM));
        assert!(!checksum_only.includes(QC));
        let skip = StageSelection::new(false, ["fusion"], &pipeline).unwrap();
        assert!(!skip.includes("fusion") && skip.includes(QC));
        let err = StageSelection::new(false, ["star"], &pipeline).unwrap_err();
        assert!(err.to_string().starts_with("Unknown stage 'star'"));
    }
}
