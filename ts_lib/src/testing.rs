//! An in-memory stand-in for a worker machine.
//!
//! Remote paths are mapped below `{root}/worker`. Containers are emulated by writing the
//! declared outputs of the stage with the same name, so the full stage protocol can be
//! exercised without ssh or docker.

use crate::command::CommandSpec;
use crate::converter::CONVERTER_CONTAINER;
use crate::pipeline::Pipeline;
use crate::remote::{check_status, ExecMode, ExecOutput, FileTransfer, RemoteExecutor, Worker};
use crate::scratch::WorkerScratch;
use anyhow::{Context, Result};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use ts_types::Machine;

pub(crate) struct FakeWorker {
    root: PathBuf,
    pipeline: Pipeline,
    failures: HashSet<(String, String)>,
    commands: RefCell<Vec<CommandSpec>>,
    conversions: Cell<usize>,
}

/// The parts of a `docker run` command line the fake cares about.
#[derive(Default)]
struct ParsedRun {
    name: String,
    sample_id: String,
    mount: Option<(String, String)>,
    args: Vec<String>,
}

fn parse_run(args: &[String]) -> ParsedRun {
    let mut parsed = ParsedRun::default();
    let mut image_seen = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if image_seen {
            parsed.args.push(arg.clone());
            continue;
        }
        match arg.as_str() {
            "--rm" => {}
            "--name" => parsed.name = iter.next().cloned().unwrap_or_default(),
            "-v" => {
                parsed.mount = iter
                    .next()
                    .and_then(|m| m.split_once(':'))
                    .map(|(h, c)| (h.to_string(), c.to_string()));
            }
            "-e" => {
                if let Some(id) = iter.next().and_then(|e| e.strip_prefix("SAMPLE_ID=")) {
                    parsed.sample_id = id.to_string();
                }
            }
            _ => image_seen = true,
        }
    }
    parsed
}

impl FakeWorker {
    pub(crate) fn new(root: &Path, pipeline: Pipeline) -> FakeWorker {
        FakeWorker {
            root: root.to_path_buf(),
            pipeline,
            failures: HashSet::new(),
            commands: RefCell::new(Vec::new()),
            conversions: Cell::new(0),
        }
    }

    pub(crate) fn machine() -> Machine {
        Machine {
            name: "fake-worker".to_string(),
            address: "10.0.0.9".to_string(),
        }
    }

    pub(crate) fn worker(&self, scratch_root: &str) -> Worker<'_> {
        Worker::new(
            FakeWorker::machine(),
            WorkerScratch::new(scratch_root, true),
            self,
            self,
        )
    }

    /// Make the container `stage` exit non-zero for `sample_id`.
    pub(crate) fn fail(&mut self, sample_id: &str, stage: &str) {
        self.failures
            .insert((sample_id.to_string(), stage.to_string()));
    }

    pub(crate) fn commands(&self) -> Vec<CommandSpec> {
        self.commands.borrow().clone()
    }

    /// Number of converter containers that ran.
    pub(crate) fn conversions(&self) -> usize {
        self.conversions.get()
    }

    /// Where a worker path lives on the local disk.
    pub(crate) fn local(&self, remote: &str) -> PathBuf {
        self.root.join("worker").join(remote.trim_start_matches('/'))
    }

    fn ok() -> ExecOutput {
        ExecOutput {
            status: 0,
            output: String::new(),
        }
    }

    fn failed(status: i32, output: String) -> ExecOutput {
        ExecOutput { status, output }
    }

    /// `md5sum -c` that only checks the listed files exist; digests are not computed.
    fn check_sums(&self, workdir: &str, args: &[String]) -> Result<ExecOutput> {
        let Some(list) = args.first() else {
            return Ok(FakeWorker::failed(1, "md5sum: no checksum file".to_string()));
        };
        let dir = self.local(workdir);
        let mut result = FakeWorker::ok();
        for line in fs::read_to_string(dir.join(list))?.lines() {
            let Some((_, file)) = line.split_once("  ") else {
                continue;
            };
            if dir.join(file).is_file() {
                result.output.push_str(&format!("{file}: OK\n"));
            } else {
                result.status = 1;
                result
                    .output
                    .push_str(&format!("md5sum: {file}: No such file or directory\n{file}: FAILED open or read\n"));
            }
        }
        Ok(result)
    }

    fn run_container(&self, args: &[String]) -> Result<ExecOutput> {
        let run = parse_run(args);
        if self.failures.contains(&(run.sample_id.clone(), run.name.clone())) {
            return Ok(FakeWorker::failed(1, format!("{} crashed\nsimulated failure\n", run.name)));
        }
        let Some((host_root, container_root)) = run.mount else {
            return Ok(FakeWorker::failed(125, "no data volume".to_string()));
        };
        for arg in &run.args {
            if let Some(rest) = arg.strip_prefix(&format!("{container_root}/samples/")) {
                if !self.local(&format!("{host_root}/samples/{rest}")).is_file() {
                    return Ok(FakeWorker::failed(1, format!("{arg}: no such file")));
                }
            }
        }

        let out_dir = self.local(&format!("{host_root}/outputs/{}", run.name));
        fs::create_dir_all(&out_dir)?;
        let files: Vec<String> = if run.name == CONVERTER_CONTAINER {
            self.conversions.set(self.conversions.get() + 1);
            vec![
                format!("{}_1.fastq.gz", run.sample_id),
                format!("{}_2.fastq.gz", run.sample_id),
            ]
        } else if let Some(stage) = self.pipeline.get(&run.name) {
            stage
                .outputs
                .iter()
                .map(|o| o.file_pattern(&run.sample_id).replace('*', "x"))
                .collect()
        } else {
            return Ok(FakeWorker::failed(125, format!("unknown image for {}", run.name)));
        };
        for file in files {
            fs::write(out_dir.join(&file), format!("{} {file}", run.name))?;
        }
        Ok(FakeWorker::ok())
    }
}

const TOP_OUTPUT: &str = "\
top - 10:01:02 up 3 days,  2:03,  1 user,  load average: 15.02, 14.87, 14.60

  PID USER      PR  NI    VIRT    RES    SHR S  %CPU %MEM     TIME+ COMMAND
 4242 root      20   0 31.2g  28.1g   2.1g R  1500 45.0 120:00.01 STAR
 4301 root      20   0  1.2g   0.9g   0.1g S   98.0  1.4   3:10.44 samtools
    1 root      20   0  0.2g   0.0g   0.0g S    0.0  0.0   0:03.00 systemd
    2 root      20   0     0      0      0 S    0.0  0.0   0:00.01 kthreadd
";

impl RemoteExecutor for FakeWorker {
    fn execute(&self, machine: &Machine, command: &CommandSpec, mode: ExecMode) -> Result<ExecOutput> {
        self.commands.borrow_mut().push(command.clone());
        let (program, args) = match (command.program(), command.get_args()) {
            ("sudo", [program, args @ ..]) => (program.as_str(), args),
            (program, args) => (program, args),
        };
        let paths = || args.iter().filter(|a| !a.starts_with('-'));
        let output = match (program, args.first().map(String::as_str)) {
            ("mkdir", _) => {
                for dir in paths() {
                    fs::create_dir_all(self.local(dir))?;
                }
                FakeWorker::ok()
            }
            ("rm", _) => {
                for path in paths().map(|p| self.local(p)) {
                    if path.is_dir() {
                        fs::remove_dir_all(&path)?;
                    } else if path.exists() {
                        fs::remove_file(&path)?;
                    }
                }
                FakeWorker::ok()
            }
            ("chown", _) => FakeWorker::ok(),
            ("docker", Some("rm")) => FakeWorker::failed(1, "No such container".to_string()),
            ("docker", Some("run")) => self.run_container(&args[1..])?,
            ("docker", Some("ps")) => ExecOutput {
                status: 0,
                output: "expression  quay.io/ucsc_cgl/rnaseq-cgl-pipeline  Up 2 hours\n".to_string(),
            },
            ("top", _) => ExecOutput {
                status: 0,
                output: TOP_OUTPUT.to_string(),
            },
            ("md5sum", Some("-c")) => self.check_sums(command.workdir().unwrap_or("/"), &args[1..])?,
            _ => FakeWorker::failed(127, format!("{program}: command not found")),
        };
        check_status(machine, command, mode, output)
    }
}

impl FileTransfer for FakeWorker {
    fn put(&self, _machine: &Machine, local: &Path, remote: &str) -> Result<()> {
        let dest = self.local(remote);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(local, &dest).with_context(|| format!("put {}", local.display()))?;
        Ok(())
    }

    fn get(&self, _machine: &Machine, remote_glob: &str, local_dir: &Path) -> Result<Vec<PathBuf>> {
        let pattern = self.local(remote_glob);
        fs::create_dir_all(local_dir)?;
        let mut fetched = Vec::new();
        for path in glob::glob(&pattern.to_string_lossy())? {
            let path = path?;
            if let (true, Some(name)) = (path.is_file(), path.file_name()) {
                let dest = local_dir.join(name);
                fs::copy(&path, &dest)?;
                fetched.push(dest);
            }
        }
        fetched.sort();
        Ok(fetched)
    }
}
