//! treeshop: process Treehouse RNA-seq samples across a pool of docker-machine workers.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use itertools::Itertools;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use ts_lib::config::Overrides;
use ts_lib::remote::{DockerMachinePool, LocalHost, MachinePool, SshSession, StaticPool, Worker};
use ts_lib::{check, maintenance, partition, process, scratch, Config, ProcessOptions, StageSelection};
use ts_types::{ConfigError, Machine, Manifest, WorkerIdentity};
use ts_wrap::env;
use ts_wrap::launch::launch_workers;
use ts_wrap::utils::print_error_chain;

const CMD: &str = "treeshop";

/// Orchestrate the Treehouse pipelines over a static pool of worker machines.
#[derive(Parser, Debug)]
#[clap(name = CMD, version)]
struct TreeShop {
    #[clap(subcommand)]
    subcmd: SubCommand,

    /// TOML configuration file.
    #[clap(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Root of the primary/ and downstream/ storage hierarchy.
    #[clap(long, global = true, value_name = "PATH")]
    storage_base: Option<PathBuf>,

    /// Orchestrator revision recorded in provenance. Defaults to `git describe --always`.
    #[clap(long, global = true, value_name = "TEXT")]
    revision: Option<String>,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    /// Print the sample ids assigned to one worker.
    #[clap(name = "partition")]
    Partition(PartitionCmd),

    /// Process this worker's shard of a manifest.
    #[clap(name = "process")]
    Process(ProcessCmd),

    /// Report how every sample of a manifest would be resolved.
    #[clap(name = "check")]
    Check(CheckCmd),

    /// List the worker pool.
    #[clap(name = "machines")]
    Machines,

    /// Stop containers and clear scratch space on one or all workers.
    #[clap(name = "reset")]
    Reset(TargetArgs),

    /// Run `process` for every worker of the pool in parallel.
    #[clap(name = "launch")]
    Launch(LaunchCmd),

    /// Show the running containers and busiest processes of one or all workers.
    #[clap(name = "status")]
    Status(TargetArgs),

    /// Install reference data into the scratch space of one or all workers.
    #[clap(name = "references")]
    References(ReferencesCmd),

    /// Check the outputs left on one or all workers against an md5 checksum list.
    #[clap(name = "verify")]
    Verify(VerifyCmd),
}

#[derive(Args, Debug)]
struct PartitionCmd {
    #[clap(long, value_name = "PATH")]
    manifest: PathBuf,

    #[clap(long, value_name = "NUM")]
    worker_index: usize,

    #[clap(long, value_name = "NUM")]
    pool_size: usize,
}

/// Options shared by `process` and `launch`.
#[derive(Args, Debug)]
struct RunArgs {
    /// Sample ids separated by newlines and/or commas.
    #[clap(long, value_name = "PATH")]
    manifest: PathBuf,

    /// Only compute checksums of the input reads.
    #[clap(long)]
    checksum_only: bool,

    /// Stages not to run; their previous outputs still feed later stages.
    #[clap(long, value_name = "STAGE", value_delimiter = ',')]
    skip: Vec<String>,

    /// Only consider the first NUM sample ids of the manifest.
    #[clap(long, value_name = "NUM")]
    limit: Option<usize>,
}

impl RunArgs {
    fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--manifest".into(), self.manifest.clone().into()];
        if self.checksum_only {
            args.push("--checksum-only".into());
        }
        if !self.skip.is_empty() {
            args.push("--skip".into());
            args.push(self.skip.join(",").into());
        }
        if let Some(limit) = self.limit {
            args.push("--limit".into());
            args.push(limit.to_string().into());
        }
        args
    }

    fn options(&self, config: &Config) -> Result<ProcessOptions> {
        Ok(ProcessOptions {
            selection: StageSelection::new(self.checksum_only, self.skip.iter().cloned(), &config.pipeline)?,
            limit: self.limit,
        })
    }
}

#[derive(Args, Debug)]
struct ProcessCmd {
    #[clap(flatten)]
    run: RunArgs,

    /// Position of this worker in the pool, ordered by machine name.
    #[clap(long, value_name = "NUM", conflicts_with_all = ["host", "local"])]
    worker_index: Option<usize>,

    /// Name or address of this worker.
    #[clap(long, value_name = "HOST", conflicts_with = "local")]
    host: Option<String>,

    /// Use this machine as the only worker.
    #[clap(long)]
    local: bool,
}

#[derive(Args, Debug)]
struct CheckCmd {
    #[clap(long, value_name = "PATH")]
    manifest: PathBuf,
}

/// Which workers a maintenance command applies to. Defaults to the whole pool.
#[derive(Args, Debug)]
struct TargetArgs {
    /// Only this worker, by name or address.
    #[clap(long, value_name = "HOST", conflicts_with = "local")]
    host: Option<String>,

    /// This machine's own scratch space.
    #[clap(long)]
    local: bool,
}

#[derive(Args, Debug)]
struct ReferencesCmd {
    /// Local directory whose files are copied into `references/`. A `references.md5` list
    /// among them is checked after the copy.
    #[clap(long, value_name = "PATH")]
    dir: PathBuf,

    #[clap(flatten)]
    target: TargetArgs,
}

#[derive(Args, Debug)]
struct VerifyCmd {
    /// md5sum list with paths relative to the outputs directory, e.g. of a TEST sample.
    #[clap(long, value_name = "PATH")]
    checksums: PathBuf,

    #[clap(flatten)]
    target: TargetArgs,
}

#[derive(Args, Debug)]
struct LaunchCmd {
    #[clap(flatten)]
    run: RunArgs,
}

impl TreeShop {
    fn config(&self) -> Result<Config> {
        let overrides = Overrides {
            storage_base: self.storage_base.clone(),
            operator: env::operator(),
            orchestrator_version: self.revision.clone().or_else(env::revision),
        };
        Config::load(self.config.as_deref(), overrides)
    }

    /// The global flags, for forwarding to child processes.
    fn global_args(&self, revision: &str) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(config) = &self.config {
            args.push("--config".into());
            args.push(config.clone().into());
        }
        if let Some(base) = &self.storage_base {
            args.push("--storage-base".into());
            args.push(base.clone().into());
        }
        args.push("--revision".into());
        args.push(revision.into());
        args
    }
}

/// The pool, sorted the way worker indices are assigned.
fn machines(config: &Config) -> Result<Vec<Machine>> {
    let mut machines = match &config.pool {
        Some(pool) => StaticPool(pool.clone()).machines()?,
        None => DockerMachinePool.machines()?,
    };
    machines.sort();
    if machines.is_empty() {
        return Err(ConfigError::EmptyPool.into());
    }
    Ok(machines)
}

fn run_process(config: &Config, cmd: &ProcessCmd) -> Result<ExitCode> {
    let manifest = Manifest::from_path(&cmd.run.manifest)?;
    let options = cmd.run.options(config)?;
    let scratch = config.worker.scratch();

    let summary = if cmd.local {
        let worker = Worker::new(LocalHost::machine(), scratch, &LocalHost, &LocalHost);
        process(config, &manifest, WorkerIdentity::new(0, 1)?, &worker, &options)?
    } else {
        let machines = machines(config)?;
        let identity = match (cmd.worker_index, &cmd.host) {
            (Some(index), _) => WorkerIdentity::new(index, machines.len())?,
            (None, Some(host)) => WorkerIdentity::from_pool(&machines, host)?,
            (None, None) => bail!("One of --worker-index, --host or --local is required."),
        };
        let machine = machines[identity.index()].clone();
        let ssh = SshSession::new(config.worker.ssh_user.as_str(), config.worker.key_dir.as_path());
        let worker = Worker::new(machine, scratch, &ssh, &ssh);
        process(config, &manifest, identity, &worker, &options)?
    };
    println!("{summary}");
    Ok(ExitCode::SUCCESS)
}

/// Apply `f` to every targeted worker in pool order, stopping at the first error.
fn for_each_worker<F>(config: &Config, target: &TargetArgs, mut f: F) -> Result<()>
where
    F: FnMut(&Worker<'_>) -> Result<()>,
{
    if target.local {
        let worker = Worker::new(LocalHost::machine(), config.worker.scratch(), &LocalHost, &LocalHost);
        return f(&worker);
    }
    let machines = machines(config)?;
    let targets: Vec<&Machine> = match &target.host {
        Some(host) => vec![&machines[WorkerIdentity::from_pool(&machines, host)?.index()]],
        None => machines.iter().collect(),
    };
    let ssh = SshSession::new(config.worker.ssh_user.as_str(), config.worker.key_dir.as_path());
    for machine in targets {
        let worker = Worker::new(machine.clone(), config.worker.scratch(), &ssh, &ssh);
        f(&worker).with_context(|| machine.to_string())?;
    }
    Ok(())
}

fn run_reset(config: &Config, target: &TargetArgs) -> Result<ExitCode> {
    let mut containers = config.pipeline.container_names();
    containers.push(ts_lib::converter::CONVERTER_CONTAINER.to_string());
    let owner = &config.worker.chown_user;
    for_each_worker(config, target, |worker| scratch::reset(worker, &containers, owner))?;
    Ok(ExitCode::SUCCESS)
}

fn run_status(config: &Config, target: &TargetArgs) -> Result<ExitCode> {
    for_each_worker(config, target, |worker| {
        print!("{}", maintenance::status(worker)?);
        Ok(())
    })?;
    Ok(ExitCode::SUCCESS)
}

fn run_references(config: &Config, cmd: &ReferencesCmd) -> Result<ExitCode> {
    let mut failed = Vec::new();
    for_each_worker(config, &cmd.target, |worker| {
        if let Some(report) = maintenance::install_references(worker, &cmd.dir)? {
            if !report.ok() {
                failed.push(worker.machine.name.clone());
            }
        }
        Ok(())
    })?;
    if !failed.is_empty() {
        eprintln!("reference checksums failed on {}", failed.join(", "));
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_verify(config: &Config, cmd: &VerifyCmd) -> Result<ExitCode> {
    let mut all_ok = true;
    for_each_worker(config, &cmd.target, |worker| {
        let report = maintenance::verify_outputs(worker, &cmd.checksums)?;
        println!("{}", worker.machine);
        print!("{report}");
        all_ok &= report.ok();
        Ok(())
    })?;
    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_launch(cli: &TreeShop, config: &Config, cmd: &LaunchCmd) -> Result<ExitCode> {
    // fail before starting anything
    Manifest::from_path(&cmd.run.manifest)?;
    cmd.run.options(config)?;
    let machines = machines(config)?;
    let exe = std::env::current_exe().context("Unable to locate the running executable")?;

    let children = (0..machines.len())
        .map(|index| {
            let mut args = cli.global_args(&config.orchestrator_version);
            args.push("process".into());
            args.extend(cmd.run.to_args());
            args.push("--worker-index".into());
            args.push(index.to_string().into());
            args
        })
        .collect();
    log::info!(
        "launching {} workers: {}",
        machines.len(),
        machines.iter().map(|m| &m.name).join(", ")
    );
    launch_workers(&exe, children)?;
    Ok(ExitCode::SUCCESS)
}

fn run_partition(cmd: &PartitionCmd) -> Result<ExitCode> {
    let manifest = Manifest::from_path(&cmd.manifest)?;
    let shard = partition(&manifest, WorkerIdentity::new(cmd.worker_index, cmd.pool_size)?)?;
    for id in &shard.assigned_sample_ids {
        println!("{id}");
    }
    Ok(ExitCode::SUCCESS)
}

fn run_check(config: &Config, cmd: &CheckCmd) -> Result<ExitCode> {
    let manifest = Manifest::from_path(&cmd.manifest)?;
    let report = check(&config.layout(), &manifest)?;
    print!("{report}");
    if report.unresolved() > 0 {
        eprintln!(
            "{} of {} samples are unresolved",
            report.unresolved(),
            manifest.len()
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn inner_main() -> Result<ExitCode> {
    env::init_logging();
    let cli = TreeShop::parse();

    match &cli.subcmd {
        SubCommand::Partition(cmd) => run_partition(cmd),
        SubCommand::Process(cmd) => run_process(&cli.config()?, cmd),
        SubCommand::Check(cmd) => run_check(&cli.config()?, cmd),
        SubCommand::Machines => {
            for machine in machines(&cli.config()?)? {
                println!("{machine}");
            }
            Ok(ExitCode::SUCCESS)
        }
        SubCommand::Reset(target) => run_reset(&cli.config()?, target),
        SubCommand::Launch(cmd) => run_launch(&cli, &cli.config()?, cmd),
        SubCommand::Status(target) => run_status(&cli.config()?, target),
        SubCommand::References(cmd) => run_references(&cli.config()?, cmd),
        SubCommand::Verify(cmd) => run_verify(&cli.config()?, cmd),
    }
}

fn main() -> ExitCode {
    match inner_main() {
        Ok(exit_code) => exit_code,
        Err(err) => {
            print_error_chain(&err);
            ExitCode::FAILURE
        }
    }
}
