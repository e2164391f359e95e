//! Run configuration.
//!
//! A [`Config`] is built once, before any sample is touched, from an optional TOML file plus
//! command line overrides. It is immutable afterwards and passed by reference.

use crate::pipeline::{default_converter, Pipeline};
use crate::scratch::WorkerScratch;
use anyhow::{bail, Context, Result};
use log::info;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use ts_types::{Machine, PipelineStage, StorageLayout, ToolIdentity};

const DEFAULT_SCRATCH_ROOT: &str = "/mnt";
const DEFAULT_SSH_USER: &str = "ubuntu";
const DEFAULT_ERROR_LOG: &str = "errors.txt";
const UNKNOWN_OPERATOR: &str = "unknown";

/// What to do with a sample that already has published secondary outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExistingOutputs {
    /// Run every stage again and replace what is there.
    #[default]
    Overwrite,
    /// Leave the sample alone.
    Skip,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkerSection {
    scratch_root: Option<String>,
    ssh_user: Option<String>,
    key_dir: Option<PathBuf>,
    chown_user: Option<String>,
    privileged: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolSection {
    machines: Vec<Machine>,
}

/// The on-disk form of the configuration; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    storage_base: Option<PathBuf>,
    operator: Option<String>,
    orchestrator_version: Option<String>,
    error_log: Option<PathBuf>,
    #[serde(default)]
    existing_outputs: ExistingOutputs,
    #[serde(default)]
    worker: WorkerSection,
    pool: Option<PoolSection>,
    converter: Option<ToolIdentity>,
    stages: Option<Vec<PipelineStage>>,
}

/// Values supplied on the command line. They win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub storage_base: Option<PathBuf>,
    pub operator: Option<String>,
    pub orchestrator_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub scratch_root: String,
    pub ssh_user: String,
    /// Directory holding one `{machine}/id_rsa` per worker.
    pub key_dir: PathBuf,
    /// Owner of the scratch directories after a reset.
    pub chown_user: String,
    /// Run destructive scratch commands through sudo.
    pub privileged: bool,
}

impl WorkerConfig {
    pub fn scratch(&self) -> WorkerScratch {
        WorkerScratch::new(self.scratch_root.clone(), self.privileged)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage_base: PathBuf,
    pub operator: String,
    pub orchestrator_version: String,
    pub error_log: PathBuf,
    pub existing_outputs: ExistingOutputs,
    pub worker: WorkerConfig,
    /// Static pool; enumerate running docker machines when absent.
    pub pool: Option<Vec<Machine>>,
    /// Container used to turn an alignment back into reads.
    pub converter: ToolIdentity,
    pub pipeline: Pipeline,
}

impl Config {
    /// Load the configuration at `path`, or the defaults when there is none.
    pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<Config> {
        match path {
            None => Config::from_file(ConfigFile::default(), overrides),
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Unable to read config {}", path.display()))?;
                Config::from_toml_str(&text, overrides)
                    .with_context(|| format!("Invalid config {}", path.display()))
            }
        }
    }

    pub fn from_toml_str(text: &str, overrides: Overrides) -> Result<Config> {
        let file: ConfigFile = toml::from_str(text)?;
        Config::from_file(file, overrides)
    }

    fn from_file(file: ConfigFile, overrides: Overrides) -> Result<Config> {
        let Some(storage_base) = overrides.storage_base.or(file.storage_base) else {
            bail!("No storage base configured. Pass --storage-base or set storage_base in the config file.");
        };
        let operator = overrides
            .operator
            .or(file.operator)
            .unwrap_or_else(|| UNKNOWN_OPERATOR.to_string());
        let orchestrator_version = overrides
            .orchestrator_version
            .or(file.orchestrator_version)
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
        let error_log = file
            .error_log
            .unwrap_or_else(|| storage_base.join(DEFAULT_ERROR_LOG));

        let ssh_user = file
            .worker
            .ssh_user
            .unwrap_or_else(|| DEFAULT_SSH_USER.to_string());
        let key_dir = match file.worker.key_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Unable to locate the home directory for the default key_dir")?
                .join(".docker/machine/machines"),
        };
        let worker = WorkerConfig {
            scratch_root: file
                .worker
                .scratch_root
                .unwrap_or_else(|| DEFAULT_SCRATCH_ROOT.to_string()),
            chown_user: file.worker.chown_user.unwrap_or_else(|| ssh_user.clone()),
            ssh_user,
            key_dir,
            privileged: file.worker.privileged.unwrap_or(true),
        };

        let pipeline = match file.stages {
            Some(stages) => {
                info!("using {} configured stages", stages.len());
                Pipeline::new(stages)?
            }
            None => Pipeline::treehouse(),
        };
        let converter = file.converter.unwrap_or_else(default_converter);
        if file.existing_outputs != ExistingOutputs::default() {
            info!("using non-default existing_outputs = {:?}", file.existing_outputs);
        }

        Ok(Config {
            storage_base,
            operator,
            orchestrator_version,
            error_log,
            existing_outputs: file.existing_outputs,
            worker,
            pool: file.pool.map(|p| p.machines),
            converter,
            pipeline,
        })
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.storage_base)
    }
}
