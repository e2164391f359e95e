//! Collaborator boundary.
//!
//! The engine consumes remote command execution, file transfer and machine pool enumeration but
//! does not implement their transports. All calls block and none are retried.

mod local;
mod pool;
mod ssh;

pub use local::LocalHost;
pub use pool::{parse_docker_machine_ls, DockerMachinePool, StaticPool};
pub use ssh::SshSession;

use crate::command::CommandSpec;
use crate::scratch::WorkerScratch;
use anyhow::Result;
use std::path::{Path, PathBuf};
use ts_types::Machine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// A non-zero exit is an error.
    Strict,
    /// A non-zero exit is reported in the returned status.
    WarnOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub status: i32,
    /// Interleaved stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Last non-blank line of output, used in one-line failure summaries.
    pub fn last_line(&self) -> &str {
        self.output
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("`{command}` on {host} exited with status {status}: {output}")]
    CommandFailed {
        host: String,
        command: String,
        status: i32,
        output: String,
    },

    #[error("unable to start `{command}` for {host}")]
    Spawn {
        host: String,
        command: String,
        source: std::io::Error,
    },

    #[error("transferring {from} to {to} failed: {output}")]
    Transfer {
        from: String,
        to: String,
        output: String,
    },
}

/// Run a command on a machine.
pub trait RemoteExecutor {
    fn execute(&self, machine: &Machine, command: &CommandSpec, mode: ExecMode)
        -> Result<ExecOutput>;
}

/// Move files between the orchestrator and a machine.
pub trait FileTransfer {
    fn put(&self, machine: &Machine, local: &Path, remote: &str) -> Result<()>;

    /// Copy every file matching `remote_glob` into `local_dir`, returning the local paths.
    /// A glob that matches nothing yields an empty list.
    fn get(&self, machine: &Machine, remote_glob: &str, local_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Enumerate the machines of the worker pool.
pub trait MachinePool {
    fn machines(&self) -> Result<Vec<Machine>>;
}

/// Apply `mode` to a finished command.
pub(crate) fn check_status(
    machine: &Machine,
    command: &CommandSpec,
    mode: ExecMode,
    output: ExecOutput,
) -> Result<ExecOutput> {
    if mode == ExecMode::Strict && !output.success() {
        return Err(RemoteError::CommandFailed {
            host: machine.to_string(),
            command: command.to_string(),
            status: output.status,
            output: output.last_line().to_string(),
        }
        .into());
    }
    Ok(output)
}

/// One worker machine together with the collaborators used to drive it.
pub struct Worker<'a> {
    pub machine: Machine,
    pub scratch: WorkerScratch,
    exec: &'a dyn RemoteExecutor,
    transfer: &'a dyn FileTransfer,
}

impl<'a> Worker<'a> {
    pub fn new(
        machine: Machine,
        scratch: WorkerScratch,
        exec: &'a dyn RemoteExecutor,
        transfer: &'a dyn FileTransfer,
    ) -> Worker<'a> {
        Worker {
            machine,
            scratch,
            exec,
            transfer,
        }
    }

    pub fn execute(&self, command: &CommandSpec, mode: ExecMode) -> Result<ExecOutput> {
        log::debug!("{}: {command}", self.machine);
        self.exec.execute(&self.machine, command, mode)
    }

    pub fn put(&self, local: &Path, remote: &str) -> Result<()> {
        self.transfer.put(&self.machine, local, remote)
    }

    pub fn get(&self, remote_glob: &str, local_dir: &Path) -> Result<Vec<PathBuf>> {
        self.transfer.get(&self.machine, remote_glob, local_dir)
    }
}
