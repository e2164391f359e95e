use super::{check_status, ExecMode, ExecOutput, FileTransfer, RemoteError, RemoteExecutor};
use crate::command::CommandSpec;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use ts_types::Machine;

/// Treat the orchestrator's own machine as the worker: commands run as local processes and
/// transfers are plain file copies.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHost;

impl LocalHost {
    pub fn machine() -> Machine {
        Machine {
            name: "localhost".to_string(),
            address: "127.0.0.1".to_string(),
        }
    }
}

impl RemoteExecutor for LocalHost {
    fn execute(
        &self,
        machine: &Machine,
        command: &CommandSpec,
        mode: ExecMode,
    ) -> Result<ExecOutput> {
        let mut cmd = Command::new(command.program());
        cmd.args(command.get_args());
        if let Some(dir) = command.workdir() {
            cmd.current_dir(dir);
        }
        let output = cmd.output().map_err(|source| RemoteError::Spawn {
            host: machine.to_string(),
            command: command.to_string(),
            source,
        })?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let result = ExecOutput {
            status: output.status.code().unwrap_or(-1),
            output: text,
        };
        check_status(machine, command, mode, result)
    }
}

impl FileTransfer for LocalHost {
    fn put(&self, _machine: &Machine, local: &Path, remote: &str) -> Result<()> {
        let remote = Path::new(remote);
        if let Some(parent) = remote.parent() {
            fs::create_dir_all(parent).with_context(|| parent.display().to_string())?;
        }
        fs::copy(local, remote)
            .with_context(|| format!("copying {} to {}", local.display(), remote.display()))?;
        Ok(())
    }

    fn get(&self, _machine: &Machine, remote_glob: &str, local_dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(local_dir).with_context(|| local_dir.display().to_string())?;
        let mut fetched = Vec::new();
        for entry in glob::glob(remote_glob).with_context(|| remote_glob.to_string())? {
            let remote = entry?;
            let Some(name) = remote.file_name() else {
                continue;
            };
            if !remote.is_file() {
                continue;
            }
            let local = local_dir.join(name);
            fs::copy(&remote, &local)
                .with_context(|| format!("copying {} to {}", remote.display(), local.display()))?;
            fetched.push(local);
        }
        Ok(fetched)
    }
}
