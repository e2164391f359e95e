use super::{check_status, ExecMode, ExecOutput, FileTransfer, RemoteError, RemoteExecutor};
use crate::command::CommandSpec;
use anyhow::{Context, Result};
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use ts_types::Machine;

/// Command execution and file transfer over ssh/scp, authenticating with the per machine key
/// docker-machine generates (`{key_dir}/{machine name}/id_rsa`).
#[derive(Debug, Clone)]
pub struct SshSession {
    user: String,
    key_dir: PathBuf,
}

impl SshSession {
    pub fn new(user: impl Into<String>, key_dir: impl Into<PathBuf>) -> SshSession {
        SshSession {
            user: user.into(),
            key_dir: key_dir.into(),
        }
    }

    fn key_file(&self, machine: &Machine) -> PathBuf {
        self.key_dir.join(&machine.name).join("id_rsa")
    }

    fn destination(&self, machine: &Machine) -> String {
        format!("{}@{}", self.user, machine.address)
    }

    fn base_command(&self, program: &str, machine: &Machine) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg("-i")
            .arg(self.key_file(machine))
            .args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no"]);
        cmd
    }

    /// Run a raw shell line remotely. Used when the remote shell must expand a glob.
    fn ssh(&self, machine: &Machine, line: &str) -> Result<Output> {
        self.base_command("ssh", machine)
            .arg(self.destination(machine))
            .arg(line)
            .output()
            .map_err(|source| {
                RemoteError::Spawn {
                    host: machine.to_string(),
                    command: line.to_string(),
                    source,
                }
                .into()
            })
    }

    fn scp(&self, machine: &Machine, from: &str, to: &str) -> Result<()> {
        let output = self
            .base_command("scp", machine)
            .args(["-q", from, to])
            .output()
            .with_context(|| format!("running scp for {machine}"))?;
        if !output.status.success() {
            return Err(RemoteError::Transfer {
                from: from.to_string(),
                to: to.to_string(),
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

impl RemoteExecutor for SshSession {
    fn execute(
        &self,
        machine: &Machine,
        command: &CommandSpec,
        mode: ExecMode,
    ) -> Result<ExecOutput> {
        let output = self.ssh(machine, &command.to_shell())?;
        let result = ExecOutput {
            status: output.status.code().unwrap_or(-1),
            output: combined_output(&output),
        };
        check_status(machine, command, mode, result)
    }
}

impl FileTransfer for SshSession {
    fn put(&self, machine: &Machine, local: &Path, remote: &str) -> Result<()> {
        let to = format!("{}:{remote}", self.destination(machine));
        self.scp(machine, &local.to_string_lossy(), &to)
    }

    fn get(&self, machine: &Machine, remote_glob: &str, local_dir: &Path) -> Result<Vec<PathBuf>> {
        let line = listing_command(remote_glob);
        let listing = self.ssh(machine, &line)?;
        // ssh's own warnings go to stderr, so only stdout lists paths
        let output = if listing.status.success() {
            String::from_utf8_lossy(&listing.stdout).into_owned()
        } else {
            combined_output(&listing)
        };
        let status = listing.status.code().unwrap_or(-1);
        let remotes = parse_listing(machine, &line, ExecOutput { status, output })?;
        if !remotes.is_empty() {
            fs::create_dir_all(local_dir).with_context(|| local_dir.display().to_string())?;
        }
        let mut fetched = Vec::new();
        for remote in remotes {
            let Some(name) = Path::new(&remote).file_name() else {
                continue;
            };
            let local = local_dir.join(name);
            self.scp(
                machine,
                &format!("{}:{remote}", self.destination(machine)),
                &local.to_string_lossy(),
            )?;
            fetched.push(local);
        }
        Ok(fetched)
    }
}

/// Remote shell line listing the regular files directly under the glob's directory whose names
/// match its last component. A missing directory lists nothing and still exits 0.
fn listing_command(remote_glob: &str) -> String {
    let (dir, pattern) = remote_glob.rsplit_once('/').unwrap_or((".", remote_glob));
    let dir = shell_escape::escape(Cow::from(dir));
    format!(
        "if [ -d {dir} ]; then find {dir} -mindepth 1 -maxdepth 1 -type f -name {}; fi",
        shell_escape::escape(Cow::from(pattern))
    )
}

/// Remote paths printed by a successful listing. Any failure, including ssh's own status
/// 255 for an unreachable host, is an error rather than an empty match.
fn parse_listing(machine: &Machine, line: &str, listing: ExecOutput) -> Result<Vec<String>> {
    if !listing.success() {
        return Err(RemoteError::CommandFailed {
            host: machine.to_string(),
            command: line.to_string(),
            status: listing.status,
            output: listing.last_line().to_string(),
        }
        .into());
    }
    let mut remotes: Vec<String> = listing
        .output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();
    remotes.sort();
    Ok(remotes)
}
