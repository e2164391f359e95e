use super::MachinePool;
use anyhow::{ensure, Context, Result};
use regex::Regex;
use std::process::Command;
use ts_types::Machine;

/// A pool listed explicitly in the configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPool(pub Vec<Machine>);

impl MachinePool for StaticPool {
    fn machines(&self) -> Result<Vec<Machine>> {
        Ok(self.0.clone())
    }
}

/// The running machines known to `docker-machine`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerMachinePool;

impl MachinePool for DockerMachinePool {
    fn machines(&self) -> Result<Vec<Machine>> {
        let output = Command::new("docker-machine")
            .args([
                "ls",
                "--filter",
                "state=Running",
                "--format",
                "{{.Name}} {{.URL}}",
            ])
            .output()
            .context("running docker-machine ls")?;
        ensure!(
            output.status.success(),
            "docker-machine ls failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        parse_docker_machine_ls(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `{{.Name}} {{.URL}}` lines. Host names are not resolvable, so machines are addressed
/// by the IPv4 address embedded in the docker URL.
pub fn parse_docker_machine_ls(text: &str) -> Result<Vec<Machine>> {
    let ip = Regex::new(r"[0-9]+(?:\.[0-9]+){3}")?;
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (name, url) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let address = ip
                .find(url)
                .with_context(|| format!("no IP address for machine {name} in '{url}'"))?;
            Ok(Machine {
                name: name.to_string(),
                address: address.as_str().to_string(),
            })
        })
        .collect()
}
