//! Structured command descriptions.
//!
//! Commands are kept as a program plus discrete arguments until the moment a collaborator has to
//! hand them to a shell; only then are they rendered, with every argument escaped.

use itertools::Itertools;
use shell_escape::escape;
use std::borrow::Cow;
use std::fmt;

/// A command to run on a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    workdir: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> CommandSpec {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            workdir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> CommandSpec {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<String>) -> CommandSpec {
        self.workdir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn workdir(&self) -> Option<&str> {
        self.workdir.as_deref()
    }

    /// Render as a single shell command line.
    pub fn to_shell(&self) -> String {
        let line = std::iter::once(&self.program)
            .chain(&self.args)
            .map(|word| escape(Cow::from(word.as_str())))
            .join(" ");
        match &self.workdir {
            Some(dir) => format!("cd {} && {line}", escape(Cow::from(dir.as_str()))),
            None => line,
        }
    }
}

/// Unescaped, for logs and error messages.
impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(dir) = &self.workdir {
            write!(f, "cd {dir} && ")?;
        }
        write!(f, "{}", std::iter::once(&self.program).chain(&self.args).join(" "))
    }
}

/// A single `docker run` invocation of a pinned tool image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRun {
    name: String,
    image: String,
    mounts: Vec<(String, String)>,
    env: Vec<(String, String)>,
    args: Vec<String>,
}

impl ContainerRun {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> ContainerRun {
        ContainerRun {
            name: name.into(),
            image: image.into(),
            mounts: Vec::new(),
            env: Vec::new(),
            args: Vec::new(),
        }
    }

    pub fn mount(mut self, host: impl Into<String>, container: impl Into<String>) -> ContainerRun {
        self.mounts.push((host.into(), container.into()));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> ContainerRun {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn args<I, S>(mut self, args: I) -> ContainerRun
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn into_command(self) -> CommandSpec {
        let mut cmd = CommandSpec::new("docker").args(["run", "--rm", "--name"]).arg(self.name);
        for (host, container) in self.mounts {
            cmd = cmd.arg("-v").arg(format!("{host}:{container}"));
        }
        for (key, value) in self.env {
            cmd = cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(self.image).args(self.args)
    }
}
